use crate::core::duplicate::{DuplicateIndex, DuplicateRelation};
use crate::core::hash::{DHash, Fingerprinter, HashError};
use crate::core::library::{Component, LibraryDocument, LibraryStore, SchemaViolation};
use base64::{Engine as _, engine::general_purpose};
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_SIMILARITY_THRESHOLD: u32 = 5;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;

const BASE_CONFIDENCE: f64 = 0.5;
const IMAGE_BONUS: f64 = 0.3;
const DESCRIPTION_BONUS: f64 = 0.1;
const QUANTITY_BONUS: f64 = 0.1;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("Library document is invalid ({} violation(s)); migration not started", .0.len())]
    InvalidDocument(Vec<SchemaViolation>),

    #[error("Batch size must be at least 1")]
    InvalidBatchSize,

    #[error("Fingerprint comparison failed: {0}")]
    Hash(#[from] HashError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Migration cancelled after {processed} of {total} components")]
    Cancelled { processed: usize, total: usize },
}

/// Heuristic confidence that a component's metadata survived migration.
///
/// 0.5 base, +0.3 for an image reference, +0.1 for a description longer
/// than ten characters, +0.1 for a positive numeric quantity, capped at 1.0.
pub fn compute_confidence(component: &Component) -> f64 {
    let mut score = BASE_CONFIDENCE;
    if component.has_image() {
        score += IMAGE_BONUS;
    }
    if component.has_long_description() {
        score += DESCRIPTION_BONUS;
    }
    if component.has_valid_quantity() {
        score += QUANTITY_BONUS;
    }
    round_score(score.min(1.0))
}

fn round_score(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub similarity_threshold: u32,
    pub confidence_threshold: f64,
    /// Scratch directory for decoded inline (data URI) images.
    pub temp_dir: Option<PathBuf>,
    /// Directory relative asset paths resolve against.
    pub base_dir: Option<PathBuf>,
    /// Recorded in the migration summary.
    pub source_file: Option<String>,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            temp_dir: None,
            base_dir: None,
            source_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentError {
    pub index: usize,
    pub component: String,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Empty,
    Complete,
    Partial,
    AllFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub started_at: String,
    pub total_components: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub duplicate_count: usize,
    pub exact_duplicate_count: usize,
    pub elapsed_ms: u64,
    pub batch_size: usize,
    pub similarity_threshold: u32,
    pub hash_bits: usize,
    #[serde(default)]
    pub errors: Vec<ComponentError>,
}

impl MigrationReport {
    pub fn status(&self) -> RunStatus {
        if self.total_components == 0 {
            RunStatus::Empty
        } else if self.succeeded == 0 {
            RunStatus::AllFailed
        } else if self.failed > 0 {
            RunStatus::Partial
        } else {
            RunStatus::Complete
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Written to `metadata.migration` of the migrated document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationSummary {
    pub migrated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    pub total_components: usize,
    pub low_confidence_count: usize,
    pub average_confidence: f64,
    pub confidence_threshold: f64,
    pub report: MigrationReport,
    #[serde(default)]
    pub duplicates: Vec<DuplicateRelation>,
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub document: LibraryDocument,
    pub report: MigrationReport,
    pub duplicates: Vec<DuplicateRelation>,
    pub errors: Vec<ComponentError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationProgress {
    pub processed: usize,
    pub total: usize,
    pub batch: usize,
    pub batches: usize,
    pub failed: usize,
    pub duplicates: usize,
}

pub type ProgressCallback = Box<dyn Fn(MigrationProgress) + Send + Sync>;

/// Fingerprints every component in document order and records duplicates.
///
/// Fingerprints inside a batch are computed in parallel; the duplicate index
/// is then updated one component at a time in document order, so batch size
/// never changes which component is reported as the original.
pub struct MigrationOrchestrator<F: Fingerprinter> {
    fingerprinter: F,
    options: MigrationOptions,
    cancellation_token: Arc<AtomicBool>,
    progress_callback: Option<ProgressCallback>,
}

impl<F: Fingerprinter> MigrationOrchestrator<F> {
    pub fn new(fingerprinter: F, options: MigrationOptions) -> Self {
        Self {
            fingerprinter,
            options,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn migrate(
        &self,
        mut document: LibraryDocument,
    ) -> Result<MigrationOutcome, MigrationError> {
        let batch_size = self.options.batch_size;
        if batch_size == 0 {
            return Err(MigrationError::InvalidBatchSize);
        }

        let violations = LibraryStore::new().validate(&document);
        if !violations.is_empty() {
            return Err(MigrationError::InvalidDocument(violations));
        }

        let start = Instant::now();
        let started_at = Utc::now().to_rfc3339();
        let total = document.components.len();
        let batches = total.div_ceil(batch_size);
        let threshold = self.options.similarity_threshold;

        let scratch = self.scratch_dir(&document)?;
        let scratch_path = scratch.as_ref().map(|dir| dir.path());

        log::info!(
            "Migrating {} component(s) in {} batch(es) of {} (threshold {})",
            total,
            batches,
            batch_size,
            threshold
        );

        let mut index = DuplicateIndex::new();
        let mut duplicates: Vec<DuplicateRelation> = Vec::new();
        let mut errors: Vec<ComponentError> = Vec::new();
        let mut succeeded = 0;

        for (batch_no, chunk) in document.components.chunks_mut(batch_size).enumerate() {
            let offset = batch_no * batch_size;
            if self.cancellation_token.load(Ordering::Relaxed) {
                return Err(MigrationError::Cancelled {
                    processed: offset,
                    total,
                });
            }

            let fingerprints: Vec<Result<DHash, String>> = chunk
                .par_iter()
                .enumerate()
                .map(|(i, component)| {
                    self.fingerprint_component(component, offset + i, scratch_path)
                })
                .collect();

            for (i, (component, fingerprint)) in chunk.iter_mut().zip(fingerprints).enumerate() {
                let position = offset + i;
                match fingerprint {
                    Ok(hash) => {
                        if let Some(relation) =
                            index.observe(hash.clone(), &component.name, position, threshold)?
                        {
                            log::debug!(
                                "{} duplicates {} (distance {})",
                                relation.duplicate,
                                relation.original,
                                relation.distance
                            );
                            duplicates.push(relation);
                        }

                        component.dhash = Some(hash);
                        component.migrated_at = Some(Utc::now().to_rfc3339());
                        component.migration_confidence = Some(compute_confidence(component));
                        succeeded += 1;
                    }
                    Err(reason) => {
                        log::warn!("Failed to migrate {}: {}", component.name, reason);
                        component.dhash = None;
                        component.migrated_at = None;
                        component.migration_confidence = None;
                        errors.push(ComponentError {
                            index: position,
                            component: component.name.clone(),
                            reason,
                        });
                    }
                }
            }

            if let Some(callback) = &self.progress_callback {
                callback(MigrationProgress {
                    processed: offset + chunk.len(),
                    total,
                    batch: batch_no + 1,
                    batches,
                    failed: errors.len(),
                    duplicates: duplicates.len(),
                });
            }
        }

        let report = MigrationReport {
            started_at,
            total_components: total,
            succeeded,
            failed: errors.len(),
            duplicate_count: duplicates.len(),
            exact_duplicate_count: duplicates.iter().filter(|d| d.is_exact()).count(),
            elapsed_ms: start.elapsed().as_millis() as u64,
            batch_size,
            similarity_threshold: threshold,
            hash_bits: self.fingerprinter.bit_len(),
            errors: errors.clone(),
        };

        document.metadata.migration = Some(self.summarize(&document, &report, &duplicates));

        match report.status() {
            RunStatus::Empty => log::info!("Library is empty; nothing to migrate"),
            RunStatus::AllFailed => log::error!("Every component ({}) failed to migrate", total),
            _ => log::info!(
                "Migrated {}/{} component(s), {} failed, {} duplicate(s) in {} ms",
                report.succeeded,
                total,
                report.failed,
                report.duplicate_count,
                report.elapsed_ms
            ),
        }

        Ok(MigrationOutcome {
            document,
            report,
            duplicates,
            errors,
        })
    }

    fn summarize(
        &self,
        document: &LibraryDocument,
        report: &MigrationReport,
        duplicates: &[DuplicateRelation],
    ) -> MigrationSummary {
        let scores: Vec<f64> = document
            .components
            .iter()
            .filter_map(|c| c.migration_confidence)
            .collect();
        let average = if scores.is_empty() {
            0.0
        } else {
            round_score(scores.iter().sum::<f64>() / scores.len() as f64)
        };

        MigrationSummary {
            migrated_at: Utc::now().to_rfc3339(),
            source_file: self.options.source_file.clone(),
            total_components: report.total_components,
            low_confidence_count: scores
                .iter()
                .filter(|&&s| s < self.options.confidence_threshold)
                .count(),
            average_confidence: average,
            confidence_threshold: self.options.confidence_threshold,
            report: report.clone(),
            duplicates: duplicates.to_vec(),
        }
    }

    /// Scratch space is only created when some component carries an inline image.
    fn scratch_dir(&self, document: &LibraryDocument) -> Result<Option<TempDir>, MigrationError> {
        let needs_scratch = document
            .components
            .iter()
            .any(|c| c.asset_ref().is_some_and(is_data_uri));
        if !needs_scratch {
            return Ok(None);
        }

        let dir = match &self.options.temp_dir {
            Some(root) => {
                fs::create_dir_all(root)?;
                TempDir::new_in(root)?
            }
            None => TempDir::new()?,
        };
        Ok(Some(dir))
    }

    fn fingerprint_component(
        &self,
        component: &Component,
        index: usize,
        scratch: Option<&Path>,
    ) -> Result<DHash, String> {
        let path = self.resolve_asset(component, index, scratch)?;
        self.fingerprinter
            .fingerprint(&path)
            .map_err(|e| e.to_string())
    }

    fn resolve_asset(
        &self,
        component: &Component,
        index: usize,
        scratch: Option<&Path>,
    ) -> Result<PathBuf, String> {
        let reference = component
            .asset_ref()
            .ok_or_else(|| "component has no asset reference".to_string())?;

        if is_data_uri(reference) {
            let dir = scratch.ok_or_else(|| "no scratch directory for inline image".to_string())?;
            return decode_data_uri(reference, &dir.join(format!("component-{}", index)));
        }

        let path = PathBuf::from(reference);
        let path = match &self.options.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        };

        if !path.is_file() {
            return Err(format!("image file not found: {}", path.display()));
        }
        Ok(path)
    }
}

fn is_data_uri(reference: &str) -> bool {
    reference.starts_with("data:")
}

/// Decode `data:<mime>;base64,<payload>` into `target`.
fn decode_data_uri(reference: &str, target: &Path) -> Result<PathBuf, String> {
    let (header, payload) = reference
        .split_once(',')
        .ok_or_else(|| "malformed data URI: missing ','".to_string())?;
    if !header.ends_with(";base64") {
        return Err("unsupported data URI: only base64 payloads are accepted".to_string());
    }

    let bytes = general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("invalid base64 image data: {}", e))?;
    fs::write(target, bytes).map_err(|e| format!("failed to stage inline image: {}", e))?;
    Ok(target.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::HashEngine;
    use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
    use serde_json::json;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::sync::Mutex;

    /// Hands out fixed fingerprints keyed by file name.
    struct FixedFingerprints(HashMap<&'static str, &'static str>);

    impl Fingerprinter for FixedFingerprints {
        fn fingerprint(&self, path: &Path) -> Result<DHash, HashError> {
            let name = path.file_name().unwrap().to_str().unwrap();
            match self.0.get(name) {
                Some(hex) => Ok(hex.parse().unwrap()),
                None => Err(HashError::ImageUnreadable {
                    path: name.to_string(),
                    source: image::ImageError::IoError(std::io::Error::other("no fixture")),
                }),
            }
        }

        fn bit_len(&self) -> usize {
            64
        }
    }

    fn create_test_image(path: &Path, descending: bool) {
        let img = ImageBuffer::from_fn(90, 80, |x, _y| {
            let step = (x * 255 / 89) as u8;
            let intensity = if descending { 255 - step } else { step };
            Rgb([intensity, intensity, intensity])
        });
        img.save(path).unwrap();
    }

    fn component(name: &str, image: &str) -> Component {
        Component {
            image: Some(image.to_string()),
            ..Component::named(name)
        }
    }

    fn document(components: Vec<Component>) -> LibraryDocument {
        LibraryDocument {
            components,
            ..LibraryDocument::default()
        }
    }

    fn options(dir: &Path, batch_size: usize) -> MigrationOptions {
        MigrationOptions {
            batch_size,
            base_dir: Some(dir.to_path_buf()),
            ..MigrationOptions::default()
        }
    }

    fn touch(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), b"").unwrap();
        }
    }

    #[test]
    fn test_exact_duplicate_independent_of_batch_size() {
        let temp_dir = TempDir::new().unwrap();
        create_test_image(&temp_dir.path().join("a.png"), false);
        create_test_image(&temp_dir.path().join("b.png"), false);
        create_test_image(&temp_dir.path().join("c.png"), true);

        for batch_size in [1, 2, 3, 10] {
            let orchestrator =
                MigrationOrchestrator::new(HashEngine::new(), options(temp_dir.path(), batch_size));
            let outcome = orchestrator
                .migrate(document(vec![
                    component("A", "a.png"),
                    component("B", "b.png"),
                    component("C", "c.png"),
                ]))
                .unwrap();

            assert_eq!(outcome.duplicates.len(), 1, "batch size {}", batch_size);
            let relation = &outcome.duplicates[0];
            assert_eq!(relation.original, "A");
            assert_eq!(relation.duplicate, "B");
            assert_eq!(relation.distance, 0);
            assert!(outcome.errors.is_empty());
            assert_eq!(outcome.report.status(), RunStatus::Complete);
        }
    }

    #[test]
    fn test_missing_file_is_recorded_not_fatal() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), &["a.png", "b.png", "d.png"]);
        let fingerprints = FixedFingerprints(HashMap::from([
            ("a.png", "0000000000000000"),
            ("b.png", "ffffffffffffffff"),
            ("d.png", "00ff00ff00ff00ff"),
        ]));

        let outcome = MigrationOrchestrator::new(fingerprints, options(temp_dir.path(), 2))
            .migrate(document(vec![
                component("a", "a.png"),
                component("b", "b.png"),
                component("gone", "missing.png"),
                component("d", "d.png"),
            ]))
            .unwrap();

        assert_eq!(outcome.report.succeeded, 3);
        assert_eq!(outcome.report.failed, 1);
        assert_eq!(outcome.report.status(), RunStatus::Partial);
        assert!(outcome.report.has_failures());
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].component, "gone");
        assert_eq!(outcome.errors[0].index, 2);
        assert!(outcome.errors[0].reason.contains("not found"));

        let components = &outcome.document.components;
        assert_eq!(components.len(), 4);
        assert!(components[2].dhash.is_none());
        assert!(components[2].migration_confidence.is_none());
        assert!(components.iter().filter(|c| c.is_migrated()).count() == 3);
        assert_eq!(outcome.report.errors, outcome.errors);
    }

    #[test]
    fn test_near_duplicates_use_first_found_match() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), &["a.png", "b.png", "c.png", "far.png"]);
        let fingerprints = FixedFingerprints(HashMap::from([
            ("a.png", "0000000000000007"),
            ("b.png", "0000000000000001"),
            ("c.png", "0000000000000000"),
            ("far.png", "ffffffffffffff00"),
        ]));

        let outcome = MigrationOrchestrator::new(fingerprints, options(temp_dir.path(), 3))
            .migrate(document(vec![
                component("a", "a.png"),
                component("b", "b.png"),
                component("c", "c.png"),
                component("far", "far.png"),
            ]))
            .unwrap();

        assert_eq!(outcome.duplicates.len(), 2);
        assert_eq!(
            (outcome.duplicates[0].original.as_str(), outcome.duplicates[0].duplicate.as_str()),
            ("a", "b")
        );
        assert_eq!(outcome.duplicates[0].distance, 2);
        // b is closer to c, but a was inserted first
        assert_eq!(outcome.duplicates[1].original, "a");
        assert_eq!(outcome.duplicates[1].duplicate, "c");
        assert_eq!(outcome.duplicates[1].distance, 3);
        assert_eq!(outcome.report.duplicate_count, 2);
        assert_eq!(outcome.report.exact_duplicate_count, 0);
    }

    #[test]
    fn test_empty_and_all_failed_are_distinct() {
        let temp_dir = TempDir::new().unwrap();
        let orchestrator = MigrationOrchestrator::new(
            FixedFingerprints(HashMap::new()),
            options(temp_dir.path(), 10),
        );

        let empty = orchestrator.migrate(document(vec![])).unwrap();
        assert_eq!(empty.report.status(), RunStatus::Empty);
        assert!(!empty.report.has_failures());

        let failed = orchestrator
            .migrate(document(vec![component("x", "x.png"), component("y", "y.png")]))
            .unwrap();
        assert_eq!(failed.report.status(), RunStatus::AllFailed);
        assert_eq!(failed.errors.len(), 2);
    }

    #[test]
    fn test_invalid_document_is_rejected() {
        let orchestrator = MigrationOrchestrator::new(
            FixedFingerprints(HashMap::new()),
            MigrationOptions::default(),
        );
        let result = orchestrator.migrate(document(vec![Component::named("no-asset")]));
        assert!(matches!(result, Err(MigrationError::InvalidDocument(v)) if v.len() == 1));
    }

    #[test]
    fn test_zero_batch_size_is_rejected() {
        let orchestrator = MigrationOrchestrator::new(
            FixedFingerprints(HashMap::new()),
            MigrationOptions {
                batch_size: 0,
                ..MigrationOptions::default()
            },
        );
        assert!(matches!(
            orchestrator.migrate(document(vec![])),
            Err(MigrationError::InvalidBatchSize)
        ));
    }

    #[test]
    fn test_cancellation_between_batches() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), &["a.png"]);
        let orchestrator = MigrationOrchestrator::new(
            FixedFingerprints(HashMap::from([("a.png", "0000000000000000")])),
            options(temp_dir.path(), 1),
        );

        orchestrator.cancel();
        let result = orchestrator.migrate(document(vec![component("a", "a.png")]));
        assert!(matches!(
            result,
            Err(MigrationError::Cancelled {
                processed: 0,
                total: 1
            })
        ));
    }

    #[test]
    fn test_progress_reported_per_batch() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), &["a.png", "b.png", "c.png"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let orchestrator = MigrationOrchestrator::new(
            FixedFingerprints(HashMap::from([
                ("a.png", "0000000000000000"),
                ("b.png", "00000000000000ff"),
                ("c.png", "ffffffffffffffff"),
            ])),
            options(temp_dir.path(), 2),
        )
        .with_progress_callback(Box::new(move |p| sink.lock().unwrap().push(p)));

        orchestrator
            .migrate(document(vec![
                component("a", "a.png"),
                component("b", "b.png"),
                component("c", "c.png"),
            ]))
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!((seen[0].processed, seen[0].batch, seen[0].batches), (2, 1, 2));
        assert_eq!((seen[1].processed, seen[1].total), (3, 3));
    }

    #[test]
    fn test_summary_embedded_in_metadata() {
        let temp_dir = TempDir::new().unwrap();
        touch(temp_dir.path(), &["a.png", "b.png"]);
        let fingerprints = FixedFingerprints(HashMap::from([
            ("a.png", "0000000000000000"),
            ("b.png", "0000000000000000"),
        ]));

        let bare = Component {
            path: Some("b.png".to_string()),
            ..Component::named("bare")
        };
        let rich = Component {
            description: Some("A richly described component".to_string()),
            quantity: Some(json!(4)),
            ..component("rich", "a.png")
        };

        let outcome = MigrationOrchestrator::new(
            fingerprints,
            MigrationOptions {
                source_file: Some("library.json".to_string()),
                ..options(temp_dir.path(), 5)
            },
        )
        .migrate(document(vec![rich, bare]))
        .unwrap();

        let summary = outcome.document.metadata.migration.as_ref().unwrap();
        assert_eq!(summary.source_file.as_deref(), Some("library.json"));
        assert_eq!(summary.total_components, 2);
        assert_eq!(summary.low_confidence_count, 1);
        assert_eq!(summary.average_confidence, 0.75);
        assert_eq!(summary.duplicates.len(), 1);
        assert_eq!(summary.report, outcome.report);

        let rich = &outcome.document.components[0];
        assert_eq!(rich.migration_confidence, Some(1.0));
        assert_eq!(rich.dhash.as_ref().unwrap().to_hex(), "0000000000000000");
        assert!(rich.migrated_at.is_some());
        assert_eq!(outcome.document.components[1].migration_confidence, Some(0.5));
    }

    #[test]
    fn test_inline_data_uri_image() {
        let temp_dir = TempDir::new().unwrap();
        let scratch_root = temp_dir.path().join("scratch");

        let image = DynamicImage::ImageRgb8(ImageBuffer::from_fn(36, 32, |x, _| {
            Rgb([(x * 7) as u8, (x * 7) as u8, (x * 7) as u8])
        }));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        let uri = format!(
            "data:image/png;base64,{}",
            general_purpose::STANDARD.encode(&bytes)
        );

        let outcome = MigrationOrchestrator::new(
            HashEngine::new(),
            MigrationOptions {
                temp_dir: Some(scratch_root.clone()),
                ..MigrationOptions::default()
            },
        )
        .migrate(document(vec![
            component("inline", &uri),
            component("broken", "data:image/png;base64,@@@"),
        ]))
        .unwrap();

        let expected = HashEngine::new().fingerprint_image(&image);
        assert_eq!(outcome.document.components[0].dhash, Some(expected));
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].reason.contains("base64"));
        // scratch files are removed with the run
        assert_eq!(fs::read_dir(&scratch_root).unwrap().count(), 0);
    }

    #[test]
    fn test_confidence_scoring() {
        let bare = Component {
            path: Some("x.png".to_string()),
            ..Component::named("bare")
        };
        assert_eq!(compute_confidence(&bare), 0.5);

        let with_image = Component {
            image: Some("x.png".to_string()),
            ..bare.clone()
        };
        assert_eq!(compute_confidence(&with_image), 0.8);

        let with_description = Component {
            description: Some("long enough text".to_string()),
            ..with_image.clone()
        };
        assert_eq!(compute_confidence(&with_description), 0.9);

        let full = Component {
            quantity: Some(json!(1)),
            ..with_description.clone()
        };
        assert_eq!(compute_confidence(&full), 1.0);

        let mut previous = 0.0;
        for c in [&bare, &with_image, &with_description, &full] {
            let score = compute_confidence(c);
            assert!(score > previous);
            assert!((0.5..=1.0).contains(&score));
            previous = score;
        }

        let short_text = Component {
            description: Some("short".to_string()),
            quantity: Some(json!("2")),
            ..bare
        };
        assert_eq!(compute_confidence(&short_text), 0.6);
    }
}
