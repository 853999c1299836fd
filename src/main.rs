use anyhow::{Context, Result, bail};
use clap::{ArgAction, Parser, Subcommand};
use dhashrs::config::{Config, library_dir};
use dhashrs::core::backup::{BackupManifest, BackupStore};
use dhashrs::core::duplicate::{DuplicateIndex, DuplicateRelation};
use dhashrs::core::export::{ExportFormat, LowConfidenceExporter};
use dhashrs::core::hash::{DHash, Fingerprinter, HashEngine, HashError, is_image_path};
use dhashrs::core::library::{LibraryError, LibraryStore};
use dhashrs::core::migration::{
    MigrationOptions, MigrationOrchestrator, MigrationOutcome, MigrationProgress, RunStatus,
};
use dhashrs::core::rollback::{DialoguerConfirmer, RollbackEngine, RollbackError};
use dhashrs::core::workflow::{MigrateRequest, WorkflowError, migrate_library, verified_snapshot};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

#[derive(Parser, Debug)]
#[command(
    name = "dhashrs",
    version,
    about = "Perceptual-hash migration and duplicate detection for component libraries"
)]
struct Cli {
    /// Config file (default: `$CONFIG_DIR/dhashrs/config.json`)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fingerprint every component and write the migrated library
    Migrate {
        /// Library document to migrate
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Where to write the result (default: overwrite the input)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        /// Run the migration but write nothing
        #[arg(long)]
        dry_run: bool,
        /// Snapshot the library directory first
        #[arg(long)]
        backup: bool,
        #[arg(long, value_name = "N")]
        batch_size: Option<usize>,
        /// Maximum Hamming distance for a near duplicate
        #[arg(long, value_name = "BITS")]
        threshold: Option<u32>,
        /// Cutoff used for the low-confidence count in the summary
        #[arg(long, value_name = "SCORE")]
        confidence_threshold: Option<f64>,
        #[arg(long, value_name = "DIR")]
        backup_root: Option<PathBuf>,
        /// Scratch directory for inline (data URI) images
        #[arg(long, value_name = "DIR")]
        temp_dir: Option<PathBuf>,
    },

    /// Restore a library from a verified backup
    Rollback {
        /// Library document (or directory) to restore
        #[arg(short, long, value_name = "PATH")]
        input: PathBuf,
        /// Backup name (default: most recent)
        #[arg(long, value_name = "NAME")]
        backup: Option<String>,
        /// Skip the confirmation prompt
        #[arg(long)]
        force: bool,
        #[arg(long, value_name = "DIR")]
        backup_root: Option<PathBuf>,
    },

    /// Export low-confidence components for manual review
    Export {
        /// Migrated library document
        #[arg(short, long, value_name = "FILE")]
        input: PathBuf,
        /// Output file (default: stdout)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
        #[arg(long, value_name = "SCORE")]
        confidence_threshold: Option<f64>,
    },

    /// Manage library backups
    Backups {
        #[command(subcommand)]
        command: BackupCmd,
    },

    /// Compute or compare fingerprints
    Hash {
        #[command(subcommand)]
        command: HashCmd,
    },

    /// Duplicate workflows
    Duplicates {
        #[command(subcommand)]
        command: Dups,
    },
}

#[derive(Subcommand, Debug)]
enum BackupCmd {
    /// Snapshot a directory
    Create {
        /// Directory to back up
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        #[arg(long, default_value = "manual")]
        label: String,
        /// Backup root (default: config, else `<DIR>/backups`)
        #[arg(long, value_name = "DIR")]
        backup_root: Option<PathBuf>,
    },

    /// List backups, newest first
    List {
        #[arg(long, value_name = "DIR")]
        backup_root: Option<PathBuf>,
    },

    /// Re-hash backups and compare against their manifests
    Verify {
        /// Backup to verify (default: all)
        #[arg(long, value_name = "NAME")]
        name: Option<String>,
        #[arg(long, value_name = "DIR")]
        backup_root: Option<PathBuf>,
    },

    /// Delete backups older than the retention window
    Prune {
        #[arg(long, value_name = "DAYS")]
        retention_days: Option<u32>,
        #[arg(long, value_name = "DIR")]
        backup_root: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum HashCmd {
    /// Print the fingerprint of each image
    Compute {
        #[arg(required = true, value_name = "FILE")]
        files: Vec<PathBuf>,
    },

    /// Hamming distance between two images or hex fingerprints
    Compare {
        left: String,
        right: String,
        #[arg(long, value_name = "BITS")]
        threshold: Option<u32>,
    },
}

#[derive(Subcommand, Debug)]
enum Dups {
    /// Find and list duplicate groups in a directory of images
    Scan {
        /// Directory to scan
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
        /// Maximum Hamming distance for a near duplicate
        #[arg(long, value_name = "BITS")]
        threshold: Option<u32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("❌ {:#}", err);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<ExitCode> {
    let config = Config::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Migrate {
            input,
            output,
            dry_run,
            backup,
            batch_size,
            threshold,
            confidence_threshold,
            backup_root,
            temp_dir,
        } => {
            let options = MigrationOptions {
                batch_size: batch_size.unwrap_or(config.batch_size),
                similarity_threshold: threshold.unwrap_or(config.similarity_threshold),
                confidence_threshold: confidence_threshold.unwrap_or(config.confidence_threshold),
                temp_dir,
                base_dir: Some(library_dir(&input)),
                source_file: Some(input.display().to_string()),
            };
            let backup_root =
                backup.then(|| backup_root.unwrap_or_else(|| config.backup_root_for(&input)));
            let request = MigrateRequest {
                output: output.unwrap_or_else(|| input.clone()),
                input,
                backup_root,
                dry_run,
            };
            migrate(&config, options, &request)
        }

        Commands::Rollback {
            input,
            backup,
            force,
            backup_root,
        } => {
            let root = backup_root.unwrap_or_else(|| config.backup_root_for(&input));
            println!("▶ Rolling back {} from {}", input.display(), root.display());

            let engine =
                RollbackEngine::new(BackupStore::new(root), DialoguerConfirmer).with_force(force);
            match engine.rollback(&input, backup.as_deref()) {
                Ok(outcome) => {
                    println!(
                        "✅ Restored {} from {} ({} file(s))",
                        outcome.restored.display(),
                        outcome.backup_name,
                        outcome.files_restored
                    );
                    Ok(ExitCode::SUCCESS)
                }
                Err(RollbackError::UserAborted) => {
                    println!("⚠️  Rollback aborted; nothing was changed.");
                    Ok(ExitCode::FAILURE)
                }
                Err(err) => Err(err).context("Rollback failed"),
            }
        }

        Commands::Export {
            input,
            output,
            format,
            confidence_threshold,
        } => {
            let document = LibraryStore::new()
                .load(&input)
                .with_context(|| format!("Failed to load {}", input.display()))?;
            let threshold = confidence_threshold.unwrap_or(config.confidence_threshold);
            let exporter = LowConfidenceExporter::new(threshold)?;
            let artifact = exporter.export(&document, format)?;

            match output {
                Some(path) => {
                    let path = if path.extension().is_none() {
                        path.with_extension(format.extension())
                    } else {
                        path
                    };
                    artifact
                        .write_to(&path)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!(
                        "✅ Exported {} of {} component(s) below {:.2} to {}",
                        artifact.header.total_filtered,
                        artifact.header.total_components,
                        artifact.header.threshold,
                        path.display()
                    );
                }
                None => print!("{}", artifact.content),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Backups { command } => match command {
            BackupCmd::Create {
                path,
                label,
                backup_root,
            } => {
                let root = backup_root.unwrap_or_else(|| config.backup_root_for(&path));
                let store = BackupStore::new(root);
                let manifest = verified_snapshot(&store, &path, &label)?;
                print_manifest(&manifest);
                Ok(ExitCode::SUCCESS)
            }

            BackupCmd::List { backup_root } => {
                let store = BackupStore::new(require_root(backup_root, &config)?);
                let manifests = store.list()?;
                if manifests.is_empty() {
                    println!("No backups in {}", store.root().display());
                } else {
                    println!(
                        "🗂️  {} backup(s) in {}:",
                        manifests.len(),
                        store.root().display()
                    );
                    for manifest in &manifests {
                        print_manifest(manifest);
                    }
                }
                Ok(ExitCode::SUCCESS)
            }

            BackupCmd::Verify { name, backup_root } => {
                let store = BackupStore::new(require_root(backup_root, &config)?);
                let manifests = match name {
                    Some(name) => vec![store.find(&name)?],
                    None => store.list()?,
                };

                let mut all_ok = true;
                for manifest in &manifests {
                    if store.verify(manifest)? {
                        println!("✅ {}", manifest.backup_name);
                    } else {
                        all_ok = false;
                        println!("❌ {} does not match its manifest", manifest.backup_name);
                    }
                }
                Ok(if all_ok {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }

            BackupCmd::Prune {
                retention_days,
                backup_root,
            } => {
                let store = BackupStore::new(require_root(backup_root, &config)?);
                let days = retention_days.unwrap_or(config.retention_days);
                let report = store.prune(days)?;

                println!(
                    "🧹 Removed {} backup(s) older than {} day(s)",
                    report.removed.len(),
                    days
                );
                for name in &report.removed {
                    println!("   🗑️  {}", name);
                }
                for failure in &report.failed {
                    eprintln!(
                        "⚠️  {}: {} (snapshot removed: {}, manifest removed: {})",
                        failure.backup_name,
                        failure.error,
                        failure.snapshot_removed,
                        failure.manifest_removed
                    );
                }
                Ok(if report.is_consistent() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        },

        Commands::Hash { command } => {
            let engine = HashEngine::new().with_hash_size(config.hash_size)?;
            match command {
                HashCmd::Compute { files } => {
                    let results: Vec<_> = files
                        .par_iter()
                        .map(|path| (path, engine.fingerprint(path)))
                        .collect();

                    let mut failed = 0;
                    for (path, result) in results {
                        match result {
                            Ok(hash) => println!("{}  {}", hash, path.display()),
                            Err(err) => {
                                failed += 1;
                                eprintln!("⚠️  {}", err);
                            }
                        }
                    }
                    Ok(if failed == 0 {
                        ExitCode::SUCCESS
                    } else {
                        ExitCode::FAILURE
                    })
                }

                HashCmd::Compare {
                    left,
                    right,
                    threshold,
                } => {
                    let a = resolve_fingerprint(&engine, &left)?;
                    let b = resolve_fingerprint(&engine, &right)?;
                    let threshold = threshold.unwrap_or(config.similarity_threshold);
                    let distance = a.distance(&b)?;

                    println!("{}  {}", a, left);
                    println!("{}  {}", b, right);
                    println!(
                        "Distance {} / {} bits → {}",
                        distance,
                        a.bit_len(),
                        if distance <= threshold {
                            "similar"
                        } else {
                            "different"
                        }
                    );
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Commands::Duplicates { command } => match command {
            Dups::Scan { path, threshold } => {
                let engine = HashEngine::new().with_hash_size(config.hash_size)?;
                let threshold = threshold.unwrap_or(config.similarity_threshold);
                println!("▶ Scanning for duplicates in: {}", path.display());

                let scan = find_duplicates(&engine, &path, threshold)?;
                println!(
                    "⏱ Hashed {} image(s) in {:.2?}",
                    scan.hashed, scan.elapsed
                );
                for err in &scan.unreadable {
                    eprintln!("⚠️  {}", err);
                }

                let groups = &scan.groups;
                if groups.is_empty() {
                    println!("No duplicates found.");
                } else {
                    println!("Found {} duplicate group(s):", groups.len());
                    for (i, (original, members)) in groups.iter().enumerate() {
                        println!("\n✨ Group {}:", i + 1);
                        println!("   🏆 {}", original);
                        for relation in members {
                            println!(
                                "   ▶ {} (distance {})",
                                relation.duplicate, relation.distance
                            );
                        }
                    }
                }
                Ok(if scan.unreadable.is_empty() {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
        },
    }
}

fn migrate(
    config: &Config,
    options: MigrationOptions,
    request: &MigrateRequest,
) -> Result<ExitCode> {
    println!("▶ Migrating {}", request.input.display());
    if request.dry_run && request.backup_root.is_some() {
        println!("⚠️  Dry-run: skipping backup");
    }

    let engine = HashEngine::new().with_hash_size(config.hash_size)?;
    let progress = ProgressBar::new(0);
    progress.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")?
            .progress_chars("=> "),
    );
    let bar = progress.clone();
    let orchestrator = MigrationOrchestrator::new(engine, options).with_progress_callback(
        Box::new(move |update: MigrationProgress| {
            bar.set_length(update.total as u64);
            bar.set_position(update.processed as u64);
            bar.set_message(format!(
                "batch {}/{} · {} failed · {} duplicate(s)",
                update.batch, update.batches, update.failed, update.duplicates
            ));
        }),
    );

    let token = orchestrator.cancellation_token();
    if let Err(err) = ctrlc::set_handler(move || token.store(true, Ordering::Relaxed)) {
        log::warn!("Could not install Ctrl-C handler: {}", err);
    }

    let result = migrate_library(&orchestrator, request);
    progress.finish_and_clear();
    let run = match result {
        Ok(run) => run,
        Err(WorkflowError::Library(LibraryError::Invalid(violations))) => {
            eprintln!("❌ {} failed validation:", request.input.display());
            for violation in &violations {
                eprintln!("   ▶ {}", violation);
            }
            bail!("{} schema violation(s)", violations.len());
        }
        Err(err) => return Err(err).context("Migration failed"),
    };

    if let Some(manifest) = &run.backup {
        println!(
            "💾 Backup {} ({} file(s))",
            manifest.backup_name, manifest.file_count
        );
    }
    print_report(&run.outcome);

    if run.written {
        println!("\n✅ Wrote {}", request.output.display());
    } else {
        println!("\n⚠️  Dry-run only; no files were changed.");
    }

    Ok(if run.succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(outcome: &MigrationOutcome) {
    let report = &outcome.report;
    let status = match report.status() {
        RunStatus::Empty => "nothing to migrate",
        RunStatus::Complete => "complete",
        RunStatus::Partial => "partial",
        RunStatus::AllFailed => "all components failed",
    };

    println!(
        "\n📊 Migration {} in {} ms",
        status, report.elapsed_ms
    );
    println!("   Components:  {}", report.total_components);
    println!("   Succeeded:   {}", report.succeeded);
    println!("   Failed:      {}", report.failed);
    println!(
        "   Duplicates:  {} ({} exact)",
        report.duplicate_count, report.exact_duplicate_count
    );

    if !outcome.duplicates.is_empty() {
        println!("\n🔁 Duplicates:");
        for relation in &outcome.duplicates {
            println!(
                "   ▶ {} → {} (distance {})",
                relation.duplicate, relation.original, relation.distance
            );
        }
    }

    if !outcome.errors.is_empty() {
        println!("\n⚠️  Errors:");
        for error in &outcome.errors {
            println!("   ▶ [{}] {}: {}", error.index, error.component, error.reason);
        }
    }
}

fn print_manifest(manifest: &BackupManifest) {
    println!(
        "   💾 {}  {}  {} file(s)  sha256:{}",
        manifest.backup_name,
        manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
        manifest.file_count,
        &manifest.sha256_hash[..12.min(manifest.sha256_hash.len())]
    );
}

fn require_root(flag: Option<PathBuf>, config: &Config) -> Result<PathBuf> {
    match flag.or_else(|| config.backup_root.clone()) {
        Some(root) => Ok(root),
        None => bail!("No backup root: pass --backup-root or set backup_root in the config"),
    }
}

/// An existing file is fingerprinted; anything else must parse as hex.
fn resolve_fingerprint(engine: &HashEngine, arg: &str) -> Result<DHash> {
    let path = Path::new(arg);
    if path.is_file() {
        return Ok(engine.fingerprint(path)?);
    }
    arg.parse::<DHash>()
        .with_context(|| format!("{} is neither an image file nor a hex fingerprint", arg))
}

/// Recursively walk `dir` in file-name order, returning the image files.
fn scan_directory(dir: &Path) -> Result<Vec<PathBuf>> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner:.green} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));

    let mut images = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        match entry {
            Ok(entry) if entry.file_type().is_file() && is_image_path(entry.path()) => {
                images.push(entry.into_path());
                spinner.set_message(format!("Found {} image(s)…", images.len()));
            }
            Ok(_) => {}
            Err(err) => log::warn!("Skipping unreadable entry: {}", err),
        }
    }
    spinner.finish_with_message(format!("Found {} image(s)", images.len()));
    Ok(images)
}

struct DuplicateScan {
    groups: BTreeMap<String, Vec<DuplicateRelation>>,
    hashed: usize,
    unreadable: Vec<HashError>,
    elapsed: Duration,
}

/// Fingerprint every image under `dir` and group each duplicate under the
/// first file (in walk order) that claimed its fingerprint.
fn find_duplicates(engine: &HashEngine, dir: &Path, threshold: u32) -> Result<DuplicateScan> {
    let images = scan_directory(dir)?;
    println!("▶ Parallel hashing {} images…", images.len());

    let start = Instant::now();
    let results: Vec<Result<DHash, HashError>> =
        images.par_iter().map(|path| engine.fingerprint(path)).collect();
    let elapsed = start.elapsed();

    let mut index = DuplicateIndex::new();
    let mut groups: BTreeMap<String, Vec<DuplicateRelation>> = BTreeMap::new();
    let mut unreadable = Vec::new();
    let mut hashed = 0;
    for (i, (path, result)) in images.iter().zip(results).enumerate() {
        let hash = match result {
            Ok(hash) => hash,
            Err(err) => {
                unreadable.push(err);
                continue;
            }
        };
        hashed += 1;
        let name = path.display().to_string();
        if let Some(relation) = index.observe(hash, &name, i, threshold)? {
            groups.entry(relation.original.clone()).or_default().push(relation);
        }
    }

    Ok(DuplicateScan {
        groups,
        hashed,
        unreadable,
        elapsed,
    })
}
