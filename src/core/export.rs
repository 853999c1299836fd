use crate::core::library::{Component, LibraryDocument, write_atomic};
use crate::core::migration::DEFAULT_CONFIDENCE_THRESHOLD;
use chrono::Utc;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Write as _;
use std::io;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Confidence threshold must be within [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
    Html,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Csv => "csv",
            ExportFormat::Html => "html",
        }
    }
}

/// One component queued for manual review.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewRow {
    pub index: usize,
    pub name: String,
    pub migration_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantity: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhash: Option<String>,
}

impl ReviewRow {
    fn from_component(index: usize, component: &Component, confidence: f64) -> Self {
        Self {
            index,
            name: component.name.clone(),
            migration_confidence: confidence,
            category: component.category.clone(),
            quantity: component.quantity.clone(),
            description: component.description.clone(),
            image: component.asset_ref().map(str::to_string),
            dhash: component.dhash.as_ref().map(|h| h.to_hex()),
        }
    }

    fn quantity_text(&self) -> String {
        match &self.quantity {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportHeader {
    pub library: String,
    pub threshold: f64,
    pub total_filtered: usize,
    pub total_components: usize,
    pub generated_at: String,
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub header: ExportHeader,
    pub rows: Vec<ReviewRow>,
    pub content: String,
}

impl ExportArtifact {
    pub fn write_to(&self, path: &Path) -> Result<(), ExportError> {
        write_atomic(path, self.content.as_bytes())?;
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonExport<'a> {
    #[serde(flatten)]
    header: &'a ExportHeader,
    components: &'a [ReviewRow],
}

/// Read-only view of migrated components whose confidence is below a cutoff.
pub struct LowConfidenceExporter {
    threshold: f64,
}

impl LowConfidenceExporter {
    pub fn new(threshold: f64) -> Result<Self, ExportError> {
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ExportError::InvalidThreshold(threshold));
        }
        Ok(Self { threshold })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Migrated components strictly below the threshold, in document order.
    /// Components without a confidence never migrated and are skipped.
    pub fn select(&self, document: &LibraryDocument) -> Vec<ReviewRow> {
        document
            .components
            .iter()
            .enumerate()
            .filter_map(|(index, component)| {
                let confidence = component.migration_confidence?;
                (confidence < self.threshold)
                    .then(|| ReviewRow::from_component(index, component, confidence))
            })
            .collect()
    }

    pub fn export(
        &self,
        document: &LibraryDocument,
        format: ExportFormat,
    ) -> Result<ExportArtifact, ExportError> {
        let rows = self.select(document);
        let header = ExportHeader {
            library: document.metadata.name.clone(),
            threshold: self.threshold,
            total_filtered: rows.len(),
            total_components: document.components.len(),
            generated_at: Utc::now().to_rfc3339(),
        };

        let content = match format {
            ExportFormat::Json => {
                let mut json = serde_json::to_string_pretty(&JsonExport {
                    header: &header,
                    components: &rows,
                })?;
                json.push('\n');
                json
            }
            ExportFormat::Csv => render_csv(&header, &rows),
            ExportFormat::Html => render_html(&header, &rows),
        };

        log::info!(
            "Exported {} of {} component(s) below {} as {}",
            header.total_filtered,
            header.total_components,
            self.threshold,
            format.extension()
        );

        Ok(ExportArtifact {
            format,
            header,
            rows,
            content,
        })
    }
}

impl Default for LowConfidenceExporter {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

const COLUMNS: [&str; 8] = [
    "index",
    "name",
    "migration_confidence",
    "category",
    "quantity",
    "description",
    "image",
    "dhash",
];

fn row_cells(row: &ReviewRow) -> [String; 8] {
    [
        row.index.to_string(),
        row.name.clone(),
        format!("{:.2}", row.migration_confidence),
        row.category.clone().unwrap_or_default(),
        row.quantity_text(),
        row.description.clone().unwrap_or_default(),
        row.image.clone().unwrap_or_default(),
        row.dhash.clone().unwrap_or_default(),
    ]
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_csv(header: &ExportHeader, rows: &[ReviewRow]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# library: {}", header.library);
    let _ = writeln!(out, "# threshold: {}", header.threshold);
    let _ = writeln!(out, "# total_filtered: {}", header.total_filtered);
    let _ = writeln!(out, "# total_components: {}", header.total_components);
    let _ = writeln!(out, "{}", COLUMNS.join(","));

    for row in rows {
        let cells: Vec<String> = row_cells(row).iter().map(|c| csv_field(c)).collect();
        let _ = writeln!(out, "{}", cells.join(","));
    }
    out
}

fn html_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn render_html(header: &ExportHeader, rows: &[ReviewRow]) -> String {
    let title = if header.library.is_empty() {
        "Low-confidence components".to_string()
    } else {
        format!("Low-confidence components: {}", html_escape(&header.library))
    };

    let mut out = String::new();
    let _ = writeln!(out, "<!DOCTYPE html>");
    let _ = writeln!(out, "<html lang=\"en\">");
    let _ = writeln!(out, "<head>\n<meta charset=\"utf-8\">\n<title>{}</title>", title);
    let _ = writeln!(
        out,
        "<style>table{{border-collapse:collapse}}td,th{{border:1px solid #ccc;padding:4px 8px}}</style>\n</head>"
    );
    let _ = writeln!(out, "<body>\n<h1>{}</h1>", title);
    let _ = writeln!(
        out,
        "<p>Threshold: {} &middot; Flagged: {} of {} components</p>",
        header.threshold, header.total_filtered, header.total_components
    );
    let _ = writeln!(out, "<table>\n<thead><tr>");
    for column in COLUMNS {
        let _ = write!(out, "<th>{}</th>", column);
    }
    let _ = writeln!(out, "</tr></thead>\n<tbody>");

    for row in rows {
        let _ = write!(out, "<tr>");
        for cell in row_cells(row) {
            let _ = write!(out, "<td>{}</td>", html_escape(&cell));
        }
        let _ = writeln!(out, "</tr>");
    }

    let _ = writeln!(out, "</tbody>\n</table>\n</body>\n</html>");
    out
}
