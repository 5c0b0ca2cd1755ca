//! Delimited sample / upload manifests.
//!
//! A manifest is a CSV (`.csv`) or tab-separated (anything else) file whose
//! first line is a header and is always discarded.

use std::path::Path;

use crate::Result;

/// Field delimiter implied by the manifest's file extension.
pub fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("csv") => b',',
        _ => b'\t',
    }
}

/// One data row of a manifest.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestRow {
    /// 1-based line number in the file (the header is line 1)
    pub line: u64,
    pub fields: Vec<String>,
}

/// Reads every row after the header line.
pub fn read_manifest(path: &Path) -> Result<Vec<ManifestRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;

    let mut rows = Vec::new();
    for (idx, record) in rdr.records().enumerate() {
        let record = record?;
        let line = record
            .position()
            .map(|p| p.line())
            .unwrap_or(idx as u64 + 2);
        rows.push(ManifestRow {
            line,
            fields: record.iter().map(str::to_string).collect(),
        });
    }
    Ok(rows)
}

/// The parts of an upload row used to create an assay.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadEntry {
    pub sample_code: String,
    pub filename: String,
    pub panel_code: String,
    /// Raw, untokenized option column
    pub options: Option<String>,
}

/// How an upload row should be treated.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadRow {
    /// Blank or `#`-commented row
    Skip,
    /// Fewer than the three required columns
    Short { columns: usize },
    Entry(UploadEntry),
}

impl ManifestRow {
    /// First column, or an empty string for an empty row.
    pub fn first(&self) -> &str {
        self.fields.first().map(String::as_str).unwrap_or("")
    }

    /// Whether the row is blank or commented out with `#`.
    pub fn is_comment(&self) -> bool {
        let first = self.first();
        first.is_empty() || first.starts_with('#')
    }

    pub fn upload_row(&self) -> UploadRow {
        if self.is_comment() {
            return UploadRow::Skip;
        }
        if self.fields.len() < 3 {
            return UploadRow::Short {
                columns: self.fields.len(),
            };
        }
        let options = self
            .fields
            .get(3)
            .filter(|s| !s.trim().is_empty())
            .cloned();
        UploadRow::Entry(UploadEntry {
            sample_code: self.fields[0].clone(),
            filename: self.fields[1].clone(),
            panel_code: self.fields[2].clone(),
            options,
        })
    }
}
