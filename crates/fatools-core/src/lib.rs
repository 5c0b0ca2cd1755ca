//! Core data models and types for fatools.
//!
//! This crate provides the types shared by the store and the `dbmgr` CLI:
//! reference records (panels and markers) with their reconciliation rules,
//! the batch / sample / assay hierarchy, the assay option tokenizer and the
//! delimited manifest reader. It contains no database code.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod manifest;
mod options;
mod reference;

pub use manifest::{delimiter_for, read_manifest, ManifestRow, UploadEntry, UploadRow};
pub use options::tokenize;
pub use reference::{
    load_references, reconcile, Marker, MarkerFields, Panel, PanelFields, Reconciled, Reference,
};

/// Free-form key/value options attached to an assay (e.g. `ploidy=2`).
pub type AssayOptions = BTreeMap<String, serde_json::Value>;

/// The two kinds of reference data that can be imported from YAML.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Panel,
    Marker,
}

impl RecordKind {
    /// Table (SQL backend) or index section (filesystem backend) holding this kind.
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Panel => "panels",
            RecordKind::Marker => "markers",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Panel => f.write_str("panel"),
            RecordKind::Marker => f.write_str("marker"),
        }
    }
}

/// A named collection of samples processed together.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Batch {
    /// Unique batch code
    pub code: String,
    /// When the batch was created
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            created_at: Utc::now(),
        }
    }
}

/// A sample belonging to one batch. The code is unique within the batch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Sample {
    pub batch_code: String,
    pub code: String,
}

/// One uploaded trace attached to a sample.
///
/// The raw trace bytes are not carried here; the store hands them out
/// separately so listing assays stays cheap.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Assay {
    /// Store-assigned identifier
    pub id: i64,
    pub batch_code: String,
    pub sample_code: String,
    /// Trace filename as written in the manifest
    pub filename: String,
    pub panel_code: String,
    pub species: Option<String>,
    pub options: Option<AssayOptions>,
    /// Size of the trace payload in bytes
    pub size: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub uploaded_at: DateTime<Utc>,
}

/// Everything needed to add an assay to a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAssay {
    pub trace: Vec<u8>,
    pub filename: String,
    pub panel_code: String,
    pub species: Option<String>,
    pub options: Option<AssayOptions>,
}

/// Error types for fatools operations.
#[derive(Error, Debug)]
pub enum FatoolsError {
    /// A YAML entry whose own `code` differs from its mapping key
    #[error("code for {kind} {key} is not consistent (record declares '{code}')")]
    CodeMismatch {
        kind: RecordKind,
        key: String,
        code: String,
    },

    /// The YAML document is not a mapping of code to record
    #[error("{kind} file must be a mapping of code to record: {reason}")]
    BadLayout { kind: RecordKind, reason: String },

    /// A command that needs `--batch` was run without it
    #[error("batch code must be supplied")]
    MissingBatchCode,

    #[error("batch {0} does not exist")]
    BatchNotFound(String),

    #[error("sample {sample} does not exist in batch {batch}")]
    SampleNotFound { batch: String, sample: String },

    /// An option token that is not `key=value`
    #[error("invalid option token '{0}', expected key=value")]
    InvalidOption(String),

    /// A row-level warning promoted to an error by `--abort`
    #[error("line {line}: {message} (aborting on warning)")]
    AbortOnWarning { line: u64, message: String },

    /// The user declined to run without committing
    #[error("declined to continue without committing")]
    Declined,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FatoolsError {
    /// Whether this error must end the run even under `--test`.
    ///
    /// Only per-row upload failures (I/O, parse, persistence) are tolerated
    /// in test mode. Validation errors, including a malformed options
    /// column, and lookup errors always terminate.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FatoolsError::CodeMismatch { .. }
                | FatoolsError::BadLayout { .. }
                | FatoolsError::MissingBatchCode
                | FatoolsError::BatchNotFound(_)
                | FatoolsError::SampleNotFound { .. }
                | FatoolsError::InvalidOption(_)
                | FatoolsError::AbortOnWarning { .. }
                | FatoolsError::Declined
        )
    }
}

pub type Result<T> = std::result::Result<T, FatoolsError>;
