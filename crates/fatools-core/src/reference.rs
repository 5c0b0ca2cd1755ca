//! Panel and marker reference records.
//!
//! Both kinds are imported from a YAML mapping of `code -> fields`. An import
//! either inserts a new record or merges the incoming fields into the record
//! already stored under the same code; [`reconcile`] makes that choice.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{FatoolsError, RecordKind, Result};

/// A record kind that can be imported from YAML and reconciled by code.
pub trait Reference: Serialize + DeserializeOwned + Clone + std::fmt::Debug {
    /// The incoming field set as read from one YAML entry.
    type Fields: DeserializeOwned + std::fmt::Debug;

    const KIND: RecordKind;

    fn code(&self) -> &str;

    /// The `code` the YAML entry declares for itself.
    fn declared_code(fields: &Self::Fields) -> &str;

    /// A blank record carrying only its code.
    fn blank(code: &str) -> Self;

    /// Overwrites every attribute present in `fields`.
    fn merge(&mut self, fields: Self::Fields);

    /// Builds a fresh record from an incoming field set.
    fn from_fields(fields: Self::Fields) -> Self {
        let mut record = Self::blank(Self::declared_code(&fields));
        record.merge(fields);
        record
    }
}

/// Outcome of reconciling an incoming field set with the stored state.
#[derive(Debug, Clone, PartialEq)]
pub enum Reconciled<R> {
    /// No record with this code exists yet.
    Insert(R),
    /// The existing record, with the incoming fields merged in.
    Merge(R),
}

impl<R> Reconciled<R> {
    pub fn record(&self) -> &R {
        match self {
            Reconciled::Insert(r) | Reconciled::Merge(r) => r,
        }
    }
}

/// Decides between inserting a new record and merging into an existing one.
pub fn reconcile<R: Reference>(existing: Option<R>, fields: R::Fields) -> Reconciled<R> {
    match existing {
        Some(mut record) => {
            record.merge(fields);
            Reconciled::Merge(record)
        }
        None => Reconciled::Insert(R::from_fields(fields)),
    }
}

/// Reads a YAML reference file and validates every entry.
///
/// The whole document is checked before anything is returned, so a code
/// mismatch in the last entry still rejects the file as a whole.
pub fn load_references<R: Reference>(path: &Path) -> Result<Vec<(String, R::Fields)>> {
    let text = fs::read_to_string(path)?;
    let doc: serde_yaml::Value = serde_yaml::from_str(&text)?;

    let mapping = match doc {
        serde_yaml::Value::Mapping(m) => m,
        serde_yaml::Value::Null => return Ok(Vec::new()),
        other => {
            return Err(FatoolsError::BadLayout {
                kind: R::KIND,
                reason: format!("top-level value is {}", yaml_type_name(&other)),
            })
        }
    };

    let mut entries = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let key = match key {
            serde_yaml::Value::String(s) => s,
            serde_yaml::Value::Number(n) => n.to_string(),
            other => {
                return Err(FatoolsError::BadLayout {
                    kind: R::KIND,
                    reason: format!("key of type {} is not a code", yaml_type_name(&other)),
                })
            }
        };
        let fields: R::Fields = serde_yaml::from_value(value)?;
        let declared = R::declared_code(&fields);
        if declared != key {
            return Err(FatoolsError::CodeMismatch {
                kind: R::KIND,
                code: declared.to_string(),
                key,
            });
        }
        entries.push((key, fields));
    }
    tracing::debug!(kind = %R::KIND, count = entries.len(), path = %path.display(), "loaded reference file");
    Ok(entries)
}

fn yaml_type_name(value: &serde_yaml::Value) -> &'static str {
    match value {
        serde_yaml::Value::Null => "null",
        serde_yaml::Value::Bool(_) => "a boolean",
        serde_yaml::Value::Number(_) => "a number",
        serde_yaml::Value::String(_) => "a string",
        serde_yaml::Value::Sequence(_) => "a sequence",
        serde_yaml::Value::Mapping(_) => "a mapping",
        serde_yaml::Value::Tagged(_) => "a tagged value",
    }
}

/// An assay panel: the dye and marker layout used on a run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Panel {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    /// Free-form panel layout
    #[serde(default)]
    pub data: Value,
    /// Attributes without a dedicated field, kept verbatim
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct PanelFields {
    pub code: String,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Reference for Panel {
    type Fields = PanelFields;
    const KIND: RecordKind = RecordKind::Panel;

    fn code(&self) -> &str {
        &self.code
    }

    fn declared_code(fields: &PanelFields) -> &str {
        &fields.code
    }

    fn blank(code: &str) -> Self {
        Panel {
            code: code.to_string(),
            remark: None,
            data: Value::Null,
            extra: BTreeMap::new(),
        }
    }

    fn merge(&mut self, fields: PanelFields) {
        if let Some(remark) = fields.remark {
            self.remark = Some(remark);
        }
        if let Some(data) = fields.data {
            self.data = data;
        }
        self.extra.extend(fields.extra);
    }
}

/// A genetic marker (microsatellite locus) definition.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct Marker {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
    /// Repeat unit length in base pairs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeats: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MarkerFields {
    pub code: String,
    #[serde(default)]
    pub species: Option<String>,
    #[serde(default)]
    pub repeats: Option<u32>,
    #[serde(default)]
    pub min_size: Option<u32>,
    #[serde(default)]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub z_params: Option<String>,
    #[serde(default)]
    pub related_to: Option<String>,
    #[serde(default)]
    pub remark: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Reference for Marker {
    type Fields = MarkerFields;
    const KIND: RecordKind = RecordKind::Marker;

    fn code(&self) -> &str {
        &self.code
    }

    fn declared_code(fields: &MarkerFields) -> &str {
        &fields.code
    }

    fn blank(code: &str) -> Self {
        Marker {
            code: code.to_string(),
            species: None,
            repeats: None,
            min_size: None,
            max_size: None,
            z_params: None,
            related_to: None,
            remark: None,
            extra: BTreeMap::new(),
        }
    }

    fn merge(&mut self, fields: MarkerFields) {
        if fields.species.is_some() {
            self.species = fields.species;
        }
        if fields.repeats.is_some() {
            self.repeats = fields.repeats;
        }
        if fields.min_size.is_some() {
            self.min_size = fields.min_size;
        }
        if fields.max_size.is_some() {
            self.max_size = fields.max_size;
        }
        if fields.z_params.is_some() {
            self.z_params = fields.z_params;
        }
        if fields.related_to.is_some() {
            self.related_to = fields.related_to;
        }
        if fields.remark.is_some() {
            self.remark = fields.remark;
        }
        self.extra.extend(fields.extra);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_panels_in_document_order() {
        let file = write_yaml(
            "GS600LIZ:\n  code: GS600LIZ\n  remark: size standard\n  data:\n    ladder: LIZ600\n\
             PANEL_A:\n  code: PANEL_A\n  data:\n    markers: [TA1, TA40]\n",
        );
        let entries = load_references::<Panel>(file.path()).unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["GS600LIZ", "PANEL_A"]);

        let panel = Panel::from_fields(entries[0].1.clone());
        assert_eq!(panel.code, "GS600LIZ");
        assert_eq!(panel.remark.as_deref(), Some("size standard"));
        assert_eq!(panel.data["ladder"], "LIZ600");
    }

    #[test]
    fn test_code_mismatch_rejects_whole_file() {
        let file = write_yaml("M1:\n  code: M1\nM2:\n  code: M3\n");
        let err = load_references::<Marker>(file.path()).unwrap_err();
        match err {
            FatoolsError::CodeMismatch { kind, key, code } => {
                assert_eq!(kind, RecordKind::Marker);
                assert_eq!(key, "M2");
                assert_eq!(code, "M3");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_non_mapping_document_is_rejected() {
        let file = write_yaml("- code: M1\n");
        let err = load_references::<Marker>(file.path()).unwrap_err();
        assert!(matches!(err, FatoolsError::BadLayout { .. }));
    }

    #[test]
    fn test_empty_document_yields_nothing() {
        let file = write_yaml("");
        assert!(load_references::<Panel>(file.path()).unwrap().is_empty());
    }

    #[test]
    fn test_reconcile_inserts_when_absent() {
        let fields: MarkerFields =
            serde_yaml::from_str("code: TA1\nspecies: pf\nrepeats: 3\n").unwrap();
        match reconcile::<Marker>(None, fields) {
            Reconciled::Insert(m) => {
                assert_eq!(m.code, "TA1");
                assert_eq!(m.repeats, Some(3));
            }
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_reconcile_merges_into_existing() {
        let mut existing = Marker::blank("TA1");
        existing.species = Some("pf".to_string());
        existing.min_size = Some(100);

        let fields: MarkerFields =
            serde_yaml::from_str("code: TA1\nmin_size: 120\nmax_size: 200\nlabel: FAM\n").unwrap();
        let merged = reconcile(Some(existing), fields);
        let Reconciled::Merge(m) = merged else {
            panic!("expected merge");
        };
        assert_eq!(m.species.as_deref(), Some("pf"));
        assert_eq!(m.min_size, Some(120));
        assert_eq!(m.max_size, Some(200));
        assert_eq!(m.extra["label"], "FAM");
    }

    #[test]
    fn test_panel_roundtrips_through_json() {
        let fields: PanelFields =
            serde_yaml::from_str("code: P1\ndata: {dye: 6-FAM}\nowner: lab\n").unwrap();
        let panel = Panel::from_fields(fields);
        let json = serde_json::to_string(&panel).unwrap();
        let back: Panel = serde_json::from_str(&json).unwrap();
        assert_eq!(back, panel);
        assert_eq!(back.extra["owner"], "lab");
    }
}
