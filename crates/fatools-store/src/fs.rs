//! Directory database backend.
//!
//! Layout:
//!
//! ```text
//! <root>/fatools.json        index of reference records, batches, samples, assays
//! <root>/traces/<id>.fsa     raw trace of assay <id>
//! ```
//!
//! A session loads the index into memory and stages every change there.
//! Nothing touches the disk until commit, which writes staged traces first
//! and then atomically replaces the index.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use fatools_core::{Assay, Batch, NewAssay, RecordKind, Reference, Sample};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::FS_INDEX_FILE;

const INDEX_VERSION: u32 = 1;
const TRACE_DIR: &str = "traces";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "snake_case")]
struct Index {
    version: u32,
    next_assay_id: i64,
    #[serde(default)]
    panels: BTreeMap<String, Value>,
    #[serde(default)]
    markers: BTreeMap<String, Value>,
    #[serde(default)]
    batches: BTreeMap<String, BatchEntry>,
}

impl Default for Index {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            next_assay_id: 1,
            panels: BTreeMap::new(),
            markers: BTreeMap::new(),
            batches: BTreeMap::new(),
        }
    }
}

impl Index {
    fn references(&self, kind: RecordKind) -> &BTreeMap<String, Value> {
        match kind {
            RecordKind::Panel => &self.panels,
            RecordKind::Marker => &self.markers,
        }
    }

    fn references_mut(&mut self, kind: RecordKind) -> &mut BTreeMap<String, Value> {
        match kind {
            RecordKind::Panel => &mut self.panels,
            RecordKind::Marker => &mut self.markers,
        }
    }

    fn batch(&self, code: &str) -> anyhow::Result<&BatchEntry> {
        self.batches
            .get(code)
            .ok_or_else(|| anyhow::anyhow!("batch {} does not exist", code))
    }

    fn batch_mut(&mut self, code: &str) -> anyhow::Result<&mut BatchEntry> {
        self.batches
            .get_mut(code)
            .ok_or_else(|| anyhow::anyhow!("batch {} does not exist", code))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct BatchEntry {
    batch: Batch,
    /// In creation order
    #[serde(default)]
    samples: Vec<SampleEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SampleEntry {
    code: String,
    #[serde(default)]
    assays: Vec<Assay>,
}

pub(crate) struct FsSession {
    root: PathBuf,
    index: Index,
    staged_traces: BTreeMap<i64, Vec<u8>>,
    removed_traces: Vec<i64>,
}

impl FsSession {
    pub(crate) fn begin(root: &Path) -> anyhow::Result<Self> {
        let index_path = root.join(FS_INDEX_FILE);
        let index = if index_path.is_file() {
            let json = std::fs::read_to_string(&index_path)
                .with_context(|| format!("failed to read index {}", index_path.display()))?;
            let index: Index = serde_json::from_str(&json)
                .with_context(|| format!("corrupt index {}", index_path.display()))?;
            if index.version > INDEX_VERSION {
                anyhow::bail!(
                    "index {} has version {}, this build understands up to {}",
                    index_path.display(),
                    index.version,
                    INDEX_VERSION
                );
            }
            index
        } else {
            Index::default()
        };

        Ok(Self {
            root: root.to_path_buf(),
            index,
            staged_traces: BTreeMap::new(),
            removed_traces: Vec::new(),
        })
    }

    /// The index is created on first commit; only the trace directory needs preparing.
    pub(crate) fn init_schema(&mut self) -> anyhow::Result<()> {
        let traces = self.root.join(TRACE_DIR);
        std::fs::create_dir_all(&traces)
            .with_context(|| format!("failed to create {}", traces.display()))?;
        Ok(())
    }

    pub(crate) fn find_reference<R: Reference>(&self, code: &str) -> anyhow::Result<Option<R>> {
        self.index
            .references(R::KIND)
            .get(code)
            .map(|v| {
                serde_json::from_value(v.clone())
                    .with_context(|| format!("corrupt {} record {}", R::KIND, code))
            })
            .transpose()
    }

    pub(crate) fn insert_reference<R: Reference>(&mut self, record: &R) -> anyhow::Result<()> {
        let value = serde_json::to_value(record)?;
        let table = self.index.references_mut(R::KIND);
        if table.contains_key(record.code()) {
            anyhow::bail!("{} {} already exists", R::KIND, record.code());
        }
        table.insert(record.code().to_string(), value);
        tracing::debug!(kind = %R::KIND, code = record.code(), "staged reference insert");
        Ok(())
    }

    pub(crate) fn update_reference<R: Reference>(&mut self, record: &R) -> anyhow::Result<()> {
        let value = serde_json::to_value(record)?;
        let slot = self
            .index
            .references_mut(R::KIND)
            .get_mut(record.code())
            .ok_or_else(|| anyhow::anyhow!("{} {} does not exist", R::KIND, record.code()))?;
        *slot = value;
        tracing::debug!(kind = %R::KIND, code = record.code(), "staged reference update");
        Ok(())
    }

    pub(crate) fn list_references<R: Reference>(&self) -> anyhow::Result<Vec<R>> {
        self.index
            .references(R::KIND)
            .values()
            .map(|v| serde_json::from_value(v.clone()).map_err(anyhow::Error::from))
            .collect()
    }

    pub(crate) fn insert_batch(&mut self, batch: &Batch) -> anyhow::Result<()> {
        if self.index.batches.contains_key(&batch.code) {
            anyhow::bail!("batch {} already exists", batch.code);
        }
        self.index.batches.insert(
            batch.code.clone(),
            BatchEntry {
                batch: batch.clone(),
                samples: Vec::new(),
            },
        );
        tracing::debug!(code = %batch.code, "staged batch insert");
        Ok(())
    }

    pub(crate) fn find_batch(&self, code: &str) -> anyhow::Result<Option<Batch>> {
        Ok(self.index.batches.get(code).map(|e| e.batch.clone()))
    }

    pub(crate) fn add_sample(&mut self, batch: &Batch, code: &str) -> anyhow::Result<Sample> {
        let entry = self.index.batch_mut(&batch.code)?;
        if entry.samples.iter().any(|s| s.code == code) {
            anyhow::bail!("sample {} already exists in batch {}", code, batch.code);
        }
        entry.samples.push(SampleEntry {
            code: code.to_string(),
            assays: Vec::new(),
        });
        tracing::debug!(batch = %batch.code, sample = code, "staged sample insert");
        Ok(Sample {
            batch_code: batch.code.clone(),
            code: code.to_string(),
        })
    }

    pub(crate) fn find_sample(&self, batch: &Batch, code: &str) -> anyhow::Result<Option<Sample>> {
        let entry = self.index.batch(&batch.code)?;
        Ok(entry.samples.iter().find(|s| s.code == code).map(|s| Sample {
            batch_code: batch.code.clone(),
            code: s.code.clone(),
        }))
    }

    pub(crate) fn list_samples(&self, batch: &Batch) -> anyhow::Result<Vec<Sample>> {
        let entry = self.index.batch(&batch.code)?;
        Ok(entry
            .samples
            .iter()
            .map(|s| Sample {
                batch_code: batch.code.clone(),
                code: s.code.clone(),
            })
            .collect())
    }

    fn sample_entry_mut(&mut self, sample: &Sample) -> anyhow::Result<&mut SampleEntry> {
        self.index
            .batch_mut(&sample.batch_code)?
            .samples
            .iter_mut()
            .find(|s| s.code == sample.code)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "sample {} does not exist in batch {}",
                    sample.code,
                    sample.batch_code
                )
            })
    }

    pub(crate) fn add_assay(&mut self, sample: &Sample, assay: NewAssay) -> anyhow::Result<Assay> {
        let id = self.index.next_assay_id;
        let record = Assay {
            id,
            batch_code: sample.batch_code.clone(),
            sample_code: sample.code.clone(),
            filename: assay.filename,
            panel_code: assay.panel_code,
            species: assay.species,
            options: assay.options,
            size: assay.trace.len() as u64,
            uploaded_at: Utc::now(),
        };
        self.sample_entry_mut(sample)?.assays.push(record.clone());
        self.index.next_assay_id += 1;
        self.staged_traces.insert(id, assay.trace);
        tracing::debug!(id, sample = %sample.code, filename = %record.filename, "staged assay insert");
        Ok(record)
    }

    pub(crate) fn list_assays(&self, sample: &Sample) -> anyhow::Result<Vec<Assay>> {
        let entry = self.index.batch(&sample.batch_code)?;
        Ok(entry
            .samples
            .iter()
            .find(|s| s.code == sample.code)
            .map(|s| s.assays.clone())
            .unwrap_or_default())
    }

    pub(crate) fn trace(&self, assay: &Assay) -> anyhow::Result<Vec<u8>> {
        if let Some(bytes) = self.staged_traces.get(&assay.id) {
            return Ok(bytes.clone());
        }
        let path = self.trace_path(assay.id);
        std::fs::read(&path).with_context(|| format!("failed to read trace {}", path.display()))
    }

    pub(crate) fn clear_assays(&mut self, batch: &Batch) -> anyhow::Result<u64> {
        let entry = self.index.batch_mut(&batch.code)?;
        let mut removed = Vec::new();
        for sample in &mut entry.samples {
            removed.extend(sample.assays.drain(..).map(|a| a.id));
        }
        for id in &removed {
            if self.staged_traces.remove(id).is_none() {
                self.removed_traces.push(*id);
            }
        }
        tracing::debug!(batch = %batch.code, removed = removed.len(), "staged assay removal");
        Ok(removed.len() as u64)
    }

    fn trace_path(&self, id: i64) -> PathBuf {
        self.root.join(TRACE_DIR).join(format!("{id}.fsa"))
    }

    pub(crate) fn commit(self) -> anyhow::Result<()> {
        let trace_dir = self.root.join(TRACE_DIR);
        std::fs::create_dir_all(&trace_dir)
            .with_context(|| format!("failed to create {}", trace_dir.display()))?;
        for (id, bytes) in &self.staged_traces {
            let path = self.trace_path(*id);
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write trace {}", path.display()))?;
        }

        let json = serde_json::to_string_pretty(&self.index).context("failed to serialize index")?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)
            .with_context(|| format!("failed to create temp file in {}", self.root.display()))?;
        tmp.write_all(json.as_bytes())
            .context("failed to write index")?;
        let index_path = self.root.join(FS_INDEX_FILE);
        tmp.persist(&index_path)
            .with_context(|| format!("failed to replace index {}", index_path.display()))?;

        // The index no longer references these, so a failure here only leaks files.
        for id in &self.removed_traces {
            let path = self.trace_path(*id);
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "could not remove trace file");
            }
        }
        tracing::debug!(
            traces = self.staged_traces.len(),
            removed = self.removed_traces.len(),
            "committed directory database"
        );
        Ok(())
    }

    pub(crate) fn rollback(self) {
        tracing::debug!(
            staged = self.staged_traces.len(),
            "discarded directory database changes"
        );
    }
}
