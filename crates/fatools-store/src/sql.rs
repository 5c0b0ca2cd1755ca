//! libSQL backend.

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use fatools_core::{Assay, AssayOptions, Batch, NewAssay, Reference, Sample};

/// Whether the tables laid down by `init_schema` are present.
pub(crate) async fn has_schema(conn: &libsql::Connection) -> anyhow::Result<bool> {
    let mut rows = conn
        .query(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'batches'",
            (),
        )
        .await
        .context("failed to inspect database schema")?;
    Ok(rows.next().await?.is_some())
}

pub(crate) struct SqlSession {
    tx: libsql::Transaction,
}

impl SqlSession {
    pub(crate) async fn begin(conn: &libsql::Connection) -> anyhow::Result<Self> {
        let tx = conn
            .transaction()
            .await
            .context("failed to start transaction")?;
        Ok(Self { tx })
    }

    pub(crate) async fn init_schema(&mut self) -> anyhow::Result<()> {
        for table in ["panels", "markers"] {
            self.tx
                .execute(
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {table} (
                            code TEXT PRIMARY KEY,
                            body TEXT NOT NULL
                        )"
                    ),
                    (),
                )
                .await
                .with_context(|| format!("failed to create {table} table"))?;
        }

        self.tx
            .execute(
                "CREATE TABLE IF NOT EXISTS batches (
                    code TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL
                )",
                (),
            )
            .await
            .context("failed to create batches table")?;

        self.tx
            .execute(
                "CREATE TABLE IF NOT EXISTS samples (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    batch_code TEXT NOT NULL REFERENCES batches(code) ON DELETE CASCADE,
                    code TEXT NOT NULL,
                    UNIQUE (batch_code, code)
                )",
                (),
            )
            .await
            .context("failed to create samples table")?;

        self.tx
            .execute(
                "CREATE TABLE IF NOT EXISTS assays (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    batch_code TEXT NOT NULL,
                    sample_code TEXT NOT NULL,
                    filename TEXT NOT NULL,
                    panel_code TEXT NOT NULL,
                    species TEXT,
                    options TEXT,
                    size INTEGER NOT NULL,
                    uploaded_at INTEGER NOT NULL,
                    trace BLOB NOT NULL,
                    FOREIGN KEY (batch_code, sample_code)
                        REFERENCES samples(batch_code, code) ON DELETE CASCADE
                )",
                (),
            )
            .await
            .context("failed to create assays table")?;

        self.tx
            .execute(
                "CREATE INDEX IF NOT EXISTS idx_assays_sample ON assays(batch_code, sample_code)",
                (),
            )
            .await
            .context("failed to create idx_assays_sample")?;

        tracing::debug!("sql schema ready");
        Ok(())
    }

    pub(crate) async fn find_reference<R: Reference>(
        &self,
        code: &str,
    ) -> anyhow::Result<Option<R>> {
        let table = R::KIND.table();
        let mut rows = self
            .tx
            .query(
                &format!("SELECT body FROM {table} WHERE code = ?1"),
                libsql::params![code],
            )
            .await
            .with_context(|| format!("failed to query {table}"))?;

        match rows.next().await? {
            Some(row) => {
                let body: String = row.get(0)?;
                let record = serde_json::from_str(&body)
                    .with_context(|| format!("corrupt {} record {}", R::KIND, code))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn insert_reference<R: Reference>(&mut self, record: &R) -> anyhow::Result<()> {
        let table = R::KIND.table();
        let body = serde_json::to_string(record)?;
        self.tx
            .execute(
                &format!("INSERT INTO {table} (code, body) VALUES (?1, ?2)"),
                libsql::params![record.code(), body],
            )
            .await
            .with_context(|| format!("failed to insert {} {}", R::KIND, record.code()))?;
        tracing::debug!(kind = %R::KIND, code = record.code(), "inserted reference");
        Ok(())
    }

    pub(crate) async fn update_reference<R: Reference>(&mut self, record: &R) -> anyhow::Result<()> {
        let table = R::KIND.table();
        let body = serde_json::to_string(record)?;
        let affected = self
            .tx
            .execute(
                &format!("UPDATE {table} SET body = ?2 WHERE code = ?1"),
                libsql::params![record.code(), body],
            )
            .await
            .with_context(|| format!("failed to update {} {}", R::KIND, record.code()))?;
        if affected == 0 {
            anyhow::bail!("{} {} does not exist", R::KIND, record.code());
        }
        tracing::debug!(kind = %R::KIND, code = record.code(), "updated reference");
        Ok(())
    }

    pub(crate) async fn list_references<R: Reference>(&self) -> anyhow::Result<Vec<R>> {
        let table = R::KIND.table();
        let mut rows = self
            .tx
            .query(&format!("SELECT body FROM {table} ORDER BY code"), ())
            .await
            .with_context(|| format!("failed to query {table}"))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            let body: String = row.get(0)?;
            records.push(serde_json::from_str(&body)?);
        }
        Ok(records)
    }

    pub(crate) async fn insert_batch(&mut self, batch: &Batch) -> anyhow::Result<()> {
        self.tx
            .execute(
                "INSERT INTO batches (code, created_at) VALUES (?1, ?2)",
                libsql::params![batch.code.as_str(), batch.created_at.timestamp_millis()],
            )
            .await
            .with_context(|| format!("failed to insert batch {}", batch.code))?;
        tracing::debug!(code = %batch.code, "inserted batch");
        Ok(())
    }

    pub(crate) async fn find_batch(&self, code: &str) -> anyhow::Result<Option<Batch>> {
        let mut rows = self
            .tx
            .query(
                "SELECT code, created_at FROM batches WHERE code = ?1",
                libsql::params![code],
            )
            .await
            .context("failed to query batches")?;

        match rows.next().await? {
            Some(row) => {
                let code: String = row.get(0)?;
                let created_at_ms: i64 = row.get(1)?;
                let created_at = timestamp(created_at_ms)
                    .with_context(|| format!("batch {code}"))?;
                Ok(Some(Batch { code, created_at }))
            }
            None => Ok(None),
        }
    }

    pub(crate) async fn add_sample(&mut self, batch: &Batch, code: &str) -> anyhow::Result<Sample> {
        self.tx
            .execute(
                "INSERT INTO samples (batch_code, code) VALUES (?1, ?2)",
                libsql::params![batch.code.as_str(), code],
            )
            .await
            .with_context(|| format!("failed to add sample {} to batch {}", code, batch.code))?;
        tracing::debug!(batch = %batch.code, sample = code, "inserted sample");
        Ok(Sample {
            batch_code: batch.code.clone(),
            code: code.to_string(),
        })
    }

    pub(crate) async fn find_sample(
        &self,
        batch: &Batch,
        code: &str,
    ) -> anyhow::Result<Option<Sample>> {
        let mut rows = self
            .tx
            .query(
                "SELECT code FROM samples WHERE batch_code = ?1 AND code = ?2",
                libsql::params![batch.code.as_str(), code],
            )
            .await
            .context("failed to query samples")?;

        match rows.next().await? {
            Some(row) => Ok(Some(Sample {
                batch_code: batch.code.clone(),
                code: row.get(0)?,
            })),
            None => Ok(None),
        }
    }

    pub(crate) async fn list_samples(&self, batch: &Batch) -> anyhow::Result<Vec<Sample>> {
        let mut rows = self
            .tx
            .query(
                "SELECT code FROM samples WHERE batch_code = ?1 ORDER BY id",
                libsql::params![batch.code.as_str()],
            )
            .await
            .context("failed to query samples")?;

        let mut samples = Vec::new();
        while let Some(row) = rows.next().await? {
            samples.push(Sample {
                batch_code: batch.code.clone(),
                code: row.get(0)?,
            });
        }
        Ok(samples)
    }

    pub(crate) async fn add_assay(&mut self, sample: &Sample, assay: NewAssay) -> anyhow::Result<Assay> {
        let uploaded_at = Utc::now();
        let size = assay.trace.len() as u64;
        let options = assay
            .options
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        self.tx
            .execute(
                "INSERT INTO assays
                    (batch_code, sample_code, filename, panel_code, species, options, size, uploaded_at, trace)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                libsql::params![
                    sample.batch_code.as_str(),
                    sample.code.as_str(),
                    assay.filename.as_str(),
                    assay.panel_code.as_str(),
                    assay.species.as_deref(),
                    options.as_deref(),
                    size as i64,
                    uploaded_at.timestamp_millis(),
                    libsql::Value::Blob(assay.trace),
                ],
            )
            .await
            .with_context(|| {
                format!("failed to add assay {} to sample {}", assay.filename, sample.code)
            })?;
        let id = self.tx.last_insert_rowid();
        tracing::debug!(id, sample = %sample.code, filename = %assay.filename, size, "inserted assay");

        Ok(Assay {
            id,
            batch_code: sample.batch_code.clone(),
            sample_code: sample.code.clone(),
            filename: assay.filename,
            panel_code: assay.panel_code,
            species: assay.species,
            options: assay.options,
            size,
            uploaded_at,
        })
    }

    pub(crate) async fn list_assays(&self, sample: &Sample) -> anyhow::Result<Vec<Assay>> {
        let mut rows = self
            .tx
            .query(
                "SELECT id, filename, panel_code, species, options, size, uploaded_at
                    FROM assays WHERE batch_code = ?1 AND sample_code = ?2 ORDER BY id",
                libsql::params![sample.batch_code.as_str(), sample.code.as_str()],
            )
            .await
            .context("failed to query assays")?;

        let mut assays = Vec::new();
        while let Some(row) = rows.next().await? {
            let options: Option<String> = row.get(4)?;
            let options: Option<AssayOptions> = options
                .map(|o| serde_json::from_str(&o))
                .transpose()
                .context("corrupt assay options")?;
            let size: i64 = row.get(5)?;
            let uploaded_at_ms: i64 = row.get(6)?;
            let id: i64 = row.get(0)?;
            let uploaded_at =
                timestamp(uploaded_at_ms).with_context(|| format!("assay {id}"))?;
            assays.push(Assay {
                id,
                batch_code: sample.batch_code.clone(),
                sample_code: sample.code.clone(),
                filename: row.get(1)?,
                panel_code: row.get(2)?,
                species: row.get(3)?,
                options,
                size: size as u64,
                uploaded_at,
            });
        }
        Ok(assays)
    }

    pub(crate) async fn trace(&self, assay: &Assay) -> anyhow::Result<Vec<u8>> {
        let mut rows = self
            .tx
            .query("SELECT trace FROM assays WHERE id = ?1", libsql::params![assay.id])
            .await
            .context("failed to query assay trace")?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| anyhow::anyhow!("assay {} does not exist", assay.id))?;
        Ok(row.get(0)?)
    }

    pub(crate) async fn clear_assays(&mut self, batch: &Batch) -> anyhow::Result<u64> {
        let removed = self
            .tx
            .execute(
                "DELETE FROM assays WHERE batch_code = ?1",
                libsql::params![batch.code.as_str()],
            )
            .await
            .with_context(|| format!("failed to clear assays of batch {}", batch.code))?;
        tracing::debug!(batch = %batch.code, removed, "cleared assays");
        Ok(removed)
    }

    pub(crate) async fn commit(self) -> anyhow::Result<()> {
        self.tx.commit().await.context("failed to commit transaction")
    }

    pub(crate) async fn rollback(self) -> anyhow::Result<()> {
        self.tx
            .rollback()
            .await
            .context("failed to roll back transaction")
    }
}

fn timestamp(ms: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("corrupt timestamp {ms}"))
}
