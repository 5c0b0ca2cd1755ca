//! Storage for fatools.
//!
//! Two backends are supported: a single-file libSQL database (`--sqldb`) and
//! a directory database (`--fsdb`) holding a JSON index plus one file per
//! trace. Both are driven through [`Session`], a unit of work that is either
//! committed or rolled back as a whole.

use std::path::{Path, PathBuf};

use anyhow::Context;
use fatools_core::{Assay, Batch, NewAssay, Reference, Sample};

mod fs;
mod sql;

/// File name of the directory database's index.
pub const FS_INDEX_FILE: &str = "fatools.json";

/// Returns the default data directory for fatools.
///
/// On Linux: `~/.local/share/fatools`
/// On macOS: `~/Library/Application Support/fatools`
/// On Windows: `%LOCALAPPDATA%\fatools`
pub fn default_data_dir() -> anyhow::Result<PathBuf> {
    let dir = dirs::data_local_dir()
        .ok_or_else(|| anyhow::anyhow!("cannot find data dir"))?
        .join("fatools");
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create data directory: {}", dir.display()))?;
    Ok(dir)
}

/// Where a database lives, and therefore which backend serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// libSQL database file
    Sql(PathBuf),
    /// Directory database
    Fs(PathBuf),
}

impl Location {
    /// Picks the location from `--sqldb` / `--fsdb`, falling back to the
    /// default SQL database in the data directory.
    pub fn resolve(sqldb: Option<PathBuf>, fsdb: Option<PathBuf>) -> anyhow::Result<Self> {
        match (sqldb, fsdb) {
            (Some(_), Some(_)) => anyhow::bail!("--sqldb and --fsdb are mutually exclusive"),
            (Some(path), None) => Ok(Location::Sql(path)),
            (None, Some(dir)) => Ok(Location::Fs(dir)),
            (None, None) => Ok(Location::Sql(default_data_dir()?.join("fatools.db"))),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Location::Sql(p) | Location::Fs(p) => p,
        }
    }

    /// Whether a database file or index is present at this location.
    pub fn exists(&self) -> bool {
        match self {
            Location::Sql(p) => p.is_file(),
            Location::Fs(dir) => dir.join(FS_INDEX_FILE).is_file(),
        }
    }
}

fn not_initialized(location: &Location) -> anyhow::Error {
    anyhow::anyhow!(
        "no database at {} (run with --initdb to create one)",
        location.path().display()
    )
}

/// An open database handle.
pub struct Database {
    backend: Backend,
}

enum Backend {
    Sql {
        _db: libsql::Database,
        conn: libsql::Connection,
    },
    Fs(PathBuf),
}

impl Database {
    /// Opens the database at `location`.
    ///
    /// With `initial` the location is created if needed; the schema itself is
    /// laid down by [`Session::init_schema`] so that it shares the fate of the
    /// session. Without `initial` the database must already exist.
    pub async fn open(location: &Location, initial: bool) -> anyhow::Result<Self> {
        if !initial && !location.exists() {
            return Err(not_initialized(location));
        }

        let backend = match location {
            Location::Sql(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create directory: {}", parent.display())
                    })?;
                }
                let db = libsql::Builder::new_local(path)
                    .build()
                    .await
                    .with_context(|| format!("failed to open database at: {}", path.display()))?;
                let conn = db
                    .connect()
                    .with_context(|| "failed to get database connection")?;
                // An `--initdb --test` run leaves the file behind without tables.
                if !initial && !sql::has_schema(&conn).await? {
                    return Err(not_initialized(location));
                }
                Backend::Sql { _db: db, conn }
            }
            Location::Fs(dir) => {
                if initial {
                    std::fs::create_dir_all(dir).with_context(|| {
                        format!("failed to create database directory: {}", dir.display())
                    })?;
                }
                Backend::Fs(dir.clone())
            }
        };

        tracing::debug!(location = %location.path().display(), initial, "opened database");
        Ok(Self { backend })
    }

    /// Starts a new unit of work.
    pub async fn session(&self) -> anyhow::Result<Session> {
        let inner = match &self.backend {
            Backend::Sql { conn, .. } => Inner::Sql(sql::SqlSession::begin(conn).await?),
            Backend::Fs(dir) => Inner::Fs(fs::FsSession::begin(dir)?),
        };
        Ok(Session { inner })
    }
}

/// A unit of work against the database.
///
/// Changes become durable only through [`Session::commit`]. Calling
/// [`Session::rollback`], or dropping the session, discards them.
pub struct Session {
    inner: Inner,
}

enum Inner {
    Sql(sql::SqlSession),
    Fs(fs::FsSession),
}

impl Session {
    /// Creates the schema if it does not exist yet.
    pub async fn init_schema(&mut self) -> anyhow::Result<()> {
        match &mut self.inner {
            Inner::Sql(s) => s.init_schema().await,
            Inner::Fs(s) => s.init_schema(),
        }
    }

    pub async fn find_reference<R: Reference>(&self, code: &str) -> anyhow::Result<Option<R>> {
        match &self.inner {
            Inner::Sql(s) => s.find_reference(code).await,
            Inner::Fs(s) => s.find_reference(code),
        }
    }

    /// Adds a new reference record. Fails if the code is already taken.
    pub async fn insert_reference<R: Reference>(&mut self, record: &R) -> anyhow::Result<()> {
        match &mut self.inner {
            Inner::Sql(s) => s.insert_reference(record).await,
            Inner::Fs(s) => s.insert_reference(record),
        }
    }

    /// Replaces the stored record with the same code.
    pub async fn update_reference<R: Reference>(&mut self, record: &R) -> anyhow::Result<()> {
        match &mut self.inner {
            Inner::Sql(s) => s.update_reference(record).await,
            Inner::Fs(s) => s.update_reference(record),
        }
    }

    /// All records of one kind, ordered by code.
    pub async fn list_references<R: Reference>(&self) -> anyhow::Result<Vec<R>> {
        match &self.inner {
            Inner::Sql(s) => s.list_references().await,
            Inner::Fs(s) => s.list_references(),
        }
    }

    pub async fn insert_batch(&mut self, batch: &Batch) -> anyhow::Result<()> {
        match &mut self.inner {
            Inner::Sql(s) => s.insert_batch(batch).await,
            Inner::Fs(s) => s.insert_batch(batch),
        }
    }

    pub async fn find_batch(&self, code: &str) -> anyhow::Result<Option<Batch>> {
        match &self.inner {
            Inner::Sql(s) => s.find_batch(code).await,
            Inner::Fs(s) => s.find_batch(code),
        }
    }

    /// Creates a sample under `batch`. Fails if the batch already has one with this code.
    pub async fn add_sample(&mut self, batch: &Batch, code: &str) -> anyhow::Result<Sample> {
        match &mut self.inner {
            Inner::Sql(s) => s.add_sample(batch, code).await,
            Inner::Fs(s) => s.add_sample(batch, code),
        }
    }

    pub async fn find_sample(&self, batch: &Batch, code: &str) -> anyhow::Result<Option<Sample>> {
        match &self.inner {
            Inner::Sql(s) => s.find_sample(batch, code).await,
            Inner::Fs(s) => s.find_sample(batch, code),
        }
    }

    /// Samples of a batch in creation order.
    pub async fn list_samples(&self, batch: &Batch) -> anyhow::Result<Vec<Sample>> {
        match &self.inner {
            Inner::Sql(s) => s.list_samples(batch).await,
            Inner::Fs(s) => s.list_samples(batch),
        }
    }

    /// Attaches a trace to a sample.
    pub async fn add_assay(&mut self, sample: &Sample, assay: NewAssay) -> anyhow::Result<Assay> {
        match &mut self.inner {
            Inner::Sql(s) => s.add_assay(sample, assay).await,
            Inner::Fs(s) => s.add_assay(sample, assay),
        }
    }

    /// Assays of a sample in upload order.
    pub async fn list_assays(&self, sample: &Sample) -> anyhow::Result<Vec<Assay>> {
        match &self.inner {
            Inner::Sql(s) => s.list_assays(sample).await,
            Inner::Fs(s) => s.list_assays(sample),
        }
    }

    /// The raw trace bytes of an assay.
    pub async fn trace(&self, assay: &Assay) -> anyhow::Result<Vec<u8>> {
        match &self.inner {
            Inner::Sql(s) => s.trace(assay).await,
            Inner::Fs(s) => s.trace(assay),
        }
    }

    /// Deletes every assay of every sample in `batch`; returns how many were removed.
    pub async fn clear_assays(&mut self, batch: &Batch) -> anyhow::Result<u64> {
        match &mut self.inner {
            Inner::Sql(s) => s.clear_assays(batch).await,
            Inner::Fs(s) => s.clear_assays(batch),
        }
    }

    pub async fn commit(self) -> anyhow::Result<()> {
        match self.inner {
            Inner::Sql(s) => s.commit().await,
            Inner::Fs(s) => s.commit(),
        }
    }

    pub async fn rollback(self) -> anyhow::Result<()> {
        match self.inner {
            Inner::Sql(s) => s.rollback().await,
            Inner::Fs(s) => {
                s.rollback();
                Ok(())
            }
        }
    }
}
