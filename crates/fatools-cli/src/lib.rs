//! `dbmgr`: database management for fatools.
//!
//! Flags select exactly one command; [`execute`] opens the database, runs
//! the command inside a single [`Session`] and commits or discards it
//! according to the [`RunMode`].

use std::path::{Path, PathBuf};

use clap::Parser;
use colored::Colorize;
use fatools_core::{Marker, Panel};
use fatools_store::{Database, Location, Session};

pub mod commands;

pub use commands::{ImportReport, UploadReport};

#[derive(Parser, Debug, Clone)]
#[command(name = "dbmgr", version, about = "Manage the fatools fragment-analysis database")]
pub struct Args {
    /// SQLite database file
    #[arg(long, env = "FATOOLS_SQLDB", conflicts_with = "fsdb")]
    pub sqldb: Option<PathBuf>,

    /// Directory for filesystem-based database
    #[arg(long, env = "FATOOLS_FSDB")]
    pub fsdb: Option<PathBuf>,

    /// Initialize database
    #[arg(long)]
    pub initdb: bool,

    /// Import panels from a YAML file
    #[arg(long, value_name = "YAML")]
    pub importpanel: Option<PathBuf>,

    /// Import markers from a YAML file
    #[arg(long, value_name = "YAML")]
    pub importmarker: Option<PathBuf>,

    /// Sync imported panels/markers with records already in the database
    #[arg(long)]
    pub update: bool,

    /// Commit to database
    #[arg(long)]
    pub commit: bool,

    /// Upload FSA files listed in a manifest
    #[arg(long, value_name = "MANIFEST")]
    pub upload: Option<PathBuf>,

    /// Batch code
    #[arg(long)]
    pub batch: Option<String>,

    /// Directory containing FSA files
    #[arg(long, default_value = ".")]
    pub fsadir: PathBuf,

    /// Create a new batch
    #[arg(long, value_name = "CODE")]
    pub initbatch: Option<String>,

    /// Create new samples from a sample manifest
    #[arg(long, value_name = "MANIFEST")]
    pub initsample: Option<PathBuf>,

    /// Clear assays of --batch
    #[arg(long)]
    pub clearassay: bool,

    /// Species of markers
    #[arg(long, default_value = "")]
    pub species: String,

    /// Perform a test run, reporting per-row upload errors as warnings
    #[arg(long)]
    pub test: bool,

    /// Abort on any row-level warning
    #[arg(long)]
    pub abort: bool,
}

/// The single action an invocation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Upload(&'a Path),
    InitBatch(&'a str),
    InitSample(&'a Path),
    ImportPanel(&'a Path),
    ImportMarker(&'a Path),
    InitDb,
    ClearAssay,
}

/// How the session's changes are treated once the command finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Commit on success
    Commit,
    /// Discard changes; ask the user before running
    Confirm,
    /// Discard changes without asking; tolerate per-row upload errors
    Test,
}

impl Args {
    /// Picks the command by flag priority.
    pub fn command(&self) -> Option<Command<'_>> {
        if let Some(path) = &self.upload {
            Some(Command::Upload(path))
        } else if let Some(code) = &self.initbatch {
            Some(Command::InitBatch(code))
        } else if let Some(path) = &self.initsample {
            Some(Command::InitSample(path))
        } else if let Some(path) = &self.importpanel {
            Some(Command::ImportPanel(path))
        } else if let Some(path) = &self.importmarker {
            Some(Command::ImportMarker(path))
        } else if self.initdb {
            Some(Command::InitDb)
        } else if self.clearassay {
            Some(Command::ClearAssay)
        } else {
            None
        }
    }

    pub fn run_mode(&self) -> RunMode {
        if self.test {
            RunMode::Test
        } else if self.commit || self.initdb {
            RunMode::Commit
        } else {
            RunMode::Confirm
        }
    }

    pub fn location(&self) -> anyhow::Result<Location> {
        Location::resolve(self.sqldb.clone(), self.fsdb.clone())
    }

    /// `--species`, with the empty default meaning "none".
    pub fn species(&self) -> Option<String> {
        Some(self.species.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }
}

/// Reads a yes/no answer: anything starting with `y` (any case) is a yes.
pub fn confirmed(answer: &str) -> bool {
    answer.trim().to_lowercase().starts_with('y')
}

/// What a dispatched command did.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Uploaded(UploadReport),
    BatchCreated(String),
    /// Codes of the created samples, in manifest order
    SamplesAdded(Vec<String>),
    Imported(ImportReport),
    DatabaseInitialized,
    /// Number of removed assays, if a batch was given
    AssaysCleared(Option<u64>),
    NothingToDo,
}

/// Runs the selected command against an open session.
///
/// Does not commit or roll back; that is [`execute`]'s job.
pub async fn dispatch(args: &Args, session: &mut Session) -> anyhow::Result<Outcome> {
    let Some(command) = args.command() else {
        eprintln!("{} Unknown command, nothing to do!", "!".yellow());
        return Ok(Outcome::NothingToDo);
    };
    tracing::info!(?command, "dispatching");

    let outcome = match command {
        Command::Upload(path) => Outcome::Uploaded(commands::cmd_upload(args, session, path).await?),
        Command::InitBatch(code) => {
            Outcome::BatchCreated(commands::cmd_initbatch(session, code).await?)
        }
        Command::InitSample(path) => {
            Outcome::SamplesAdded(commands::cmd_initsample(args, session, path).await?)
        }
        Command::ImportPanel(path) => {
            Outcome::Imported(commands::cmd_import::<Panel>(args, session, path).await?)
        }
        Command::ImportMarker(path) => {
            Outcome::Imported(commands::cmd_import::<Marker>(args, session, path).await?)
        }
        Command::InitDb => {
            commands::cmd_initdb(session).await?;
            Outcome::DatabaseInitialized
        }
        Command::ClearAssay => Outcome::AssaysCleared(commands::cmd_clearassay(args, session).await?),
    };
    Ok(outcome)
}

/// Opens the database, dispatches, and commits or discards the session.
///
/// Any error discards the session. Confirmation for [`RunMode::Confirm`]
/// is the caller's responsibility.
pub async fn execute(args: &Args) -> anyhow::Result<Outcome> {
    let location = args.location()?;
    let db = Database::open(&location, args.initdb).await?;
    let mut session = db.session().await?;

    let result = run_in_session(args, &mut session).await;

    match result {
        Ok(outcome) if args.run_mode() == RunMode::Commit => {
            session.commit().await?;
            eprintln!("{}", "** COMMIT to database **".green().bold());
            Ok(outcome)
        }
        Ok(outcome) => {
            session.rollback().await?;
            tracing::info!("changes discarded");
            Ok(outcome)
        }
        Err(err) => {
            if let Err(rollback_err) = session.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failure also failed");
            }
            Err(err)
        }
    }
}

async fn run_in_session(args: &Args, session: &mut Session) -> anyhow::Result<Outcome> {
    if args.initdb {
        session.init_schema().await?;
    }
    dispatch(args, session).await
}
