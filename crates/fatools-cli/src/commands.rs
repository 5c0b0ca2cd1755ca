//! Command handlers. Each consumes one input and writes through the session.

use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use fatools_core::{
    load_references, read_manifest, reconcile, tokenize, Assay, Batch, FatoolsError, NewAssay,
    Reconciled, RecordKind, Reference, UploadEntry, UploadRow,
};
use fatools_store::Session;
use indicatif::{ProgressBar, ProgressStyle};

use crate::Args;

/// Result of a panel or marker import.
#[derive(Debug, Clone, PartialEq)]
pub struct ImportReport {
    pub kind: RecordKind,
    /// Codes inserted as new records
    pub added: Vec<String>,
    /// Codes reconciled in update mode
    pub synced: Vec<String>,
}

/// Result of an upload run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UploadReport {
    pub uploaded: usize,
    /// Blank or commented rows
    pub skipped: usize,
    /// Line numbers of rows with too few columns
    pub short_rows: Vec<u64>,
    /// Rows that failed under `--test`, with the error
    pub failed: Vec<(u64, String)>,
}

async fn require_batch(args: &Args, session: &Session) -> anyhow::Result<Batch> {
    let code = args.batch.as_deref().ok_or(FatoolsError::MissingBatchCode)?;
    let batch = session
        .find_batch(code)
        .await?
        .ok_or_else(|| FatoolsError::BatchNotFound(code.to_string()))?;
    Ok(batch)
}

/// Reports a row-level problem, or fails with it under `--abort`.
fn row_warning(args: &Args, line: u64, message: String) -> anyhow::Result<()> {
    if args.abort {
        return Err(FatoolsError::AbortOnWarning { line, message }.into());
    }
    tracing::warn!(line, %message, "row skipped");
    eprintln!("{} line {} {}", "ERR -".red(), line, message);
    Ok(())
}

pub async fn cmd_initdb(session: &mut Session) -> anyhow::Result<()> {
    session.init_schema().await?;
    println!("{} Database initialized", "✓".green());
    Ok(())
}

/// Imports panels or markers from a YAML mapping of code to fields.
pub async fn cmd_import<R: Reference>(
    args: &Args,
    session: &mut Session,
    path: &Path,
) -> anyhow::Result<ImportReport> {
    let entries = load_references::<R>(path)
        .with_context(|| format!("failed to import {}s from {}", R::KIND, path.display()))?;

    let mut report = ImportReport {
        kind: R::KIND,
        added: Vec::new(),
        synced: Vec::new(),
    };

    for (code, fields) in entries {
        if args.update {
            let existing = session.find_reference::<R>(&code).await?;
            match reconcile(existing, fields) {
                Reconciled::Insert(record) => session.insert_reference(&record).await?,
                Reconciled::Merge(record) => session.update_reference(&record).await?,
            }
            println!("{} {} {} sync'd", "✓".green(), R::KIND, code.cyan());
            report.synced.push(code);
        } else {
            let record = R::from_fields(fields);
            session.insert_reference(&record).await?;
            println!("{} {} {} added", "✓".green(), R::KIND, record.code().cyan());
            report.added.push(code);
        }
    }

    tracing::info!(
        kind = %R::KIND,
        added = report.added.len(),
        synced = report.synced.len(),
        "import finished"
    );
    Ok(report)
}

pub async fn cmd_initbatch(session: &mut Session, code: &str) -> anyhow::Result<String> {
    let batch = Batch::new(code);
    session.insert_batch(&batch).await?;
    println!("{} batch {} added", "✓".green(), batch.code.cyan());
    Ok(batch.code)
}

/// Creates one sample per manifest row under `--batch`.
pub async fn cmd_initsample(
    args: &Args,
    session: &mut Session,
    manifest: &Path,
) -> anyhow::Result<Vec<String>> {
    let batch = require_batch(args, session).await?;
    println!("Using batch code: {}", batch.code.cyan());

    let rows = read_manifest(manifest)
        .with_context(|| format!("failed to read sample manifest {}", manifest.display()))?;

    let mut added = Vec::new();
    for row in &rows {
        let code = row.first();
        if code.is_empty() {
            row_warning(args, row.line, "has no sample code".to_string())?;
            continue;
        }
        let sample = session.add_sample(&batch, code).await?;
        println!("{} sample {} added", "✓".green(), sample.code.cyan());
        added.push(sample.code);
    }

    println!("  Number of new sample(s): {}", added.len());
    Ok(added)
}

/// Uploads the traces listed in a manifest as assays of `--batch`'s samples.
pub async fn cmd_upload(
    args: &Args,
    session: &mut Session,
    manifest: &Path,
) -> anyhow::Result<UploadReport> {
    println!("Uploading FSA files from input file: {}", manifest.display());

    let batch = require_batch(args, session).await?;
    let rows = read_manifest(manifest)
        .with_context(|| format!("failed to read upload manifest {}", manifest.display()))?;
    let species = args.species();

    let pb = ProgressBar::new(rows.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{bar:40} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut report = UploadReport::default();
    for row in &rows {
        pb.inc(1);
        let entry = match row.upload_row() {
            UploadRow::Skip => {
                report.skipped += 1;
                continue;
            }
            UploadRow::Short { columns } => {
                let res = pb.suspend(|| {
                    row_warning(args, row.line, format!("only has {} item(s)", columns))
                });
                if let Err(err) = res {
                    pb.finish_and_clear();
                    return Err(err);
                }
                report.short_rows.push(row.line);
                continue;
            }
            UploadRow::Entry(entry) => entry,
        };

        match upload_entry(session, &batch, &entry, &args.fsadir, species.clone()).await {
            Ok(assay) => {
                pb.suspend(|| {
                    eprintln!(
                        "{} sample: {} assay: {} panel: {} has been uploaded",
                        "✓".green(),
                        entry.sample_code.cyan(),
                        assay.filename,
                        assay.panel_code
                    )
                });
                report.uploaded += 1;
            }
            Err(err) => {
                let fatal = err
                    .downcast_ref::<FatoolsError>()
                    .is_some_and(FatoolsError::is_fatal);
                if fatal || !args.test {
                    pb.finish_and_clear();
                    return Err(err.context(format!("line {}", row.line)));
                }
                pb.suspend(|| {
                    eprintln!("{} line {}", "ERR -".red(), row.line);
                    eprintln!(" => {:#}", err);
                });
                tracing::warn!(line = row.line, error = %format!("{err:#}"), "row failed");
                report.failed.push((row.line, format!("{err:#}")));
            }
        }
    }
    pb.finish_and_clear();

    println!(
        "  Uploaded: {} assays (skipped: {} rows, short: {} rows, failed: {} rows)",
        report.uploaded,
        report.skipped,
        report.short_rows.len(),
        report.failed.len()
    );
    Ok(report)
}

async fn upload_entry(
    session: &mut Session,
    batch: &Batch,
    entry: &UploadEntry,
    fsadir: &Path,
    species: Option<String>,
) -> anyhow::Result<Assay> {
    let options = entry.options.as_deref().map(tokenize).transpose()?;

    let sample = session
        .find_sample(batch, &entry.sample_code)
        .await?
        .ok_or_else(|| FatoolsError::SampleNotFound {
            batch: batch.code.clone(),
            sample: entry.sample_code.clone(),
        })?;

    let path = fsadir.join(&entry.filename);
    let trace = std::fs::read(&path)
        .with_context(|| format!("failed to read trace file {}", path.display()))?;

    session
        .add_assay(
            &sample,
            NewAssay {
                trace,
                filename: entry.filename.clone(),
                panel_code: entry.panel_code.clone(),
                species,
                options,
            },
        )
        .await
}

/// Removes every assay of `--batch`. Without a batch only announces itself.
pub async fn cmd_clearassay(args: &Args, session: &mut Session) -> anyhow::Result<Option<u64>> {
    println!("Clearing assay...");
    if args.batch.is_none() {
        eprintln!("{} No --batch given, nothing cleared", "!".yellow());
        return Ok(None);
    }
    let batch = require_batch(args, session).await?;
    let removed = session.clear_assays(&batch).await?;
    println!("{} {} assay(s) removed from batch {}", "✓".green(), removed, batch.code.cyan());
    Ok(Some(removed))
}
