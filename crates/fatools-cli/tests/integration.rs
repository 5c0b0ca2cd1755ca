use std::path::{Path, PathBuf};

use clap::Parser;
use fatools_cli::{dispatch, execute, Args, Outcome, UploadReport};
use fatools_core::{Batch, FatoolsError, Marker, Panel, RecordKind};
use fatools_store::{Database, Location, Session};
use tempfile::TempDir;

// ─── Helpers ───────────────────────────────────────────────────────────────

/// A temporary lab: an initialized database plus a directory for inputs.
struct Lab {
    dir: TempDir,
    location: Location,
    db_flag: &'static str,
}

impl Lab {
    async fn sql() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let location = Location::Sql(dir.path().join("lab.db"));
        Self::init(dir, location, "--sqldb").await
    }

    async fn fs() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let location = Location::Fs(dir.path().join("labdb"));
        Self::init(dir, location, "--fsdb").await
    }

    async fn init(dir: TempDir, location: Location, db_flag: &'static str) -> Self {
        let lab = Self { dir, location, db_flag };
        let outcome = execute(&lab.args(&["--initdb"])).await.unwrap();
        assert_eq!(outcome, Outcome::DatabaseInitialized);
        std::fs::create_dir_all(lab.fsadir()).unwrap();
        lab
    }

    fn args(&self, flags: &[&str]) -> Args {
        let mut argv = vec![
            "dbmgr".to_string(),
            self.db_flag.to_string(),
            self.location.path().display().to_string(),
        ];
        argv.extend(flags.iter().map(|f| f.to_string()));
        Args::parse_from(argv)
    }

    fn fsadir(&self) -> PathBuf {
        self.dir.path().join("fsa")
    }

    fn write(&self, name: &str, content: &str) -> String {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.display().to_string()
    }

    fn write_trace(&self, name: &str, bytes: &[u8]) {
        std::fs::write(self.fsadir().join(name), bytes).unwrap();
    }

    async fn open(&self) -> (Database, Session) {
        let db = Database::open(&self.location, false).await.unwrap();
        let session = db.session().await.unwrap();
        (db, session)
    }

    /// Batch `B1` with samples `S1` and `S2`, committed.
    async fn with_samples(self) -> Self {
        execute(&self.args(&["--initbatch", "B1", "--commit"])).await.unwrap();
        let manifest = self.write("samples.csv", "code\nS1\nS2\n");
        execute(&self.args(&["--initsample", &manifest, "--batch", "B1", "--commit"]))
            .await
            .unwrap();
        self
    }

    fn upload_args(&self, manifest: &str, extra: &[&str]) -> Args {
        let fsadir = self.fsadir().display().to_string();
        let mut flags = vec!["--upload", manifest, "--batch", "B1", "--fsadir", &fsadir];
        flags.extend_from_slice(extra);
        self.args(&flags)
    }
}

fn fatools_error(err: &anyhow::Error) -> &FatoolsError {
    err.downcast_ref::<FatoolsError>()
        .unwrap_or_else(|| panic!("not a FatoolsError: {err:#}"))
}

fn uploaded(outcome: Outcome) -> UploadReport {
    match outcome {
        Outcome::Uploaded(report) => report,
        other => panic!("expected upload report, got {other:?}"),
    }
}

async fn batch(session: &Session, code: &str) -> Batch {
    session.find_batch(code).await.unwrap().unwrap()
}

async fn assay_count(session: &Session, code: &str) -> usize {
    let b = batch(session, "B1").await;
    let sample = session.find_sample(&b, code).await.unwrap().unwrap();
    session.list_assays(&sample).await.unwrap().len()
}

// ─── Dispatch and transactions ─────────────────────────────────────────────

#[tokio::test]
async fn test_unknown_command_does_nothing() {
    let lab = Lab::sql().await;
    let outcome = execute(&lab.args(&["--commit"])).await.unwrap();
    assert_eq!(outcome, Outcome::NothingToDo);
}

#[tokio::test]
async fn test_initbatch_commits() {
    let lab = Lab::sql().await;
    let outcome = execute(&lab.args(&["--initbatch", "B1", "--commit"])).await.unwrap();
    assert_eq!(outcome, Outcome::BatchCreated("B1".to_string()));

    let (_db, session) = lab.open().await;
    assert!(session.find_batch("B1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_test_mode_discards_changes() {
    let lab = Lab::sql().await;
    let outcome = execute(&lab.args(&["--initbatch", "B1", "--commit", "--test"]))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::BatchCreated("B1".to_string()));

    let (_db, session) = lab.open().await;
    assert!(session.find_batch("B1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_missing_database_requires_initdb() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("absent.db");
    let args = Args::parse_from(["dbmgr", "--sqldb", db.to_str().unwrap(), "--initbatch", "B1", "--commit"]);
    let err = execute(&args).await.unwrap_err();
    assert!(format!("{err:#}").contains("--initdb"));
}

#[tokio::test]
async fn test_uncommitted_initdb_still_requires_initdb() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("lab.db");
    let db = db.to_str().unwrap();

    let outcome = execute(&Args::parse_from(["dbmgr", "--sqldb", db, "--initdb", "--test"]))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::DatabaseInitialized);

    let args = Args::parse_from(["dbmgr", "--sqldb", db, "--initbatch", "B1", "--commit"]);
    let err = execute(&args).await.unwrap_err();
    assert!(format!("{err:#}").contains("--initdb"), "{err:#}");
}

// ─── Panel / marker import ─────────────────────────────────────────────────

const PANELS: &str = "\
GS600LIZ:
  code: GS600LIZ
  remark: size standard
PANEL_A:
  code: PANEL_A
  data:
    dyes: [6-FAM, VIC]
";

#[tokio::test]
async fn test_import_panels() {
    let lab = Lab::sql().await;
    let yaml = lab.write("panels.yaml", PANELS);

    let outcome = execute(&lab.args(&["--importpanel", &yaml, "--commit"])).await.unwrap();
    let Outcome::Imported(report) = outcome else {
        panic!("expected import report");
    };
    assert_eq!(report.kind, RecordKind::Panel);
    assert_eq!(report.added, vec!["GS600LIZ", "PANEL_A"]);
    assert!(report.synced.is_empty());

    let (_db, session) = lab.open().await;
    let panels: Vec<Panel> = session.list_references().await.unwrap();
    assert_eq!(panels.len(), 2);
    assert_eq!(panels[1].data["dyes"][1], "VIC");
}

#[tokio::test]
async fn test_reimport_without_update_fails() {
    let lab = Lab::sql().await;
    let yaml = lab.write("panels.yaml", PANELS);
    execute(&lab.args(&["--importpanel", &yaml, "--commit"])).await.unwrap();
    assert!(execute(&lab.args(&["--importpanel", &yaml, "--commit"])).await.is_err());
}

#[tokio::test]
async fn test_update_mode_merges_instead_of_duplicating() {
    let lab = Lab::sql().await;
    let first = lab.write("m1.yaml", "TA1:\n  code: TA1\n  species: pf\n  min_size: 100\n");
    execute(&lab.args(&["--importmarker", &first, "--commit"])).await.unwrap();

    let second = lab.write(
        "m2.yaml",
        "TA1:\n  code: TA1\n  max_size: 250\nTA40:\n  code: TA40\n  repeats: 3\n",
    );
    let outcome = execute(&lab.args(&["--importmarker", &second, "--update", "--commit"]))
        .await
        .unwrap();
    let Outcome::Imported(report) = outcome else {
        panic!("expected import report");
    };
    assert_eq!(report.kind, RecordKind::Marker);
    assert_eq!(report.synced, vec!["TA1", "TA40"]);
    assert!(report.added.is_empty());

    let (_db, session) = lab.open().await;
    let markers: Vec<Marker> = session.list_references().await.unwrap();
    assert_eq!(markers.len(), 2);
    assert_eq!(markers[0].code, "TA1");
    assert_eq!(markers[0].species.as_deref(), Some("pf"));
    assert_eq!(markers[0].min_size, Some(100));
    assert_eq!(markers[0].max_size, Some(250));
    assert_eq!(markers[1].repeats, Some(3));
}

#[tokio::test]
async fn test_code_mismatch_terminates_before_any_write() {
    let lab = Lab::sql().await;
    let yaml = lab.write(
        "panels.yaml",
        "PANEL_A:\n  code: PANEL_A\nPANEL_B:\n  code: PANEL_C\n",
    );

    let err = execute(&lab.args(&["--importpanel", &yaml, "--commit"])).await.unwrap_err();
    assert!(matches!(
        fatools_error(&err),
        FatoolsError::CodeMismatch { key, .. } if key == "PANEL_B"
    ));

    let (_db, session) = lab.open().await;
    let panels: Vec<Panel> = session.list_references().await.unwrap();
    assert!(panels.is_empty());
}

// ─── Samples ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_initsample_adds_rows_in_order() {
    let lab = Lab::sql().await;
    execute(&lab.args(&["--initbatch", "B1", "--commit"])).await.unwrap();
    let manifest = lab.write("samples.csv", "code\nS1\nS2\n");

    let outcome = execute(&lab.args(&["--initsample", &manifest, "--batch", "B1", "--commit"]))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::SamplesAdded(vec!["S1".to_string(), "S2".to_string()])
    );

    let (_db, session) = lab.open().await;
    let b = batch(&session, "B1").await;
    let codes: Vec<_> = session
        .list_samples(&b)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.code)
        .collect();
    assert_eq!(codes, vec!["S1", "S2"]);
}

#[tokio::test]
async fn test_initsample_tab_separated() {
    let lab = Lab::sql().await;
    execute(&lab.args(&["--initbatch", "B1", "--commit"])).await.unwrap();
    let manifest = lab.write("samples.txt", "code\tcountry\nS1\tID\nS2,x\tTL\n");

    let outcome = execute(&lab.args(&["--initsample", &manifest, "--batch", "B1", "--test"]))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        Outcome::SamplesAdded(vec!["S1".to_string(), "S2,x".to_string()])
    );
}

#[tokio::test]
async fn test_initsample_requires_batch_code() {
    let lab = Lab::sql().await;
    let manifest = lab.write("samples.csv", "code\nS1\n");
    let err = execute(&lab.args(&["--initsample", &manifest, "--commit"])).await.unwrap_err();
    assert!(matches!(fatools_error(&err), FatoolsError::MissingBatchCode));
}

#[tokio::test]
async fn test_initsample_unknown_batch() {
    let lab = Lab::sql().await;
    let manifest = lab.write("samples.csv", "code\nS1\n");
    let err = execute(&lab.args(&["--initsample", &manifest, "--batch", "NOPE", "--commit"]))
        .await
        .unwrap_err();
    assert!(matches!(fatools_error(&err), FatoolsError::BatchNotFound(code) if code == "NOPE"));
}

// ─── Upload ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_upload_creates_assay_with_options() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF\x00\x01");
    let manifest = lab.write("upload.csv", "sample,file,panel,options\nS1,trace1.fsa,PANEL_A,ploidy=2\n");

    let report = uploaded(
        execute(&lab.upload_args(&manifest, &["--species", "pf", "--commit"]))
            .await
            .unwrap(),
    );
    assert_eq!(report.uploaded, 1);

    let (_db, session) = lab.open().await;
    let b = batch(&session, "B1").await;
    let s1 = session.find_sample(&b, "S1").await.unwrap().unwrap();
    let assays = session.list_assays(&s1).await.unwrap();
    assert_eq!(assays.len(), 1);
    assert_eq!(assays[0].panel_code, "PANEL_A");
    assert_eq!(assays[0].filename, "trace1.fsa");
    assert_eq!(assays[0].species.as_deref(), Some("pf"));
    let options = assays[0].options.as_ref().unwrap();
    assert_eq!(options.len(), 1);
    assert_eq!(options["ploidy"], serde_json::json!(2));
    assert_eq!(session.trace(&assays[0]).await.unwrap(), b"ABIF\x00\x01");
}

#[tokio::test]
async fn test_upload_skips_comment_and_blank_rows_without_lookup() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    // Neither S9 nor missing.fsa exist; touching them would fail the run.
    let manifest = lab.write(
        "upload.csv",
        "sample,file,panel\n#S9,missing.fsa,PANEL_A\n,missing.fsa,PANEL_A\nS1,trace1.fsa,PANEL_A\n",
    );

    let report = uploaded(execute(&lab.upload_args(&manifest, &["--commit"])).await.unwrap());
    assert_eq!(report.skipped, 2);
    assert_eq!(report.uploaded, 1);
}

#[tokio::test]
async fn test_upload_short_row_is_reported_and_skipped() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write("upload.csv", "sample,file,panel\nS1,trace1.fsa\nS1,trace1.fsa,PANEL_A\n");

    let report = uploaded(execute(&lab.upload_args(&manifest, &["--commit"])).await.unwrap());
    assert_eq!(report.short_rows, vec![2]);
    assert_eq!(report.uploaded, 1);
}

#[tokio::test]
async fn test_upload_short_row_aborts_under_abort_flag() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write("upload.csv", "sample,file,panel\nS1,trace1.fsa,PANEL_A\nS2\n");

    let err = execute(&lab.upload_args(&manifest, &["--abort", "--commit"]))
        .await
        .unwrap_err();
    assert!(matches!(
        fatools_error(&err),
        FatoolsError::AbortOnWarning { line: 3, .. }
    ));

    let (_db, session) = lab.open().await;
    assert_eq!(assay_count(&session, "S1").await, 0);
}

#[tokio::test]
async fn test_upload_requires_batch_code() {
    let lab = Lab::sql().await.with_samples().await;
    let manifest = lab.write("upload.csv", "sample,file,panel\nS1,trace1.fsa,PANEL_A\n");
    let err = execute(&lab.args(&["--upload", &manifest, "--commit"])).await.unwrap_err();
    assert!(matches!(fatools_error(&err), FatoolsError::MissingBatchCode));
}

#[tokio::test]
async fn test_upload_missing_sample_is_fatal_even_in_test_mode() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write(
        "upload.csv",
        "sample,file,panel\nS9,trace1.fsa,PANEL_A\nS1,trace1.fsa,PANEL_A\n",
    );

    let err = execute(&lab.upload_args(&manifest, &["--test"])).await.unwrap_err();
    assert!(matches!(
        fatools_error(&err),
        FatoolsError::SampleNotFound { sample, .. } if sample == "S9"
    ));
}

#[tokio::test]
async fn test_upload_malformed_options_are_fatal_even_in_test_mode() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write(
        "upload.csv",
        "sample,file,panel,options\n\
         S1,trace1.fsa,PANEL_A,ploidy\n\
         S2,trace1.fsa,PANEL_A\n",
    );

    let err = execute(&lab.upload_args(&manifest, &["--test"])).await.unwrap_err();
    assert!(matches!(
        fatools_error(&err),
        FatoolsError::InvalidOption(token) if token == "ploidy"
    ));
    assert!(format!("{err:#}").contains("line 2"));
}

#[tokio::test]
async fn test_upload_failure_aborts_whole_run_without_test_mode() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write(
        "upload.csv",
        "sample,file,panel\nS1,trace1.fsa,PANEL_A\nS2,missing.fsa,PANEL_A\n",
    );

    let err = execute(&lab.upload_args(&manifest, &["--commit"])).await.unwrap_err();
    let chain = format!("{err:#}");
    assert!(chain.contains("line 3"), "{chain}");
    assert!(chain.contains("missing.fsa"), "{chain}");

    // The first row was rolled back with the rest.
    let (_db, session) = lab.open().await;
    assert_eq!(assay_count(&session, "S1").await, 0);
}

#[tokio::test]
async fn test_upload_test_mode_continues_past_failures() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF-1");
    lab.write_trace("trace3.fsa", b"ABIF-3");
    let manifest = lab.write(
        "upload.csv",
        "sample,file,panel,options\n\
         S1,trace1.fsa,PANEL_A\n\
         S2,missing.fsa,PANEL_A\n\
         S2,gone.fsa,PANEL_A,ploidy=2\n\
         S1,trace3.fsa,PANEL_A,ploidy=1\n",
    );

    // Drive the session directly to inspect what the run left behind.
    let args = lab.upload_args(&manifest, &["--test"]);
    let (_db, mut session) = lab.open().await;
    let report = uploaded(dispatch(&args, &mut session).await.unwrap());

    assert_eq!(report.uploaded, 2);
    let failed_lines: Vec<_> = report.failed.iter().map(|(line, _)| *line).collect();
    assert_eq!(failed_lines, vec![3, 4]);
    assert!(report.failed[1].1.contains("gone.fsa"));

    assert_eq!(assay_count(&session, "S1").await, 2);
    assert_eq!(assay_count(&session, "S2").await, 0);
    session.rollback().await.unwrap();
}

// ─── Clear assay ───────────────────────────────────────────────────────────

#[tokio::test]
async fn test_clearassay() {
    let lab = Lab::sql().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write(
        "upload.csv",
        "sample,file,panel\nS1,trace1.fsa,PANEL_A\nS2,trace1.fsa,PANEL_A\n",
    );
    execute(&lab.upload_args(&manifest, &["--commit"])).await.unwrap();

    let outcome = execute(&lab.args(&["--clearassay", "--commit"])).await.unwrap();
    assert_eq!(outcome, Outcome::AssaysCleared(None));

    let outcome = execute(&lab.args(&["--clearassay", "--batch", "B1", "--commit"]))
        .await
        .unwrap();
    assert_eq!(outcome, Outcome::AssaysCleared(Some(2)));

    let (_db, session) = lab.open().await;
    assert_eq!(assay_count(&session, "S1").await, 0);
    assert_eq!(assay_count(&session, "S2").await, 0);
}

// ─── Directory database ────────────────────────────────────────────────────

#[tokio::test]
async fn test_fsdb_workflow() {
    let lab = Lab::fs().await.with_samples().await;
    lab.write_trace("trace1.fsa", b"ABIF");
    let manifest = lab.write("upload.tsv", "sample\tfile\tpanel\nS2\ttrace1.fsa\tPANEL_A\n");

    let report = uploaded(execute(&lab.upload_args(&manifest, &["--commit"])).await.unwrap());
    assert_eq!(report.uploaded, 1);

    let (_db, session) = lab.open().await;
    assert_eq!(assay_count(&session, "S2").await, 1);
    assert!(lab.location.path().join("fatools.json").is_file());
    assert!(Path::new(&lab.location.path().join("traces")).is_dir());
}
