// 🔄 Pipeline Orchestrator - one document from inbox to archive
//
// Discovered -> Fingerprinted -> {Skipped | Extracting}
//            -> {ExtractFailed | Staged} -> {ValidationFailed | Committed}
//            -> Archived
//
// Staging, validation and commit share one unit of work: either every row of
// a document lands in the ledger or none does. Archiving happens after the
// commit, so an ArchiveFailed document is durable and moved again next run.

use crate::archive::{archive_document, archive_name};
use crate::committer::commit;
use crate::config::PipelineConfig;
use crate::db::{count_transactions, get_document, mark_archived, open_connection, DocumentStatus, UnitOfWork};
use crate::error::{ArchiveFailure, ExtractionFailure, IngestError, PersistenceFailure, RunError};
use crate::extract::{DocumentFormat, DocumentType, ExtractorRegistry, Institution, SourceBytes};
use crate::fingerprint::{fingerprint_bytes, fingerprint_file, Fingerprint};
use crate::observer::IngestObserver;
use crate::reconciliation::ReconciliationEngine;
use crate::staging::{stage, Document};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

// ============================================================================
// JOBS AND OUTCOMES
// ============================================================================

/// One file to ingest, with what the caller declares it to be
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentJob {
    pub path: PathBuf,
    pub source_id: String,
    pub document_type: DocumentType,
}

impl DocumentJob {
    pub fn new(path: impl Into<PathBuf>, source_id: impl Into<String>, document_type: DocumentType) -> Self {
        DocumentJob {
            path: path.into(),
            source_id: source_id.into(),
            document_type,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DocumentState {
    Discovered,
    Fingerprinted,
    Skipped,
    Extracting,
    ExtractFailed,
    Staged,
    ValidationFailed,
    Committed,
    Archived,
    PersistenceFailed,
    ArchiveFailed,
}

impl DocumentState {
    /// STATUS column of the status line
    pub fn status_label(&self) -> &'static str {
        match self {
            DocumentState::Discovered => "DISCOVERED",
            DocumentState::Fingerprinted => "FINGERPRINTED",
            DocumentState::Skipped => "SKIPPED",
            DocumentState::Extracting => "EXTRACTING",
            DocumentState::ExtractFailed => "EXTRACT_FAILED",
            DocumentState::Staged => "STAGED",
            DocumentState::ValidationFailed => "VALIDATION_FAILED",
            DocumentState::Committed => "COMMITTED",
            DocumentState::Archived => "ARCHIVED",
            DocumentState::PersistenceFailed => "PERSISTENCE_FAILED",
            DocumentState::ArchiveFailed => "ARCHIVE_FAILED",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DocumentState::ExtractFailed
                | DocumentState::ValidationFailed
                | DocumentState::PersistenceFailed
                | DocumentState::ArchiveFailed
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_failure() || matches!(self, DocumentState::Skipped | DocumentState::Archived)
    }

    /// Terminal state for a document that stopped on `err`
    pub fn for_error(err: &IngestError) -> DocumentState {
        match err {
            IngestError::Duplicate { .. } => DocumentState::Skipped,
            IngestError::Read { .. } | IngestError::Extraction(_) => DocumentState::ExtractFailed,
            IngestError::Validation(_) => DocumentState::ValidationFailed,
            IngestError::Persistence(_) => DocumentState::PersistenceFailed,
            IngestError::Archive(_) => DocumentState::ArchiveFailed,
        }
    }
}

/// Where a document ended up
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub path: PathBuf,
    pub fingerprint: Option<Fingerprint>,
    pub state: DocumentState,
    /// Rows staged (or, for a re-archive, rows already committed)
    pub rows: usize,
    pub archived_to: Option<PathBuf>,
    pub reason: Option<String>,
}

impl Outcome {
    fn discovered(path: &Path) -> Self {
        Outcome {
            path: path.to_path_buf(),
            fingerprint: None,
            state: DocumentState::Discovered,
            rows: 0,
            archived_to: None,
            reason: None,
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// `FILE | HASH | STATUS`
    pub fn status_line(&self) -> String {
        format!(
            "{} | {} | {}",
            self.file_name(),
            self.fingerprint.as_ref().map(|f| f.as_str()).unwrap_or("-"),
            self.state.status_label()
        )
    }
}

/// Test hook: abort the unit of work at a fixed point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePoint {
    /// Rows are staged, nothing validated yet
    AfterStaging,
    /// Typed rows written, unit of work still open
    BeforeCommit,
}

impl FailurePoint {
    fn label(&self) -> &'static str {
        match self {
            FailurePoint::AfterStaging => "validation",
            FailurePoint::BeforeCommit => "commit",
        }
    }
}

// ============================================================================
// RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone)]
pub struct RunSummary {
    /// One outcome per job, in job order
    pub outcomes: Vec<Outcome>,
}

impl RunSummary {
    pub fn count(&self, state: DocumentState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.state.is_failure()).count()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} documents: {} archived, {} skipped, {} failed",
            self.outcomes.len(),
            self.count(DocumentState::Archived),
            self.count(DocumentState::Skipped),
            self.failed()
        )
    }
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct Pipeline {
    registry: ExtractorRegistry,
    engine: ReconciliationEngine,
    processed_dir_name: String,
    failure_point: Option<FailurePoint>,
    workers: usize,
    busy_timeout: Duration,
}

impl Pipeline {
    pub fn new(registry: ExtractorRegistry) -> Self {
        Pipeline {
            registry,
            engine: ReconciliationEngine::new(),
            processed_dir_name: "processed".to_string(),
            failure_point: None,
            workers: 1,
            busy_timeout: Duration::from_secs(5),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Pipeline::new(ExtractorRegistry::with_defaults(&config.credit_descriptions))
            .with_engine(ReconciliationEngine::with_tolerance(config.tolerance))
            .with_processed_dir_name(&config.processed_dir_name)
            .with_workers(config.workers)
            .with_busy_timeout(config.busy_timeout())
    }

    pub fn with_engine(mut self, engine: ReconciliationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_processed_dir_name(mut self, name: &str) -> Self {
        self.processed_dir_name = name.to_string();
        self
    }

    pub fn with_failure_point(mut self, point: FailurePoint) -> Self {
        self.failure_point = Some(point);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Drive one document to a terminal state. Never fails: every error
    /// becomes the outcome, and `observer` hears about it exactly once.
    pub fn process_document(
        &self,
        conn: &mut Connection,
        job: &DocumentJob,
        observer: &dyn IngestObserver,
    ) -> Outcome {
        let mut outcome = Outcome::discovered(&job.path);

        // An open unit of work rolls back as the panic unwinds through it
        let run = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_document(conn, job, &mut outcome)
        }));

        match run {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                outcome.state = DocumentState::for_error(&err);
                outcome.reason = Some(err.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                let (state, stage) = match outcome.state {
                    DocumentState::Discovered
                    | DocumentState::Fingerprinted
                    | DocumentState::Extracting => (DocumentState::ExtractFailed, "extractor"),
                    _ => (DocumentState::PersistenceFailed, "ledger write"),
                };
                tracing::error!(path = %job.path.display(), %message, "{} panicked", stage);
                outcome.state = state;
                outcome.reason = Some(format!("{} panicked: {}", stage, message));
            }
        }

        observer.on_outcome(&outcome);
        outcome
    }

    fn run_document(
        &self,
        conn: &mut Connection,
        job: &DocumentJob,
        outcome: &mut Outcome,
    ) -> Result<(), IngestError> {
        let read_error = |source| IngestError::Read {
            path: job.path.clone(),
            source,
        };

        // 1. Fingerprint + dedup
        let fingerprint = fingerprint_file(&job.path).map_err(read_error)?;
        outcome.fingerprint = Some(fingerprint.clone());
        outcome.state = DocumentState::Fingerprinted;

        if let Some(existing) = get_document(conn, fingerprint.as_str())? {
            if existing.status == DocumentStatus::Committed
                && existing.original_filename == outcome.file_name()
            {
                return self.rearchive(conn, job, &fingerprint, existing.period_end, outcome);
            }
            return Err(IngestError::Duplicate {
                fingerprint: fingerprint.to_string(),
            });
        }

        // 2. Extract
        let bytes = std::fs::read(&job.path).map_err(read_error)?;
        if fingerprint_bytes(&bytes) != fingerprint {
            return Err(ExtractionFailure::new("file changed while it was being read").into());
        }
        outcome.state = DocumentState::Extracting;

        let institution = Institution::from_source_id(&job.source_id)?;
        let format = DocumentFormat::sniff(&bytes);
        let extractor = self.registry.resolve(institution, job.document_type, format)?;
        let file_name = outcome.file_name();

        let result = extractor
            .extract(SourceBytes {
                bytes: &bytes,
                file_name: &file_name,
            })?
            .non_empty()?;

        tracing::debug!(
            fingerprint = %fingerprint.short(),
            extractor = extractor.name(),
            rows = result.raw.len(),
            "extracted"
        );

        // 3. Stage, validate, commit: one unit of work
        let uow = UnitOfWork::begin(conn)?;

        let document = Document {
            fingerprint: fingerprint.clone(),
            source_id: job.source_id.clone(),
            document_type: job.document_type,
            original_filename: file_name,
            extractor: extractor.name().to_string(),
            extractor_version: extractor.version().to_string(),
            period_start: result.totals.period_start,
            period_end: Some(result.totals.period_end),
        };
        outcome.rows = stage(&uow, &document, &result.raw)?;
        outcome.state = DocumentState::Staged;
        self.interrupt_at(FailurePoint::AfterStaging)?;

        self.engine
            .validate(&uow, &fingerprint, &result.totals)?
            .into_result()?;

        commit(&uow, &fingerprint, &result.transactions)?;
        self.interrupt_at(FailurePoint::BeforeCommit)?;
        uow.commit()?;
        outcome.state = DocumentState::Committed;

        // 4. Archive
        let name = archive_name(
            job.document_type,
            &result.totals.period_label(),
            &fingerprint,
            &job.path,
        );
        self.archive(conn, job, &fingerprint, &name, outcome)
    }

    /// A committed document whose move failed last time is still in the
    /// inbox under its original name: move it now instead of skipping it.
    fn rearchive(
        &self,
        conn: &Connection,
        job: &DocumentJob,
        fingerprint: &Fingerprint,
        period_end: Option<chrono::NaiveDate>,
        outcome: &mut Outcome,
    ) -> Result<(), IngestError> {
        let period = period_end
            .map(|d| d.format("%Y-%m").to_string())
            .unwrap_or_else(|| "undated".to_string());
        let name = archive_name(job.document_type, &period, fingerprint, &job.path);

        outcome.rows = count_transactions(conn, fingerprint.as_str())? as usize;
        outcome.state = DocumentState::Committed;
        outcome.reason = Some("committed earlier, archiving again".to_string());

        tracing::info!(fingerprint = %fingerprint.short(), "re-archiving committed document");
        self.archive(conn, job, fingerprint, &name, outcome)
    }

    fn archive(
        &self,
        conn: &Connection,
        job: &DocumentJob,
        fingerprint: &Fingerprint,
        name: &str,
        outcome: &mut Outcome,
    ) -> Result<(), IngestError> {
        let target = archive_document(&job.path, name, &self.processed_dir_name, fingerprint)?;
        outcome.archived_to = Some(target.clone());

        if !mark_archived(conn, fingerprint.as_str(), &target)? {
            tracing::warn!(
                fingerprint = %fingerprint.short(),
                target = %target.display(),
                "file moved but ledger row is not committed"
            );
            return Err(ArchiveFailure {
                path: job.path.clone(),
                source: io::Error::new(
                    io::ErrorKind::Other,
                    format!("ledger row {} is not committed", fingerprint.short()),
                ),
            }
            .into());
        }

        outcome.state = DocumentState::Archived;
        Ok(())
    }

    fn interrupt_at(&self, point: FailurePoint) -> Result<(), PersistenceFailure> {
        if self.failure_point == Some(point) {
            return Err(PersistenceFailure::Interrupted(point.label()));
        }
        Ok(())
    }

    /// Process every job with a fixed pool of scoped worker threads. Each
    /// worker opens its own connection and pulls the next job index from a
    /// shared cursor. Per-document failures, panics included, are outcomes;
    /// only a connection that cannot be opened (or a panicking observer)
    /// fails the run.
    pub fn run_batch(
        &self,
        db_path: &Path,
        jobs: &[DocumentJob],
        observer: &dyn IngestObserver,
    ) -> Result<RunSummary, RunError> {
        // Schema up front so workers never race on CREATE TABLE
        drop(open_connection(db_path, self.busy_timeout)?);

        let workers = self.workers.min(jobs.len()).max(1);
        let cursor = AtomicUsize::new(0);
        let collected: Mutex<Vec<(usize, Outcome)>> = Mutex::new(Vec::with_capacity(jobs.len()));

        tracing::info!(jobs = jobs.len(), workers, "starting run");

        let failures: Vec<RunError> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let cursor = &cursor;
                    let collected = &collected;
                    scope.spawn(move || -> rusqlite::Result<()> {
                        let mut conn = open_connection(db_path, self.busy_timeout)?;
                        loop {
                            let index = cursor.fetch_add(1, Ordering::SeqCst);
                            let Some(job) = jobs.get(index) else {
                                break;
                            };
                            let outcome = self.process_document(&mut conn, job, observer);
                            collected
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .push((index, outcome));
                        }
                        tracing::debug!(worker, "worker finished");
                        Ok(())
                    })
                })
                .collect();

            handles
                .into_iter()
                .enumerate()
                .filter_map(|(worker, handle)| match handle.join() {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(RunError::Database(e)),
                    Err(_) => Some(RunError::WorkerPanicked(worker)),
                })
                .collect()
        });

        if let Some(err) = failures.into_iter().next() {
            return Err(err);
        }

        let mut outcomes = collected
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        outcomes.sort_by_key(|(index, _)| *index);

        let summary = RunSummary {
            outcomes: outcomes.into_iter().map(|(_, outcome)| outcome).collect(),
        };
        tracing::info!("{}", summary.summary());
        Ok(summary)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{count_staged_rows, setup_database};
    use crate::observer::CollectingObserver;
    use std::fs;

    const CHECKING_SHEET: &str = "Saldo inicial;;100.000;;\n\
                                  Saldo final;;103.500;;\n\
                                  Fecha;Descripcion;Cargo;Abono;Saldo\n\
                                  02-01-2024;SUELDO;;5.000;105.000\n\
                                  03-01-2024;GIRO;1.500;;103.500\n";

    fn setup() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::open(dir.path().join("ledger.db")).unwrap();
        setup_database(&conn).unwrap();
        (dir, conn)
    }

    fn falabella_job(dir: &Path, name: &str, contents: &str) -> DocumentJob {
        let inbox = dir.join("inbox");
        fs::create_dir_all(&inbox).unwrap();
        let path = inbox.join(name);
        fs::write(&path, contents).unwrap();
        DocumentJob::new(path, "banco-falabella", DocumentType::CheckingStatement)
    }

    fn pipeline() -> Pipeline {
        Pipeline::new(ExtractorRegistry::with_defaults(&[]))
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(DocumentState::Archived.status_label(), "ARCHIVED");
        assert_eq!(DocumentState::ExtractFailed.status_label(), "EXTRACT_FAILED");
        assert!(DocumentState::ArchiveFailed.is_failure());
        assert!(DocumentState::Skipped.is_terminal());
        assert!(!DocumentState::Skipped.is_failure());
        assert!(!DocumentState::Staged.is_terminal());
    }

    #[test]
    fn test_status_line_without_fingerprint() {
        let outcome = Outcome::discovered(Path::new("/inbox/missing.csv"));
        assert_eq!(outcome.status_line(), "missing.csv | - | DISCOVERED");
    }

    #[test]
    fn test_sheet_document_is_committed_and_archived() {
        let (dir, mut conn) = setup();
        let job = falabella_job(dir.path(), "cartola.csv", CHECKING_SHEET);
        let observer = CollectingObserver::new();

        let outcome = pipeline().process_document(&mut conn, &job, &observer);

        assert_eq!(outcome.state, DocumentState::Archived, "{:?}", outcome.reason);
        assert_eq!(outcome.rows, 2);
        let fp = outcome.fingerprint.clone().unwrap();
        let target = outcome.archived_to.clone().unwrap();
        assert_eq!(
            target,
            dir.path()
                .join("inbox")
                .join("processed")
                .join(format!("checking_2024-01_{}.csv", fp.short()))
        );
        assert!(!job.path.exists());

        let doc = get_document(&conn, fp.as_str()).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Archived);
        assert_eq!(doc.extractor.as_deref(), Some("falabella_checking_sheet"));
        assert_eq!(count_transactions(&conn, fp.as_str()).unwrap(), 2);
        assert_eq!(observer.outcomes().len(), 1);
    }

    #[test]
    fn test_same_bytes_twice_is_skipped() {
        let (dir, mut conn) = setup();
        let first = falabella_job(dir.path(), "a.csv", CHECKING_SHEET);
        let second = falabella_job(dir.path(), "renamed.csv", CHECKING_SHEET);
        let observer = CollectingObserver::new();

        let p = pipeline();
        assert_eq!(p.process_document(&mut conn, &first, &observer).state, DocumentState::Archived);
        let again = p.process_document(&mut conn, &second, &observer);

        assert_eq!(again.state, DocumentState::Skipped);
        assert!(second.path.exists());
        let fp = again.fingerprint.unwrap();
        assert_eq!(count_transactions(&conn, fp.as_str()).unwrap(), 2);
    }

    #[test]
    fn test_incoherent_balances_fail_validation_and_roll_back() {
        let (dir, mut conn) = setup();
        let sheet = CHECKING_SHEET.replace("Saldo final;;103.500", "Saldo final;;99.000");
        let job = falabella_job(dir.path(), "bad.csv", &sheet);

        let outcome = pipeline().process_document(&mut conn, &job, &CollectingObserver::new());

        assert_eq!(outcome.state, DocumentState::ValidationFailed);
        assert!(outcome.reason.unwrap().contains("closing 99000"));
        let fp = outcome.fingerprint.unwrap();
        assert!(get_document(&conn, fp.as_str()).unwrap().is_none());
        assert_eq!(count_staged_rows(&conn, fp.as_str()).unwrap(), 0);
        assert!(job.path.exists());
    }

    #[test]
    fn test_interrupted_before_commit_leaves_nothing() {
        let (dir, mut conn) = setup();
        let job = falabella_job(dir.path(), "cartola.csv", CHECKING_SHEET);

        let outcome = pipeline()
            .with_failure_point(FailurePoint::BeforeCommit)
            .process_document(&mut conn, &job, &CollectingObserver::new());

        assert_eq!(outcome.state, DocumentState::PersistenceFailed);
        assert_eq!(outcome.reason.as_deref(), Some("interrupted before commit"));
        let fp = outcome.fingerprint.unwrap();
        assert!(get_document(&conn, fp.as_str()).unwrap().is_none());
        assert_eq!(count_transactions(&conn, fp.as_str()).unwrap(), 0);

        // next run picks it up
        let retry = pipeline().process_document(&mut conn, &job, &CollectingObserver::new());
        assert_eq!(retry.state, DocumentState::Archived);
    }

    #[test]
    fn test_unknown_source_and_missing_file_are_extract_failures() {
        let (dir, mut conn) = setup();
        let mut job = falabella_job(dir.path(), "cartola.csv", CHECKING_SHEET);
        job.source_id = "some-other-bank".to_string();

        let outcome = pipeline().process_document(&mut conn, &job, &CollectingObserver::new());
        assert_eq!(outcome.state, DocumentState::ExtractFailed);
        assert!(outcome.fingerprint.is_some());

        let missing = DocumentJob::new(dir.path().join("nope.csv"), "banco-falabella", DocumentType::CheckingStatement);
        let outcome = pipeline().process_document(&mut conn, &missing, &CollectingObserver::new());
        assert_eq!(outcome.state, DocumentState::ExtractFailed);
        assert_eq!(outcome.fingerprint, None);
    }

    #[test]
    fn test_committed_document_still_in_inbox_is_archived_again() {
        let (dir, mut conn) = setup();
        let job = falabella_job(dir.path(), "cartola.csv", CHECKING_SHEET);
        let p = pipeline();
        let first = p.process_document(&mut conn, &job, &CollectingObserver::new());
        let fp = first.fingerprint.unwrap();

        // simulate a move that never happened
        let archived = first.archived_to.unwrap();
        fs::rename(&archived, &job.path).unwrap();
        conn.execute(
            "UPDATE documents SET status = 'committed', archived_path = NULL WHERE fingerprint = ?1",
            [fp.as_str()],
        )
        .unwrap();

        let again = p.process_document(&mut conn, &job, &CollectingObserver::new());

        assert_eq!(again.state, DocumentState::Archived);
        assert_eq!(again.rows, 2);
        assert_eq!(again.archived_to, Some(archived));
        assert!(!job.path.exists());
        assert_eq!(count_transactions(&conn, fp.as_str()).unwrap(), 2);
    }

    #[test]
    fn test_archive_without_committed_row_is_archive_failed() {
        let (dir, conn) = setup();
        let job = falabella_job(dir.path(), "cartola.csv", CHECKING_SHEET);
        let fp = fingerprint_file(&job.path).unwrap();
        let mut outcome = Outcome::discovered(&job.path);

        // no documents row for this fingerprint, so nothing to mark archived
        let err = pipeline()
            .archive(&conn, &job, &fp, "checking_2024-01_x.csv", &mut outcome)
            .unwrap_err();

        assert_eq!(DocumentState::for_error(&err), DocumentState::ArchiveFailed);
        assert!(err.to_string().contains("is not committed"));
        let target = outcome.archived_to.unwrap();
        assert!(target.exists());
        assert!(get_document(&conn, fp.as_str()).unwrap().is_none());
    }

    #[test]
    fn test_extractor_panic_is_an_extract_failure() {
        struct Explodes;

        impl crate::extract::Extractor for Explodes {
            fn name(&self) -> &str {
                "explodes"
            }

            fn document_type(&self) -> DocumentType {
                DocumentType::CheckingStatement
            }

            fn extract(
                &self,
                _source: SourceBytes<'_>,
            ) -> Result<crate::extract::ExtractResult, ExtractionFailure> {
                panic!("malformed xref table")
            }
        }

        let (dir, mut conn) = setup();
        let job = falabella_job(dir.path(), "cartola.csv", CHECKING_SHEET);
        let mut registry = ExtractorRegistry::default();
        registry.register(
            Institution::BancoFalabella,
            &[DocumentFormat::Delimited],
            std::sync::Arc::new(Explodes),
        );
        let observer = CollectingObserver::new();

        let outcome = Pipeline::new(registry).process_document(&mut conn, &job, &observer);

        assert_eq!(outcome.state, DocumentState::ExtractFailed);
        assert_eq!(
            outcome.reason.as_deref(),
            Some("extractor panicked: malformed xref table")
        );
        assert!(job.path.exists());
        assert_eq!(observer.outcomes().len(), 1);

        // the connection is still usable
        let fp = outcome.fingerprint.unwrap();
        assert!(get_document(&conn, fp.as_str()).unwrap().is_none());
    }

    #[test]
    fn test_run_batch_keeps_job_order_and_skips_in_batch_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let jobs = vec![
            falabella_job(dir.path(), "one.csv", CHECKING_SHEET),
            falabella_job(dir.path(), "two.csv", CHECKING_SHEET),
            falabella_job(dir.path(), "junk.csv", "nothing;here\n"),
        ];
        let observer = CollectingObserver::new();

        let summary = pipeline()
            .with_workers(3)
            .run_batch(&dir.path().join("ledger.db"), &jobs, &observer)
            .unwrap();

        assert_eq!(summary.outcomes.len(), 3);
        assert_eq!(summary.outcomes[2].file_name(), "junk.csv");
        assert_eq!(summary.outcomes[2].state, DocumentState::ExtractFailed);
        // identical bytes: exactly one wins, whichever worker got there first
        assert_eq!(summary.count(DocumentState::Archived), 1);
        assert_eq!(summary.count(DocumentState::Skipped), 1);
        assert_eq!(summary.failed(), 1);
        assert_eq!(observer.outcomes().len(), 3);
    }
}
