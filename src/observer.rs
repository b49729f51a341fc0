// 👁️ Ingestion observers - one terminal status line per document
//
// `FILE | HASH | STATUS` is the contract external audit tooling reads. The
// orchestrator owns no logger; it reports to whatever observer it was given
// for the run. Observers are shared by every worker, hence Send + Sync.

use crate::db::{insert_event, IngestionEvent};
use crate::pipeline::Outcome;
use rusqlite::Connection;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

pub const STATUS_TARGET: &str = "ingestion_status";

pub trait IngestObserver: Send + Sync {
    /// Called exactly once per document with its terminal outcome
    fn on_outcome(&self, outcome: &Outcome);
}

// ============================================================================
// TRACING
// ============================================================================

/// Status lines as tracing events under the `ingestion_status` target
pub struct TracingObserver;

impl IngestObserver for TracingObserver {
    fn on_outcome(&self, outcome: &Outcome) {
        let line = outcome.status_line();
        match &outcome.reason {
            Some(reason) if outcome.state.is_failure() => {
                tracing::warn!(target: STATUS_TARGET, reason = %reason, "{}", line)
            }
            Some(reason) => tracing::info!(target: STATUS_TARGET, reason = %reason, "{}", line),
            None => tracing::info!(target: STATUS_TARGET, "{}", line),
        }
    }
}

// ============================================================================
// STATUS LOG FILE
// ============================================================================

/// Appends status lines to a plain text file
pub struct StatusLogObserver {
    file: Mutex<File>,
}

impl StatusLogObserver {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(StatusLogObserver {
            file: Mutex::new(file),
        })
    }
}

impl IngestObserver for StatusLogObserver {
    fn on_outcome(&self, outcome: &Outcome) {
        let Ok(mut file) = self.file.lock() else {
            tracing::error!("status log lock poisoned");
            return;
        };
        if let Err(e) = writeln!(file, "{}", outcome.status_line()) {
            tracing::error!(error = %e, "could not append to status log");
        }
    }
}

// ============================================================================
// DATABASE EVENTS
// ============================================================================

/// Mirrors each outcome into `ingestion_events` on its own connection, so the
/// record survives the document's rollback. Scoped to one run id.
pub struct EventRecorder {
    run_id: String,
    conn: Mutex<Connection>,
}

impl EventRecorder {
    pub fn new(run_id: impl Into<String>, conn: Connection) -> Self {
        EventRecorder {
            run_id: run_id.into(),
            conn: Mutex::new(conn),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }
}

impl IngestObserver for EventRecorder {
    fn on_outcome(&self, outcome: &Outcome) {
        let event = IngestionEvent::new(
            &self.run_id,
            outcome.fingerprint.as_ref().map(|f| f.as_str()),
            &outcome.file_name(),
            outcome.state.status_label(),
            outcome.reason.clone(),
        );
        let Ok(conn) = self.conn.lock() else {
            tracing::error!("event recorder lock poisoned");
            return;
        };
        if let Err(e) = insert_event(&conn, &event) {
            tracing::error!(error = %e, file = %event.file_name, "could not record ingestion event");
        }
    }
}

// ============================================================================
// FAN-OUT
// ============================================================================

#[derive(Default)]
pub struct Observers {
    observers: Vec<Box<dyn IngestObserver>>,
}

impl Observers {
    pub fn new() -> Self {
        Observers::default()
    }

    pub fn with(mut self, observer: impl IngestObserver + 'static) -> Self {
        self.observers.push(Box::new(observer));
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl IngestObserver for Observers {
    fn on_outcome(&self, outcome: &Outcome) {
        for observer in &self.observers {
            observer.on_outcome(outcome);
        }
    }
}

/// Keeps every outcome in memory; handy for tests and the CLI summary
#[derive(Default)]
pub struct CollectingObserver {
    outcomes: Mutex<Vec<Outcome>>,
}

impl CollectingObserver {
    pub fn new() -> Self {
        CollectingObserver::default()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.outcomes
            .lock()
            .map(|o| o.clone())
            .unwrap_or_default()
    }
}

impl IngestObserver for CollectingObserver {
    fn on_outcome(&self, outcome: &Outcome) {
        if let Ok(mut outcomes) = self.outcomes.lock() {
            outcomes.push(outcome.clone());
        }
    }
}

impl<T: IngestObserver + ?Sized> IngestObserver for std::sync::Arc<T> {
    fn on_outcome(&self, outcome: &Outcome) {
        (**self).on_outcome(outcome)
    }
}
