// Statement Ledger - Core Library
// Bank statements and receipts in, reconciled raw transactions out.
// The binary is a thin CLI over this; tests drive the same entry points.

pub mod archive;
pub mod committer;
pub mod config;
pub mod db;
pub mod discovery;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod locale;
pub mod observer;
pub mod pipeline;
pub mod reconciliation;
pub mod staging;

// Re-export commonly used types
pub use config::{PipelineConfig, SourceConfig};
pub use db::{open_connection, setup_database, DocumentRecord, DocumentStatus, UnitOfWork};
pub use error::{
    ArchiveFailure, CheckMismatch, ExtractionFailure, IngestError, PersistenceFailure, RunError,
    ValidationFailure,
};
pub use extract::{
    DocumentFormat, DocumentTotals, DocumentType, ExtractResult, Extractor, ExtractorRegistry,
    Institution, RawRow, RawTable, RawTransaction,
};
pub use fingerprint::{fingerprint_file, Fingerprint};
pub use observer::{
    CollectingObserver, EventRecorder, IngestObserver, Observers, StatusLogObserver,
    TracingObserver,
};
pub use pipeline::{DocumentJob, DocumentState, FailurePoint, Outcome, Pipeline, RunSummary};
pub use reconciliation::{CheckOutcome, ReconciliationEngine, ReconciliationReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
