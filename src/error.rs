// ❌ Error taxonomy for the ingestion pipeline
//
// Every document ends in exactly one of these (or success). The orchestrator
// catches all of them at the per-document boundary; only setup failures
// (database, config) escape as anyhow errors in the binary.

use rust_decimal::Decimal;
use std::path::PathBuf;
use thiserror::Error;

/// Template/header not found, unreadable source, missing required total.
/// Permanent until the template is fixed.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("extraction failed: {reason}")]
pub struct ExtractionFailure {
    pub reason: String,
}

impl ExtractionFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        ExtractionFailure {
            reason: reason.into(),
        }
    }
}

/// One failed reconciliation check, with expected vs actual values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CheckMismatch {
    #[error("row count: expected {expected}, staged {actual}")]
    RowCount { expected: usize, actual: usize },

    #[error("charge sum: expected {expected}, staged {actual}")]
    ChargeSum { expected: Decimal, actual: Decimal },

    #[error("credit sum: expected {expected}, staged {actual}")]
    CreditSum { expected: Decimal, actual: Decimal },

    #[error(
        "statement coherence: opening {opening} + credits {credits} - charges {charges} = {computed}, closing {closing}"
    )]
    Coherence {
        opening: Decimal,
        credits: Decimal,
        charges: Decimal,
        computed: Decimal,
        closing: Decimal,
    },
}

/// Staged data does not reconcile with the document's totals.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("validation failed: {}", join_mismatches(.mismatches))]
pub struct ValidationFailure {
    pub mismatches: Vec<CheckMismatch>,
}

fn join_mismatches(mismatches: &[CheckMismatch]) -> String {
    mismatches
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Database error during staging or commit. The unit of work is rolled back
/// and the document is retried on the next run.
#[derive(Debug, Error)]
pub enum PersistenceFailure {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("could not encode row: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("document {0} is not staged")]
    NotStaged(String),

    #[error("interrupted before {0}")]
    Interrupted(&'static str),
}

#[derive(Debug, Error)]
#[error("could not archive {}: {source}", .path.display())]
pub struct ArchiveFailure {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Per-document outcome error.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("document {fingerprint} already ingested")]
    Duplicate { fingerprint: String },

    #[error("could not read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Extraction(#[from] ExtractionFailure),

    #[error(transparent)]
    Validation(#[from] ValidationFailure),

    #[error(transparent)]
    Persistence(#[from] PersistenceFailure),

    #[error(transparent)]
    Archive(#[from] ArchiveFailure),
}

/// Failure of the run itself rather than of one document.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not open ledger database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Persistence(PersistenceFailure::Database(err))
    }
}

/// True when a rusqlite error is a UNIQUE/PK violation.
pub fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_failure_lists_every_mismatch() {
        let failure = ValidationFailure {
            mismatches: vec![
                CheckMismatch::RowCount {
                    expected: 10,
                    actual: 9,
                },
                CheckMismatch::ChargeSum {
                    expected: Decimal::new(3000, 0),
                    actual: Decimal::new(2500, 0),
                },
            ],
        };

        let message = failure.to_string();
        assert!(message.contains("row count: expected 10, staged 9"));
        assert!(message.contains("charge sum: expected 3000, staged 2500"));
    }

    #[test]
    fn test_extraction_failure_reason() {
        let err: IngestError = ExtractionFailure::new("header not found").into();
        assert_eq!(err.to_string(), "extraction failed: header not found");
    }
}
