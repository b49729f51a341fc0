// 🗄️ Database layer - schema, connections, unit of work, ingestion events
//
// Four tables:
// - documents: one row per physical file, fingerprint is the primary key and
//   doubles as the cross-worker mutex
// - staged_rows: verbatim cells, kept permanently for audit
// - raw_transactions: typed rows, written once, never updated
// - ingestion_events: one row per document attempt, written outside the
//   document's unit of work so failures stay visible

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;
use std::path::Path;
use std::time::Duration;

pub fn setup_database(conn: &Connection) -> rusqlite::Result<()> {
    // WAL so readers never block the worker that holds the write lock
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;

    // ==========================================================================
    // Documents
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS documents (
            fingerprint TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            document_type TEXT NOT NULL,
            original_filename TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'staging',
            extractor TEXT,
            extractor_version TEXT,
            period_start TEXT,
            period_end TEXT,
            ingested_at TEXT,
            archived_path TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Staged rows (verbatim cells)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS staged_rows (
            document_fingerprint TEXT NOT NULL REFERENCES documents(fingerprint),
            row_index INTEGER NOT NULL,
            cells_json TEXT NOT NULL,
            raw_charge TEXT NOT NULL,
            raw_credit TEXT NOT NULL,
            PRIMARY KEY (document_fingerprint, row_index)
        )",
        [],
    )?;

    // ==========================================================================
    // Raw transactions (amounts as exact decimal TEXT)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS raw_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tx_uuid TEXT UNIQUE NOT NULL,
            document_fingerprint TEXT NOT NULL REFERENCES documents(fingerprint),
            row_index INTEGER NOT NULL,
            transaction_date TEXT NOT NULL,
            description TEXT NOT NULL,
            charge_amount TEXT NOT NULL,
            credit_amount TEXT NOT NULL,
            installment_current INTEGER,
            installment_total INTEGER,
            installment_date TEXT,
            foreign_amount TEXT,
            exchange_rate TEXT,
            country TEXT,
            balance_after TEXT,
            reference TEXT,
            channel TEXT,
            category TEXT,
            metadata TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
            UNIQUE (document_fingerprint, row_index)
        )",
        [],
    )?;

    // ==========================================================================
    // Ingestion events (audit trail of every attempt)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ingestion_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            run_id TEXT NOT NULL,
            fingerprint TEXT,
            file_name TEXT NOT NULL,
            status TEXT NOT NULL,
            reason TEXT,
            recorded_at TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_status ON documents(status)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_raw_transactions_date ON raw_transactions(transaction_date)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_run ON ingestion_events(run_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_fingerprint ON ingestion_events(fingerprint)",
        [],
    )?;

    Ok(())
}

/// Open (or create) the ledger database with a busy timeout and the schema
/// in place. Each worker calls this for its own connection.
pub fn open_connection(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    setup_database(&conn)?;
    Ok(conn)
}

// ============================================================================
// UNIT OF WORK
// ============================================================================

/// One document's database work: a single `BEGIN IMMEDIATE` transaction.
///
/// `commit` and `rollback` consume the unit, so it is closed exactly once.
/// Dropping it without closing rolls back.
pub struct UnitOfWork<'conn> {
    tx: Transaction<'conn>,
}

impl<'conn> UnitOfWork<'conn> {
    pub fn begin(conn: &'conn mut Connection) -> rusqlite::Result<Self> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(UnitOfWork { tx })
    }

    pub fn commit(self) -> rusqlite::Result<()> {
        self.tx.commit()
    }

    pub fn rollback(self) -> rusqlite::Result<()> {
        self.tx.rollback()
    }
}

impl Deref for UnitOfWork<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.tx
    }
}

// ============================================================================
// DOCUMENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Staging,
    Committed,
    Archived,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Staging => "staging",
            DocumentStatus::Committed => "committed",
            DocumentStatus::Archived => "archived",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "staging" => Some(DocumentStatus::Staging),
            "committed" => Some(DocumentStatus::Committed),
            "archived" => Some(DocumentStatus::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `documents` row as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub fingerprint: String,
    pub source_id: String,
    pub document_type: String,
    pub original_filename: String,
    pub status: DocumentStatus,
    pub extractor: Option<String>,
    pub extractor_version: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
    pub ingested_at: Option<DateTime<Utc>>,
    pub archived_path: Option<String>,
}

pub fn get_document(conn: &Connection, fingerprint: &str) -> rusqlite::Result<Option<DocumentRecord>> {
    conn.query_row(
        "SELECT fingerprint, source_id, document_type, original_filename, status,
                extractor, extractor_version, period_start, period_end, ingested_at,
                archived_path
         FROM documents WHERE fingerprint = ?1",
        params![fingerprint],
        |row| {
            let status: String = row.get(4)?;
            let ingested_at: Option<String> = row.get(9)?;
            Ok(DocumentRecord {
                fingerprint: row.get(0)?,
                source_id: row.get(1)?,
                document_type: row.get(2)?,
                original_filename: row.get(3)?,
                status: DocumentStatus::parse(&status).ok_or_else(|| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        format!("unknown document status '{}'", status).into(),
                    )
                })?,
                extractor: row.get(5)?,
                extractor_version: row.get(6)?,
                period_start: row.get(7)?,
                period_end: row.get(8)?,
                ingested_at: ingested_at
                    .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                    .map(|dt| dt.with_timezone(&Utc)),
                archived_path: row.get(10)?,
            })
        },
    )
    .optional()
}

/// Archive bookkeeping; only a committed document moves forward to archived.
pub fn mark_archived(conn: &Connection, fingerprint: &str, archived_path: &Path) -> rusqlite::Result<bool> {
    let updated = conn.execute(
        "UPDATE documents SET status = 'archived', archived_path = ?2
         WHERE fingerprint = ?1 AND status = 'committed'",
        params![fingerprint, archived_path.to_string_lossy()],
    )?;
    Ok(updated == 1)
}

/// Document count per status, for `status` reporting
pub fn status_counts(conn: &Connection) -> rusqlite::Result<Vec<(String, i64)>> {
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM documents GROUP BY status ORDER BY status")?;
    let counts = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(counts)
}

pub fn count_staged_rows(conn: &Connection, fingerprint: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM staged_rows WHERE document_fingerprint = ?1",
        params![fingerprint],
        |row| row.get(0),
    )
}

pub fn count_transactions(conn: &Connection, fingerprint: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM raw_transactions WHERE document_fingerprint = ?1",
        params![fingerprint],
        |row| row.get(0),
    )
}

// ============================================================================
// INGESTION EVENTS
// ============================================================================

/// IngestionEvent - the database mirror of one `FILE | HASH | STATUS` line
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct IngestionEvent {
    pub event_id: String,
    pub run_id: String,
    pub fingerprint: Option<String>,
    pub file_name: String,
    pub status: String,
    pub reason: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl IngestionEvent {
    pub fn new(
        run_id: &str,
        fingerprint: Option<&str>,
        file_name: &str,
        status: &str,
        reason: Option<String>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            fingerprint: fingerprint.map(str::to_string),
            file_name: file_name.to_string(),
            status: status.to_string(),
            reason,
            recorded_at: Utc::now(),
        }
    }
}

pub fn insert_event(conn: &Connection, event: &IngestionEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO ingestion_events (
            event_id, run_id, fingerprint, file_name, status, reason, recorded_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.run_id,
            event.fingerprint,
            event.file_name,
            event.status,
            event.reason,
            event.recorded_at.to_rfc3339(),
        ],
    )?;

    Ok(())
}

/// Events of one run, oldest first
pub fn get_events_for_run(conn: &Connection, run_id: &str) -> rusqlite::Result<Vec<IngestionEvent>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, run_id, fingerprint, file_name, status, reason, recorded_at
         FROM ingestion_events
         WHERE run_id = ?1
         ORDER BY id",
    )?;

    let events = stmt
        .query_map(params![run_id], |row| {
            let recorded_at: String = row.get(6)?;
            Ok(IngestionEvent {
                event_id: row.get(0)?,
                run_id: row.get(1)?,
                fingerprint: row.get(2)?,
                file_name: row.get(3)?,
                status: row.get(4)?,
                reason: row.get(5)?,
                recorded_at: DateTime::parse_from_rfc3339(&recorded_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
                    })?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Latest run id recorded, if any
pub fn latest_run_id(conn: &Connection) -> rusqlite::Result<Option<String>> {
    conn.query_row(
        "SELECT run_id FROM ingestion_events ORDER BY id DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
    .optional()
}
