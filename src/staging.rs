// 📥 Staging writer - document row + verbatim cells, inside the unit of work
//
// The documents insert is the claim on the fingerprint: a second worker with
// the same file hits the primary key and backs off as a duplicate.

use crate::db::UnitOfWork;
use crate::error::{is_constraint_violation, IngestError, PersistenceFailure};
use crate::extract::{DocumentType, RawTable};
use crate::fingerprint::Fingerprint;
use chrono::NaiveDate;
use rusqlite::params;

/// What gets recorded about a document before any of its rows
#[derive(Debug, Clone)]
pub struct Document {
    pub fingerprint: Fingerprint,
    pub source_id: String,
    pub document_type: DocumentType,
    pub original_filename: String,
    pub extractor: String,
    pub extractor_version: String,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

/// Insert the document (status `staging`) and every raw row. Returns the
/// number of rows staged. A fingerprint that already exists is
/// `IngestError::Duplicate`; any other database error is a persistence
/// failure. Nothing is retried here.
pub fn stage(uow: &UnitOfWork<'_>, document: &Document, raw: &RawTable) -> Result<usize, IngestError> {
    let claimed = uow.execute(
        "INSERT INTO documents (
            fingerprint, source_id, document_type, original_filename, status,
            extractor, extractor_version, period_start, period_end
        ) VALUES (?1, ?2, ?3, ?4, 'staging', ?5, ?6, ?7, ?8)",
        params![
            document.fingerprint.as_str(),
            document.source_id,
            document.document_type.as_str(),
            document.original_filename,
            document.extractor,
            document.extractor_version,
            document.period_start,
            document.period_end,
        ],
    );

    match claimed {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(IngestError::Duplicate {
                fingerprint: document.fingerprint.to_string(),
            });
        }
        Err(e) => return Err(PersistenceFailure::Database(e).into()),
    }

    let mut stmt = uow
        .prepare(
            "INSERT INTO staged_rows (
                document_fingerprint, row_index, cells_json, raw_charge, raw_credit
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .map_err(PersistenceFailure::Database)?;

    for (index, row) in raw.rows.iter().enumerate() {
        let cells_json =
            serde_json::to_string(&raw.named_cells(row)).map_err(PersistenceFailure::Encoding)?;
        stmt.execute(params![
            document.fingerprint.as_str(),
            index as i64,
            cells_json,
            row.charge,
            row.credit,
        ])
        .map_err(PersistenceFailure::Database)?;
    }

    tracing::debug!(
        fingerprint = %document.fingerprint.short(),
        rows = raw.len(),
        "rows staged"
    );

    Ok(raw.len())
}

/// One staged row as re-read by the validator
#[derive(Debug, Clone, PartialEq)]
pub struct StagedRow {
    pub row_index: i64,
    pub cells: Vec<(String, String)>,
    pub raw_charge: String,
    pub raw_credit: String,
}

pub fn load_staged_rows(
    conn: &rusqlite::Connection,
    fingerprint: &Fingerprint,
) -> Result<Vec<StagedRow>, PersistenceFailure> {
    let mut stmt = conn.prepare(
        "SELECT row_index, cells_json, raw_charge, raw_credit
         FROM staged_rows
         WHERE document_fingerprint = ?1
         ORDER BY row_index",
    )?;

    let rows = stmt
        .query_map(params![fingerprint.as_str()], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(row_index, cells_json, raw_charge, raw_credit)| -> Result<StagedRow, PersistenceFailure> {
            Ok(StagedRow {
                row_index,
                cells: serde_json::from_str(&cells_json)?,
                raw_charge,
                raw_credit,
            })
        })
        .collect()
}
