// ✅ Raw transaction committer
//
// Typed rows go in, the document flips to `committed`, all inside the same
// unit of work the rows were staged in. The orchestrator commits the unit
// once afterwards; nothing here is visible until then.

use crate::db::UnitOfWork;
use crate::error::PersistenceFailure;
use crate::extract::RawTransaction;
use crate::fingerprint::Fingerprint;
use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

pub fn commit(
    uow: &UnitOfWork<'_>,
    fingerprint: &Fingerprint,
    transactions: &[RawTransaction],
) -> Result<usize, PersistenceFailure> {
    let mut stmt = uow.prepare(
        "INSERT INTO raw_transactions (
            tx_uuid, document_fingerprint, row_index, transaction_date, description,
            charge_amount, credit_amount,
            installment_current, installment_total, installment_date,
            foreign_amount, exchange_rate, country,
            balance_after, reference, channel, category, metadata
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
    )?;

    for tx in transactions {
        let metadata_json = if tx.metadata.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&tx.metadata)?)
        };
        let installment = tx.installment.as_ref();
        let foreign = tx.foreign.as_ref();

        stmt.execute(params![
            uuid::Uuid::new_v4().to_string(),
            fingerprint.as_str(),
            tx.row_index as i64,
            tx.transaction_date,
            tx.description,
            tx.charge_amount.to_string(),
            tx.credit_amount.to_string(),
            installment.map(|i| i.current),
            installment.map(|i| i.total),
            installment.and_then(|i| i.charge_date),
            foreign.map(|f| f.amount.to_string()),
            foreign.map(|f| f.exchange_rate.to_string()),
            foreign.and_then(|f| f.country.clone()),
            tx.balance_after.map(|b| b.to_string()),
            tx.reference,
            tx.channel,
            tx.category,
            metadata_json,
        ])?;
    }

    let marked = uow.execute(
        "UPDATE documents SET status = 'committed', ingested_at = ?2
         WHERE fingerprint = ?1 AND status = 'staging'",
        params![fingerprint.as_str(), Utc::now().to_rfc3339()],
    )?;
    if marked != 1 {
        return Err(PersistenceFailure::NotStaged(fingerprint.to_string()));
    }

    tracing::debug!(
        fingerprint = %fingerprint.short(),
        rows = transactions.len(),
        "transactions written"
    );

    Ok(transactions.len())
}

/// Committed rows of one document, in row order. Only the core columns are
/// read back; extras stay in the database.
pub fn load_transactions(
    conn: &Connection,
    fingerprint: &Fingerprint,
) -> Result<Vec<RawTransaction>, PersistenceFailure> {
    let mut stmt = conn.prepare(
        "SELECT row_index, transaction_date, description, charge_amount, credit_amount,
                balance_after, reference, metadata
         FROM raw_transactions
         WHERE document_fingerprint = ?1
         ORDER BY row_index",
    )?;

    let rows = stmt
        .query_map(params![fingerprint.as_str()], |row| {
            let row_index: i64 = row.get(0)?;
            let date: NaiveDate = row.get(1)?;
            let charge: String = row.get(3)?;
            let credit: String = row.get(4)?;
            let balance: Option<String> = row.get(5)?;
            let metadata: Option<String> = row.get(7)?;

            let mut tx = RawTransaction::new(
                row_index as usize,
                date,
                row.get::<_, String>(2)?,
                decimal_column(3, &charge)?,
                decimal_column(4, &credit)?,
            );
            tx.balance_after = balance.as_deref().map(|b| decimal_column(5, b)).transpose()?;
            tx.reference = row.get(6)?;
            tx.metadata = metadata
                .as_deref()
                .map(serde_json::from_str::<HashMap<String, serde_json::Value>>)
                .transpose()
                .map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(7, rusqlite::types::Type::Text, Box::new(e))
                })?
                .unwrap_or_default();
            Ok(tx)
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(rows)
}

fn decimal_column(index: usize, text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{get_document, setup_database, DocumentStatus};
    use crate::extract::{DocumentType, RawTable};
    use crate::fingerprint::fingerprint_bytes;
    use crate::staging::{stage, Document};
    use serde_json::json;

    fn document(fingerprint: &Fingerprint) -> Document {
        Document {
            fingerprint: fingerprint.clone(),
            source_id: "jumbo".to_string(),
            document_type: DocumentType::RetailReceipt,
            original_filename: "202403.pdf".to_string(),
            extractor: "jumbo_receipt_pdf".to_string(),
            extractor_version: "1.0.0".to_string(),
            period_start: None,
            period_end: None,
        }
    }

    #[test]
    fn test_commit_writes_rows_and_marks_document() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let fp = fingerprint_bytes(b"receipt");
        let date = NaiveDate::from_ymd_opt(2024, 3, 14).unwrap();
        let txs = vec![
            RawTransaction::new(0, date, "LECHE", Decimal::new(5970, 0), Decimal::ZERO)
                .with_reference("7801234567890".to_string())
                .with_metadata("quantity", json!(3)),
            RawTransaction::new(1, date, "TMP OFERTA", Decimal::new(-9705, 1), Decimal::ZERO),
        ];

        let uow = UnitOfWork::begin(&mut conn).unwrap();
        stage(&uow, &document(&fp), &RawTable::default()).unwrap();
        assert_eq!(commit(&uow, &fp, &txs).unwrap(), 2);
        uow.commit().unwrap();

        let doc = get_document(&conn, fp.as_str()).unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Committed);
        assert!(doc.ingested_at.is_some());

        let stored = load_transactions(&conn, &fp).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].reference.as_deref(), Some("7801234567890"));
        assert_eq!(stored[0].metadata.get("quantity"), Some(&json!(3)));
        assert_eq!(stored[1].charge_amount, Decimal::new(-9705, 1));
        assert_eq!(stored[1].transaction_date, date);
    }

    #[test]
    fn test_commit_without_staged_document_fails() {
        let mut conn = rusqlite::Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        let fp = fingerprint_bytes(b"never staged");

        let uow = UnitOfWork::begin(&mut conn).unwrap();
        // foreign key or missing status row, either way nothing commits
        assert!(commit(&uow, &fp, &[]).is_err());
        uow.rollback().unwrap();
    }
}
