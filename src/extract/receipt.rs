// 🧾 Retail receipt extractor (Jumbo electronic receipts)
//
// Receipts have no columns worth positioning, so plain PDF text is enough.
// Each product line is `<SKU> <description> <amount>`; the line above may
// carry `n X $unit`, the line below a `TMP OFERTA/DESCUENTO ... -amount`.
//
// A receipt is modelled as a statement that opens at zero and closes at
// -TOTAL. Discounts are their own negative charge rows, so the coherence
// check verifies gross - discounts = printed TOTAL.

use super::{
    compile, DocumentType, ExtractResult, Extractor, RawRow, RawTable, RawTransaction,
    SourceBytes,
};
use crate::error::ExtractionFailure;
use crate::extract::totals::DocumentTotals;
use crate::locale::{parse_amount, parse_amount_checked, parse_statement_date};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;

const RECEIPT_ID: &str = r"(?i)BOLETA\s*ELECTRONICA\s*N\D*(\d+)";
const PURCHASE_DATE: &str = r"SALDO\s+DE\s+PUNTOS\s+AL\s*(\d{2}[-/]\d{2}[-/]\d{4})";
const FILE_NAME_DATE: &str = r"^(\d{4})(\d{2})\.pdf$";
const PRODUCT_LINE: &str = r"^\s*(\d{8,13})\s+(.+?)\s+([\d.,]+)\s*$";
const QUANTITY_LINE: &str = r"^\s*(\d+)\s*X\s*\$\s*([\d.,]+)";
const OFFER_LINE: &str = r"(?i)(TMP\s*(?:OFERTA|DESCUENTO).*?)(-?[\d.,]+)\s*$";
const PRINTED_TOTAL: &str = r"(?m)^\s*TOTAL\s*:?\s*\$?\s*([\d.,]+)\s*$";

pub const COLUMNS: [&str; 4] = ["sku", "description", "quantity", "amount"];

/// Where receipt text comes from; tests hand it in directly
pub trait TextSource: Send + Sync {
    fn text(&self, bytes: &[u8]) -> Result<String, ExtractionFailure>;
}

/// Production text source: pdf-extract over the file bytes
pub struct PdfText;

impl TextSource for PdfText {
    fn text(&self, bytes: &[u8]) -> Result<String, ExtractionFailure> {
        let text = pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractionFailure::new(format!("could not read receipt text: {}", e)))?;
        Ok(text.replace('\0', ""))
    }
}

pub struct ReceiptExtractor {
    text: Arc<dyn TextSource>,
}

impl ReceiptExtractor {
    pub fn new() -> Self {
        ReceiptExtractor {
            text: Arc::new(PdfText),
        }
    }

    pub fn with_text_source(mut self, text: Arc<dyn TextSource>) -> Self {
        self.text = text;
        self
    }
}

impl Default for ReceiptExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for ReceiptExtractor {
    fn name(&self) -> &str {
        "jumbo_receipt_pdf"
    }

    fn document_type(&self) -> DocumentType {
        DocumentType::RetailReceipt
    }

    fn extract(&self, source: SourceBytes<'_>) -> Result<ExtractResult, ExtractionFailure> {
        let text = self.text.text(source.bytes)?;
        parse_receipt_text(&text, source.file_name)
    }
}

/// Receipt text -> rows and totals. `file_name` is only used when the
/// points-balance date is missing.
pub fn parse_receipt_text(text: &str, file_name: &str) -> Result<ExtractResult, ExtractionFailure> {
    let receipt_id = compile(RECEIPT_ID)?
        .captures(text)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ExtractionFailure::new("receipt number not found"))?;

    let date = purchase_date(text, file_name)?
        .ok_or_else(|| ExtractionFailure::new(format!("purchase date not found in receipt {}", receipt_id)))?;

    let printed_total = compile(PRINTED_TOTAL)?
        .captures(text)
        .and_then(|c| parse_amount_checked(&c[1]))
        .ok_or_else(|| ExtractionFailure::new(format!("TOTAL not found in receipt {}", receipt_id)))?;

    let product_re = compile(PRODUCT_LINE)?;
    let quantity_re = compile(QUANTITY_LINE)?;
    let offer_re = compile(OFFER_LINE)?;

    let mut raw = RawTable::new(COLUMNS.iter().map(|c| c.to_string()).collect());
    let mut transactions = Vec::new();

    let lines: Vec<&str> = text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let Some(product) = product_re.captures(line) else {
            continue;
        };
        let sku = product[1].to_string();
        let description = product[2].trim().to_string();
        let amount = product[3].to_string();
        let charge = parse_amount(&amount);

        let quantity = i
            .checked_sub(1)
            .and_then(|prev| quantity_re.captures(lines[prev]));
        let (units, unit_price) = match &quantity {
            Some(q) => (q[1].parse::<u32>().unwrap_or(1), parse_amount(&q[2])),
            None => (1, charge),
        };

        transactions.push(
            RawTransaction::new(raw.rows.len(), date, description.clone(), charge, Decimal::ZERO)
                .with_reference(sku.clone())
                .with_metadata("quantity", json!(units))
                .with_metadata("unit_price", json!(unit_price.to_string()))
                .with_metadata("receipt_id", json!(receipt_id)),
        );
        raw.rows.push(RawRow {
            cells: vec![
                sku.clone(),
                description,
                quantity.map(|q| q[0].trim().to_string()).unwrap_or_default(),
                amount.clone(),
            ],
            charge: amount,
            credit: String::new(),
        });

        let Some(offer) = lines.get(i + 1).and_then(|next| offer_re.captures(next)) else {
            continue;
        };
        let offer_description = offer[1].trim().to_string();
        let token = offer[2].to_string();
        // discounts always reduce the total, whether or not the sign is printed
        let signed = if token.starts_with('-') {
            token.clone()
        } else {
            format!("-{}", token)
        };

        transactions.push(
            RawTransaction::new(
                raw.rows.len(),
                date,
                offer_description.clone(),
                parse_amount(&signed),
                Decimal::ZERO,
            )
            .with_reference(sku.clone())
            .with_metadata("offer", json!(offer_description))
            .with_metadata("receipt_id", json!(receipt_id)),
        );
        raw.rows.push(RawRow {
            cells: vec![sku, offer_description, String::new(), token],
            charge: signed,
            credit: String::new(),
        });
    }

    tracing::debug!(receipt = %receipt_id, rows = transactions.len(), total = %printed_total, "receipt parsed");

    let totals = DocumentTotals::derived(&transactions, date)
        .with_balances(Decimal::ZERO, -printed_total);

    ExtractResult {
        raw,
        transactions,
        totals,
    }
    .non_empty()
}

fn purchase_date(text: &str, file_name: &str) -> Result<Option<NaiveDate>, ExtractionFailure> {
    if let Some(date) = compile(PURCHASE_DATE)?
        .captures(text)
        .and_then(|c| parse_statement_date(&c[1]))
    {
        return Ok(Some(date));
    }

    let base = std::path::Path::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file_name);
    Ok(compile(FILE_NAME_DATE)?.captures(base).and_then(|c| {
        let year = c[1].parse().ok()?;
        let month = c[2].parse().ok()?;
        NaiveDate::from_ymd_opt(year, month, 1)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIPT: &str = "JUMBO LA REINA\n\
BOLETA ELECTRONICA N° 123456789\n\
3 X $1.990\n\
7801234567890 LECHE ENTERA 1L 5.970\n\
TMP OFERTA LECHE -970\n\
7809876543210 PAN MOLDE 2.490\n\
TOTAL $ 7.490\n\
SALDO DE PUNTOS AL 14-03-2024\n";

    #[test]
    fn test_parse_receipt_rows_and_totals() {
        let result = parse_receipt_text(RECEIPT, "boleta.pdf").unwrap();

        assert_eq!(result.transactions.len(), 3);
        assert_eq!(result.raw.len(), 3);

        let leche = &result.transactions[0];
        assert_eq!(leche.reference.as_deref(), Some("7801234567890"));
        assert_eq!(leche.charge_amount, Decimal::new(5970, 0));
        assert_eq!(leche.metadata.get("quantity"), Some(&json!(3)));
        assert_eq!(leche.metadata.get("unit_price"), Some(&json!("1990")));
        assert_eq!(leche.transaction_date, NaiveDate::from_ymd_opt(2024, 3, 14).unwrap());

        let offer = &result.transactions[1];
        assert_eq!(offer.charge_amount, Decimal::new(-970, 0));
        assert_eq!(result.raw.rows[1].charge, "-970");

        // 0 + 0 - (5970 - 970 + 2490) = -7490
        assert_eq!(result.totals.reported_charge_sum.value, Decimal::new(7490, 0));
        assert_eq!(result.totals.opening_balance, Some(Decimal::ZERO));
        assert_eq!(result.totals.closing_balance, Some(Decimal::new(-7490, 0)));
        assert_eq!(result.totals.period_label(), "2024-03");
    }

    #[test]
    fn test_unsigned_offer_is_still_a_discount() {
        let text = "BOLETA ELECTRONICA N 1\n12345678 ARROZ 1.000\nTMP DESCUENTO 200\nTOTAL 800\nSALDO DE PUNTOS AL 01-02-2024";
        let result = parse_receipt_text(text, "x.pdf").unwrap();
        assert_eq!(result.transactions[1].charge_amount, Decimal::new(-200, 0));
        assert_eq!(result.raw.rows[1].cells[3], "200");
    }

    #[test]
    fn test_date_falls_back_to_file_name() {
        let text = "BOLETA ELECTRONICA N 77\n12345678 ARROZ 1.000\nTOTAL 1.000";
        let result = parse_receipt_text(text, "/tmp/boletas/202405.pdf").unwrap();
        assert_eq!(
            result.transactions[0].transaction_date,
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
    }

    #[test]
    fn test_missing_fields_are_failures() {
        let no_id = parse_receipt_text("12345678 ARROZ 1.000\nTOTAL 1.000", "202405.pdf").unwrap_err();
        assert!(no_id.reason.contains("receipt number"));

        let no_date = parse_receipt_text("BOLETA ELECTRONICA N 1\n12345678 ARROZ 1.000\nTOTAL 1.000", "scan.pdf").unwrap_err();
        assert!(no_date.reason.contains("purchase date"));

        let no_total = parse_receipt_text("BOLETA ELECTRONICA N 1\n12345678 ARROZ 1.000", "202405.pdf").unwrap_err();
        assert!(no_total.reason.contains("TOTAL"));

        let no_rows = parse_receipt_text("BOLETA ELECTRONICA N 1\nTOTAL 0", "202405.pdf").unwrap_err();
        assert!(no_rows.reason.contains("no transaction rows"));
    }
}
