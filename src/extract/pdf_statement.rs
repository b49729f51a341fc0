// 🏦 PDF statement extractor - Banco de Chile checking and credit line
//
// Same pipeline for both templates:
//   words -> lines (tolerance) -> block between markers -> rows with a DD/MM
//   date cell -> raw cells + typed rows, totals from the page text.
// Templates differ only in calibration (boundaries, markers, labels).

use super::pdf_layout::{
    assign_columns, cluster_lines, page_text, transaction_block, Line, PageWords,
    PdftotextBbox, WordSource, LINE_TOLERANCE,
};
use super::totals::{extract_totals, statement_closing_date, TotalsPatterns};
use super::{
    compile, DocumentType, ExtractResult, Extractor, RawRow, RawTable, RawTransaction,
    SourceBytes,
};
use crate::error::ExtractionFailure;
use crate::locale::{is_masked_zero, parse_amount, resolve_day_month};
use std::sync::Arc;

const DATE_CELL: &str = r"^\d{2}/\d{2}";

/// How a block line is split into cells
#[derive(Debug, Clone)]
pub enum RowLayout {
    /// Each word goes to the column whose [start, next start) range holds its x0
    Columns { boundaries: &'static [f64] },
    /// Date, free-text description, then one to three amounts right of
    /// `amounts_from`. The amount count decides which is charge/credit/balance.
    AmountTail { amounts_from: f64 },
}

/// Calibration for one statement layout
#[derive(Debug, Clone)]
pub struct PdfTemplate {
    pub name: &'static str,
    pub document_type: DocumentType,
    pub columns: &'static [&'static str],
    pub layout: RowLayout,
    pub header_marker: &'static str,
    pub footer_marker: &'static str,
    pub totals: TotalsPatterns,
    pub date_col: usize,
    pub description_col: usize,
    pub charge_col: usize,
    pub credit_col: usize,
    pub balance_col: Option<usize>,
    pub channel_col: Option<usize>,
    pub reference_col: Option<usize>,
}

pub const CHECKING: PdfTemplate = PdfTemplate {
    name: "banco_chile_checking_pdf",
    document_type: DocumentType::CheckingStatement,
    columns: &[
        "FECHA DIA/MES",
        "DETALLE DE TRANSACCION",
        "SUCURSAL",
        "N° DOCTO",
        "MONTO CHEQUES O CARGOS",
        "MONTO DEPOSITOS O ABONOS",
        "SALDO",
    ],
    layout: RowLayout::Columns {
        boundaries: &[15.0, 50.0, 230.0, 300.0, 380.0, 450.0, 550.0],
    },
    header_marker: "DETALLE DE TRANSACCION",
    footer_marker: "RETENCION A 1 DIA",
    totals: TotalsPatterns {
        period_end: r"HASTA\s*:\s*(\d{2}/\d{2}/\d{4})",
        period_start: Some(r"DESDE\s*:\s*(\d{2}/\d{2}/\d{4})"),
        opening_balance: Some(r"SALDO\s+INICIAL\s*:?\s*\$?\s*(-?\d[\d.]*(?:,\d+)?-?)"),
        closing_balance: Some(r"SALDO\s+FINAL\s*:?\s*\$?\s*(-?\d[\d.]*(?:,\d+)?-?)"),
        charge_total: Some(r"TOTAL\s+CARGOS\s*:?\s*\$?\s*(\d[\d.]*(?:,\d+)?)"),
        credit_total: Some(r"TOTAL\s+ABONOS\s*:?\s*\$?\s*(\d[\d.]*(?:,\d+)?)"),
        balances_required: true,
    },
    date_col: 0,
    description_col: 1,
    charge_col: 4,
    credit_col: 5,
    balance_col: Some(6),
    channel_col: Some(2),
    reference_col: Some(3),
};

pub const CREDIT_LINE: PdfTemplate = PdfTemplate {
    name: "banco_chile_credit_line_pdf",
    document_type: DocumentType::CreditLineStatement,
    columns: &[
        "FECHA DIA/MES",
        "DETALLE DE TRANSACCION",
        "MONTO CHEQUES O CARGOS",
        "MONTO DEPOSITOS O ABONOS",
        "SALDO",
    ],
    layout: RowLayout::AmountTail {
        amounts_from: 300.0,
    },
    header_marker: "SALDO INICIAL",
    footer_marker: "SALDO FINAL",
    totals: TotalsPatterns {
        period_end: r"HASTA\s*:\s*(\d{2}/\d{2}/\d{4})",
        period_start: Some(r"DESDE\s*:\s*(\d{2}/\d{2}/\d{4})"),
        opening_balance: Some(r"SALDO\s+INICIAL\s*:?\s*\$?\s*(-?\d[\d.]*(?:,\d+)?-?)"),
        closing_balance: Some(r"SALDO\s+FINAL\s*:?\s*\$?\s*(-?\d[\d.]*(?:,\d+)?-?)"),
        charge_total: None,
        credit_total: None,
        balances_required: true,
    },
    date_col: 0,
    description_col: 1,
    charge_col: 2,
    credit_col: 3,
    balance_col: Some(4),
    channel_col: None,
    reference_col: None,
};

pub struct PdfStatementExtractor {
    template: PdfTemplate,
    words: Arc<dyn WordSource>,
}

impl PdfStatementExtractor {
    pub fn new(template: PdfTemplate, words: Arc<dyn WordSource>) -> Self {
        PdfStatementExtractor { template, words }
    }

    pub fn checking() -> Self {
        Self::new(CHECKING, Arc::new(PdftotextBbox::default()))
    }

    pub fn credit_line() -> Self {
        Self::new(CREDIT_LINE, Arc::new(PdftotextBbox::default()))
    }

    /// Swap the word source (tests, or a different PDF backend)
    pub fn with_word_source(mut self, words: Arc<dyn WordSource>) -> Self {
        self.words = words;
        self
    }

    pub fn template(&self) -> &PdfTemplate {
        &self.template
    }

    /// Everything after word extraction; no I/O.
    pub fn extract_pages(&self, pages: &[PageWords]) -> Result<ExtractResult, ExtractionFailure> {
        let t = &self.template;
        let date_re = compile(DATE_CELL)?;

        let full_text = pages.iter().map(page_text).collect::<Vec<_>>().join("\n");
        let period_end = statement_closing_date(&full_text, &t.totals)?;

        let mut raw = RawTable::new(t.columns.iter().map(|c| c.to_string()).collect());
        let mut transactions = Vec::new();
        let mut found_header = false;
        let mut masked = 0usize;

        for page in pages {
            let lines = cluster_lines(&page.words, LINE_TOLERANCE);
            let Some(block) = transaction_block(&lines, t.header_marker, t.footer_marker) else {
                continue;
            };
            found_header = true;

            for line in &block {
                let cells = self.split_line(line, page.width);
                let date_cell = cells[t.date_col].trim();
                if !date_re.is_match(date_cell) {
                    continue;
                }

                let Some(date) = resolve_day_month(date_cell, period_end) else {
                    tracing::warn!(
                        template = t.name,
                        cell = date_cell,
                        "skipping row with impossible date"
                    );
                    continue;
                };

                let charge = cells[t.charge_col].clone();
                let credit = cells[t.credit_col].clone();
                masked += [&charge, &credit]
                    .iter()
                    .filter(|c| is_masked_zero(c))
                    .count();

                let row_index = raw.rows.len();
                let mut tx = RawTransaction::new(
                    row_index,
                    date,
                    cells[t.description_col].trim(),
                    parse_amount(&charge),
                    parse_amount(&credit),
                );
                if let Some(col) = t.balance_col {
                    if !cells[col].trim().is_empty() {
                        tx = tx.with_balance(parse_amount(&cells[col]));
                    }
                }
                if let Some(col) = t.channel_col {
                    tx = tx.with_channel(cells[col].clone());
                }
                if let Some(col) = t.reference_col {
                    tx = tx.with_reference(cells[col].clone());
                }

                transactions.push(tx);
                raw.rows.push(RawRow {
                    cells,
                    charge,
                    credit,
                });
            }
        }

        if !found_header {
            return Err(ExtractionFailure::new(format!(
                "header marker '{}' not found",
                t.header_marker
            )));
        }

        if masked > 0 {
            tracing::warn!(
                template = t.name,
                cells = masked,
                "unreadable amount cells counted as zero"
            );
        }

        let totals = extract_totals(&full_text, &t.totals, &transactions)?;
        ExtractResult {
            raw,
            transactions,
            totals,
        }
        .non_empty()
    }

    fn split_line(&self, line: &Line, page_width: f64) -> Vec<String> {
        match &self.template.layout {
            RowLayout::Columns { boundaries } => assign_columns(line, boundaries, page_width),
            RowLayout::AmountTail { amounts_from } => split_amount_tail(line, *amounts_from),
        }
    }
}

/// [date, description, charge, credit, balance] from a line whose amounts sit
/// right of `amounts_from`. One or two amounts: the first is a credit when the
/// description says ABONO, otherwise a charge; a second amount is the
/// balance. Three amounts are charge, credit, balance.
fn split_amount_tail(line: &Line, amounts_from: f64) -> Vec<String> {
    let mut words = line.words.iter();
    let date = words.next().map(|w| w.text.clone()).unwrap_or_default();

    let mut description = Vec::new();
    let mut amounts = Vec::new();
    for word in words {
        if word.x0 >= amounts_from {
            amounts.push(word.text.clone());
        } else {
            description.push(word.text.as_str());
        }
    }
    let description = description.join(" ");
    let is_credit = description.to_uppercase().contains("ABONO");

    let (charge, credit, balance) = match amounts.as_slice() {
        [one] if is_credit => (String::new(), one.clone(), String::new()),
        [one] => (one.clone(), String::new(), String::new()),
        [one, saldo] if is_credit => (String::new(), one.clone(), saldo.clone()),
        [one, saldo] => (one.clone(), String::new(), saldo.clone()),
        [cargo, abono, saldo] => (cargo.clone(), abono.clone(), saldo.clone()),
        _ => (String::new(), String::new(), String::new()),
    };

    vec![date, description, charge, credit, balance]
}

impl Extractor for PdfStatementExtractor {
    fn name(&self) -> &str {
        self.template.name
    }

    fn document_type(&self) -> DocumentType {
        self.template.document_type
    }

    fn extract(&self, source: SourceBytes<'_>) -> Result<ExtractResult, ExtractionFailure> {
        let pages = self.words.pages(source.bytes)?;
        self.extract_pages(&pages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::pdf_layout::PositionedWord;
    use crate::extract::Provenance;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;

    fn word(text: &str, x0: f64, top: f64) -> PositionedWord {
        PositionedWord::new(text, x0, top)
    }

    fn words_of(text: &str, x0: f64, top: f64) -> Vec<PositionedWord> {
        text.split_whitespace()
            .enumerate()
            .map(|(i, t)| word(t, x0 + i as f64 * 30.0, top))
            .collect()
    }

    fn checking_page() -> PageWords {
        let mut words = Vec::new();
        words.extend(words_of("DESDE : 01/12/2023 HASTA : 10/01/2024", 20.0, 30.0));
        words.extend(words_of("SALDO INICIAL 50.000", 20.0, 45.0));
        words.extend(words_of("SALDO FINAL 53.500", 300.0, 45.0));
        words.extend(words_of("DETALLE DE TRANSACCION", 60.0, 80.0));
        // December row on a January statement
        words.push(word("28/12", 20.0, 100.0));
        words.push(word("TRASPASO", 60.0, 100.0));
        words.push(word("DE:", 95.0, 101.0));
        words.push(word("PEREZ", 130.0, 100.5));
        words.push(word("INTERNET", 240.0, 100.0));
        words.push(word("5.000", 460.0, 100.0));
        words.push(word("55.000", 560.0, 100.0));
        // January row
        words.push(word("03/01", 20.0, 115.0));
        words.push(word("PAGO", 60.0, 115.0));
        words.push(word("CUENTA", 95.0, 115.0));
        words.push(word("0012345", 310.0, 115.0));
        words.push(word("1.500", 390.0, 115.0));
        words.push(word("53.500", 560.0, 115.0));
        // wrapped description line, no date
        words.push(word("CONTINUACION", 60.0, 127.0));
        words.extend(words_of("RETENCION A 1 DIA", 20.0, 200.0));
        words.push(word("31/01", 20.0, 220.0));
        PageWords {
            width: 612.0,
            height: 792.0,
            words,
        }
    }

    fn extractor() -> PdfStatementExtractor {
        PdfStatementExtractor::checking()
    }

    #[test]
    fn test_checking_rows_and_columns() {
        let result = extractor().extract_pages(&[checking_page()]).unwrap();

        assert_eq!(result.raw.len(), 2);
        assert_eq!(result.raw.rows[0].cells[1], "TRASPASO DE: PEREZ");
        assert_eq!(result.raw.rows[0].cells[2], "INTERNET");
        assert_eq!(result.raw.rows[0].credit, "5.000");
        assert_eq!(result.raw.rows[1].cells[3], "0012345");
        assert_eq!(result.raw.rows[1].charge, "1.500");

        let first = &result.transactions[0];
        assert_eq!(first.transaction_date, NaiveDate::from_ymd_opt(2023, 12, 28).unwrap());
        assert_eq!(first.credit_amount, Decimal::new(5000, 0));
        assert_eq!(first.charge_amount, Decimal::ZERO);
        assert_eq!(first.balance_after, Some(Decimal::new(55000, 0)));
        assert_eq!(first.channel.as_deref(), Some("INTERNET"));

        let second = &result.transactions[1];
        assert_eq!(second.transaction_date, NaiveDate::from_ymd_opt(2024, 1, 3).unwrap());
        assert_eq!(second.reference.as_deref(), Some("0012345"));
    }

    #[test]
    fn test_checking_totals() {
        let result = extractor().extract_pages(&[checking_page()]).unwrap();
        let totals = &result.totals;

        assert_eq!(totals.opening_balance, Some(Decimal::new(50000, 0)));
        assert_eq!(totals.closing_balance, Some(Decimal::new(53500, 0)));
        assert_eq!(totals.reported_row_count, 2);
        assert_eq!(totals.reported_charge_sum.value, Decimal::new(1500, 0));
        assert_eq!(totals.reported_charge_sum.provenance, Provenance::Derived);
        assert_eq!(totals.reported_credit_sum.value, Decimal::new(5000, 0));
        assert_eq!(totals.period_label(), "2024-01");
    }

    #[test]
    fn test_missing_header_is_failure() {
        let mut page = checking_page();
        page.words.retain(|w| w.text != "DETALLE");
        let err = extractor().extract_pages(&[page]).unwrap_err();
        assert!(err.reason.contains("header marker"));
    }

    #[test]
    fn test_missing_period_is_failure() {
        let mut page = checking_page();
        page.words.retain(|w| w.text != "HASTA");
        assert!(extractor().extract_pages(&[page]).is_err());
    }

    #[test]
    fn test_credit_line_amount_tail() {
        let mut words = Vec::new();
        words.extend(words_of("HASTA : 31/03/2024", 20.0, 30.0));
        words.extend(words_of("SALDO INICIAL 200.000", 20.0, 80.0));
        words.push(word("05/03", 20.0, 100.0));
        words.extend(words_of("USO LINEA", 60.0, 100.0));
        words.push(word("50.000", 320.0, 100.0));
        words.push(word("150.000", 450.0, 100.0));
        words.push(word("20/03", 20.0, 115.0));
        words.extend(words_of("ABONO LINEA", 60.0, 115.0));
        words.push(word("30.000", 320.0, 115.0));
        words.push(word("10/03", 20.0, 130.0));
        words.extend(words_of("INTERESES", 60.0, 130.0));
        words.push(word("1.000", 320.0, 130.0));
        words.push(word("0", 380.0, 130.0));
        words.push(word("179.000", 450.0, 130.0));
        words.extend(words_of("SALDO FINAL 179.000", 20.0, 160.0));

        let page = PageWords {
            width: 612.0,
            height: 792.0,
            words,
        };

        let result = PdfStatementExtractor::credit_line()
            .extract_pages(&[page])
            .unwrap();

        assert_eq!(result.raw.len(), 3);
        assert_eq!(result.raw.rows[0].charge, "50.000");
        assert_eq!(result.raw.rows[0].cells[4], "150.000");
        assert_eq!(result.raw.rows[1].credit, "30.000");
        assert_eq!(result.raw.rows[1].charge, "");
        assert_eq!(result.raw.rows[2].charge, "1.000");
        assert_eq!(result.raw.rows[2].credit, "0");

        assert_eq!(result.totals.opening_balance, Some(Decimal::new(200000, 0)));
        assert_eq!(result.totals.closing_balance, Some(Decimal::new(179000, 0)));
        assert_eq!(result.totals.reported_charge_sum.value, Decimal::new(51000, 0));
        assert_eq!(result.totals.reported_credit_sum.value, Decimal::new(30000, 0));
    }
}
