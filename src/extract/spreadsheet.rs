// 📊 Spreadsheet extractor - header-row discovery + column remap
//
// Bank exports put a variable-height preamble (account holder, period,
// balances) above the transaction table. The header row is found by keyword
// search in the first rows, then every row below it is read against that
// header and the columns renamed to canonical names.
//
// xls/xlsx go through calamine, delimited exports through the csv crate.
// Both end up as a plain grid of strings.

use super::{
    DocumentType, ExtractResult, Extractor, RawRow, RawTable, RawTransaction, SourceBytes,
};
use crate::error::ExtractionFailure;
use crate::extract::totals::DocumentTotals;
use crate::extract::DocumentFormat;
use crate::locale::{
    excel_serial_date, installment_charge_date, is_masked_zero, locale_number, parse_amount, parse_amount_checked,
    parse_installments, parse_sheet_date,
};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::io::Cursor;

// Canonical column names
pub const DATE: &str = "transaction_date";
pub const DESCRIPTION: &str = "description";
pub const AMOUNT: &str = "amount";
pub const CHARGE: &str = "charge";
pub const CREDIT: &str = "credit";
pub const BALANCE: &str = "balance";
pub const INSTALLMENTS: &str = "installments";
pub const CATEGORY: &str = "category";
pub const FOREIGN_AMOUNT: &str = "foreign_amount";
pub const COUNTRY: &str = "country";

/// How charge and credit amounts are laid out
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AmountRule {
    /// Separate charge column, plus a credit column when `credit` is set
    Columns { credit: bool },
    /// A single amount column; rows whose description is in the configured
    /// credit set are credits, the rest are charges
    CreditDescriptions,
}

#[derive(Debug, Clone)]
pub struct SheetTemplate {
    pub name: &'static str,
    pub document_type: DocumentType,
    /// First row index searched for the header
    pub scan_from: usize,
    /// Rows at or past this index are never searched
    pub scan_limit: usize,
    pub required: &'static [&'static str],
    /// When non-empty, at least one must also appear in the header row
    pub any_of: &'static [&'static str],
    pub case_insensitive: bool,
    /// Printed header -> canonical name
    pub renames: &'static [(&'static str, &'static str)],
    pub amounts: AmountRule,
    /// Labels of printed opening/closing balance cells above the header
    pub balance_labels: Option<(&'static str, &'static str)>,
    /// Canonical columns copied verbatim into the row metadata
    pub metadata_columns: &'static [&'static str],
}

impl SheetTemplate {
    fn matches(&self, a: &str, b: &str) -> bool {
        if self.case_insensitive {
            a.to_lowercase() == b.to_lowercase()
        } else {
            a == b
        }
    }

    fn contains(&self, haystack: &str, needle: &str) -> bool {
        if self.case_insensitive {
            haystack.to_lowercase().contains(&needle.to_lowercase())
        } else {
            haystack.contains(needle)
        }
    }

    fn canonical(&self, header: &str) -> String {
        self.renames
            .iter()
            .find(|(printed, _)| self.matches(printed, header))
            .map(|(_, canonical)| canonical.to_string())
            .unwrap_or_else(|| header.to_string())
    }
}

// ============================================================================
// TEMPLATES
// ============================================================================

pub const NATIONAL_CARD: SheetTemplate = SheetTemplate {
    name: "banco_chile_national_card_sheet",
    document_type: DocumentType::CreditCardNational,
    scan_from: 10,
    scan_limit: 50,
    required: &["Fecha", "Descripción"],
    any_of: &[],
    case_insensitive: false,
    renames: &[
        ("Fecha", DATE),
        ("Descripción", DESCRIPTION),
        ("Categoría", CATEGORY),
        ("Cuotas", INSTALLMENTS),
        ("Monto ($)", AMOUNT),
    ],
    amounts: AmountRule::CreditDescriptions,
    balance_labels: None,
    metadata_columns: &[],
};

pub const INTERNATIONAL_CARD: SheetTemplate = SheetTemplate {
    name: "banco_chile_international_card_sheet",
    document_type: DocumentType::CreditCardInternational,
    scan_from: 17,
    scan_limit: 50,
    required: &["Fecha", "Descripción"],
    any_of: &["Monto", "Cargo", "Abono", "Importe"],
    case_insensitive: false,
    renames: &[
        ("Fecha", DATE),
        ("Descripción", DESCRIPTION),
        ("Categoría", CATEGORY),
        ("Cuotas", INSTALLMENTS),
        ("Monto Moneda Origen", CHARGE),
        ("Monto (USD)", FOREIGN_AMOUNT),
        ("País", COUNTRY),
    ],
    amounts: AmountRule::Columns { credit: false },
    balance_labels: None,
    metadata_columns: &[],
};

pub const FALABELLA_CARD: SheetTemplate = SheetTemplate {
    name: "falabella_card_sheet",
    document_type: DocumentType::CreditCardNational,
    scan_from: 0,
    scan_limit: 50,
    required: &["FECHA", "DESCRIPCION", "MONTO"],
    any_of: &["CUOTAS PENDIENTES", "VALOR CUOTA"],
    case_insensitive: false,
    renames: &[
        ("FECHA", DATE),
        ("DESCRIPCION", DESCRIPTION),
        ("VALOR CUOTA", CHARGE),
        ("CUOTAS PENDIENTES", "pending_installments"),
        ("MONTO", "purchase_amount"),
    ],
    amounts: AmountRule::Columns { credit: false },
    balance_labels: None,
    metadata_columns: &["pending_installments", "purchase_amount"],
};

pub const FALABELLA_CHECKING: SheetTemplate = SheetTemplate {
    name: "falabella_checking_sheet",
    document_type: DocumentType::CheckingStatement,
    scan_from: 0,
    scan_limit: 50,
    required: &["Fecha", "Descripcion", "Cargo", "Abono", "Saldo"],
    any_of: &[],
    case_insensitive: false,
    renames: &[
        ("Fecha", DATE),
        ("Descripcion", DESCRIPTION),
        ("Cargo", CHARGE),
        ("Abono", CREDIT),
        ("Saldo", BALANCE),
    ],
    amounts: AmountRule::Columns { credit: true },
    balance_labels: Some(("Saldo inicial", "Saldo final")),
    metadata_columns: &[],
};

pub const FALABELLA_CREDIT_LINE: SheetTemplate = SheetTemplate {
    name: "falabella_credit_line_sheet",
    document_type: DocumentType::CreditLineStatement,
    scan_from: 0,
    scan_limit: 20,
    required: &["Fecha", "Descripcion", "Cargos", "Abonos", "Monto utilizado"],
    any_of: &[],
    case_insensitive: true,
    renames: &[
        ("Fecha", DATE),
        ("Descripcion", DESCRIPTION),
        ("Cargos", CHARGE),
        ("Abonos", CREDIT),
        ("Monto utilizado", BALANCE),
        ("Tasa diaria", "daily_rate"),
        ("Intereses", "interest"),
    ],
    amounts: AmountRule::Columns { credit: true },
    balance_labels: None,
    metadata_columns: &["daily_rate", "interest"],
};

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct SpreadsheetExtractor {
    template: SheetTemplate,
    credit_descriptions: HashSet<String>,
}

impl SpreadsheetExtractor {
    pub fn new(template: SheetTemplate) -> Self {
        SpreadsheetExtractor {
            template,
            credit_descriptions: HashSet::new(),
        }
    }

    pub fn national_card(credit_descriptions: &[String]) -> Self {
        Self::new(NATIONAL_CARD).with_credit_descriptions(credit_descriptions)
    }

    pub fn international_card() -> Self {
        Self::new(INTERNATIONAL_CARD)
    }

    pub fn falabella_card() -> Self {
        Self::new(FALABELLA_CARD)
    }

    pub fn falabella_checking() -> Self {
        Self::new(FALABELLA_CHECKING)
    }

    pub fn falabella_credit_line() -> Self {
        Self::new(FALABELLA_CREDIT_LINE)
    }

    pub fn with_credit_descriptions(mut self, descriptions: &[String]) -> Self {
        self.credit_descriptions = descriptions.iter().map(|d| d.trim().to_string()).collect();
        self
    }

    /// Everything after the bytes became a grid; no I/O.
    pub fn extract_grid(&self, grid: &[Vec<String>]) -> Result<ExtractResult, ExtractionFailure> {
        let t = &self.template;

        let header_index = find_header_row(grid, t).ok_or_else(|| {
            ExtractionFailure::new(format!(
                "header row with {:?} not found in rows {}..{}",
                t.required, t.scan_from, t.scan_limit
            ))
        })?;
        tracing::debug!(template = t.name, row = header_index, "header row found");

        // (grid column index, canonical name); unnamed columns are dropped
        let columns: Vec<(usize, String)> = grid[header_index]
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| {
                let name = cell.trim();
                if name.is_empty() || name.eq_ignore_ascii_case("nan") || name.starts_with("Unnamed") {
                    None
                } else {
                    Some((i, t.canonical(name)))
                }
            })
            .collect();
        let position = |name: &str| columns.iter().position(|(_, c)| c == name);

        let mut needed = vec![DATE, DESCRIPTION];
        match t.amounts {
            AmountRule::Columns { credit } => {
                needed.push(CHARGE);
                if credit {
                    needed.push(CREDIT);
                }
            }
            AmountRule::CreditDescriptions => needed.push(AMOUNT),
        }
        if let Some(missing) = needed.iter().find(|n| position(n).is_none()) {
            return Err(ExtractionFailure::new(format!(
                "column '{}' missing from header row {}",
                missing, header_index
            )));
        }

        let mut raw = RawTable::new(columns.iter().map(|(_, c)| c.clone()).collect());
        let mut transactions = Vec::new();
        let mut skipped = 0usize;
        let mut masked = 0usize;

        for row in &grid[header_index + 1..] {
            let cells: Vec<String> = columns
                .iter()
                .map(|(i, _)| row.get(*i).cloned().unwrap_or_default())
                .collect();
            if cells.iter().all(|c| c.trim().is_empty()) {
                continue;
            }

            let cell = |name: &str| position(name).map(|p| cells[p].as_str()).unwrap_or("");

            // Summary and footer rows have no readable date
            let Some(date) = parse_sheet_date(cell(DATE)) else {
                skipped += 1;
                continue;
            };

            let description = cell(DESCRIPTION).trim().to_string();
            let (charge, credit) = match t.amounts {
                AmountRule::Columns { .. } => (cell(CHARGE).to_string(), cell(CREDIT).to_string()),
                AmountRule::CreditDescriptions => {
                    let amount = cell(AMOUNT).to_string();
                    if self.credit_descriptions.contains(&description) {
                        (String::new(), amount)
                    } else {
                        (amount, String::new())
                    }
                }
            };
            masked += [&charge, &credit].iter().filter(|c| is_masked_zero(c)).count();

            let row_index = raw.rows.len();
            let mut tx = RawTransaction::new(
                row_index,
                date,
                description,
                parse_amount(&charge),
                parse_amount(&credit),
            );

            if matches!(
                t.document_type,
                DocumentType::CreditCardNational | DocumentType::CreditCardInternational
            ) {
                let (current, total) = parse_installments(cell(INSTALLMENTS));
                tx = tx.with_installment(current, total, installment_charge_date(date, current));
            }

            tx = tx.with_category(cell(CATEGORY).to_string());

            if !cell(BALANCE).trim().is_empty() {
                tx = tx.with_balance(parse_amount(cell(BALANCE)));
            }

            if position(FOREIGN_AMOUNT).is_some() {
                let foreign = parse_amount(cell(FOREIGN_AMOUNT));
                let rate = if foreign.is_zero() {
                    Decimal::ZERO
                } else {
                    (tx.charge_amount / foreign).round_dp(4)
                };
                let country = Some(cell(COUNTRY).trim().to_string()).filter(|c| !c.is_empty());
                tx = tx.with_foreign(foreign, rate, country);
            }

            for name in t.metadata_columns {
                let value = cell(name).trim();
                if !value.is_empty() {
                    tx = tx.with_metadata(name, serde_json::json!(value));
                }
            }

            transactions.push(tx);
            raw.rows.push(RawRow {
                cells,
                charge,
                credit,
            });
        }

        if skipped > 0 {
            tracing::debug!(template = t.name, rows = skipped, "rows without a date skipped");
        }
        if masked > 0 {
            tracing::warn!(
                template = t.name,
                cells = masked,
                "unreadable amount cells counted as zero"
            );
        }

        let period_end = transactions
            .iter()
            .map(|tx| tx.transaction_date)
            .max()
            .ok_or_else(|| ExtractionFailure::new("no transaction rows found"))?;

        let mut totals = DocumentTotals::derived(&transactions, period_end);
        totals.period_start = transactions.iter().map(|tx| tx.transaction_date).min();
        if let Some(labels) = t.balance_labels {
            if let Some((opening, closing)) = labelled_balances(&grid[..header_index], labels, t)? {
                totals = totals.with_balances(opening, closing);
            }
        }

        ExtractResult {
            raw,
            transactions,
            totals,
        }
        .non_empty()
    }
}

impl Extractor for SpreadsheetExtractor {
    fn name(&self) -> &str {
        self.template.name
    }

    fn document_type(&self) -> DocumentType {
        self.template.document_type
    }

    fn extract(&self, source: SourceBytes<'_>) -> Result<ExtractResult, ExtractionFailure> {
        let grid = read_grid(source.bytes)?;
        self.extract_grid(&grid)
    }
}

// ============================================================================
// HEADER + BALANCES
// ============================================================================

/// First row in [scan_from, scan_limit) whose joined text holds every
/// required keyword and, if the template lists any, one optional keyword.
pub fn find_header_row(grid: &[Vec<String>], template: &SheetTemplate) -> Option<usize> {
    let end = grid.len().min(template.scan_limit);
    (template.scan_from..end).find(|&i| {
        let text = grid[i]
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let has = |keyword: &&str| template.contains(&text, keyword);
        template.required.iter().all(has)
            && (template.any_of.is_empty() || template.any_of.iter().any(has))
    })
}

/// Opening/closing balances printed as "label | value" cells above the table.
/// Both or neither must be present.
fn labelled_balances(
    preamble: &[Vec<String>],
    (opening_label, closing_label): (&str, &str),
    template: &SheetTemplate,
) -> Result<Option<(Decimal, Decimal)>, ExtractionFailure> {
    let find = |label: &str| -> Result<Option<Decimal>, ExtractionFailure> {
        for row in preamble {
            let Some(at) = row.iter().position(|c| template.contains(c, label)) else {
                continue;
            };
            let Some(value) = row[at + 1..].iter().find(|c| !c.trim().is_empty()) else {
                continue;
            };
            return parse_amount_checked(value).map(Some).ok_or_else(|| {
                ExtractionFailure::new(format!("unreadable {}: '{}'", label, value))
            });
        }
        Ok(None)
    };

    match (find(opening_label)?, find(closing_label)?) {
        (Some(opening), Some(closing)) => Ok(Some((opening, closing))),
        (None, None) => Ok(None),
        (Some(_), None) => Err(ExtractionFailure::new(format!("'{}' not found", closing_label))),
        (None, Some(_)) => Err(ExtractionFailure::new(format!("'{}' not found", opening_label))),
    }
}

// ============================================================================
// READERS
// ============================================================================

/// Bytes -> grid of cell strings, by sniffed format.
pub fn read_grid(bytes: &[u8]) -> Result<Vec<Vec<String>>, ExtractionFailure> {
    match DocumentFormat::sniff(bytes) {
        DocumentFormat::Xlsx | DocumentFormat::Xls => read_workbook(bytes),
        DocumentFormat::Delimited => read_delimited(bytes),
        DocumentFormat::Pdf => Err(ExtractionFailure::new("expected a spreadsheet, got a PDF")),
    }
}

fn read_workbook(bytes: &[u8]) -> Result<Vec<Vec<String>>, ExtractionFailure> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| ExtractionFailure::new(format!("could not open workbook: {}", e)))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| ExtractionFailure::new("workbook has no sheets"))?
        .map_err(|e| ExtractionFailure::new(format!("could not read first sheet: {}", e)))?;

    // calamine ranges start at the first used cell; pad so row indexes
    // match the sheet as printed
    let (row_offset, col_offset) = range
        .start()
        .map(|(r, c)| (r as usize, c as usize))
        .unwrap_or((0, 0));

    let mut grid = vec![Vec::new(); row_offset];
    for row in range.rows() {
        let mut cells = vec![String::new(); col_offset];
        cells.extend(row.iter().map(cell_text));
        grid.push(cells);
    }
    Ok(grid)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::Float(f) => locale_number(*f),
        Data::DateTime(dt) => excel_serial_date(dt.as_f64())
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| dt.as_f64().to_string()),
        Data::Int(i) => i.to_string(),
        other => other.to_string(),
    }
}

fn read_delimited(bytes: &[u8]) -> Result<Vec<Vec<String>>, ExtractionFailure> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(sniff_delimiter(&text))
        .from_reader(text.as_bytes());

    let mut grid = Vec::new();
    for record in reader.records() {
        let record =
            record.map_err(|e| ExtractionFailure::new(format!("malformed delimited file: {}", e)))?;
        grid.push(record.iter().map(|c| c.to_string()).collect());
    }
    Ok(grid)
}

/// UTF-8 when valid, otherwise Latin-1 (Windows bank exports)
fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.trim_start_matches('\u{feff}').to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

/// ';' when most lines use it (decimal commas make ',' unreliable), then tab,
/// then ','.
fn sniff_delimiter(text: &str) -> u8 {
    let lines: Vec<&str> = text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .take(30)
        .collect();
    let share = |c: char| lines.iter().filter(|l| l.contains(c)).count() * 2 > lines.len();

    if share(';') {
        b';'
    } else if share('\t') {
        b'\t'
    } else {
        b','
    }
}
