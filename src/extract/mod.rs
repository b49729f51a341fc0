// 🏗️ Extractor Framework - one strategy per (institution, document type, format)
//
// Every extractor turns document bytes into three things:
// - a RawTable: the cells exactly as printed, staged for audit and validation
// - typed RawTransactions: dates resolved, amounts parsed
// - DocumentTotals: what the document itself claims (balances, period, sums)
//
// The raw and typed outputs are built independently so the validator can
// re-derive the sums from raw cells and catch normalization bugs.

pub mod pdf_layout;
pub mod pdf_statement;
pub mod receipt;
pub mod spreadsheet;
pub mod totals;

use crate::error::ExtractionFailure;
use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

pub use totals::{DocumentTotals, Provenance, ReportedSum};

// ============================================================================
// CORE TYPES
// ============================================================================

/// DocumentType - what kind of statement a file is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    CheckingStatement,
    CreditCardNational,
    CreditCardInternational,
    CreditLineStatement,
    RetailReceipt,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::CheckingStatement => "checking_statement",
            DocumentType::CreditCardNational => "credit_card_national",
            DocumentType::CreditCardInternational => "credit_card_international",
            DocumentType::CreditLineStatement => "credit_line_statement",
            DocumentType::RetailReceipt => "retail_receipt",
        }
    }

    /// Prefix used in processed file names
    pub fn archive_label(&self) -> &'static str {
        match self {
            DocumentType::CheckingStatement => "checking",
            DocumentType::CreditCardNational => "credit_card",
            DocumentType::CreditCardInternational => "credit_card_intl",
            DocumentType::CreditLineStatement => "credit_line",
            DocumentType::RetailReceipt => "receipt",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = ExtractionFailure;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").replace(' ', "_").as_str() {
            "checking_statement" | "checking" => Ok(DocumentType::CheckingStatement),
            "credit_card_national" | "credit_card" => Ok(DocumentType::CreditCardNational),
            "credit_card_international" | "credit_card_intl" => {
                Ok(DocumentType::CreditCardInternational)
            }
            "credit_line_statement" | "credit_line" => Ok(DocumentType::CreditLineStatement),
            "retail_receipt" | "receipt" => Ok(DocumentType::RetailReceipt),
            other => Err(ExtractionFailure::new(format!(
                "unknown document type: {}",
                other
            ))),
        }
    }
}

/// Institution - who produced the document (parsed from the declared source id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Institution {
    BancoDeChile,
    BancoFalabella,
    Jumbo,
}

impl Institution {
    pub fn name(&self) -> &str {
        match self {
            Institution::BancoDeChile => "Banco de Chile",
            Institution::BancoFalabella => "Banco Falabella",
            Institution::Jumbo => "Jumbo",
        }
    }

    /// Match on the lowercased source id, e.g. "banco-de-chile/cuenta-corriente".
    pub fn from_source_id(source_id: &str) -> Result<Institution, ExtractionFailure> {
        let id = source_id.to_lowercase();

        if id.contains("falabella") {
            return Ok(Institution::BancoFalabella);
        }

        if id.contains("chile") {
            return Ok(Institution::BancoDeChile);
        }

        if id.contains("jumbo") {
            return Ok(Institution::Jumbo);
        }

        Err(ExtractionFailure::new(format!(
            "could not detect institution from source id: {}",
            source_id
        )))
    }
}

/// DocumentFormat - sniffed from the leading bytes, never from the extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentFormat {
    Pdf,
    Xlsx,
    Xls,
    Delimited,
}

impl DocumentFormat {
    pub fn sniff(bytes: &[u8]) -> DocumentFormat {
        if bytes.starts_with(b"%PDF") {
            DocumentFormat::Pdf
        } else if bytes.starts_with(b"PK\x03\x04") {
            DocumentFormat::Xlsx
        } else if bytes.starts_with(&[0xD0, 0xCF, 0x11, 0xE0]) {
            DocumentFormat::Xls
        } else {
            DocumentFormat::Delimited
        }
    }

    pub fn is_spreadsheet(&self) -> bool {
        !matches!(self, DocumentFormat::Pdf)
    }
}

/// Bytes plus the original file name (receipts fall back to a YYYYMM name).
#[derive(Debug, Clone, Copy)]
pub struct SourceBytes<'a> {
    pub bytes: &'a [u8],
    pub file_name: &'a str,
}

// ============================================================================
// RAW ROWS (staged verbatim)
// ============================================================================

/// One uninterpreted row. `charge` and `credit` are the verbatim cell strings
/// the validator sums; both are empty when the row has no such amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRow {
    pub cells: Vec<String>,
    pub charge: String,
    pub credit: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawTable {
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl RawTable {
    pub fn new(columns: Vec<String>) -> Self {
        RawTable {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column name -> cell value pairs, in column order.
    pub fn named_cells(&self, row: &RawRow) -> Vec<(String, String)> {
        self.columns
            .iter()
            .cloned()
            .zip(row.cells.iter().cloned())
            .collect()
    }
}

// ============================================================================
// TYPED ROWS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Installment {
    pub current: u32,
    pub total: u32,
    /// Month this installment is billed in
    pub charge_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignAmount {
    pub amount: Decimal,
    pub exchange_rate: Decimal,
    pub country: Option<String>,
}

/// RawTransaction - one typed movement, ready to commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransaction {
    pub row_index: usize,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub charge_amount: Decimal,
    pub credit_amount: Decimal,

    pub installment: Option<Installment>,
    pub foreign: Option<ForeignAmount>,
    pub balance_after: Option<Decimal>,
    pub reference: Option<String>,
    pub channel: Option<String>,
    pub category: Option<String>,

    /// Template-specific extras (interest, quantities, offers)
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RawTransaction {
    pub fn new(
        row_index: usize,
        transaction_date: NaiveDate,
        description: impl Into<String>,
        charge_amount: Decimal,
        credit_amount: Decimal,
    ) -> Self {
        RawTransaction {
            row_index,
            transaction_date,
            description: description.into(),
            charge_amount,
            credit_amount,
            installment: None,
            foreign: None,
            balance_after: None,
            reference: None,
            channel: None,
            category: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_installment(mut self, current: u32, total: u32, charge_date: Option<NaiveDate>) -> Self {
        self.installment = Some(Installment {
            current,
            total,
            charge_date,
        });
        self
    }

    pub fn with_foreign(mut self, amount: Decimal, exchange_rate: Decimal, country: Option<String>) -> Self {
        self.foreign = Some(ForeignAmount {
            amount,
            exchange_rate,
            country,
        });
        self
    }

    pub fn with_balance(mut self, balance: Decimal) -> Self {
        self.balance_after = Some(balance);
        self
    }

    pub fn with_reference(mut self, reference: String) -> Self {
        self.reference = non_blank(reference);
        self
    }

    pub fn with_channel(mut self, channel: String) -> Self {
        self.channel = non_blank(channel);
        self
    }

    pub fn with_category(mut self, category: String) -> Self {
        self.category = non_blank(category);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Everything one extraction produces
#[derive(Debug, Clone)]
pub struct ExtractResult {
    pub raw: RawTable,
    pub transactions: Vec<RawTransaction>,
    pub totals: DocumentTotals,
}

impl ExtractResult {
    /// Extraction with no transaction rows is a failure, not an empty success.
    pub fn non_empty(self) -> Result<Self, ExtractionFailure> {
        if self.transactions.is_empty() || self.raw.is_empty() {
            return Err(ExtractionFailure::new("no transaction rows found"));
        }
        Ok(self)
    }
}

/// Compile a template pattern. A bad pattern surfaces as an extraction
/// failure for the document instead of a panic in the worker.
pub(crate) fn compile(pattern: &str) -> Result<Regex, ExtractionFailure> {
    Regex::new(pattern)
        .map_err(|e| ExtractionFailure::new(format!("invalid pattern {}: {}", pattern, e)))
}

// ============================================================================
// EXTRACTOR TRAIT + REGISTRY
// ============================================================================

/// Extractor - the only interface a new institution has to implement
pub trait Extractor: Send + Sync {
    /// Stable name, stored with the document for provenance
    fn name(&self) -> &str;

    fn document_type(&self) -> DocumentType;

    fn extract(&self, source: SourceBytes<'_>) -> Result<ExtractResult, ExtractionFailure>;

    /// Stored next to `name`; bump when the template's output changes
    fn version(&self) -> &str {
        "1.0.0"
    }
}

type RegistryKey = (Institution, DocumentType, DocumentFormat);

/// Extractors keyed by (institution, document type, format).
/// Adding an institution is one `register` call, no shared branching.
#[derive(Default)]
pub struct ExtractorRegistry {
    extractors: HashMap<RegistryKey, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn new() -> Self {
        ExtractorRegistry::default()
    }

    /// Registry with every template this crate ships.
    /// `credit_descriptions` splits the single amount column of national card
    /// exports into charges and credits.
    pub fn with_defaults(credit_descriptions: &[String]) -> Self {
        let mut registry = ExtractorRegistry::new();

        registry.register(
            Institution::BancoDeChile,
            &[DocumentFormat::Pdf],
            Arc::new(pdf_statement::PdfStatementExtractor::checking()),
        );
        registry.register(
            Institution::BancoDeChile,
            &[DocumentFormat::Pdf],
            Arc::new(pdf_statement::PdfStatementExtractor::credit_line()),
        );

        let sheets = [
            DocumentFormat::Xlsx,
            DocumentFormat::Xls,
            DocumentFormat::Delimited,
        ];
        registry.register(
            Institution::BancoDeChile,
            &sheets,
            Arc::new(spreadsheet::SpreadsheetExtractor::national_card(
                credit_descriptions,
            )),
        );
        registry.register(
            Institution::BancoDeChile,
            &sheets,
            Arc::new(spreadsheet::SpreadsheetExtractor::international_card()),
        );
        registry.register(
            Institution::BancoFalabella,
            &sheets,
            Arc::new(spreadsheet::SpreadsheetExtractor::falabella_card()),
        );
        registry.register(
            Institution::BancoFalabella,
            &sheets,
            Arc::new(spreadsheet::SpreadsheetExtractor::falabella_checking()),
        );
        registry.register(
            Institution::BancoFalabella,
            &sheets,
            Arc::new(spreadsheet::SpreadsheetExtractor::falabella_credit_line()),
        );

        registry.register(
            Institution::Jumbo,
            &[DocumentFormat::Pdf],
            Arc::new(receipt::ReceiptExtractor::new()),
        );

        registry
    }

    pub fn register(
        &mut self,
        institution: Institution,
        formats: &[DocumentFormat],
        extractor: Arc<dyn Extractor>,
    ) {
        for format in formats {
            self.extractors.insert(
                (institution, extractor.document_type(), *format),
                Arc::clone(&extractor),
            );
        }
    }

    pub fn resolve(
        &self,
        institution: Institution,
        document_type: DocumentType,
        format: DocumentFormat,
    ) -> Result<&dyn Extractor, ExtractionFailure> {
        self.extractors
            .get(&(institution, document_type, format))
            .map(|e| e.as_ref())
            .ok_or_else(|| {
                ExtractionFailure::new(format!(
                    "no extractor for {} {} ({:?})",
                    institution.name(),
                    document_type,
                    format
                ))
            })
    }

    pub fn len(&self) -> usize {
        self.extractors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extractors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_type_round_trip_names() {
        for ty in [
            DocumentType::CheckingStatement,
            DocumentType::CreditCardNational,
            DocumentType::CreditCardInternational,
            DocumentType::CreditLineStatement,
            DocumentType::RetailReceipt,
        ] {
            assert_eq!(ty.as_str().parse::<DocumentType>().unwrap(), ty);
        }
        assert_eq!(
            "credit-card-intl".parse::<DocumentType>().unwrap(),
            DocumentType::CreditCardInternational
        );
        assert!("brokerage".parse::<DocumentType>().is_err());
    }

    #[test]
    fn test_archive_labels() {
        assert_eq!(DocumentType::CheckingStatement.archive_label(), "checking");
        assert_eq!(DocumentType::RetailReceipt.archive_label(), "receipt");
    }

    #[test]
    fn test_institution_from_source_id() {
        assert_eq!(
            Institution::from_source_id("banco-de-chile").unwrap(),
            Institution::BancoDeChile
        );
        assert_eq!(
            Institution::from_source_id("Banco Falabella - Cuenta Corriente").unwrap(),
            Institution::BancoFalabella
        );
        assert_eq!(
            Institution::from_source_id("jumbo").unwrap(),
            Institution::Jumbo
        );
        assert!(Institution::from_source_id("unknown-bank").is_err());
    }

    #[test]
    fn test_sniff_format() {
        assert_eq!(DocumentFormat::sniff(b"%PDF-1.7\n"), DocumentFormat::Pdf);
        assert_eq!(DocumentFormat::sniff(b"PK\x03\x04rest"), DocumentFormat::Xlsx);
        assert_eq!(
            DocumentFormat::sniff(&[0xD0, 0xCF, 0x11, 0xE0, 0xA1]),
            DocumentFormat::Xls
        );
        assert_eq!(DocumentFormat::sniff(b"Fecha;Descripcion"), DocumentFormat::Delimited);
    }

    #[test]
    fn test_registry_defaults_resolve() {
        let registry = ExtractorRegistry::with_defaults(&[]);

        let checking = registry
            .resolve(
                Institution::BancoDeChile,
                DocumentType::CheckingStatement,
                DocumentFormat::Pdf,
            )
            .unwrap();
        assert_eq!(checking.document_type(), DocumentType::CheckingStatement);

        let falabella = registry
            .resolve(
                Institution::BancoFalabella,
                DocumentType::CheckingStatement,
                DocumentFormat::Xlsx,
            )
            .unwrap();
        assert_eq!(falabella.name(), "falabella_checking_sheet");

        assert!(registry
            .resolve(
                Institution::Jumbo,
                DocumentType::CheckingStatement,
                DocumentFormat::Pdf
            )
            .is_err());
    }

    #[test]
    fn test_raw_transaction_builder() {
        let tx = RawTransaction::new(
            0,
            NaiveDate::from_ymd_opt(2024, 1, 5).unwrap(),
            "COMPRA",
            Decimal::new(1000, 0),
            Decimal::ZERO,
        )
        .with_channel("  ".to_string())
        .with_reference("000123".to_string());

        assert_eq!(tx.channel, None);
        assert_eq!(tx.reference.as_deref(), Some("000123"));
    }
}
