// 📑 Document totals - what the statement itself claims
//
// Pure function from page text to DocumentTotals. A missing required field is
// an ExtractionFailure, never a silent zero: "not printed" and "printed as 0"
// must stay distinguishable for the validator.

use super::{compile, RawTransaction};
use crate::error::ExtractionFailure;
use crate::locale::{parse_amount_checked, parse_statement_date};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Where a reported sum came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Read from a labelled total on the document
    Printed,
    /// The template prints no total; summed from the typed rows
    Derived,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportedSum {
    pub value: Decimal,
    pub provenance: Provenance,
}

impl ReportedSum {
    pub fn printed(value: Decimal) -> Self {
        ReportedSum {
            value,
            provenance: Provenance::Printed,
        }
    }

    pub fn derived(value: Decimal) -> Self {
        ReportedSum {
            value,
            provenance: Provenance::Derived,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub opening_balance: Option<Decimal>,
    pub closing_balance: Option<Decimal>,
    pub reported_row_count: usize,
    pub reported_charge_sum: ReportedSum,
    pub reported_credit_sum: ReportedSum,
    pub period_start: Option<NaiveDate>,
    pub period_end: NaiveDate,
}

impl DocumentTotals {
    /// Totals for a document that prints no balances or sums.
    pub fn derived(transactions: &[RawTransaction], period_end: NaiveDate) -> Self {
        let (charges, credits) = sum_transactions(transactions);
        DocumentTotals {
            opening_balance: None,
            closing_balance: None,
            reported_row_count: transactions.len(),
            reported_charge_sum: ReportedSum::derived(charges),
            reported_credit_sum: ReportedSum::derived(credits),
            period_start: None,
            period_end,
        }
    }

    pub fn with_balances(mut self, opening: Decimal, closing: Decimal) -> Self {
        self.opening_balance = Some(opening);
        self.closing_balance = Some(closing);
        self
    }

    pub fn has_balances(&self) -> bool {
        self.opening_balance.is_some() && self.closing_balance.is_some()
    }

    /// Statement period as YYYY-MM (from the closing date)
    pub fn period_label(&self) -> String {
        self.period_end.format("%Y-%m").to_string()
    }
}

pub fn sum_transactions(transactions: &[RawTransaction]) -> (Decimal, Decimal) {
    transactions.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(charges, credits), tx| (charges + tx.charge_amount, credits + tx.credit_amount),
    )
}

// ============================================================================
// LABELLED FIELDS
// ============================================================================

/// Regexes for the labelled fields of one template. Each pattern has exactly
/// one capture group holding the value.
#[derive(Debug, Clone)]
pub struct TotalsPatterns {
    pub period_end: &'static str,
    pub period_start: Option<&'static str>,
    pub opening_balance: Option<&'static str>,
    pub closing_balance: Option<&'static str>,
    pub charge_total: Option<&'static str>,
    pub credit_total: Option<&'static str>,
    /// Balance patterns must match; otherwise extraction fails
    pub balances_required: bool,
}

pub fn extract_totals(
    text: &str,
    patterns: &TotalsPatterns,
    transactions: &[RawTransaction],
) -> Result<DocumentTotals, ExtractionFailure> {
    let period_end = statement_closing_date(text, patterns)?;

    let period_start = match patterns.period_start {
        Some(pattern) => capture(text, pattern)?.and_then(|s| parse_statement_date(&s)),
        None => None,
    };

    let opening = labelled_amount(text, patterns.opening_balance, "opening balance")?;
    let closing = labelled_amount(text, patterns.closing_balance, "closing balance")?;

    match (opening, closing) {
        (None, None) if patterns.balances_required => {
            return Err(ExtractionFailure::new("opening and closing balances not found"));
        }
        (Some(_), None) => {
            return Err(ExtractionFailure::new(
                "closing balance not found (opening balance is printed)",
            ));
        }
        (None, Some(_)) => {
            return Err(ExtractionFailure::new(
                "opening balance not found (closing balance is printed)",
            ));
        }
        _ => {}
    }

    let (derived_charges, derived_credits) = sum_transactions(transactions);
    let reported_charge_sum = labelled_amount(text, patterns.charge_total, "charge total")?
        .map(ReportedSum::printed)
        .unwrap_or(ReportedSum::derived(derived_charges));
    let reported_credit_sum = labelled_amount(text, patterns.credit_total, "credit total")?
        .map(ReportedSum::printed)
        .unwrap_or(ReportedSum::derived(derived_credits));

    Ok(DocumentTotals {
        opening_balance: opening,
        closing_balance: closing,
        reported_row_count: transactions.len(),
        reported_charge_sum,
        reported_credit_sum,
        period_start,
        period_end,
    })
}

/// Closing date of the statement period; every DD/MM row date hangs off it.
pub fn statement_closing_date(
    text: &str,
    patterns: &TotalsPatterns,
) -> Result<NaiveDate, ExtractionFailure> {
    let raw = capture(text, patterns.period_end)?
        .ok_or_else(|| ExtractionFailure::new("statement closing date not found"))?;
    parse_statement_date(&raw).ok_or_else(|| {
        ExtractionFailure::new(format!("unreadable statement closing date: '{}'", raw))
    })
}

/// `Ok(None)` when the label is absent, an error when it is printed but
/// the value cannot be read.
fn labelled_amount(
    text: &str,
    pattern: Option<&'static str>,
    label: &str,
) -> Result<Option<Decimal>, ExtractionFailure> {
    let Some(pattern) = pattern else {
        return Ok(None);
    };
    match capture(text, pattern)? {
        Some(raw) => parse_amount_checked(&raw)
            .map(Some)
            .ok_or_else(|| ExtractionFailure::new(format!("unreadable {}: '{}'", label, raw))),
        None => Ok(None),
    }
}

fn capture(text: &str, pattern: &str) -> Result<Option<String>, ExtractionFailure> {
    let re = compile(pattern)?;
    Ok(re
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string()))
}
