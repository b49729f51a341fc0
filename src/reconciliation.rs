// ⚖️ Reconciliation Engine - staged rows vs what the document claims
//
// Two checks, both re-derived from the staged raw cells (never from the
// typed rows the extractor produced):
//
//   1. Item integrity:  count(staged) = reported rows
//                       Σ charges     = reported charge sum
//                       Σ credits     = reported credit sum
//   2. Coherence:       opening + credits - charges = closing
//
// A statement that prints no balances cannot be checked for coherence; that
// check is NotApplicable rather than passed or failed.

use crate::error::{CheckMismatch, PersistenceFailure, ValidationFailure};
use crate::extract::DocumentTotals;
use crate::fingerprint::Fingerprint;
use crate::locale::parse_amount;
use crate::staging::{load_staged_rows, StagedRow};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ============================================================================
// CHECK OUTCOME
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOutcome {
    Passed,
    Failed,
    NotApplicable,
}

impl CheckOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, CheckOutcome::Failed)
    }
}

// ============================================================================
// RECONCILIATION REPORT
// ============================================================================

#[derive(Debug, Clone)]
pub struct ReconciliationReport {
    pub staged_rows: usize,
    pub staged_charges: Decimal,
    pub staged_credits: Decimal,
    pub item_integrity: CheckOutcome,
    pub coherence: CheckOutcome,
    /// opening + credits - charges, when balances are printed
    pub computed_closing: Option<Decimal>,
    pub mismatches: Vec<CheckMismatch>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconciliationReport {
    pub fn is_balanced(&self) -> bool {
        !self.item_integrity.is_failed() && !self.coherence.is_failed()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} rows, charges {}, credits {}, integrity {:?}, coherence {:?}",
            self.staged_rows,
            self.staged_charges,
            self.staged_credits,
            self.item_integrity,
            self.coherence
        )
    }

    /// Err with every mismatch when either check failed
    pub fn into_result(self) -> Result<Self, ValidationFailure> {
        if self.is_balanced() {
            Ok(self)
        } else {
            Err(ValidationFailure {
                mismatches: self.mismatches,
            })
        }
    }
}

// ============================================================================
// RECONCILIATION ENGINE
// ============================================================================

pub struct ReconciliationEngine {
    /// Absolute tolerance for sums and balances (default: 0.01)
    pub tolerance: Decimal,
}

impl ReconciliationEngine {
    pub fn new() -> Self {
        ReconciliationEngine {
            tolerance: Decimal::new(1, 2),
        }
    }

    pub fn with_tolerance(tolerance: Decimal) -> Self {
        ReconciliationEngine { tolerance }
    }

    /// Re-read the staged rows of `fingerprint` (inside the caller's unit of
    /// work) and reconcile them against the document totals.
    pub fn validate(
        &self,
        conn: &Connection,
        fingerprint: &Fingerprint,
        totals: &DocumentTotals,
    ) -> Result<ReconciliationReport, PersistenceFailure> {
        let rows = load_staged_rows(conn, fingerprint)?;
        let report = self.reconcile(&rows, totals);

        if report.is_balanced() {
            tracing::info!(
                fingerprint = %fingerprint.short(),
                summary = %report.summary(),
                "reconciled"
            );
        } else {
            for mismatch in &report.mismatches {
                tracing::warn!(fingerprint = %fingerprint.short(), %mismatch, "reconciliation mismatch");
            }
        }

        Ok(report)
    }

    pub fn reconcile(&self, rows: &[StagedRow], totals: &DocumentTotals) -> ReconciliationReport {
        let staged_charges: Decimal = rows.iter().map(|r| parse_amount(&r.raw_charge)).sum();
        let staged_credits: Decimal = rows.iter().map(|r| parse_amount(&r.raw_credit)).sum();

        let mut mismatches = Vec::new();

        // 1. Item integrity
        if rows.len() != totals.reported_row_count {
            mismatches.push(CheckMismatch::RowCount {
                expected: totals.reported_row_count,
                actual: rows.len(),
            });
        }
        if !self.within(staged_charges, totals.reported_charge_sum.value) {
            mismatches.push(CheckMismatch::ChargeSum {
                expected: totals.reported_charge_sum.value,
                actual: staged_charges,
            });
        }
        if !self.within(staged_credits, totals.reported_credit_sum.value) {
            mismatches.push(CheckMismatch::CreditSum {
                expected: totals.reported_credit_sum.value,
                actual: staged_credits,
            });
        }
        let item_integrity = if mismatches.is_empty() {
            CheckOutcome::Passed
        } else {
            CheckOutcome::Failed
        };

        // 2. Coherence: opening + credits - charges = closing
        let (coherence, computed_closing) = match (totals.opening_balance, totals.closing_balance) {
            (Some(opening), Some(closing)) => {
                let credits = totals.reported_credit_sum.value;
                let charges = totals.reported_charge_sum.value;
                let computed = opening + credits - charges;

                if self.within(computed, closing) {
                    (CheckOutcome::Passed, Some(computed))
                } else {
                    mismatches.push(CheckMismatch::Coherence {
                        opening,
                        credits,
                        charges,
                        computed,
                        closing,
                    });
                    (CheckOutcome::Failed, Some(computed))
                }
            }
            _ => (CheckOutcome::NotApplicable, None),
        };

        ReconciliationReport {
            staged_rows: rows.len(),
            staged_charges,
            staged_credits,
            item_integrity,
            coherence,
            computed_closing,
            mismatches,
            reconciled_at: Utc::now(),
        }
    }

    fn within(&self, actual: Decimal, expected: Decimal) -> bool {
        (actual - expected).abs() <= self.tolerance
    }
}

impl Default for ReconciliationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================
