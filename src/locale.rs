// 🌎 Locale Normalizer - statement numbers and dates (es-CL)
//
// Amounts: "." is the thousands separator, "," the decimal separator.
// Dates: bank PDFs print only DD/MM, the year comes from the statement
// closing date (see infer_statement_year).

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use std::str::FromStr;

// Longest markers first so "US$" is not left as "US" after stripping "$"
const CURRENCY_MARKERS: [&str; 5] = ["US$", "USD", "CLP", "$", "%"];

const FLOAT_CELL_DECIMALS: u32 = 6;

// Excel day zero (serial 1 = 1900-01-01, accounting for the 1900 leap bug)
const EXCEL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

// ============================================================================
// AMOUNTS
// ============================================================================

/// Parse a statement-formatted amount.
///
/// Blank cells, a bare "-" and malformed input all map to zero. A value
/// with an embedded space (PDF word-wrap) keeps only its first token.
/// A trailing "-" marks a negative amount ("1.234-" = -1234).
pub fn parse_amount(raw: &str) -> Decimal {
    parse_amount_checked(raw).unwrap_or(Decimal::ZERO)
}

/// Same as [`parse_amount`] but malformed input is `None` instead of zero.
/// Blank and "-" are still `Some(0)`.
pub fn parse_amount_checked(raw: &str) -> Option<Decimal> {
    let mut value = raw.trim().to_string();
    for marker in CURRENCY_MARKERS {
        value = value.replace(marker, "");
    }

    let token = value.split_whitespace().next().unwrap_or("");
    if token.is_empty() || token == "-" {
        return Some(Decimal::ZERO);
    }

    let (negative, digits) = if let Some(rest) = token.strip_suffix('-') {
        (true, rest)
    } else if let Some(rest) = token.strip_prefix('-') {
        (true, rest)
    } else {
        (false, token)
    };

    let normalized = digits.replace('.', "").replace(',', ".");
    if normalized.is_empty() || !normalized.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return None;
    }

    let parsed = Decimal::from_str(&normalized).ok()?;
    Some(if negative { -parsed } else { parsed })
}

/// True when a non-blank cell parsed to zero only because it was malformed.
pub fn is_masked_zero(raw: &str) -> bool {
    parse_amount_checked(raw).is_none()
}

/// Render a spreadsheet float the way the statement locale prints it
/// (1234.5 -> "1234,5"), so numeric cells go through the same parser as text.
/// Binary noise past six decimals is rounded away (0.1 + 0.2 -> "0,3").
pub fn locale_number(value: f64) -> String {
    match Decimal::from_f64(value) {
        Some(d) => d
            .round_dp(FLOAT_CELL_DECIMALS)
            .normalize()
            .to_string()
            .replace('.', ","),
        // NaN or out of range: keep it visible as a malformed cell
        None => value.to_string(),
    }
}

// ============================================================================
// DATES
// ============================================================================

/// Resolve a DD/MM transaction date against the statement closing date.
///
/// A month strictly after the closing month belongs to the previous year
/// (a December purchase on a January statement). Otherwise the statement's
/// year is used. Returns `None` for impossible dates such as 31/02.
pub fn infer_statement_year(day: u32, month: u32, statement_end: NaiveDate) -> Option<NaiveDate> {
    let year = if month > statement_end.month() {
        statement_end.year() - 1
    } else {
        statement_end.year()
    };
    NaiveDate::from_ymd_opt(year, month, day)
}

/// "15/12" -> (15, 12). Anything after the month is ignored.
pub fn parse_day_month(raw: &str) -> Option<(u32, u32)> {
    let mut parts = raw.trim().split('/');
    let day = parts.next()?.trim().parse::<u32>().ok()?;
    let month = parts.next()?.trim();
    let month = month.get(..2).unwrap_or(month).parse::<u32>().ok()?;
    if (1..=31).contains(&day) && (1..=12).contains(&month) {
        Some((day, month))
    } else {
        None
    }
}

/// DD/MM cell plus closing date -> full date.
pub fn resolve_day_month(raw: &str, statement_end: NaiveDate) -> Option<NaiveDate> {
    let (day, month) = parse_day_month(raw)?;
    infer_statement_year(day, month, statement_end)
}

/// Full printed date: dd/mm/yyyy or dd-mm-yyyy.
pub fn parse_statement_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .filter(|d| d.year() >= 1900)
}

/// Spreadsheet date cell as text: printed dates or ISO dates. A bare number
/// is not a date here; typed workbook date cells are converted with
/// [`excel_serial_date`] before they become text.
pub fn parse_sheet_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(date) = parse_statement_date(raw) {
        return Some(date);
    }

    for fmt in ["%Y-%m-%d", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            return Some(date);
        }
    }

    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(dt.date());
        }
    }

    ["%d/%m/%y", "%d-%m-%y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Excel serial day number -> date. Only for cells the workbook itself
/// types as dates.
pub fn excel_serial_date(serial: f64) -> Option<NaiveDate> {
    // 1 = 1900-01-01, 2958465 = 9999-12-31
    if !(1.0..=2_958_465.0).contains(&serial) {
        return None;
    }
    let (y, m, d) = EXCEL_EPOCH;
    let epoch = NaiveDate::from_ymd_opt(y, m, d)?;
    epoch.checked_add_signed(Duration::days(serial.trunc() as i64))
}

// ============================================================================
// INSTALLMENTS
// ============================================================================

/// "03/12" -> (3, 12). Missing or unreadable values mean a single payment.
pub fn parse_installments(raw: &str) -> (u32, u32) {
    let raw = raw.trim();
    let Some((current, total)) = raw.split_once('/') else {
        return (1, 1);
    };
    match (current.trim().parse::<u32>(), total.trim().parse::<u32>()) {
        (Ok(c), Ok(t)) if c >= 1 && t >= 1 => (c, t),
        _ => (1, 1),
    }
}

/// Month in which installment `current` is billed: purchase date plus
/// (current - 1) months, clamped to the end of shorter months.
pub fn installment_charge_date(purchase: NaiveDate, current: u32) -> Option<NaiveDate> {
    purchase.checked_add_months(Months::new(current.saturating_sub(1)))
}
