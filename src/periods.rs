//! Period label handling and fiscal-calendar mapping
//!
//! Monthly series are keyed by zero-padded `YYYY-MM` labels so that
//! lexicographic order is chronological order. Quarterly and yearly
//! aggregates are labeled on the configured fiscal-year convention
//! (a fiscal year is named for the calendar year in which it ends).

/// Parse a period label into (year, month). Accepts `YYYY-MM`,
/// `YYYY-MM-DD` and `YYYY/MM` shapes.
pub fn parse_month_label(raw: &str) -> Option<(i32, u32)> {
    let mut parts = raw.trim().split(['-', '/']);
    let year: i32 = parts.next()?.trim().parse().ok()?;
    let month: u32 = parts.next()?.trim().parse().ok()?;
    if !(1..=12).contains(&month) || !(1000..=9999).contains(&year) {
        return None;
    }
    Some((year, month))
}

pub fn month_label(year: i32, month: u32) -> String {
    format!("{:04}-{:02}", year, month)
}

pub fn next_month(year: i32, month: u32) -> (i32, u32) {
    if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    }
}

pub fn add_months(year: i32, month: u32, count: u32) -> (i32, u32) {
    let total = year * 12 + (month as i32 - 1) + count as i32;
    (total.div_euclid(12), (total.rem_euclid(12) + 1) as u32)
}

/// Number of whole months from `a` to `b` (negative when `b` precedes `a`).
pub fn months_between(a: (i32, u32), b: (i32, u32)) -> i32 {
    (b.0 * 12 + b.1 as i32) - (a.0 * 12 + a.1 as i32)
}

/// Fiscal year containing the given calendar month. With a January start
/// this is the calendar year; otherwise months at or past the start month
/// belong to the fiscal year ending next calendar year.
pub fn fiscal_year(year: i32, month: u32, fy_start_month: u32) -> i32 {
    if fy_start_month == 1 || month < fy_start_month {
        year
    } else {
        year + 1
    }
}

/// Fiscal quarter (1..=4) of the given calendar month.
pub fn fiscal_quarter(month: u32, fy_start_month: u32) -> u32 {
    let offset = (month + 12 - fy_start_month) % 12;
    offset / 3 + 1
}

pub fn fiscal_year_label(fy: i32) -> String {
    format!("FY{}", fy)
}

pub fn fiscal_quarter_label(fy: i32, quarter: u32) -> String {
    format!("FY{}-Q{}", fy, quarter)
}
