use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use std::collections::BTreeSet;
use std::fmt;

pub const PARENT_TABLE: &str = "metric_value";
const TABLE_PREFIX: &str = "metric_value_y";

/// One monthly slice of `metric_value`, `[YYYY-MM-01, next month-01)` in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionMonth {
    year: i32,
    month: u32,
}

impl PartitionMonth {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return None;
        }
        Some(Self { year, month })
    }

    pub fn of(ts: DateTime<Utc>) -> Self {
        Self {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Shifts by `months`, negative values go back in time.
    pub fn offset(&self, months: i64) -> Self {
        let index = self.year as i64 * 12 + (self.month as i64 - 1) + months;
        Self {
            year: index.div_euclid(12) as i32,
            month: index.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn next(&self) -> Self {
        self.offset(1)
    }

    pub fn table_name(&self) -> String {
        format!("{}{:04}m{:02}", TABLE_PREFIX, self.year, self.month)
    }

    /// Parses names produced by [`table_name`](Self::table_name). Anything
    /// else, including non-canonical padding, yields `None`.
    pub fn from_table_name(name: &str) -> Option<Self> {
        let rest = name.strip_prefix(TABLE_PREFIX)?;
        let (year, month) = rest.split_once('m')?;
        if year.len() != 4 || month.len() != 2 {
            return None;
        }
        if !year.bytes().chain(month.bytes()).all(|b| b.is_ascii_digit()) {
            return None;
        }
        Self::new(year.parse().ok()?, month.parse().ok()?)
    }

    pub fn lower_bound(&self) -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn upper_bound(&self) -> DateTime<Utc> {
        self.next().lower_bound()
    }

    fn bound_literal(&self) -> String {
        format!("'{:04}-{:02}-01 00:00:00+00'", self.year, self.month)
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} PARTITION OF {} FOR VALUES FROM ({}) TO ({})",
            self.table_name(),
            PARENT_TABLE,
            self.bound_literal(),
            self.next().bound_literal()
        )
    }

    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", self.table_name())
    }

    /// `self` and the `months_forward` months after it.
    pub fn range_forward(&self, months_forward: u32) -> Vec<Self> {
        (0..=months_forward as i64).map(|i| self.offset(i)).collect()
    }
}

impl fmt::Display for PartitionMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// First month that is kept when `retention_months` full months before
/// `current` are retained.
pub fn retention_cutoff(current: PartitionMonth, retention_months: u32) -> PartitionMonth {
    current.offset(-(retention_months as i64))
}

/// Months in `wanted` that have no table in `existing`, ascending.
pub fn missing_months(wanted: &[PartitionMonth], existing: &[String]) -> Vec<PartitionMonth> {
    let present: BTreeSet<PartitionMonth> = existing
        .iter()
        .filter_map(|name| PartitionMonth::from_table_name(name))
        .collect();
    let wanted: BTreeSet<PartitionMonth> = wanted.iter().copied().collect();
    wanted.difference(&present).copied().collect()
}

/// Partitions strictly older than `cutoff`, oldest first. Tables that do not
/// follow the naming scheme are never selected.
pub fn expired_months(existing: &[String], cutoff: PartitionMonth) -> Vec<PartitionMonth> {
    let expired: BTreeSet<PartitionMonth> = existing
        .iter()
        .filter_map(|name| PartitionMonth::from_table_name(name))
        .filter(|month| *month < cutoff)
        .collect();
    expired.into_iter().collect()
}

#[cfg(test)]
mod tests;
