use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FrequencyError {
    #[error("invalid frequency unit: {0} (expected A, M or D)")]
    InvalidUnit(String),
    #[error("date out of range while stepping {0} periods")]
    OutOfRange(i64),
}

/// Calendar granularity used for decline rates, time axes and cashflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Frequency {
    #[serde(rename = "A")]
    Annual,
    #[serde(rename = "M")]
    Monthly,
    #[serde(rename = "D")]
    Daily,
}

impl Frequency {
    pub fn code(&self) -> &'static str {
        match self {
            Frequency::Annual => "A",
            Frequency::Monthly => "M",
            Frequency::Daily => "D",
        }
    }

    /// Approximate number of days in one period of this frequency.
    fn days(&self) -> f64 {
        match self {
            Frequency::Annual => 365.0,
            Frequency::Monthly => 30.0,
            Frequency::Daily => 1.0,
        }
    }

    /// `true` when one period of `self` spans more time than one of `other`.
    pub fn is_coarser_than(&self, other: Frequency) -> bool {
        self.days() > other.days()
    }

    fn label_format(&self) -> &'static str {
        match self {
            Frequency::Annual => "%Y",
            Frequency::Monthly => "%Y-%m",
            Frequency::Daily => "%Y-%m-%d",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Frequency {
    type Err = FrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "A" | "a" => Ok(Frequency::Annual),
            "M" | "m" => Ok(Frequency::Monthly),
            "D" | "d" => Ok(Frequency::Daily),
            other => Err(FrequencyError::InvalidUnit(other.to_string())),
        }
    }
}

/// Multiplicative factor converting a quantity quoted per `from` period into
/// one quoted per `to` period.
///
/// An annual decline rate becomes a daily one with
/// `converter_factor(Annual, Daily) == 1/365`, and a monthly count becomes an
/// annual one with `converter_factor(Monthly, Annual) == 12`.
pub fn converter_factor(from: Frequency, to: Frequency) -> f64 {
    use Frequency::*;
    match (from, to) {
        (Annual, Annual) | (Monthly, Monthly) | (Daily, Daily) => 1.0,
        (Annual, Monthly) => 1.0 / 12.0,
        (Annual, Daily) => 1.0 / 365.0,
        (Monthly, Annual) => 12.0,
        (Monthly, Daily) => 1.0 / 30.0,
        (Daily, Annual) => 365.0,
        (Daily, Monthly) => 30.0,
    }
}

/// First calendar day of the period containing `date`.
pub fn period_start(date: NaiveDate, freq: Frequency) -> NaiveDate {
    match freq {
        Frequency::Daily => date,
        Frequency::Monthly => date.with_day(1).unwrap_or(date),
        Frequency::Annual => NaiveDate::from_ymd_opt(date.year(), 1, 1).unwrap_or(date),
    }
}

/// Moves `date` by `steps` whole periods. Month and year steps keep the day of
/// month when it exists and clamp to the month end otherwise.
pub fn advance(date: NaiveDate, freq: Frequency, steps: i64) -> Result<NaiveDate, FrequencyError> {
    let shifted = match freq {
        Frequency::Daily => date.checked_add_signed(chrono::Duration::days(steps)),
        Frequency::Monthly => shift_months(date, steps),
        Frequency::Annual => shift_months(date, steps.saturating_mul(12)),
    };
    shifted.ok_or(FrequencyError::OutOfRange(steps))
}

fn shift_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
    if months >= 0 {
        date.checked_add_months(Months::new(magnitude))
    } else {
        date.checked_sub_months(Months::new(magnitude))
    }
}

/// Period starts covering `[start, end)` at `freq`. The first element is the
/// period containing `start`.
pub fn period_range(
    start: NaiveDate,
    end: NaiveDate,
    freq: Frequency,
) -> Result<Vec<NaiveDate>, FrequencyError> {
    let mut current = period_start(start, freq);
    let mut periods = Vec::new();
    while current < end {
        periods.push(current);
        current = advance(current, freq, 1)?;
    }
    Ok(periods)
}

/// `count` consecutive period starts beginning at the period of `start`.
pub fn period_sequence(
    start: NaiveDate,
    count: usize,
    freq: Frequency,
) -> Result<Vec<NaiveDate>, FrequencyError> {
    let first = period_start(start, freq);
    (0..count as i64).map(|step| advance(first, freq, step)).collect()
}

pub fn period_label(date: NaiveDate, freq: Frequency) -> String {
    period_start(date, freq).format(freq.label_format()).to_string()
}
