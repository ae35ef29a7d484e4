use std::fmt;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::frequency::{Frequency, FrequencyError, advance, period_start};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TimeError {
    #[error("time values mix integer steps and calendar dates")]
    MixedModes,
    #[error("time anchor is empty")]
    EmptyAnchor,
    #[error("{value} shifted by {delay} is out of range")]
    OutOfRange { value: TimeValue, delay: i64 },
    #[error(transparent)]
    Frequency(#[from] FrequencyError),
}

/// How a model places its values on the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeMode {
    Number,
    Date,
}

/// A point in time: either an integer step or a calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TimeValue {
    Int(i64),
    Date(NaiveDate),
}

impl TimeValue {
    pub fn mode(&self) -> TimeMode {
        match self {
            TimeValue::Int(_) => TimeMode::Number,
            TimeValue::Date(_) => TimeMode::Date,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            TimeValue::Date(date) => Some(*date),
            TimeValue::Int(_) => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TimeValue::Int(value) => Some(*value),
            TimeValue::Date(_) => None,
        }
    }

    /// Aligns a date to the start of its period; integers are left untouched.
    pub fn to_period(&self, freq: Frequency) -> TimeValue {
        match self {
            TimeValue::Date(date) => TimeValue::Date(period_start(*date, freq)),
            TimeValue::Int(value) => TimeValue::Int(*value),
        }
    }

    /// The next period after this one: one calendar period for dates, one
    /// step for integers.
    pub fn next(&self, freq: Frequency) -> Result<TimeValue, TimeError> {
        match self {
            TimeValue::Date(date) => Ok(TimeValue::Date(advance(*date, freq, 1)?)),
            TimeValue::Int(_) => self.shifted(1),
        }
    }

    /// Shifts the value by a delay expressed in days (dates) or steps (integers).
    pub fn shifted(&self, delay: i64) -> Result<TimeValue, TimeError> {
        let shifted = match self {
            TimeValue::Date(date) => {
                let days = Days::new(delay.unsigned_abs());
                let moved = if delay >= 0 {
                    date.checked_add_days(days)
                } else {
                    date.checked_sub_days(days)
                };
                moved.map(TimeValue::Date)
            }
            TimeValue::Int(value) => value.checked_add(delay).map(TimeValue::Int),
        };
        shifted.ok_or(TimeError::OutOfRange { value: *self, delay })
    }
}

impl fmt::Display for TimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeValue::Int(value) => write!(f, "{value}"),
            TimeValue::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

impl From<NaiveDate> for TimeValue {
    fn from(date: NaiveDate) -> Self {
        TimeValue::Date(date)
    }
}

impl From<i64> for TimeValue {
    fn from(value: i64) -> Self {
        TimeValue::Int(value)
    }
}

/// Checks that every value shares one representation and returns it.
pub fn common_mode<'a, I>(values: I) -> Result<Option<TimeMode>, TimeError>
where
    I: IntoIterator<Item = &'a TimeValue>,
{
    let mut mode = None;
    for value in values {
        match mode {
            None => mode = Some(value.mode()),
            Some(existing) if existing != value.mode() => return Err(TimeError::MixedModes),
            Some(_) => {}
        }
    }
    Ok(mode)
}

/// Time of the initial rate of a decline model. Holds one value or one value
/// per iteration when periods start staggered after a dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "AnchorRecord", into = "AnchorRecord")]
pub struct TimeAnchor {
    values: Vec<TimeValue>,
    mode: TimeMode,
}

impl TimeAnchor {
    pub fn new(values: Vec<TimeValue>) -> Result<Self, TimeError> {
        let mode = common_mode(&values)?.ok_or(TimeError::EmptyAnchor)?;
        Ok(Self { values, mode })
    }

    pub fn single(value: TimeValue) -> Self {
        Self {
            mode: value.mode(),
            values: vec![value],
        }
    }

    pub fn values(&self) -> &[TimeValue] {
        &self.values
    }

    pub fn mode(&self) -> TimeMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn min(&self) -> TimeValue {
        // new() rejects empty anchors
        self.values.iter().min().copied().unwrap_or(TimeValue::Int(0))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum AnchorRecord {
    Single(TimeValue),
    Many(Vec<TimeValue>),
}

impl TryFrom<AnchorRecord> for TimeAnchor {
    type Error = TimeError;

    fn try_from(record: AnchorRecord) -> Result<Self, Self::Error> {
        match record {
            AnchorRecord::Single(value) => Ok(TimeAnchor::single(value)),
            AnchorRecord::Many(values) => TimeAnchor::new(values),
        }
    }
}

impl From<TimeAnchor> for AnchorRecord {
    fn from(anchor: TimeAnchor) -> Self {
        if anchor.values.len() == 1 {
            AnchorRecord::Single(anchor.values[0])
        } else {
            AnchorRecord::Many(anchor.values)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::on_date;

    #[test]
    fn anchor_rejects_mixed_representations() {
        let error = TimeAnchor::new(vec![TimeValue::Int(0), TimeValue::Date(on_date(2021, 1, 1))])
            .unwrap_err();
        assert_eq!(error, TimeError::MixedModes);
        assert_eq!(TimeAnchor::new(vec![]).unwrap_err(), TimeError::EmptyAnchor);
    }

    #[test]
    fn anchor_min_picks_earliest_value() {
        let anchor = TimeAnchor::new(vec![
            TimeValue::Date(on_date(2022, 3, 1)),
            TimeValue::Date(on_date(2021, 5, 1)),
        ])
        .unwrap();
        assert_eq!(anchor.min(), TimeValue::Date(on_date(2021, 5, 1)));
        assert_eq!(anchor.mode(), TimeMode::Date);
    }

    #[test]
    fn anchor_deserializes_from_scalar_or_list() {
        let single: TimeAnchor = serde_yaml::from_str("2021-01-01").unwrap();
        assert_eq!(single.values(), &[TimeValue::Date(on_date(2021, 1, 1))]);

        let many: TimeAnchor = serde_yaml::from_str("[0, 12]").unwrap();
        assert_eq!(many.values(), &[TimeValue::Int(0), TimeValue::Int(12)]);
        assert_eq!(many.mode(), TimeMode::Number);
    }

    #[test]
    fn shifted_moves_dates_by_days() {
        let value = TimeValue::Date(on_date(2021, 12, 31));
        assert_eq!(value.shifted(1).unwrap(), TimeValue::Date(on_date(2022, 1, 1)));
        assert_eq!(value.shifted(-365).unwrap(), TimeValue::Date(on_date(2020, 12, 31)));
        assert_eq!(TimeValue::Int(4).shifted(3).unwrap(), TimeValue::Int(7));
    }

    #[test]
    fn shifting_past_the_representable_range_is_an_error() {
        let value = TimeValue::Date(on_date(2021, 1, 1));
        assert_eq!(
            value.shifted(i64::MAX).unwrap_err(),
            TimeError::OutOfRange { value, delay: i64::MAX }
        );
        assert!(value.shifted(i64::MIN).is_err());
        assert!(TimeValue::Int(i64::MAX).shifted(1).is_err());
        assert!(TimeValue::Int(i64::MAX).next(Frequency::Monthly).is_err());
    }
}
