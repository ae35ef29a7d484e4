use chrono::NaiveDate;

use crate::domain::frequency::Frequency;
use crate::domain::prob_var::ProbVar;
use crate::domain::time::{TimeAnchor, TimeValue};
use crate::services::arps::Arps;
use crate::services::decline::Decline;
use crate::services::period::Period;
use crate::services::wor::Wor;

pub fn on_date(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap()
}

pub fn date(year: i32, month: u32, day: u32) -> TimeValue {
    TimeValue::Date(on_date(year, month, day))
}

/// Exponential decline from 700 bbl/d at 30% a year, with a constant fluid
/// rate, forecast monthly over 2021.
pub fn arps_decline() -> Decline {
    let arps = Arps::new(
        ProbVar::fixed(700.0),
        ProbVar::fixed(0.3),
        ProbVar::fixed(0.0),
        TimeAnchor::single(date(2021, 1, 1)),
    )
    .with_freq_di(Frequency::Annual)
    .with_ratios(Some(ProbVar::fixed(250.0)), None, None, None, None)
    .unwrap();
    Decline::Arps(arps)
}

pub fn arps_period(name: &str) -> Period {
    Period::new(name, arps_decline())
        .between(date(2021, 1, 1), date(2022, 1, 1))
        .with_freqs(Frequency::Daily, Frequency::Monthly)
        .with_rate_limit(70.0)
}

/// Two water-cut scenarios of one WOR model over the first five months of
/// 2021.
pub fn wor_period(name: &str) -> Period {
    let wor = Wor::new(
        ProbVar::array(vec![0.3, 0.5]).unwrap(),
        ProbVar::fixed(3e-4),
        ProbVar::fixed(1000.0),
        TimeAnchor::single(date(2021, 1, 1)),
    );
    Period::new(name, Decline::Wor(wor))
        .between(date(2021, 1, 1), date(2021, 6, 1))
        .with_freqs(Frequency::Daily, Frequency::Monthly)
}
