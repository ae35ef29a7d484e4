use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::frequency::{
    Frequency, FrequencyError, advance, converter_factor, period_range, period_sequence,
};
use crate::domain::time::{TimeError, TimeMode, TimeValue, common_mode};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CashFlowError {
    #[error("start and end must both be integers or both be dates")]
    StartEndMismatch,
    #[error("change point times must use the same representation as the cashflow start")]
    ChgPtsMode,
    #[error("change points have {times} times and {values} values")]
    ChgPtsLength { times: usize, values: usize },
    #[error("cashflow has {values} values but {periods} periods")]
    PeriodsMismatch { periods: usize, values: usize },
    #[error("periods must be greater than or equal to -1, got {0}")]
    InvalidPeriods(i64),
    #[error("cannot resample a {from} cashflow to the finer frequency {to}")]
    Upsample { from: Frequency, to: Frequency },
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Frequency(#[from] FrequencyError),
}

/// Explicit time/value overrides layered onto a constant cashflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ChgPtsRecord", into = "ChgPtsRecord")]
pub struct ChgPts {
    time: Vec<TimeValue>,
    value: Vec<f64>,
}

impl ChgPts {
    pub fn new(time: Vec<TimeValue>, value: Vec<f64>) -> Result<Self, CashFlowError> {
        if time.len() != value.len() {
            return Err(CashFlowError::ChgPtsLength {
                times: time.len(),
                values: value.len(),
            });
        }
        common_mode(time.iter())?;
        Ok(Self { time, value })
    }

    pub fn time(&self) -> &[TimeValue] {
        &self.time
    }

    pub fn value(&self) -> &[f64] {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.time.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }

    pub fn mode(&self) -> Option<TimeMode> {
        self.time.first().map(TimeValue::mode)
    }
}

#[derive(Serialize, Deserialize)]
struct ChgPtsRecord {
    date: Vec<TimeValue>,
    value: Vec<f64>,
}

impl TryFrom<ChgPtsRecord> for ChgPts {
    type Error = CashFlowError;

    fn try_from(record: ChgPtsRecord) -> Result<Self, Self::Error> {
        ChgPts::new(record.date, record.value)
    }
}

impl From<ChgPts> for ChgPtsRecord {
    fn from(chgpts: ChgPts) -> Self {
        ChgPtsRecord {
            date: chgpts.time,
            value: chgpts.value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Income,
    Opex,
    Capex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Sum,
    Mean,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CashValue {
    Constant(f64),
    PerPeriod(Vec<f64>),
}

/// Time-indexed cash amounts.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CashSeries {
    pub index: Vec<TimeValue>,
    pub values: Vec<f64>,
}

impl CashSeries {
    pub fn iter(&self) -> impl Iterator<Item = (TimeValue, f64)> + '_ {
        self.index.iter().copied().zip(self.values.iter().copied())
    }

    pub fn total(&self) -> f64 {
        self.values.iter().sum()
    }
}

/// A named cash series over `[start, end)` at `freq_input`.
///
/// With `periods > 0` the series covers that many periods from `start`.
/// `periods == -1` places the value in the final period before `end`, which
/// is how abandonment costs are booked; lower values are rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CashFlow {
    pub name: String,
    pub const_value: CashValue,
    pub start: TimeValue,
    pub end: TimeValue,
    pub periods: Option<i64>,
    pub freq_input: Frequency,
    pub freq_output: Option<Frequency>,
    pub chgpts: Option<ChgPts>,
}

impl CashFlow {
    pub fn new(
        name: &str,
        const_value: CashValue,
        start: TimeValue,
        end: TimeValue,
        freq_input: Frequency,
    ) -> Result<Self, CashFlowError> {
        if start.mode() != end.mode() {
            return Err(CashFlowError::StartEndMismatch);
        }
        Ok(Self {
            name: name.to_string(),
            const_value,
            start,
            end,
            periods: None,
            freq_input,
            freq_output: None,
            chgpts: None,
        })
    }

    pub fn with_periods(mut self, periods: i64) -> Result<Self, CashFlowError> {
        if periods < -1 {
            return Err(CashFlowError::InvalidPeriods(periods));
        }
        self.periods = (periods != 0).then_some(periods);
        Ok(self)
    }

    pub fn with_freq_output(mut self, freq_output: Frequency) -> Self {
        self.freq_output = Some(freq_output);
        self
    }

    pub fn with_chgpts(mut self, chgpts: ChgPts) -> Result<Self, CashFlowError> {
        if chgpts.mode().is_some_and(|mode| mode != self.start.mode()) {
            return Err(CashFlowError::ChgPtsMode);
        }
        self.chgpts = Some(chgpts);
        Ok(self)
    }

    fn index(&self) -> Result<Vec<TimeValue>, CashFlowError> {
        let count = match (&self.const_value, self.periods) {
            (CashValue::PerPeriod(values), Some(periods)) if periods > 0 => {
                if values.len() != periods as usize {
                    return Err(CashFlowError::PeriodsMismatch {
                        periods: periods as usize,
                        values: values.len(),
                    });
                }
                Some(values.len())
            }
            (CashValue::PerPeriod(values), _) => Some(values.len()),
            (CashValue::Constant(_), Some(periods)) => Some(periods.unsigned_abs() as usize),
            (CashValue::Constant(_), None) => None,
        };
        let at_end = self.periods.is_some_and(|periods| periods < 0);

        let index = match (self.start, self.end) {
            (TimeValue::Date(start), TimeValue::Date(end)) => {
                let dates = match count {
                    Some(count) if at_end => {
                        let full = period_range(start, end, self.freq_input)?;
                        if full.len() >= count {
                            full[full.len() - count..].to_vec()
                        } else {
                            let first = advance(end, self.freq_input, -(count as i64))?;
                            period_sequence(first, count, self.freq_input)?
                        }
                    }
                    Some(count) => period_sequence(start, count, self.freq_input)?,
                    None => period_range(start, end, self.freq_input)?,
                };
                dates.into_iter().map(TimeValue::Date).collect()
            }
            (TimeValue::Int(start), TimeValue::Int(end)) => {
                let range = match count {
                    Some(count) if at_end => (end - count as i64)..end,
                    Some(count) => start..(start + count as i64),
                    None => start..end,
                };
                range.map(TimeValue::Int).collect()
            }
            _ => return Err(CashFlowError::StartEndMismatch),
        };
        Ok(index)
    }

    /// Builds the series at `freq_input`, applies change points and
    /// re-aggregates to the coarser `freq_output` with `agg`.
    pub fn get_cashflow(
        &self,
        freq_output: Option<Frequency>,
        agg: Aggregation,
    ) -> Result<CashSeries, CashFlowError> {
        let freq_output = freq_output.or(self.freq_output).unwrap_or(self.freq_input);
        let index = self.index()?;
        let mut values = match &self.const_value {
            CashValue::Constant(value) => vec![*value; index.len()],
            CashValue::PerPeriod(values) => values.clone(),
        };

        if let Some(chgpts) = &self.chgpts {
            for (time, value) in chgpts.time().iter().zip(chgpts.value()) {
                let bucket = time.to_period(self.freq_input);
                if let Some(position) = index.iter().position(|at| *at == bucket) {
                    values[position] = *value;
                }
            }
        }

        resample(
            CashSeries { index, values },
            self.freq_input,
            freq_output,
            agg,
        )
    }
}

/// Groups a series into `to` periods. Dates group by calendar period, integer
/// steps by `floor(t / converter_factor(from, to))`.
pub fn resample(
    series: CashSeries,
    from: Frequency,
    to: Frequency,
    agg: Aggregation,
) -> Result<CashSeries, CashFlowError> {
    if from == to {
        return Ok(series);
    }
    if !to.is_coarser_than(from) {
        return Err(CashFlowError::Upsample { from, to });
    }
    let factor = converter_factor(from, to);
    let mut groups: BTreeMap<TimeValue, (f64, usize)> = BTreeMap::new();
    for (time, value) in series.iter() {
        let bucket = match time {
            TimeValue::Date(_) => time.to_period(to),
            TimeValue::Int(step) => TimeValue::Int((step as f64 / factor).floor() as i64),
        };
        let entry = groups.entry(bucket).or_insert((0.0, 0));
        entry.0 += value;
        entry.1 += 1;
    }

    let (index, values) = groups
        .into_iter()
        .map(|(time, (sum, count))| match agg {
            Aggregation::Sum => (time, sum),
            Aggregation::Mean => (time, sum / count as f64),
        })
        .unzip();
    Ok(CashSeries { index, values })
}

/// One row of a free cash flow table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FcfRow {
    pub time: TimeValue,
    pub total_income: f64,
    pub total_opex: f64,
    pub total_capex: f64,
    pub fcf: f64,
    pub cum_fcf: f64,
}

/// Cash flows of one iteration grouped by target.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct CashFlowModel {
    pub name: String,
    pub income: Vec<CashFlow>,
    pub opex: Vec<CashFlow>,
    pub capex: Vec<CashFlow>,
}

impl CashFlowModel {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn push(&mut self, target: Target, cashflow: CashFlow) {
        match target {
            Target::Income => self.income.push(cashflow),
            Target::Opex => self.opex.push(cashflow),
            Target::Capex => self.capex.push(cashflow),
        }
    }

    pub fn target(&self, target: Target) -> &[CashFlow] {
        match target {
            Target::Income => &self.income,
            Target::Opex => &self.opex,
            Target::Capex => &self.capex,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.income.is_empty() && self.opex.is_empty() && self.capex.is_empty()
    }

    /// Concatenates every target list of `other` onto this model.
    pub fn append(&mut self, other: &CashFlowModel) {
        self.income.extend(other.income.iter().cloned());
        self.opex.extend(other.opex.iter().cloned());
        self.capex.extend(other.capex.iter().cloned());
    }

    /// Free cash flow over the union of every cashflow's periods, with
    /// missing periods counted as zero.
    pub fn fcf(&self, freq_output: Option<Frequency>) -> Result<Vec<FcfRow>, CashFlowError> {
        let mut totals: BTreeMap<TimeValue, [f64; 3]> = BTreeMap::new();
        for (slot, target) in [Target::Income, Target::Opex, Target::Capex].into_iter().enumerate() {
            for cashflow in self.target(target) {
                let series = cashflow.get_cashflow(freq_output, Aggregation::Sum)?;
                for (time, value) in series.iter() {
                    totals.entry(time).or_insert([0.0; 3])[slot] += value;
                }
            }
        }
        common_mode(totals.keys())?;

        let mut cum_fcf = 0.0;
        Ok(totals
            .into_iter()
            .map(|(time, [income, opex, capex])| {
                let fcf = income + opex + capex;
                cum_fcf += fcf;
                FcfRow {
                    time,
                    total_income: income,
                    total_opex: opex,
                    total_capex: capex,
                    fcf,
                    cum_fcf,
                }
            })
            .collect())
    }

    fn fcf_values(&self, freq_output: Option<Frequency>) -> Result<Vec<f64>, CashFlowError> {
        Ok(self.fcf(freq_output)?.into_iter().map(|row| row.fcf).collect())
    }

    /// Net present value of the free cash flow for each rate, already
    /// expressed per cashflow period.
    pub fn npv(&self, rates: &[f64], freq_output: Option<Frequency>) -> Result<Vec<f64>, CashFlowError> {
        let values = self.fcf_values(freq_output)?;
        Ok(rates.iter().map(|rate| npv(*rate, &values)).collect())
    }

    pub fn irr(&self, freq_output: Option<Frequency>) -> Result<Option<f64>, CashFlowError> {
        Ok(irr(&self.fcf_values(freq_output)?))
    }
}

/// Discounted sum with the first value at t = 0.
pub fn npv(rate: f64, values: &[f64]) -> f64 {
    values
        .iter()
        .enumerate()
        .map(|(t, value)| value / (1.0 + rate).powi(t as i32))
        .sum()
}

fn npv_derivative(rate: f64, values: &[f64]) -> f64 {
    values
        .iter()
        .enumerate()
        .skip(1)
        .map(|(t, value)| -(t as f64) * value / (1.0 + rate).powi(t as i32 + 1))
        .sum()
}

const IRR_TOLERANCE: f64 = 1e-10;

/// Rate that zeroes the NPV. Newton iterations from 10%, falling back to
/// bisection over the first sign change; `None` when no root exists.
pub fn irr(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }

    let mut rate = 0.1;
    for _ in 0..100 {
        let value = npv(rate, values);
        let slope = npv_derivative(rate, values);
        if !slope.is_normal() {
            break;
        }
        let next = rate - value / slope;
        if !next.is_finite() || next <= -1.0 {
            break;
        }
        if (next - rate).abs() < IRR_TOLERANCE {
            return Some(next);
        }
        rate = next;
    }

    bisect_irr(values)
}

fn bisect_irr(values: &[f64]) -> Option<f64> {
    let grid: Vec<f64> = (0..=400).map(|i| -0.99 + i as f64 * 0.0275).collect();
    let (mut low, mut high) = grid
        .windows(2)
        .find(|pair| npv(pair[0], values).signum() != npv(pair[1], values).signum())
        .map(|pair| (pair[0], pair[1]))?;

    let mut f_low = npv(low, values);
    for _ in 0..200 {
        let mid = (low + high) / 2.0;
        let f_mid = npv(mid, values);
        if f_mid == 0.0 || (high - low) / 2.0 < IRR_TOLERANCE {
            return Some(mid);
        }
        if f_mid.signum() == f_low.signum() {
            low = mid;
            f_low = f_mid;
        } else {
            high = mid;
        }
    }
    Some((low + high) / 2.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::on_date;
    use approx::assert_relative_eq;

    fn monthly(name: &str, value: CashValue, start: (i32, u32), end: (i32, u32)) -> CashFlow {
        CashFlow::new(
            name,
            value,
            TimeValue::Date(on_date(start.0, start.1, 1)),
            TimeValue::Date(on_date(end.0, end.1, 1)),
            Frequency::Monthly,
        )
        .unwrap()
    }

    #[test]
    fn npv_discounts_from_time_zero() {
        let values = [-40000.0, 5000.0, 8000.0, 12000.0, 30000.0];
        assert_relative_eq!(npv(0.08, &values), 3065.22267, epsilon = 1e-4);
    }

    #[test]
    fn npv_at_zero_rate_is_the_plain_sum() {
        let values = [-100.0, 30.0, 45.5, 60.0];
        assert_relative_eq!(npv(0.0, &values), 35.5, epsilon = 1e-12);
    }

    #[test]
    fn irr_zeroes_the_npv() {
        let values = [-100.0, 39.0, 59.0, 55.0, 20.0];
        let rate = irr(&values).unwrap();
        assert_relative_eq!(rate, 0.28095, epsilon = 1e-5);
        assert_relative_eq!(npv(rate, &values), 0.0, epsilon = 1e-8);
    }

    #[test]
    fn irr_is_none_without_a_sign_change() {
        assert_eq!(irr(&[10.0, 20.0, 30.0]), None);
        assert_eq!(irr(&[-10.0]), None);
    }

    #[test]
    fn start_and_end_must_share_a_representation() {
        let error = CashFlow::new(
            "capex",
            CashValue::Constant(1.0),
            TimeValue::Int(0),
            TimeValue::Date(on_date(2021, 1, 1)),
            Frequency::Monthly,
        )
        .unwrap_err();
        assert_eq!(error, CashFlowError::StartEndMismatch);
    }

    #[test]
    fn chgpts_must_have_matching_lengths() {
        let error = ChgPts::new(vec![TimeValue::Int(0), TimeValue::Int(1)], vec![1.0]).unwrap_err();
        assert_eq!(error, CashFlowError::ChgPtsLength { times: 2, values: 1 });
    }

    #[test]
    fn constant_cashflow_covers_a_half_open_range() {
        let series = monthly("opex", CashValue::Constant(-5.0), (2021, 1), (2021, 7))
            .get_cashflow(None, Aggregation::Sum)
            .unwrap();
        assert_eq!(series.values, vec![-5.0; 6]);
        assert_eq!(series.index[5], TimeValue::Date(on_date(2021, 6, 1)));
    }

    #[test]
    fn negative_periods_place_the_value_at_the_end() {
        let cashflow = monthly("abandonment", CashValue::Constant(-900.0), (2021, 1), (2022, 1))
            .with_periods(-1)
            .unwrap();
        let series = cashflow.get_cashflow(None, Aggregation::Sum).unwrap();
        assert_eq!(series.index, vec![TimeValue::Date(on_date(2021, 12, 1))]);
        assert_eq!(series.values, vec![-900.0]);
    }

    #[test]
    fn periods_below_minus_one_are_rejected() {
        let result = monthly("abandonment", CashValue::Constant(-900.0), (2021, 1), (2022, 1)).with_periods(-2);
        assert_eq!(result.unwrap_err(), CashFlowError::InvalidPeriods(-2));
    }

    #[test]
    fn positive_periods_count_from_the_start() {
        let cashflow = CashFlow::new("drill", CashValue::Constant(-50.0), TimeValue::Int(3), TimeValue::Int(20), Frequency::Monthly)
            .unwrap()
            .with_periods(1)
            .unwrap();
        let series = cashflow.get_cashflow(None, Aggregation::Sum).unwrap();
        assert_eq!(series.index, vec![TimeValue::Int(3)]);
    }

    #[test]
    fn change_points_override_matching_periods() {
        let chgpts = ChgPts::new(
            vec![TimeValue::Date(on_date(2021, 3, 15)), TimeValue::Date(on_date(2030, 1, 1))],
            vec![99.0, 1.0],
        )
        .unwrap();
        let series = monthly("price", CashValue::Constant(40.0), (2021, 1), (2021, 5))
            .with_chgpts(chgpts)
            .unwrap()
            .get_cashflow(None, Aggregation::Sum)
            .unwrap();
        assert_eq!(series.values, vec![40.0, 40.0, 99.0, 40.0]);
    }

    #[test]
    fn chgpts_must_match_the_start_representation() {
        let chgpts = ChgPts::new(vec![TimeValue::Int(2)], vec![1.0]).unwrap();
        let error = monthly("price", CashValue::Constant(40.0), (2021, 1), (2021, 5))
            .with_chgpts(chgpts)
            .unwrap_err();
        assert_eq!(error, CashFlowError::ChgPtsMode);
    }

    #[test]
    fn resampling_to_a_coarser_frequency_aggregates() {
        let values: Vec<f64> = (1..=24).map(f64::from).collect();
        let cashflow = monthly("sales", CashValue::PerPeriod(values), (2021, 1), (2023, 1));
        let summed = cashflow.get_cashflow(Some(Frequency::Annual), Aggregation::Sum).unwrap();
        assert_eq!(summed.values, vec![78.0, 222.0]);
        let averaged = cashflow.get_cashflow(Some(Frequency::Annual), Aggregation::Mean).unwrap();
        assert_eq!(averaged.values, vec![6.5, 18.5]);
    }

    #[test]
    fn daily_to_annual_equals_daily_to_monthly_to_annual() {
        let daily = CashFlow::new(
            "sales",
            CashValue::Constant(2.0),
            TimeValue::Date(on_date(2021, 1, 1)),
            TimeValue::Date(on_date(2023, 1, 1)),
            Frequency::Daily,
        )
        .unwrap();
        let direct = daily.get_cashflow(Some(Frequency::Annual), Aggregation::Sum).unwrap();
        let monthly = daily.get_cashflow(Some(Frequency::Monthly), Aggregation::Sum).unwrap();
        let staged = resample(monthly, Frequency::Monthly, Frequency::Annual, Aggregation::Sum).unwrap();
        assert_eq!(direct, staged);
        assert_eq!(direct.values, vec![730.0, 730.0]);
    }

    #[test]
    fn integer_steps_group_by_conversion_factor() {
        let cashflow = CashFlow::new("sales", CashValue::Constant(1.0), TimeValue::Int(0), TimeValue::Int(24), Frequency::Monthly)
            .unwrap();
        let annual = cashflow.get_cashflow(Some(Frequency::Annual), Aggregation::Sum).unwrap();
        assert_eq!(annual.index, vec![TimeValue::Int(0), TimeValue::Int(1)]);
        assert_eq!(annual.values, vec![12.0, 12.0]);
    }

    #[test]
    fn upsampling_is_rejected() {
        let error = monthly("sales", CashValue::Constant(1.0), (2021, 1), (2021, 3))
            .get_cashflow(Some(Frequency::Daily), Aggregation::Sum)
            .unwrap_err();
        assert_eq!(
            error,
            CashFlowError::Upsample {
                from: Frequency::Monthly,
                to: Frequency::Daily
            }
        );
    }

    #[test]
    fn fcf_sums_targets_over_the_union_of_periods() {
        let mut model = CashFlowModel::new("well");
        model.push(Target::Income, monthly("oil", CashValue::Constant(100.0), (2021, 1), (2021, 4)));
        model.push(Target::Opex, monthly("lifting", CashValue::Constant(-30.0), (2021, 2), (2021, 5)));
        model.push(Target::Capex, monthly("drill", CashValue::Constant(-150.0), (2021, 1), (2021, 2)));

        let rows = model.fcf(None).unwrap();
        let fcf: Vec<f64> = rows.iter().map(|row| row.fcf).collect();
        assert_eq!(fcf, vec![-50.0, 70.0, 70.0, -30.0]);
        assert_eq!(rows[3].cum_fcf, 60.0);
        assert_eq!(model.npv(&[0.0], None).unwrap(), vec![60.0]);
    }

    #[test]
    fn append_concatenates_and_is_associative() {
        let flow = |name: &str| monthly(name, CashValue::Constant(1.0), (2021, 1), (2021, 2));
        let mut a = CashFlowModel::new("a");
        a.push(Target::Income, flow("a"));
        let mut b = CashFlowModel::new("b");
        b.push(Target::Opex, flow("b"));
        let mut c = CashFlowModel::new("c");
        c.push(Target::Income, flow("c"));
        c.push(Target::Capex, flow("c2"));

        let mut left = a.clone();
        left.append(&b);
        left.append(&c);

        let mut bc = b.clone();
        bc.append(&c);
        let mut right = a.clone();
        right.append(&bc);

        assert_eq!(left, right);
        assert_eq!(left.income.len(), 2);
        assert_eq!(left.opex.len(), 1);
        assert_eq!(left.capex.len(), 1);
    }

    #[test]
    fn chgpts_deserialize_from_date_value_pairs() {
        let chgpts: ChgPts =
            serde_yaml::from_str("date: [2021-01-01, 2021-02-01]\nvalue: [38, 42]\n").unwrap();
        assert_eq!(chgpts.len(), 2);
        assert!(serde_yaml::from_str::<ChgPts>("date: [2021-01-01]\nvalue: [38, 42]\n").is_err());
    }
}
