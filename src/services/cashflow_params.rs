//! Cashflow parameters attached to schedule nodes and their conversion into
//! `CashFlow` series over a forecast.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::domain::cashflow::{
    Aggregation, CashFlow, CashFlowError, CashValue, ChgPts, Target,
};
use crate::domain::forecast::ForecastRecord;
use crate::domain::frequency::{Frequency, converter_factor};
use crate::domain::prob_var::{ProbVar, ProbVarError};
use crate::domain::time::{TimeError, TimeValue};
use crate::services::wiener::{WienerError, WienerProcess};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CashFlowParamsError {
    #[error("cashflow parameter {name}: periods must be >= -1, got {periods}")]
    InvalidPeriods { name: String, periods: i64 },
    #[error("cashflow parameter {0}: iter must be at least 1")]
    ZeroIterations(String),
    #[error("cashflow parameter {0}: value list is empty")]
    EmptyValues(String),
    #[error(transparent)]
    CashFlow(#[from] CashFlowError),
    #[error(transparent)]
    ProbVar(#[from] ProbVarError),
    #[error(transparent)]
    Wiener(#[from] WienerError),
    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Every shape a cashflow value or working interest may take in a model file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(f64),
    List(Vec<f64>),
    ChgPts(ChgPts),
    ChgPtsList(Vec<ChgPts>),
    Process(WienerProcess),
    Prob(ProbVar),
}

impl ParamValue {
    fn list_len(&self) -> Option<usize> {
        match self {
            ParamValue::List(values) => Some(values.len()),
            ParamValue::ChgPtsList(values) => Some(values.len()),
            _ => None,
        }
    }
}

/// A value realized for one iteration.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedValue {
    Scalar(f64),
    ChgPts(ChgPts),
}

/// Sampling settings shared by every parameter of one cashflow run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolveContext {
    pub count: usize,
    pub seed: Option<u64>,
    pub ppf: Option<f64>,
    pub freq: Frequency,
}

impl ParamValue {
    /// One value per iteration, `ctx.count` in total. Lists cycle, random
    /// variables draw `count` values and processes generate one path per
    /// iteration.
    pub fn resolve_all(&self, ctx: &ResolveContext) -> Result<Vec<ResolvedValue>, CashFlowParamsError> {
        let count = ctx.count.max(1);
        let values = match self {
            ParamValue::Scalar(value) => vec![ResolvedValue::Scalar(*value); count],
            ParamValue::List(values) => (0..count)
                .map(|i| ResolvedValue::Scalar(values[i % values.len()]))
                .collect(),
            ParamValue::ChgPts(chgpts) => vec![ResolvedValue::ChgPts(chgpts.clone()); count],
            ParamValue::ChgPtsList(values) => (0..count)
                .map(|i| ResolvedValue::ChgPts(values[i % values.len()].clone()))
                .collect(),
            ParamValue::Prob(var) => {
                let draws = var.resolve(count, ctx.seed, ctx.ppf)?;
                (0..count)
                    .map(|i| ResolvedValue::Scalar(draws[i % draws.len()]))
                    .collect()
            }
            ParamValue::Process(process) => {
                let paths = process.generate(None, Some(count), Some(ctx.freq), None, ctx.seed)?;
                paths
                    .paths
                    .into_iter()
                    .map(|path| Ok(ResolvedValue::ChgPts(ChgPts::new(paths.index.clone(), path)?)))
                    .collect::<Result<Vec<_>, CashFlowError>>()?
            }
        };
        Ok(values)
    }
}

/// A cash amount attached to a schedule node: a price, a cost or an
/// investment, optionally multiplied by a forecast column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "CashFlowParamsRecord", into = "CashFlowParamsRecord")]
pub struct CashFlowParams {
    pub name: String,
    pub value: ParamValue,
    pub wi: ParamValue,
    pub periods: Option<i64>,
    pub target: Target,
    pub multiply: Option<String>,
    pub agg: Aggregation,
    pub iter: usize,
    pub general: bool,
    pub freq_value: Option<Frequency>,
}

impl CashFlowParams {
    pub fn new(name: &str, value: ParamValue, target: Target) -> Result<Self, CashFlowParamsError> {
        CashFlowParamsRecord {
            name: name.to_string(),
            value,
            wi: default_wi(),
            periods: None,
            target,
            multiply: None,
            agg: Aggregation::Mean,
            iter: 1,
            general: false,
            freq_value: None,
        }
        .try_into()
    }

    pub fn multiplied_by(mut self, column: &str) -> Self {
        self.multiply = Some(column.to_string());
        self
    }

    pub fn with_wi(mut self, wi: ParamValue) -> Self {
        self.iter = self.iter.max(wi.list_len().unwrap_or(1));
        self.wi = wi;
        self
    }

    pub fn with_periods(mut self, periods: i64) -> Result<Self, CashFlowParamsError> {
        check_periods(&self.name, periods)?;
        self.periods = Some(periods);
        Ok(self)
    }

    pub fn with_freq_value(mut self, freq_value: Frequency) -> Self {
        self.freq_value = Some(freq_value);
        self
    }

    pub fn as_general(mut self) -> Self {
        self.general = true;
        self
    }
}

fn check_periods(name: &str, periods: i64) -> Result<(), CashFlowParamsError> {
    if periods < -1 {
        return Err(CashFlowParamsError::InvalidPeriods {
            name: name.to_string(),
            periods,
        });
    }
    Ok(())
}

fn default_wi() -> ParamValue {
    ParamValue::Scalar(1.0)
}

fn default_agg() -> Aggregation {
    Aggregation::Mean
}

fn one() -> usize {
    1
}

#[derive(Serialize, Deserialize)]
struct CashFlowParamsRecord {
    name: String,
    #[serde(alias = "const_value", alias = "array_values")]
    value: ParamValue,
    #[serde(default = "default_wi")]
    wi: ParamValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    periods: Option<i64>,
    target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    multiply: Option<String>,
    #[serde(default = "default_agg")]
    agg: Aggregation,
    #[serde(default = "one")]
    iter: usize,
    #[serde(default)]
    general: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    freq_value: Option<Frequency>,
}

impl TryFrom<CashFlowParamsRecord> for CashFlowParams {
    type Error = CashFlowParamsError;

    fn try_from(record: CashFlowParamsRecord) -> Result<Self, Self::Error> {
        if let Some(periods) = record.periods {
            check_periods(&record.name, periods)?;
        }
        if record.iter == 0 {
            return Err(CashFlowParamsError::ZeroIterations(record.name));
        }
        let lists = [record.value.list_len(), record.wi.list_len()];
        if lists.contains(&Some(0)) {
            return Err(CashFlowParamsError::EmptyValues(record.name));
        }
        let iter = lists.into_iter().flatten().max().unwrap_or(record.iter);

        Ok(Self {
            name: record.name,
            value: record.value,
            wi: record.wi,
            periods: record.periods,
            target: record.target,
            multiply: record.multiply,
            agg: record.agg,
            iter,
            general: record.general,
            freq_value: record.freq_value,
        })
    }
}

impl From<CashFlowParams> for CashFlowParamsRecord {
    fn from(params: CashFlowParams) -> Self {
        CashFlowParamsRecord {
            name: params.name,
            value: params.value,
            wi: params.wi,
            periods: params.periods,
            target: params.target,
            multiply: params.multiply,
            agg: params.agg,
            iter: params.iter,
            general: params.general,
            freq_value: params.freq_value,
        }
    }
}

/// Cash periods covered by a forecast, at the cashflow frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct CashSpan {
    pub start: TimeValue,
    pub end: TimeValue,
    pub freq: Frequency,
    pub times: Vec<TimeValue>,
}

impl CashSpan {
    /// Span of the given rows. Integer times counted in `freq_input` units are
    /// turned into positional cash periods. `end` is exclusive.
    pub fn from_rows<'a, I>(rows: I, freq_input: Frequency, freq: Frequency) -> Result<Option<Self>, TimeError>
    where
        I: IntoIterator<Item = &'a ForecastRecord>,
    {
        let stride = converter_factor(freq_input, freq);
        let mut times: Vec<TimeValue> = rows
            .into_iter()
            .map(|row| match row.time {
                TimeValue::Date(_) => row.time.to_period(freq),
                TimeValue::Int(step) => TimeValue::Int((step as f64 / stride).round() as i64),
            })
            .collect();
        times.sort_unstable();
        times.dedup();

        let (Some(start), Some(last)) = (times.first().copied(), times.last().copied()) else {
            return Ok(None);
        };
        Ok(Some(Self {
            start,
            end: last.next(freq)?,
            freq,
            times,
        }))
    }

    fn bucket(&self, time: TimeValue) -> TimeValue {
        time.to_period(self.freq)
    }

    /// Change points grouped into cash periods with `agg`.
    fn bucket_points(&self, chgpts: &ChgPts, agg: Aggregation) -> BTreeMap<TimeValue, f64> {
        let mut groups: BTreeMap<TimeValue, (f64, usize)> = BTreeMap::new();
        for (time, value) in chgpts.time().iter().zip(chgpts.value()) {
            let entry = groups.entry(self.bucket(*time)).or_insert((0.0, 0));
            entry.0 += value;
            entry.1 += 1;
        }
        groups
            .into_iter()
            .map(|(time, (sum, count))| match agg {
                Aggregation::Sum => (time, sum),
                Aggregation::Mean => (time, sum / count as f64),
            })
            .collect()
    }

    /// Working interest in force at `time`. Change-point interests hold their
    /// last value forward and are 1 before the first point.
    fn wi_at(&self, wi: &ResolvedValue, time: TimeValue) -> f64 {
        match wi {
            ResolvedValue::Scalar(value) => *value,
            ResolvedValue::ChgPts(chgpts) => {
                let bucketed: Vec<TimeValue> = chgpts.time().iter().map(|t| self.bucket(*t)).collect();
                bucketed
                    .iter()
                    .zip(chgpts.value())
                    .filter(|(at, _)| **at <= time)
                    .max_by_key(|(at, _)| **at)
                    .map(|(_, value)| *value)
                    .unwrap_or(1.0)
            }
        }
    }
}

/// Builds the cashflow of one parameter for one iteration. `column` holds the
/// multiplied forecast column aligned with `span.times`. Returns `None` when
/// change points do not overlap the forecast.
pub(crate) fn build_cashflow(
    param: &CashFlowParams,
    name: &str,
    value: &ResolvedValue,
    wi: &ResolvedValue,
    span: &CashSpan,
    column: Option<&[f64]>,
) -> Result<Option<CashFlow>, CashFlowParamsError> {
    let freq_conv = param
        .freq_value
        .map(|freq| converter_factor(freq, span.freq))
        .unwrap_or(1.0);
    let empty = |const_value: CashValue| CashFlow::new(name, const_value, span.start, span.end, span.freq);

    let cashflow = match (value, column) {
        (ResolvedValue::Scalar(value), Some(column)) => {
            let values = span
                .times
                .iter()
                .zip(column)
                .map(|(time, amount)| amount * value * freq_conv * span.wi_at(wi, *time))
                .collect();
            empty(CashValue::PerPeriod(values))?
        }
        (ResolvedValue::Scalar(value), None) => match (wi, param.periods) {
            (ResolvedValue::ChgPts(_), None) => {
                let values = span
                    .times
                    .iter()
                    .map(|time| value * freq_conv * span.wi_at(wi, *time))
                    .collect();
                empty(CashValue::PerPeriod(values))?
            }
            (_, periods) => {
                let amount = value * freq_conv * span.wi_at(wi, span.start);
                let cashflow = empty(CashValue::Constant(amount))?;
                match periods {
                    Some(periods) => cashflow.with_periods(periods)?,
                    None => cashflow,
                }
            }
        },
        (ResolvedValue::ChgPts(chgpts), column) => {
            let buckets = span.bucket_points(chgpts, param.agg);
            let mut times = Vec::new();
            let mut values = Vec::new();
            match column {
                Some(column) => {
                    for (time, amount) in span.times.iter().zip(column) {
                        if let Some(value) = buckets.get(time) {
                            times.push(*time);
                            values.push(amount * value * span.wi_at(wi, *time));
                        }
                    }
                }
                None => {
                    for (time, value) in &buckets {
                        times.push(*time);
                        values.push(value * freq_conv * span.wi_at(wi, *time));
                    }
                }
            }
            if times.is_empty() {
                warn!(param = %param.name, "change points do not overlap the forecast");
                return Ok(None);
            }
            empty(CashValue::Constant(0.0))?.with_chgpts(ChgPts::new(times, values)?)?
        }
    };
    Ok(Some(cashflow))
}

/// Multiplied forecast column aligned with the span, or `None` when the
/// forecast does not carry it.
pub(crate) fn multiply_column(rows: &[&ForecastRecord], column: &str) -> Option<Vec<f64>> {
    if !rows.iter().any(|row| row.value(column).is_some()) {
        return None;
    }
    Some(rows.iter().map(|row| row.value(column).unwrap_or(0.0)).collect())
}
