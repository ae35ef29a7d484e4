//! Shared contract and plumbing of the decline models.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::forecast::{Forecast, ForecastError, ForecastRecord};
use crate::domain::frequency::{Frequency, converter_factor, period_range};
use crate::domain::prob_var::ProbVar;
use crate::domain::time::{TimeAnchor, TimeMode, TimeValue};
use crate::services::arps::Arps;
use crate::services::filters::OutlierFilter;
use crate::services::fit::FitError;
use crate::services::grid::{gradient, weighted_cumsum};
use crate::services::wor::Wor;

/// Time axis, limits and sampling options of one forecast run.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastRequest {
    pub time_list: Option<Vec<TimeValue>>,
    pub start: Option<TimeValue>,
    pub end: Option<TimeValue>,
    pub freq_input: Frequency,
    pub freq_output: Frequency,
    pub rate_limit: Option<f64>,
    pub cum_limit: Option<f64>,
    pub iter: usize,
    pub ppf: Option<f64>,
    pub seed: Option<u64>,
}

impl Default for ForecastRequest {
    fn default() -> Self {
        Self {
            time_list: None,
            start: None,
            end: None,
            freq_input: Frequency::Daily,
            freq_output: Frequency::Daily,
            rate_limit: None,
            cum_limit: None,
            iter: 1,
            ppf: None,
            seed: None,
        }
    }
}

impl ForecastRequest {
    pub fn between(start: TimeValue, end: TimeValue, freq_output: Frequency) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            freq_output,
            ..Self::default()
        }
    }
}

/// One observed production point used by `fit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: TimeValue,
    pub oil_rate: f64,
    #[serde(default)]
    pub oil_cum: Option<f64>,
    #[serde(default)]
    pub bsw: Option<f64>,
}

#[derive(Default)]
pub struct FitOptions<'a> {
    /// Holds the Arps exponent fixed instead of fitting it.
    pub b: Option<f64>,
    pub filter: Option<&'a dyn OutlierFilter>,
    /// Smoothing factor of the exponential moving average applied first.
    pub smoothing_beta: Option<f64>,
    /// Store the fitted parameters as normal distributions built from their
    /// standard errors.
    pub probabilistic: bool,
}

/// Input series after smoothing with the outlier flag of every point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FitRow {
    pub time: TimeValue,
    pub observed: f64,
    pub filtered: f64,
    pub outlier: bool,
}

/// Behaviour shared by every decline model.
pub trait DeclineCurve: fmt::Display {
    fn forecast(&self, request: &ForecastRequest) -> Result<Forecast, ForecastError>;

    /// Replaces the model parameters with a least-squares fit of the
    /// observations.
    fn fit(&mut self, observations: &[Observation], options: &FitOptions<'_>) -> Result<Vec<FitRow>, FitError>;

    fn anchor(&self) -> &TimeAnchor;

    fn set_anchor(&mut self, anchor: TimeAnchor);

    fn time_mode(&self) -> TimeMode {
        self.anchor().mode()
    }
}

/// Decline model held by a period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Decline {
    Arps(Arps),
    Wor(Wor),
}

impl Decline {
    fn curve(&self) -> &dyn DeclineCurve {
        match self {
            Decline::Arps(arps) => arps,
            Decline::Wor(wor) => wor,
        }
    }

    fn curve_mut(&mut self) -> &mut dyn DeclineCurve {
        match self {
            Decline::Arps(arps) => arps,
            Decline::Wor(wor) => wor,
        }
    }
}

impl fmt::Display for Decline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.curve(), f)
    }
}

impl DeclineCurve for Decline {
    fn forecast(&self, request: &ForecastRequest) -> Result<Forecast, ForecastError> {
        self.curve().forecast(request)
    }

    fn fit(&mut self, observations: &[Observation], options: &FitOptions<'_>) -> Result<Vec<FitRow>, FitError> {
        self.curve_mut().fit(observations, options)
    }

    fn anchor(&self) -> &TimeAnchor {
        self.curve().anchor()
    }

    fn set_anchor(&mut self, anchor: TimeAnchor) {
        self.curve_mut().set_anchor(anchor);
    }
}

/// Shared time axis of a forecast, with numeric offsets from the earliest
/// anchor. Offsets are days in date mode and `freq_input` units otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAxis {
    pub values: Vec<TimeValue>,
    pub t: Vec<f64>,
    pub unit: Frequency,
    origin: TimeValue,
}

impl TimeAxis {
    /// Builds the axis from the explicit time list or from `[start, end)`
    /// stepped by `step`.
    pub fn build(anchor: &TimeAnchor, request: &ForecastRequest, step: Frequency) -> Result<Self, ForecastError> {
        let origin = anchor.min();
        let values = match &request.time_list {
            Some(list) => list.clone(),
            None => {
                let start = request.start.unwrap_or(origin);
                let end = request.end.ok_or(ForecastError::MissingEnd)?;
                axis_values(start, end, step, request.freq_input)?
            }
        };
        if values.is_empty() {
            return Err(ForecastError::EmptyTimeAxis);
        }
        if let Some(value) = values.iter().find(|v| v.mode() != anchor.mode()) {
            return Err(ForecastError::ModeMismatch {
                anchor: anchor.mode(),
                axis: value.mode(),
            });
        }

        let unit = match anchor.mode() {
            TimeMode::Date => Frequency::Daily,
            TimeMode::Number => request.freq_input,
        };
        let t = values.iter().map(|v| offset(*v, origin)).collect();
        Ok(Self {
            values,
            t,
            unit,
            origin,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Offset of every anchor value from the axis origin.
    pub fn anchor_offsets(&self, anchor: &TimeAnchor) -> Vec<f64> {
        anchor.values().iter().map(|v| offset(*v, self.origin)).collect()
    }

    /// Factor converting a rate quoted per `freq` period into axis units.
    pub fn rate_factor(&self, freq: Frequency) -> f64 {
        converter_factor(freq, self.unit)
    }
}

fn offset(value: TimeValue, origin: TimeValue) -> f64 {
    match (value, origin) {
        (TimeValue::Date(date), TimeValue::Date(origin)) => (date - origin).num_days() as f64,
        (TimeValue::Int(value), TimeValue::Int(origin)) => (value - origin) as f64,
        _ => f64::NAN,
    }
}

fn axis_values(
    start: TimeValue,
    end: TimeValue,
    step: Frequency,
    freq_input: Frequency,
) -> Result<Vec<TimeValue>, ForecastError> {
    match (start, end) {
        (TimeValue::Date(start), TimeValue::Date(end)) => Ok(period_range(start, end, step)?
            .into_iter()
            .map(TimeValue::Date)
            .collect()),
        (TimeValue::Int(start), TimeValue::Int(end)) => {
            let stride = converter_factor(freq_input, step).round().max(1.0) as usize;
            Ok((start..end).step_by(stride).map(TimeValue::Int).collect())
        }
        (start, end) => Err(ForecastError::ModeMismatch {
            anchor: start.mode(),
            axis: end.mode(),
        }),
    }
}

/// Independent variable of the water stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaterDriver {
    FluidRate(f64),
    Bsw(f64),
    Wor(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GasDriver {
    Gor(f64),
    Glr(f64),
}

/// Gas ratio parameter of a decline model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum GasParam {
    Gor(ProbVar),
    Glr(ProbVar),
}

impl GasParam {
    pub(crate) fn var(&self) -> &ProbVar {
        match self {
            GasParam::Gor(var) | GasParam::Glr(var) => var,
        }
    }

    pub(crate) fn driver(&self, value: f64) -> GasDriver {
        match self {
            GasParam::Gor(_) => GasDriver::Gor(value),
            GasParam::Glr(_) => GasDriver::Glr(value),
        }
    }
}

impl GasParam {
    pub(crate) fn from_ratios(gor: Option<ProbVar>, glr: Option<ProbVar>) -> Result<Option<Self>, ForecastError> {
        match (gor, glr) {
            (None, None) => Ok(None),
            (Some(var), None) => Ok(Some(GasParam::Gor(var))),
            (None, Some(var)) => Ok(Some(GasParam::Glr(var))),
            _ => Err(ForecastError::GasDrivers),
        }
    }

    pub(crate) fn into_ratios(param: Option<Self>) -> (Option<ProbVar>, Option<ProbVar>) {
        match param {
            Some(GasParam::Gor(var)) => (Some(var), None),
            Some(GasParam::Glr(var)) => (None, Some(var)),
            None => (None, None),
        }
    }
}

/// Seed of the `index`-th sampled parameter of a model.
pub(crate) fn parameter_seed(seed: Option<u64>, index: u64) -> Option<u64> {
    seed.map(|seed| seed.wrapping_add(index))
}

/// Resolves an optional auxiliary parameter, returning an empty list when it
/// is not set so it does not take part in broadcasting.
pub(crate) fn resolve_optional(
    var: Option<&ProbVar>,
    request: &ForecastRequest,
    seed: Option<u64>,
) -> Result<Vec<f64>, ForecastError> {
    match var {
        Some(var) => Ok(var.resolve(request.iter, seed, request.ppf)?),
        None => Ok(Vec::new()),
    }
}

/// Water, fluid, bsw and wor columns of one iteration, integrated over `dt`.
pub(crate) fn derive_water(rows: &mut [ForecastRecord], dt: &[f64], driver: WaterDriver) {
    for row in rows.iter_mut() {
        let oil = row.oil_rate;
        let (water, fluid, bsw, wor) = match driver {
            WaterDriver::FluidRate(fluid) => {
                let water = fluid - oil;
                (water, fluid, water / fluid, water / oil)
            }
            WaterDriver::Bsw(bsw) => {
                let water = bsw * oil / (1.0 - bsw);
                (water, oil + water, bsw, bsw_to_wor(bsw))
            }
            WaterDriver::Wor(wor) => {
                let water = wor * oil;
                (water, oil + water, wor_to_bsw(wor), wor)
            }
        };
        row.water_rate = Some(water);
        row.fluid_rate = Some(fluid);
        row.bsw = Some(bsw);
        row.wor = Some(wor);
    }
    integrate_water(rows, dt);
}

/// Fills water and fluid cumulatives and volumes from their rates.
pub(crate) fn integrate_water(rows: &mut [ForecastRecord], dt: &[f64]) {
    let water: Vec<f64> = rows.iter().map(|r| r.water_rate.unwrap_or(0.0)).collect();
    let fluid: Vec<f64> = rows.iter().map(|r| r.fluid_rate.unwrap_or(0.0)).collect();
    let water_cum = weighted_cumsum(&water, dt);
    let fluid_cum = weighted_cumsum(&fluid, dt);
    let water_volume = gradient(&water_cum);
    let fluid_volume = gradient(&fluid_cum);
    for (i, row) in rows.iter_mut().enumerate() {
        row.water_cum = Some(water_cum[i]);
        row.water_volume = Some(water_volume[i]);
        row.fluid_cum = Some(fluid_cum[i]);
        row.fluid_volume = Some(fluid_volume[i]);
    }
}

/// Gas columns of one iteration. A `glr` driver needs the fluid column.
pub(crate) fn derive_gas(rows: &mut [ForecastRecord], dt: &[f64], driver: GasDriver) {
    for row in rows.iter_mut() {
        match driver {
            GasDriver::Gor(gor) => {
                let gas = row.oil_rate * gor;
                row.gas_rate = Some(gas);
                row.gor = Some(gor);
                row.glr = row.fluid_rate.map(|fluid| gas / fluid);
            }
            GasDriver::Glr(glr) => {
                let fluid = row.fluid_rate.unwrap_or(row.oil_rate);
                let gas = fluid * glr;
                row.gas_rate = Some(gas);
                row.glr = Some(glr);
                row.gor = Some(gas / row.oil_rate);
            }
        }
    }
    let gas: Vec<f64> = rows.iter().map(|r| r.gas_rate.unwrap_or(0.0)).collect();
    let gas_cum = weighted_cumsum(&gas, dt);
    let gas_volume = gradient(&gas_cum);
    for (i, row) in rows.iter_mut().enumerate() {
        row.gas_cum = Some(gas_cum[i]);
        row.gas_volume = Some(gas_volume[i]);
    }
}

pub fn bsw_to_wor(bsw: f64) -> f64 {
    bsw / (1.0 - bsw)
}

pub fn wor_to_bsw(wor: f64) -> f64 {
    wor / (wor + 1.0)
}

pub(crate) fn log_shape(model: &str, forecast: &Forecast) {
    debug!(
        model,
        rows = forecast.len(),
        iterations = forecast.iteration_count(),
        "forecast generated"
    );
}
