//! Arps exponential, hyperbolic and harmonic decline.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::forecast::{Forecast, ForecastError, ForecastRecord};
use crate::domain::frequency::{Frequency, converter_factor};
use crate::domain::prob_var::{Distribution, ProbVar, broadcast_len, broadcast_to};
use crate::domain::time::{TimeAnchor, TimeMode, TimeValue};
use crate::services::decline::{
    DeclineCurve, FitOptions, FitRow, ForecastRequest, GasParam, Observation, TimeAxis, WaterDriver,
    derive_gas, derive_water, log_shape, parameter_seed, resolve_optional,
};
use crate::services::filters::exp_weighted_average;
use crate::services::fit::{FitError, fit_arps};
use crate::services::grid::{IterationGrid, gradient};

const EXPONENTIAL_B: f64 = 1e-9;

/// Rate at `t` after the anchor.
pub fn rate(qi: f64, di: f64, b: f64, t: f64) -> f64 {
    if b.abs() < EXPONENTIAL_B {
        qi * (-di * t).exp()
    } else {
        qi * (1.0 + b * di * t).powf(-1.0 / b)
    }
}

/// Volume produced between the anchor and `t`.
pub fn cumulative(qi: f64, di: f64, b: f64, t: f64) -> f64 {
    if b.abs() < EXPONENTIAL_B {
        (qi / di) * (1.0 - (-di * t).exp())
    } else if (b - 1.0).abs() < EXPONENTIAL_B {
        (qi / di) * (1.0 + di * t).ln()
    } else {
        qi / (di * (b - 1.0)) * ((1.0 + b * di * t).powf((b - 1.0) / b) - 1.0)
    }
}

/// Time after the anchor at which the rate falls to `limit`. Not defined for
/// a zero limit.
pub fn time_to_rate(qi: f64, di: f64, b: f64, limit: f64) -> f64 {
    if b.abs() < EXPONENTIAL_B {
        (qi / limit).ln() / di
    } else {
        ((qi / limit).powf(b) - 1.0) / (b * di)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum WaterParam {
    FluidRate(ProbVar),
    Bsw(ProbVar),
    Wor(ProbVar),
}

impl WaterParam {
    fn var(&self) -> &ProbVar {
        match self {
            WaterParam::FluidRate(var) | WaterParam::Bsw(var) | WaterParam::Wor(var) => var,
        }
    }

    fn driver(&self, value: f64) -> WaterDriver {
        match self {
            WaterParam::FluidRate(_) => WaterDriver::FluidRate(value),
            WaterParam::Bsw(_) => WaterDriver::Bsw(value),
            WaterParam::Wor(_) => WaterDriver::Wor(value),
        }
    }
}

/// Arps decline model. `di` is quoted per `freq_di` period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ArpsRecord", into = "ArpsRecord")]
pub struct Arps {
    qi: ProbVar,
    di: ProbVar,
    b: ProbVar,
    ti: TimeAnchor,
    freq_di: Frequency,
    water: Option<WaterParam>,
    gas: Option<GasParam>,
    seed: Option<u64>,
}

impl Arps {
    pub fn new(qi: ProbVar, di: ProbVar, b: ProbVar, ti: TimeAnchor) -> Self {
        Self {
            qi,
            di,
            b,
            ti,
            freq_di: Frequency::Daily,
            water: None,
            gas: None,
            seed: None,
        }
    }

    pub fn with_freq_di(mut self, freq_di: Frequency) -> Self {
        self.freq_di = freq_di;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Sets the water and gas ratios. At most one of `fluid_rate`, `bsw` and
    /// `wor`, and one of `gor` and `glr`, may be given.
    pub fn with_ratios(
        mut self,
        fluid_rate: Option<ProbVar>,
        bsw: Option<ProbVar>,
        wor: Option<ProbVar>,
        gor: Option<ProbVar>,
        glr: Option<ProbVar>,
    ) -> Result<Self, ForecastError> {
        self.water = match (fluid_rate, bsw, wor) {
            (None, None, None) => None,
            (Some(var), None, None) => Some(WaterParam::FluidRate(var)),
            (None, Some(var), None) => Some(WaterParam::Bsw(var)),
            (None, None, Some(var)) => Some(WaterParam::Wor(var)),
            _ => return Err(ForecastError::WaterDrivers),
        };
        self.gas = GasParam::from_ratios(gor, glr)?;
        if matches!(self.gas, Some(GasParam::Glr(_))) && self.water.is_none() {
            return Err(ForecastError::GlrWithoutFluid);
        }
        Ok(self)
    }

    pub fn qi(&self) -> &ProbVar {
        &self.qi
    }

    pub fn di(&self) -> &ProbVar {
        &self.di
    }

    pub fn b(&self) -> &ProbVar {
        &self.b
    }

    pub fn freq_di(&self) -> Frequency {
        self.freq_di
    }
}

impl fmt::Display for Arps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Arps(qi={}, di={}/{}, b={}, ti={})",
            self.qi,
            self.di,
            self.freq_di,
            self.b,
            self.ti.min()
        )
    }
}

impl DeclineCurve for Arps {
    fn forecast(&self, request: &ForecastRequest) -> Result<Forecast, ForecastError> {
        let axis = TimeAxis::build(&self.ti, request, request.freq_output)?;
        let seed = request.seed.or(self.seed);

        let qi = self.qi.resolve(request.iter, parameter_seed(seed, 0), request.ppf)?;
        let di = self.di.resolve(request.iter, parameter_seed(seed, 1), request.ppf)?;
        let b = self.b.resolve(request.iter, parameter_seed(seed, 2), request.ppf)?;
        let offsets = axis.anchor_offsets(&self.ti);
        let water = resolve_optional(self.water.as_ref().map(WaterParam::var), request, parameter_seed(seed, 3))?;
        let gas = resolve_optional(self.gas.as_ref().map(GasParam::var), request, parameter_seed(seed, 4))?;

        let mut lengths = vec![qi.len(), di.len(), b.len(), offsets.len()];
        lengths.extend([water.len(), gas.len()].into_iter().filter(|len| *len > 0));
        let n = broadcast_len(&lengths)?;

        let qi = broadcast_to(&qi, n);
        let factor = axis.rate_factor(self.freq_di);
        let di: Vec<f64> = broadcast_to(&di, n).into_iter().map(|d| d * factor).collect();
        let b = broadcast_to(&b, n);
        let offsets = broadcast_to(&offsets, n);
        let water = broadcast_to(&water, n);
        let gas = broadcast_to(&gas, n);

        let limit_time: Vec<f64> = (0..n)
            .map(|i| {
                request
                    .rate_limit
                    .map_or(f64::INFINITY, |limit| time_to_rate(qi[i], di[i], b[i], limit).floor())
            })
            .collect();
        let mut elapsed = IterationGrid::from_fn(n, axis.len(), |i, j| axis.t[j] - offsets[i]);
        elapsed.mask_where(|i, t| t < 0.0 || t > limit_time[i]);
        let rates = IterationGrid::from_fn(n, axis.len(), |i, j| rate(qi[i], di[i], b[i], elapsed.get(i, j)));
        let mut cums = IterationGrid::from_fn(n, axis.len(), |i, j| cumulative(qi[i], di[i], b[i], elapsed.get(i, j)));
        if let Some(limit) = request.cum_limit {
            cums.mask_where(|_, cum| cum > limit);
        }

        let mut records = Vec::new();
        for i in 0..n {
            let (rate_row, cum_row) = (rates.row(i), cums.row(i));
            let kept: Vec<usize> = (0..axis.len())
                .filter(|&j| !rate_row[j].is_nan() && !cum_row[j].is_nan())
                .collect();

            let cum: Vec<f64> = kept.iter().map(|&j| cum_row[j]).collect();
            let volume = gradient(&cum);
            let dt = gradient(&kept.iter().map(|&j| axis.t[j]).collect::<Vec<f64>>());

            let mut rows: Vec<ForecastRecord> = kept
                .iter()
                .enumerate()
                .map(|(k, &j)| ForecastRecord::new(axis.values[j], i, rate_row[j], cum[k], volume[k]))
                .collect();
            if let Some(param) = &self.water {
                derive_water(&mut rows, &dt, param.driver(water[i]));
            }
            if let Some(param) = &self.gas {
                derive_gas(&mut rows, &dt, param.driver(gas[i]));
            }
            records.extend(rows);
        }

        let forecast = Forecast::new(request.freq_output, records);
        log_shape("arps", &forecast);
        Ok(forecast)
    }

    fn fit(&mut self, observations: &[Observation], options: &FitOptions<'_>) -> Result<Vec<FitRow>, FitError> {
        let Some(first) = observations.first() else {
            return Err(FitError::TooFewPoints { needed: 3, got: 0 });
        };
        let origin = first.time;
        let t: Vec<f64> = observations
            .iter()
            .map(|o| match (o.time, origin) {
                (TimeValue::Date(date), TimeValue::Date(origin)) => (date - origin).num_days() as f64,
                (TimeValue::Int(value), TimeValue::Int(origin)) => (value - origin) as f64,
                _ => f64::NAN,
            })
            .collect();
        let observed: Vec<f64> = observations.iter().map(|o| o.oil_rate).collect();
        let filtered = match options.smoothing_beta {
            Some(beta) => exp_weighted_average(&observed, beta),
            None => observed.clone(),
        };
        let flags = match options.filter {
            Some(filter) => filter.flag(&t, &filtered),
            None => vec![false; t.len()],
        };

        let (t_fit, q_fit): (Vec<f64>, Vec<f64>) = t
            .iter()
            .zip(&filtered)
            .zip(&flags)
            .filter(|(_, outlier)| !**outlier)
            .map(|((t, q), _)| (*t, *q))
            .unzip();
        let estimate = fit_arps(&t_fit, &q_fit, options.b)?;

        // dates are fitted per day, integer steps per freq_di period
        let factor = match origin.mode() {
            TimeMode::Date => converter_factor(Frequency::Daily, self.freq_di),
            TimeMode::Number => 1.0,
        };
        let as_var = |value: f64, se: f64| {
            if options.probabilistic && se > 0.0 {
                ProbVar::Sampled {
                    dist: Distribution::Normal { loc: value, scale: se },
                    seed: None,
                }
            } else {
                ProbVar::fixed(value)
            }
        };
        self.qi = as_var(estimate.qi, estimate.qi_se);
        self.di = as_var(estimate.di * factor, estimate.di_se * factor);
        self.b = as_var(estimate.b, estimate.b_se);
        self.ti = TimeAnchor::single(origin);

        Ok(observations
            .iter()
            .zip(filtered)
            .zip(flags)
            .map(|((o, filtered), outlier)| FitRow {
                time: o.time,
                observed: o.oil_rate,
                filtered,
                outlier,
            })
            .collect())
    }

    fn anchor(&self) -> &TimeAnchor {
        &self.ti
    }

    fn set_anchor(&mut self, anchor: TimeAnchor) {
        self.ti = anchor;
    }
}

fn zero_b() -> ProbVar {
    ProbVar::fixed(0.0)
}

fn daily() -> Frequency {
    Frequency::Daily
}

#[derive(Serialize, Deserialize)]
struct ArpsRecord {
    qi: ProbVar,
    di: ProbVar,
    #[serde(default = "zero_b")]
    b: ProbVar,
    ti: TimeAnchor,
    #[serde(default = "daily")]
    freq_di: Frequency,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    fluid_rate: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bsw: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wor: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gor: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    glr: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl TryFrom<ArpsRecord> for Arps {
    type Error = ForecastError;

    fn try_from(record: ArpsRecord) -> Result<Self, Self::Error> {
        let mut arps = Arps::new(record.qi, record.di, record.b, record.ti)
            .with_freq_di(record.freq_di)
            .with_ratios(record.fluid_rate, record.bsw, record.wor, record.gor, record.glr)?;
        arps.seed = record.seed;
        Ok(arps)
    }
}

impl From<Arps> for ArpsRecord {
    fn from(arps: Arps) -> Self {
        let (mut fluid_rate, mut bsw, mut wor) = (None, None, None);
        match arps.water {
            Some(WaterParam::FluidRate(var)) => fluid_rate = Some(var),
            Some(WaterParam::Bsw(var)) => bsw = Some(var),
            Some(WaterParam::Wor(var)) => wor = Some(var),
            None => {}
        }
        let (gor, glr) = GasParam::into_ratios(arps.gas);
        ArpsRecord {
            qi: arps.qi,
            di: arps.di,
            b: arps.b,
            ti: arps.ti,
            freq_di: arps.freq_di,
            fluid_rate,
            bsw,
            wor,
            gor,
            glr,
            seed: arps.seed,
        }
    }
}
