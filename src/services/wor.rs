//! Water-oil-ratio decline: water cut grows exponentially with cumulative oil.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::forecast::{Forecast, ForecastError, ForecastRecord};
use crate::domain::frequency::Frequency;
use crate::domain::prob_var::{Distribution, ProbVar, broadcast_len, broadcast_to};
use crate::domain::time::{TimeAnchor, TimeMode};
use crate::services::decline::{
    DeclineCurve, FitOptions, FitRow, ForecastRequest, GasParam, Observation, TimeAxis, bsw_to_wor,
    derive_gas, integrate_water, log_shape, parameter_seed, resolve_optional, wor_to_bsw,
};
use crate::services::filters::exp_weighted_average;
use crate::services::fit::{FitError, ols};
use crate::services::grid::gradient;

/// Early-termination thresholds of the step simulation.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WorLimits {
    pub rate_limit: Option<f64>,
    pub cum_limit: Option<f64>,
    pub wor_limit: Option<f64>,
}

impl WorLimits {
    fn breached(&self, step: &WorStep) -> bool {
        self.rate_limit.is_some_and(|limit| step.oil_rate <= limit)
            || self.cum_limit.is_some_and(|limit| step.oil_cum >= limit)
            || self.wor_limit.is_some_and(|limit| step.wor >= limit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorStep {
    pub oil_rate: f64,
    pub water_rate: f64,
    pub bsw: f64,
    pub wor: f64,
    pub oil_cum: f64,
    pub water_cum: f64,
}

/// Sequential WOR simulation over `time`.
///
/// `wor[0] = wor_initial` and `wor[i] = wor_initial * exp(slope * oil_cum[i - 1])`.
/// Cumulatives integrate `rate * dt` with `dt` the centered gradient of the
/// time axis. The loop stops at the first step breaching a limit; that step
/// is the last one returned.
pub fn wor_forecast(
    time: &[f64],
    fluid_rate: &[f64],
    slope: f64,
    wor_initial: f64,
    limits: &WorLimits,
) -> Vec<WorStep> {
    let dt = gradient(time);
    let mut steps: Vec<WorStep> = Vec::with_capacity(time.len());
    let (mut oil_cum, mut water_cum) = (0.0, 0.0);

    for (i, step_dt) in dt.iter().enumerate() {
        let wor = match steps.last() {
            Some(previous) => wor_initial * (slope * previous.oil_cum).exp(),
            None => wor_initial,
        };
        let bsw = wor_to_bsw(wor);
        let fluid = fluid_rate.get(i).or(fluid_rate.last()).copied().unwrap_or(f64::NAN);
        let oil_rate = fluid * (1.0 - bsw);
        let water_rate = fluid * bsw;
        oil_cum += oil_rate * step_dt;
        water_cum += water_rate * step_dt;

        let step = WorStep {
            oil_rate,
            water_rate,
            bsw,
            wor,
            oil_cum,
            water_cum,
        };
        steps.push(step);
        if limits.breached(&step) {
            break;
        }
    }
    steps
}

/// WOR decline model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WorRecord", into = "WorRecord")]
pub struct Wor {
    bsw: ProbVar,
    slope: ProbVar,
    fluid_rate: ProbVar,
    ti: TimeAnchor,
    gas: Option<GasParam>,
    wor_limit: Option<f64>,
    seed: Option<u64>,
}

impl Wor {
    pub fn new(bsw: ProbVar, slope: ProbVar, fluid_rate: ProbVar, ti: TimeAnchor) -> Self {
        Self {
            bsw,
            slope,
            fluid_rate,
            ti,
            gas: None,
            wor_limit: None,
            seed: None,
        }
    }

    pub fn with_gas(mut self, gor: Option<ProbVar>, glr: Option<ProbVar>) -> Result<Self, ForecastError> {
        self.gas = GasParam::from_ratios(gor, glr)?;
        Ok(self)
    }

    pub fn with_wor_limit(mut self, wor_limit: f64) -> Self {
        self.wor_limit = Some(wor_limit);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn bsw(&self) -> &ProbVar {
        &self.bsw
    }

    pub fn slope(&self) -> &ProbVar {
        &self.slope
    }
}

impl fmt::Display for Wor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Wor(bsw={}, slope={}, fluid_rate={}, ti={})",
            self.bsw,
            self.slope,
            self.fluid_rate,
            self.ti.min()
        )
    }
}

impl DeclineCurve for Wor {
    fn forecast(&self, request: &ForecastRequest) -> Result<Forecast, ForecastError> {
        let date_mode = self.ti.mode() == TimeMode::Date;
        let step = if date_mode { Frequency::Daily } else { request.freq_output };
        let axis = TimeAxis::build(&self.ti, request, step)?;
        let seed = request.seed.or(self.seed);

        let bsw = self.bsw.resolve(request.iter, parameter_seed(seed, 0), request.ppf)?;
        let slope = self.slope.resolve(request.iter, parameter_seed(seed, 1), request.ppf)?;
        let fluid = self.fluid_rate.resolve(request.iter, parameter_seed(seed, 2), request.ppf)?;
        let offsets = axis.anchor_offsets(&self.ti);
        let gas = resolve_optional(self.gas.as_ref().map(GasParam::var), request, parameter_seed(seed, 3))?;

        let mut lengths = vec![bsw.len(), slope.len(), fluid.len(), offsets.len()];
        if !gas.is_empty() {
            lengths.push(gas.len());
        }
        let n = broadcast_len(&lengths)?;
        let bsw = broadcast_to(&bsw, n);
        let slope = broadcast_to(&slope, n);
        let fluid = broadcast_to(&fluid, n);
        let offsets = broadcast_to(&offsets, n);
        let gas = broadcast_to(&gas, n);

        let limits = WorLimits {
            rate_limit: request.rate_limit,
            cum_limit: request.cum_limit,
            wor_limit: self.wor_limit,
        };

        let mut records = Vec::new();
        for i in 0..n {
            let kept: Vec<usize> = (0..axis.len()).filter(|&j| axis.t[j] - offsets[i] >= 0.0).collect();
            let time: Vec<f64> = kept.iter().map(|&j| axis.t[j] - offsets[i]).collect();
            let steps = wor_forecast(&time, &[fluid[i]], slope[i], bsw_to_wor(bsw[i]), &limits);

            let kept = &kept[..steps.len()];
            let oil_cum: Vec<f64> = steps.iter().map(|s| s.oil_cum).collect();
            let oil_volume = gradient(&oil_cum);
            let dt = gradient(&time[..steps.len()]);

            let mut rows: Vec<ForecastRecord> = steps
                .iter()
                .zip(kept)
                .enumerate()
                .map(|(k, (s, &j))| {
                    let mut row = ForecastRecord::new(axis.values[j], i, s.oil_rate, s.oil_cum, oil_volume[k]);
                    row.water_rate = Some(s.water_rate);
                    row.fluid_rate = Some(fluid[i]);
                    row.bsw = Some(s.bsw);
                    row.wor = Some(s.wor);
                    row
                })
                .collect();
            integrate_water(&mut rows, &dt);
            if let Some(param) = &self.gas {
                derive_gas(&mut rows, &dt, param.driver(gas[i]));
            }
            records.extend(rows);
        }

        let daily = Forecast::new(step, records);
        let forecast = if date_mode && request.freq_output != Frequency::Daily {
            daily.resample(request.freq_output)?
        } else {
            daily
        };
        log_shape("wor", &forecast);
        Ok(forecast)
    }

    /// Regresses `ln(wor)` on cumulative oil. The initial water cut is taken
    /// at zero cumulative oil; its standard error comes from the delta method.
    fn fit(&mut self, observations: &[Observation], options: &FitOptions<'_>) -> Result<Vec<FitRow>, FitError> {
        let oil_cum = observations
            .iter()
            .map(|o| o.oil_cum)
            .collect::<Option<Vec<f64>>>()
            .ok_or(FitError::MissingColumn("oil_cum"))?;
        let observed = observations
            .iter()
            .map(|o| o.bsw)
            .collect::<Option<Vec<f64>>>()
            .ok_or(FitError::MissingColumn("bsw"))?;
        let filtered = match options.smoothing_beta {
            Some(beta) => exp_weighted_average(&observed, beta),
            None => observed.clone(),
        };
        let wor: Vec<f64> = filtered.iter().map(|bsw| bsw_to_wor(*bsw)).collect();
        let flags = match options.filter {
            Some(filter) => filter.flag(&oil_cum, &wor),
            None => vec![false; wor.len()],
        };

        let (x, y): (Vec<f64>, Vec<f64>) = oil_cum
            .iter()
            .zip(&wor)
            .zip(&flags)
            .filter(|(_, outlier)| !**outlier)
            .map(|((np, wor), _)| (*np, wor.ln()))
            .unzip();
        let line = ols(&x, &y)?;

        let bsw_initial = wor_to_bsw(line.intercept.exp());
        // d(bsw)/d(intercept) = bsw * (1 - bsw)
        let bsw_se = bsw_initial * (1.0 - bsw_initial) * line.intercept_se;
        if options.probabilistic && bsw_se > 0.0 && line.slope_se > 0.0 {
            self.bsw = ProbVar::Sampled {
                dist: Distribution::Normal { loc: bsw_initial, scale: bsw_se },
                seed: None,
            };
            self.slope = ProbVar::Sampled {
                dist: Distribution::Normal {
                    loc: line.slope,
                    scale: line.slope_se,
                },
                seed: None,
            };
        } else {
            self.bsw = ProbVar::fixed(bsw_initial);
            self.slope = ProbVar::fixed(line.slope);
        }

        Ok(observations
            .iter()
            .zip(filtered)
            .zip(flags)
            .map(|((o, filtered), outlier)| FitRow {
                time: o.time,
                observed: o.bsw.unwrap_or(f64::NAN),
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

#[derive(Serialize, Deserialize)]
struct WorRecord {
    bsw: ProbVar,
    slope: ProbVar,
    fluid_rate: ProbVar,
    ti: TimeAnchor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gor: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    glr: Option<ProbVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wor_limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

impl TryFrom<WorRecord> for Wor {
    type Error = ForecastError;

    fn try_from(record: WorRecord) -> Result<Self, Self::Error> {
        let mut wor = Wor::new(record.bsw, record.slope, record.fluid_rate, record.ti)
            .with_gas(record.gor, record.glr)?;
        wor.wor_limit = record.wor_limit;
        wor.seed = record.seed;
        Ok(wor)
    }
}

impl From<Wor> for WorRecord {
    fn from(wor: Wor) -> Self {
        let (gor, glr) = GasParam::into_ratios(wor.gas);
        WorRecord {
            bsw: wor.bsw,
            slope: wor.slope,
            fluid_rate: wor.fluid_rate,
            ti: wor.ti,
            gor,
            glr,
            wor_limit: wor.wor_limit,
            seed: wor.seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::time::TimeValue;
    use crate::test_support::on_date;
    use approx::assert_relative_eq;

    #[test]
    fn first_step_uses_the_initial_ratio() {
        let time: Vec<f64> = (0..10).map(f64::from).collect();
        let steps = wor_forecast(&time, &[5000.0], 3e-6, 1.0, &WorLimits::default());
        assert_eq!(steps.len(), 10);
        assert_eq!(steps[0].wor, 1.0);
        assert_eq!(steps[0].bsw, 0.5);
        assert_eq!(steps[0].oil_rate, 2500.0);
    }

    #[test]
    fn wor_grows_while_oil_accumulates() {
        let time: Vec<f64> = (0..30).map(f64::from).collect();
        let steps = wor_forecast(&time, &[1000.0], 1e-5, 0.4, &WorLimits::default());
        assert!(steps.windows(2).all(|pair| pair[1].wor > pair[0].wor));
        assert!(steps.windows(2).all(|pair| pair[1].oil_cum > pair[0].oil_cum));
        for (i, step) in steps.iter().enumerate().skip(1) {
            assert_relative_eq!(step.wor, 0.4 * (1e-5 * steps[i - 1].oil_cum).exp(), max_relative = 1e-12);
        }
    }

    #[test]
    fn simulation_stops_at_the_first_breach() {
        let time: Vec<f64> = (0..100).map(f64::from).collect();
        let limits = WorLimits {
            rate_limit: Some(400.0),
            ..WorLimits::default()
        };
        let steps = wor_forecast(&time, &[1000.0], 1e-4, 0.5, &limits);
        let last = steps.last().unwrap();
        assert!(last.oil_rate <= 400.0);
        assert!(steps[..steps.len() - 1].iter().all(|s| s.oil_rate > 400.0));
        assert!(steps.len() < 100);
    }

    #[test]
    fn limits_are_checked_on_the_first_step() {
        let limits = WorLimits {
            wor_limit: Some(0.1),
            ..WorLimits::default()
        };
        let steps = wor_forecast(&[0.0, 1.0, 2.0], &[100.0], 1e-3, 0.5, &limits);
        assert_eq!(steps.len(), 1);
    }

    fn daily_wor() -> Wor {
        Wor::new(
            ProbVar::fixed(0.3),
            ProbVar::array(vec![1e-5, 1e-7]).unwrap(),
            ProbVar::fixed(1000.0),
            TimeAnchor::single(TimeValue::Date(on_date(2021, 1, 1))),
        )
        .with_gas(Some(ProbVar::fixed(0.3)), None)
        .unwrap()
    }

    #[test]
    fn oil_and_water_add_up_to_fluid_in_every_iteration() {
        let request = ForecastRequest::between(
            TimeValue::Date(on_date(2021, 1, 1)),
            TimeValue::Date(on_date(2021, 6, 1)),
            Frequency::Daily,
        );
        let forecast = daily_wor().forecast(&request).unwrap();
        assert_eq!(forecast.iterations(), vec![0, 1]);
        assert_eq!(forecast.rows_for(0).count(), 151);
        for row in forecast.records() {
            let water = row.water_rate.unwrap();
            assert_relative_eq!(row.oil_rate + water, 1000.0, max_relative = 1e-12);
            assert_relative_eq!(row.gas_rate.unwrap(), row.oil_rate * 0.3, max_relative = 1e-12);
        }
    }

    #[test]
    fn monthly_output_is_resampled_from_daily_steps() {
        let request = ForecastRequest::between(
            TimeValue::Date(on_date(2021, 1, 1)),
            TimeValue::Date(on_date(2021, 6, 1)),
            Frequency::Monthly,
        );
        let forecast = daily_wor().forecast(&request).unwrap();
        assert_eq!(forecast.freq(), Frequency::Monthly);
        assert_eq!(forecast.rows_for(1).count(), 5);
        let cums: Vec<f64> = forecast.rows_for(0).map(|r| r.oil_cum).collect();
        assert!(cums.windows(2).all(|pair| pair[1] >= pair[0]));
    }

    #[test]
    fn deserializes_without_qi_as_wor_model() {
        let wor: Wor =
            serde_yaml::from_str("bsw: 0.3\nslope: [1.0e-5, 1.0e-7]\nfluid_rate: 1000\nti: 2021-01-01\ngor: 0.3\n")
                .unwrap();
        assert_eq!(wor.slope(), &ProbVar::FixedArray(vec![1e-5, 1e-7]));
    }

    #[test]
    fn fit_recovers_slope_and_initial_water_cut() {
        let observations: Vec<Observation> = (0..20)
            .map(|i| {
                let np = 1000.0 * f64::from(i);
                Observation {
                    time: TimeValue::Int(i64::from(i)),
                    oil_rate: 100.0,
                    oil_cum: Some(np),
                    bsw: Some(wor_to_bsw(0.25 * (2e-5 * np).exp())),
                }
            })
            .collect();
        let mut wor = Wor::new(
            ProbVar::fixed(0.0),
            ProbVar::fixed(0.0),
            ProbVar::fixed(100.0),
            TimeAnchor::single(TimeValue::Int(0)),
        );
        wor.fit(&observations, &FitOptions::default()).unwrap();

        let (ProbVar::Fixed(bsw), ProbVar::Fixed(slope)) = (wor.bsw(), wor.slope()) else {
            panic!("expected fixed parameters");
        };
        assert_relative_eq!(*slope, 2e-5, max_relative = 1e-8);
        assert_relative_eq!(*bsw, 0.2, max_relative = 1e-8);
    }

    #[test]
    fn fit_requires_cumulative_oil() {
        let observations = vec![Observation {
            time: TimeValue::Int(0),
            oil_rate: 10.0,
            oil_cum: None,
            bsw: Some(0.2),
        }];
        let mut wor = daily_wor();
        let error = wor.fit(&observations, &FitOptions::default()).unwrap_err();
        assert_eq!(error, FitError::MissingColumn("oil_cum"));
    }
}
