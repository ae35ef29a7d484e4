//! Wiener processes used to generate per-iteration price paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::frequency::{Frequency, FrequencyError, converter_factor, period_sequence};
use crate::domain::prob_var::{Distribution, ProbVar, ProbVarError};
use crate::domain::time::TimeValue;
use crate::services::grid::linspace;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WienerError {
    #[error("interval {0} is outside [0, 1]")]
    InvalidInterval(f64),
    #[error("steps and processes must be greater than zero")]
    EmptyShape,
    #[error(transparent)]
    Generator(#[from] ProbVarError),
    #[error(transparent)]
    Frequency(#[from] FrequencyError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessKind {
    Brownian { drift: f64 },
    GeometricBrownian { drift: f64 },
    MeanReversion { m: f64, eta: f64 },
}

/// Discretised stochastic process with `processes` independent paths of
/// `steps` points each.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProcessRecord", into = "ProcessRecord")]
pub struct WienerProcess {
    pub kind: ProcessKind,
    pub initial_condition: f64,
    pub ti: TimeValue,
    pub steps: usize,
    pub processes: usize,
    pub generator: ProbVar,
    pub freq_input: Frequency,
    pub freq_output: Frequency,
}

/// Generated paths, one per process, sharing one time index.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessPaths {
    pub index: Vec<TimeValue>,
    pub paths: Vec<Vec<f64>>,
}

impl WienerProcess {
    pub fn new(kind: ProcessKind) -> Self {
        Self {
            kind,
            initial_condition: 0.0,
            ti: TimeValue::Int(0),
            steps: 1,
            processes: 1,
            generator: standard_normal(),
            freq_input: Frequency::Daily,
            freq_output: Frequency::Daily,
        }
    }

    /// Generates the paths. `None` arguments fall back to the configured
    /// values. With `interval`, shocks are the generator's inverse CDF at
    /// evenly spaced percentiles spanning the central `interval` mass, one
    /// percentile per process, instead of random draws.
    pub fn generate(
        &self,
        steps: Option<usize>,
        processes: Option<usize>,
        freq_output: Option<Frequency>,
        interval: Option<f64>,
        seed: Option<u64>,
    ) -> Result<ProcessPaths, WienerError> {
        let steps = steps.unwrap_or(self.steps);
        let processes = processes.unwrap_or(self.processes);
        if steps == 0 || processes == 0 {
            return Err(WienerError::EmptyShape);
        }
        let freq_output = freq_output.unwrap_or(self.freq_output);
        let shocks = self.shocks(steps, processes, interval, seed)?;
        let dt = converter_factor(self.freq_input, freq_output);

        let paths = shocks
            .iter()
            .map(|epsilon| {
                let mut path = Vec::with_capacity(steps);
                path.push(self.initial_condition);
                for shock in epsilon.iter().skip(1) {
                    let previous = path[path.len() - 1];
                    path.push(self.step(previous, *shock, dt));
                }
                path
            })
            .collect();

        Ok(ProcessPaths {
            index: self.index(steps, freq_output)?,
            paths,
        })
    }

    fn step(&self, previous: f64, shock: f64, dt: f64) -> f64 {
        match self.kind {
            ProcessKind::Brownian { drift } => previous + drift * dt + shock * dt.sqrt(),
            ProcessKind::GeometricBrownian { drift } => {
                let var = self.volatility().powi(2) * dt;
                previous * (drift * dt - var / 2.0 + shock * dt.sqrt()).exp()
            }
            ProcessKind::MeanReversion { m, eta } => {
                let decay = (-eta).exp();
                m * (1.0 - decay) + decay * previous + shock
            }
        }
    }

    fn volatility(&self) -> f64 {
        match &self.generator {
            ProbVar::Sampled { dist, .. } => dist.scale(),
            ProbVar::Fixed(_) | ProbVar::FixedArray(_) => 0.0,
        }
    }

    fn shocks(
        &self,
        steps: usize,
        processes: usize,
        interval: Option<f64>,
        seed: Option<u64>,
    ) -> Result<Vec<Vec<f64>>, WienerError> {
        match interval {
            Some(interval) => {
                if !(0.0..=1.0).contains(&interval) {
                    return Err(WienerError::InvalidInterval(interval));
                }
                let half = (1.0 - interval) / 2.0;
                let percentiles = linspace(half, 1.0 - half, processes);
                let values = self.generator.sample_at_percentiles(&percentiles)?;
                Ok(values.into_iter().map(|value| vec![value; steps]).collect())
            }
            None => {
                let draws = self.generator.sample(steps * processes, seed)?;
                Ok(draws.chunks(steps).map(<[f64]>::to_vec).collect())
            }
        }
    }

    fn index(&self, steps: usize, freq_output: Frequency) -> Result<Vec<TimeValue>, WienerError> {
        match self.ti {
            TimeValue::Date(start) => Ok(period_sequence(start, steps, freq_output)?
                .into_iter()
                .map(TimeValue::Date)
                .collect()),
            TimeValue::Int(_) => Ok((0..steps as i64).map(TimeValue::Int).collect()),
        }
    }
}

fn standard_normal() -> ProbVar {
    ProbVar::Sampled {
        dist: Distribution::Normal { loc: 0.0, scale: 1.0 },
        seed: None,
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ProcessName {
    Brownian,
    GeometricBrownian,
    MeanReversion,
}

fn one() -> usize {
    1
}

fn daily() -> Frequency {
    Frequency::Daily
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessRecord {
    process: ProcessName,
    #[serde(default)]
    drift: f64,
    #[serde(default)]
    m: f64,
    #[serde(default)]
    eta: f64,
    #[serde(default)]
    initial_condition: f64,
    #[serde(default = "origin")]
    ti: TimeValue,
    #[serde(default = "one")]
    steps: usize,
    #[serde(default = "one")]
    processes: usize,
    #[serde(default = "standard_normal")]
    generator: ProbVar,
    #[serde(default = "daily")]
    freq_input: Frequency,
    #[serde(default = "daily")]
    freq_output: Frequency,
}

fn origin() -> TimeValue {
    TimeValue::Int(0)
}

impl TryFrom<ProcessRecord> for WienerProcess {
    type Error = WienerError;

    fn try_from(record: ProcessRecord) -> Result<Self, Self::Error> {
        if record.steps == 0 || record.processes == 0 {
            return Err(WienerError::EmptyShape);
        }
        let kind = match record.process {
            ProcessName::Brownian => ProcessKind::Brownian { drift: record.drift },
            ProcessName::GeometricBrownian => ProcessKind::GeometricBrownian { drift: record.drift },
            ProcessName::MeanReversion => ProcessKind::MeanReversion {
                m: record.m,
                eta: record.eta,
            },
        };
        Ok(Self {
            kind,
            initial_condition: record.initial_condition,
            ti: record.ti,
            steps: record.steps,
            processes: record.processes,
            generator: record.generator,
            freq_input: record.freq_input,
            freq_output: record.freq_output,
        })
    }
}

impl From<WienerProcess> for ProcessRecord {
    fn from(process: WienerProcess) -> Self {
        let (name, drift, m, eta) = match process.kind {
            ProcessKind::Brownian { drift } => (ProcessName::Brownian, drift, 0.0, 0.0),
            ProcessKind::GeometricBrownian { drift } => (ProcessName::GeometricBrownian, drift, 0.0, 0.0),
            ProcessKind::MeanReversion { m, eta } => (ProcessName::MeanReversion, 0.0, m, eta),
        };
        ProcessRecord {
            process: name,
            drift,
            m,
            eta,
            initial_condition: process.initial_condition,
            ti: process.ti,
            steps: process.steps,
            processes: process.processes,
            generator: process.generator,
            freq_input: process.freq_input,
            freq_output: process.freq_output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::on_date;
    use approx::assert_relative_eq;

    #[test]
    fn brownian_paths_start_at_the_initial_condition() {
        let process = WienerProcess {
            initial_condition: 60.0,
            steps: 12,
            processes: 4,
            ..WienerProcess::new(ProcessKind::Brownian { drift: 0.1 })
        };
        let paths = process.generate(None, None, None, None, Some(5)).unwrap();
        assert_eq!(paths.paths.len(), 4);
        assert!(paths.paths.iter().all(|path| path.len() == 12 && path[0] == 60.0));
        assert_eq!(paths.index.len(), 12);
        assert_eq!(paths, process.generate(None, None, None, None, Some(5)).unwrap());
    }

    #[test]
    fn brownian_without_noise_follows_the_drift() {
        let process = WienerProcess {
            generator: ProbVar::fixed(0.0),
            steps: 4,
            freq_input: Frequency::Daily,
            freq_output: Frequency::Monthly,
            ..WienerProcess::new(ProcessKind::Brownian { drift: 0.5 })
        };
        let paths = process.generate(None, None, None, None, None).unwrap();
        // dt = 30 days per monthly step
        assert_eq!(paths.paths[0], vec![0.0, 15.0, 30.0, 45.0]);
    }

    #[test]
    fn interval_mode_orders_processes_by_percentile() {
        let process = WienerProcess {
            initial_condition: 50.0,
            steps: 6,
            ..WienerProcess::new(ProcessKind::Brownian { drift: 0.0 })
        };
        let paths = process.generate(None, Some(3), None, Some(0.8), None).unwrap();
        let last: Vec<f64> = paths.paths.iter().map(|path| path[5]).collect();
        assert!(last[0] < last[1] && last[1] < last[2]);
        assert_relative_eq!(last[1], 50.0, epsilon = 1e-9);
        assert!(process.generate(None, None, None, Some(1.5), None).is_err());
    }

    #[test]
    fn geometric_brownian_stays_positive() {
        let process = WienerProcess {
            initial_condition: 70.0,
            steps: 50,
            processes: 3,
            generator: ProbVar::sampled(Distribution::Normal { loc: 0.0, scale: 0.2 }, None).unwrap(),
            ..WienerProcess::new(ProcessKind::GeometricBrownian { drift: 0.01 })
        };
        let paths = process.generate(None, None, None, None, Some(8)).unwrap();
        assert!(paths.paths.iter().flatten().all(|value| *value > 0.0));
    }

    #[test]
    fn mean_reversion_without_noise_converges_to_the_mean() {
        let process = WienerProcess {
            initial_condition: 10.0,
            steps: 200,
            generator: ProbVar::fixed(0.0),
            ..WienerProcess::new(ProcessKind::MeanReversion { m: 40.0, eta: 0.1 })
        };
        let paths = process.generate(None, None, None, None, None).unwrap();
        assert_relative_eq!(paths.paths[0][199], 40.0, max_relative = 1e-6);
    }

    #[test]
    fn dated_processes_use_calendar_periods() {
        let process = WienerProcess {
            ti: TimeValue::Date(on_date(2021, 1, 1)),
            steps: 3,
            freq_output: Frequency::Monthly,
            ..WienerProcess::new(ProcessKind::Brownian { drift: 0.0 })
        };
        let paths = process.generate(None, None, None, None, Some(1)).unwrap();
        assert_eq!(paths.index[2], TimeValue::Date(on_date(2021, 3, 1)));
    }

    #[test]
    fn deserializes_from_process_record() {
        let process: WienerProcess = serde_yaml::from_str(
            "process: mean_reversion\nm: 60\neta: 0.2\ninitial_condition: 55\nsteps: 12\n",
        )
        .unwrap();
        assert_eq!(process.kind, ProcessKind::MeanReversion { m: 60.0, eta: 0.2 });
        assert_eq!(process.steps, 12);
        assert!(serde_yaml::from_str::<WienerProcess>("process: jump\n").is_err());
    }
}
