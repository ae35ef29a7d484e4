//! Model parameters that are either fixed numbers or probability
//! distributions.
//!
//! Every decline parameter resolves to one value per iteration through
//! [`ProbVar::resolve`]. Fixed scalars resolve to a single value, fixed arrays
//! to their own length and distributions to as many draws as requested, so the
//! realized iteration count of a model is the broadcast of its parameters.

use std::collections::BTreeMap;
use std::fmt;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::Distribution as _;
use serde::{Deserialize, Serialize};
use statrs::distribution::ContinuousCDF;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbVarError {
    #[error("unsupported distribution: {0}")]
    UnsupportedDistribution(String),
    #[error("distribution {dist} is missing parameter {param}")]
    MissingParameter { dist: String, param: String },
    #[error("invalid parameters for distribution {0}")]
    InvalidParameters(String),
    #[error("percentile {0} is outside [0, 1]")]
    InvalidPercentile(f64),
    #[error("fixed array is empty")]
    EmptyArray,
    #[error("cannot broadcast iteration counts {0:?}")]
    Broadcast(Vec<usize>),
}

/// Parametric distributions, named after their scipy counterparts in model
/// files.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Normal { loc: f64, scale: f64 },
    Uniform { loc: f64, scale: f64 },
    Triangular { c: f64, loc: f64, scale: f64 },
    LogNormal { s: f64, loc: f64, scale: f64 },
    Beta { a: f64, b: f64, loc: f64, scale: f64 },
}

impl Distribution {
    /// Builds a distribution from its model-file name and keyword parameters.
    pub fn from_name(name: &str, kw: &BTreeMap<String, f64>) -> Result<Self, ProbVarError> {
        let param = |key: &str, default: Option<f64>| -> Result<f64, ProbVarError> {
            kw.get(key).copied().or(default).ok_or_else(|| ProbVarError::MissingParameter {
                dist: name.to_string(),
                param: key.to_string(),
            })
        };

        let dist = match name {
            "norm" | "normal" => Distribution::Normal {
                loc: param("loc", Some(0.0))?,
                scale: param("scale", Some(1.0))?,
            },
            "uniform" => Distribution::Uniform {
                loc: param("loc", Some(0.0))?,
                scale: param("scale", Some(1.0))?,
            },
            "triang" | "triangular" => Distribution::Triangular {
                c: param("c", None)?,
                loc: param("loc", Some(0.0))?,
                scale: param("scale", Some(1.0))?,
            },
            "lognorm" | "lognormal" => Distribution::LogNormal {
                s: param("s", None)?,
                loc: param("loc", Some(0.0))?,
                scale: param("scale", Some(1.0))?,
            },
            "beta" => Distribution::Beta {
                a: param("a", None)?,
                b: param("b", None)?,
                loc: param("loc", Some(0.0))?,
                scale: param("scale", Some(1.0))?,
            },
            other => return Err(ProbVarError::UnsupportedDistribution(other.to_string())),
        };
        dist.validate()?;
        Ok(dist)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Distribution::Normal { .. } => "norm",
            Distribution::Uniform { .. } => "uniform",
            Distribution::Triangular { .. } => "triang",
            Distribution::LogNormal { .. } => "lognorm",
            Distribution::Beta { .. } => "beta",
        }
    }

    pub fn kw(&self) -> BTreeMap<String, f64> {
        let pairs: Vec<(&str, f64)> = match *self {
            Distribution::Normal { loc, scale } | Distribution::Uniform { loc, scale } => {
                vec![("loc", loc), ("scale", scale)]
            }
            Distribution::Triangular { c, loc, scale } => vec![("c", c), ("loc", loc), ("scale", scale)],
            Distribution::LogNormal { s, loc, scale } => vec![("s", s), ("loc", loc), ("scale", scale)],
            Distribution::Beta { a, b, loc, scale } => {
                vec![("a", a), ("b", b), ("loc", loc), ("scale", scale)]
            }
        };
        pairs.into_iter().map(|(key, value)| (key.to_string(), value)).collect()
    }

    /// Scale parameter of the distribution, used as the volatility of
    /// geometric Brownian processes.
    pub fn scale(&self) -> f64 {
        match *self {
            Distribution::Normal { scale, .. }
            | Distribution::Uniform { scale, .. }
            | Distribution::Triangular { scale, .. }
            | Distribution::LogNormal { scale, .. }
            | Distribution::Beta { scale, .. } => scale,
        }
    }

    fn validate(&self) -> Result<(), ProbVarError> {
        let valid = match *self {
            Distribution::Normal { scale, .. } | Distribution::Uniform { scale, .. } => scale > 0.0,
            Distribution::Triangular { c, scale, .. } => scale > 0.0 && (0.0..=1.0).contains(&c),
            Distribution::LogNormal { s, scale, .. } => s > 0.0 && scale > 0.0,
            Distribution::Beta { a, b, scale, .. } => a > 0.0 && b > 0.0 && scale > 0.0,
        };
        if valid {
            Ok(())
        } else {
            Err(ProbVarError::InvalidParameters(self.name().to_string()))
        }
    }

    /// Draws `count` independent values.
    pub fn sample<R: rand::Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Result<Vec<f64>, ProbVarError> {
        self.validate()?;
        let invalid = || ProbVarError::InvalidParameters(self.name().to_string());
        let values = match *self {
            Distribution::Normal { loc, scale } => {
                let dist = rand_distr::Normal::new(loc, scale).map_err(|_| invalid())?;
                (0..count).map(|_| dist.sample(rng)).collect()
            }
            Distribution::Uniform { loc, scale } => {
                let dist = rand_distr::Uniform::new(loc, loc + scale);
                (0..count).map(|_| dist.sample(rng)).collect()
            }
            Distribution::Triangular { c, loc, scale } => {
                let dist = rand_distr::Triangular::new(loc, loc + scale, loc + c * scale)
                    .map_err(|_| invalid())?;
                (0..count).map(|_| dist.sample(rng)).collect()
            }
            Distribution::LogNormal { s, loc, scale } => {
                let dist = rand_distr::LogNormal::new(scale.ln(), s).map_err(|_| invalid())?;
                (0..count).map(|_| loc + dist.sample(rng)).collect()
            }
            Distribution::Beta { a, b, loc, scale } => {
                let dist = rand_distr::Beta::new(a, b).map_err(|_| invalid())?;
                (0..count).map(|_| loc + scale * dist.sample(rng)).collect()
            }
        };
        Ok(values)
    }

    /// Inverse CDF at `percentile` in `[0, 1]`.
    pub fn ppf(&self, percentile: f64) -> Result<f64, ProbVarError> {
        if !(0.0..=1.0).contains(&percentile) {
            return Err(ProbVarError::InvalidPercentile(percentile));
        }
        self.validate()?;
        let invalid = |_| ProbVarError::InvalidParameters(self.name().to_string());
        let value = match *self {
            Distribution::Normal { loc, scale } => statrs::distribution::Normal::new(loc, scale)
                .map_err(invalid)?
                .inverse_cdf(percentile),
            Distribution::Uniform { loc, scale } => loc + scale * percentile,
            Distribution::Triangular { c, loc, scale } => {
                statrs::distribution::Triangular::new(loc, loc + scale, loc + c * scale)
                    .map_err(invalid)?
                    .inverse_cdf(percentile)
            }
            Distribution::LogNormal { s, loc, scale } => {
                loc + statrs::distribution::LogNormal::new(scale.ln(), s)
                    .map_err(invalid)?
                    .inverse_cdf(percentile)
            }
            Distribution::Beta { a, b, loc, scale } => {
                loc + scale
                    * statrs::distribution::Beta::new(a, b)
                        .map_err(invalid)?
                        .inverse_cdf(percentile)
            }
        };
        Ok(value)
    }
}

/// A model parameter: a fixed value, one fixed value per iteration, or a
/// distribution sampled on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ProbVarRecord", into = "ProbVarRecord")]
pub enum ProbVar {
    Fixed(f64),
    FixedArray(Vec<f64>),
    Sampled {
        dist: Distribution,
        seed: Option<u64>,
    },
}

impl ProbVar {
    pub fn fixed(value: f64) -> Self {
        ProbVar::Fixed(value)
    }

    pub fn array(values: Vec<f64>) -> Result<Self, ProbVarError> {
        if values.is_empty() {
            return Err(ProbVarError::EmptyArray);
        }
        Ok(ProbVar::FixedArray(values))
    }

    pub fn sampled(dist: Distribution, seed: Option<u64>) -> Result<Self, ProbVarError> {
        dist.validate()?;
        Ok(ProbVar::Sampled { dist, seed })
    }

    /// Draws `count` values. Fixed parameters are repeated; arrays are
    /// cycled to the requested length.
    pub fn sample(&self, count: usize, seed: Option<u64>) -> Result<Vec<f64>, ProbVarError> {
        match self {
            ProbVar::Fixed(value) => Ok(vec![*value; count]),
            ProbVar::FixedArray(values) => Ok(values.iter().copied().cycle().take(count).collect()),
            ProbVar::Sampled { dist, seed: own } => {
                let mut rng = seeded_rng(own.or(seed));
                dist.sample(count, &mut rng)
            }
        }
    }

    /// Inverse-CDF evaluation at each percentile. Fixed parameters return
    /// their value for every percentile.
    pub fn sample_at_percentiles(&self, percentiles: &[f64]) -> Result<Vec<f64>, ProbVarError> {
        match self {
            ProbVar::Fixed(value) => Ok(vec![*value; percentiles.len()]),
            ProbVar::FixedArray(values) => {
                Ok(values.iter().copied().cycle().take(percentiles.len()).collect())
            }
            ProbVar::Sampled { dist, .. } => percentiles.iter().map(|p| dist.ppf(*p)).collect(),
        }
    }

    /// Per-iteration values for a forecast or cashflow run.
    ///
    /// Fixed scalars give one value, fixed arrays their own values,
    /// distributions either `count` draws or, when `percentile` is set, the
    /// single inverse-CDF value.
    pub fn resolve(
        &self,
        count: usize,
        seed: Option<u64>,
        percentile: Option<f64>,
    ) -> Result<Vec<f64>, ProbVarError> {
        match self {
            ProbVar::Fixed(value) => Ok(vec![*value]),
            ProbVar::FixedArray(values) => Ok(values.clone()),
            ProbVar::Sampled { dist, .. } => match percentile {
                Some(p) => Ok(vec![dist.ppf(p)?]),
                None => self.sample(count.max(1), seed),
            },
        }
    }
}

impl fmt::Display for ProbVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbVar::Fixed(value) => write!(f, "{value}"),
            ProbVar::FixedArray(values) => write!(f, "{values:?}"),
            ProbVar::Sampled { dist, .. } => {
                let kw: Vec<String> = dist.kw().iter().map(|(k, v)| format!("{k}={v}")).collect();
                write!(f, "{}({})", dist.name(), kw.join(", "))
            }
        }
    }
}

impl From<f64> for ProbVar {
    fn from(value: f64) -> Self {
        ProbVar::Fixed(value)
    }
}

pub(crate) fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

/// Realized iteration count of several per-iteration arrays: every length
/// must be 1 or the common maximum.
pub fn broadcast_len(lengths: &[usize]) -> Result<usize, ProbVarError> {
    let max = lengths.iter().copied().max().unwrap_or(1).max(1);
    if lengths.iter().all(|len| *len == 1 || *len == max) {
        Ok(max)
    } else {
        Err(ProbVarError::Broadcast(lengths.to_vec()))
    }
}

/// Expands a length-1 array to `len`, leaves matching arrays untouched.
pub fn broadcast_to(values: &[f64], len: usize) -> Vec<f64> {
    if values.len() == len {
        values.to_vec()
    } else {
        let value = values.first().copied().unwrap_or(f64::NAN);
        vec![value; len]
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum ProbVarRecord {
    Scalar(f64),
    Array(Vec<f64>),
    Dist {
        dist: String,
        #[serde(default)]
        kw: BTreeMap<String, f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seed: Option<u64>,
    },
}

impl TryFrom<ProbVarRecord> for ProbVar {
    type Error = ProbVarError;

    fn try_from(record: ProbVarRecord) -> Result<Self, Self::Error> {
        match record {
            ProbVarRecord::Scalar(value) => Ok(ProbVar::Fixed(value)),
            ProbVarRecord::Array(values) => ProbVar::array(values),
            ProbVarRecord::Dist { dist, kw, seed } => {
                ProbVar::sampled(Distribution::from_name(&dist, &kw)?, seed)
            }
        }
    }
}

impl From<ProbVar> for ProbVarRecord {
    fn from(value: ProbVar) -> Self {
        match value {
            ProbVar::Fixed(value) => ProbVarRecord::Scalar(value),
            ProbVar::FixedArray(values) => ProbVarRecord::Array(values),
            ProbVar::Sampled { dist, seed } => ProbVarRecord::Dist {
                dist: dist.name().to_string(),
                kw: dist.kw(),
                seed,
            },
        }
    }
}
