//! Outlier filters and smoothing applied to observed production before
//! fitting a decline curve.

use std::collections::HashMap;

use crate::services::fit::FitError;
use crate::services::grid::{gradient, mean_std};

/// Flags anomalous points of a `(x, y)` series.
pub trait OutlierFilter {
    /// One flag per point, `true` for outliers.
    fn flag(&self, x: &[f64], y: &[f64]) -> Vec<bool>;
}

impl<F> OutlierFilter for F
where
    F: Fn(&[f64], &[f64]) -> Vec<bool>,
{
    fn flag(&self, x: &[f64], y: &[f64]) -> Vec<bool> {
        self(x, y)
    }
}

/// Flags points whose log-rate derivative has an absolute z-score above the
/// threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZScoreFilter {
    pub threshold: f64,
}

impl Default for ZScoreFilter {
    fn default() -> Self {
        Self { threshold: 2.0 }
    }
}

impl OutlierFilter for ZScoreFilter {
    fn flag(&self, x: &[f64], y: &[f64]) -> Vec<bool> {
        let log_y: Vec<f64> = y.iter().map(|v| v.ln()).collect();
        let dy = gradient(&log_y);
        let dx = gradient(x);
        let derivative: Vec<f64> = dy.iter().zip(&dx).map(|(a, b)| a / b).collect();

        let (mean, std) = mean_std(&derivative);
        // rounding noise on a perfectly smooth series is not a signal
        let spread = std > 1e-9 * mean.abs().max(1.0);
        derivative
            .iter()
            .map(|d| spread && ((d - mean) / std).abs() > self.threshold)
            .collect()
    }
}

/// Named built-in filters plus any caller-registered ones.
pub struct FilterRegistry {
    filters: HashMap<String, Box<dyn OutlierFilter>>,
}

impl FilterRegistry {
    pub fn empty() -> Self {
        Self {
            filters: HashMap::new(),
        }
    }

    pub fn register(&mut self, name: &str, filter: Box<dyn OutlierFilter>) {
        self.filters.insert(name.to_string(), filter);
    }

    pub fn get(&self, name: &str) -> Option<&dyn OutlierFilter> {
        self.filters.get(name).map(|filter| filter.as_ref())
    }

    pub fn resolve(&self, name: &str) -> Result<&dyn OutlierFilter, FitError> {
        self.get(name).ok_or_else(|| FitError::UnknownFilter(name.to_string()))
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("zscore", Box::new(ZScoreFilter::default()));
        registry
    }
}

/// Exponentially weighted moving average with bias correction.
pub fn exp_weighted_average(y: &[f64], beta: f64) -> Vec<f64> {
    let mut average = 0.0;
    y.iter()
        .enumerate()
        .map(|(i, value)| {
            average = beta * average + (1.0 - beta) * value;
            let correction = 1.0 - beta.powi(i as i32 + 1);
            if correction == 0.0 { 0.0 } else { average / correction }
        })
        .collect()
}

/// Smoothing factor equivalent to averaging over roughly `days` samples.
pub fn beta_from_days(days: f64) -> f64 {
    1.0 - 1.0 / days
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zscore_flags_a_spike_in_a_smooth_decline() {
        let x: Vec<f64> = (0..20).map(f64::from).collect();
        let mut y: Vec<f64> = x.iter().map(|t| 1000.0 * (-0.05 * t).exp()).collect();
        y[10] = 3000.0;

        let flags = ZScoreFilter::default().flag(&x, &y);
        assert_eq!(flags.len(), 20);
        assert!(flags[9] || flags[11]);
        assert!(!flags[2]);
        assert!(!flags[17]);
    }

    #[test]
    fn zscore_keeps_every_point_of_a_clean_exponential() {
        let x: Vec<f64> = (0..10).map(f64::from).collect();
        let y: Vec<f64> = x.iter().map(|t| 500.0 * (-0.1 * t).exp()).collect();
        assert!(ZScoreFilter::default().flag(&x, &y).iter().all(|flag| !flag));
    }

    #[test]
    fn registry_resolves_builtins_and_custom_filters() {
        let mut registry = FilterRegistry::default();
        assert!(registry.get("zscore").is_some());
        assert!(registry.get("iqr").is_none());

        registry.register(
            "first",
            Box::new(|x: &[f64], _: &[f64]| (0..x.len()).map(|i| i == 0).collect::<Vec<bool>>()),
        );
        let flags = registry.get("first").unwrap().flag(&[1.0, 2.0], &[3.0, 4.0]);
        assert_eq!(flags, vec![true, false]);
        assert!(matches!(registry.resolve("iqr"), Err(FitError::UnknownFilter(name)) if name == "iqr"));
    }

    #[test]
    fn exp_weighted_average_of_a_constant_is_constant() {
        let smoothed = exp_weighted_average(&[4.0; 5], beta_from_days(10.0));
        for value in smoothed {
            assert!((value - 4.0).abs() < 1e-12);
        }
    }
}
