use serde::Serialize;

use crate::domain::cashflow::{CashFlowError, CashFlowModel};
use crate::domain::frequency::{Frequency, converter_factor};

/// NPV of one iteration at one discount rate. `rate` is the rate as quoted,
/// before conversion to the cashflow frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NpvRecord {
    pub rate: f64,
    pub npv: f64,
    pub iteration: usize,
}

/// Converts a discount rate quoted per `freq_rate` period into one per
/// `freq_cashflow` period: `(1 + rate)^factor - 1`.
pub fn convert_rate(rate: f64, freq_rate: Frequency, freq_cashflow: Frequency) -> f64 {
    (1.0 + rate).powf(converter_factor(freq_rate, freq_cashflow)) - 1.0
}

pub fn npv_cashflows(
    models: &[CashFlowModel],
    rates: &[f64],
    freq_rate: Frequency,
    freq_cashflow: Frequency,
) -> Result<Vec<NpvRecord>, CashFlowError> {
    let converted: Vec<f64> = rates
        .iter()
        .map(|rate| convert_rate(*rate, freq_rate, freq_cashflow))
        .collect();

    let mut records = Vec::with_capacity(models.len() * rates.len());
    for (iteration, model) in models.iter().enumerate() {
        let npvs = model.npv(&converted, Some(freq_cashflow))?;
        records.extend(rates.iter().zip(npvs).map(|(rate, npv)| NpvRecord {
            rate: *rate,
            npv,
            iteration,
        }));
    }
    Ok(records)
}

pub fn irr_cashflows(models: &[CashFlowModel], freq_output: Option<Frequency>) -> Result<Vec<Option<f64>>, CashFlowError> {
    models.iter().map(|model| model.irr(freq_output)).collect()
}

/// Spread of NPV across iterations for one discount rate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NpvSummary {
    pub rate: f64,
    pub iterations: usize,
    pub p10: f64,
    pub p50: f64,
    pub p90: f64,
    pub mean: f64,
}

/// Groups records by rate, in the order rates first appear.
pub fn summarize_npv(records: &[NpvRecord]) -> Vec<NpvSummary> {
    let mut rates: Vec<f64> = Vec::new();
    for record in records {
        if !rates.contains(&record.rate) {
            rates.push(record.rate);
        }
    }

    rates
        .into_iter()
        .filter_map(|rate| {
            let mut values: Vec<f64> = records
                .iter()
                .filter(|record| record.rate == rate)
                .map(|record| record.npv)
                .collect();
            values.sort_by(f64::total_cmp);
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            Some(NpvSummary {
                rate,
                iterations: values.len(),
                p10: nearest_rank(&values, 0.1)?,
                p50: nearest_rank(&values, 0.5)?,
                p90: nearest_rank(&values, 0.9)?,
                mean,
            })
        })
        .collect()
}

/// Value at `fraction` of an ascending slice, rounded to the nearest index.
fn nearest_rank(sorted: &[f64], fraction: f64) -> Option<f64> {
    let last = sorted.len().checked_sub(1)?;
    let position = (fraction.clamp(0.0, 1.0) * last as f64).round() as usize;
    sorted.get(position).copied()
}

/// Economics of a whole model run, ready for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EconomicsReport {
    pub model: String,
    pub kind: String,
    pub iterations: usize,
    pub freq_rate: Frequency,
    pub freq_cashflow: Frequency,
    pub npv: Vec<NpvSummary>,
    pub irr: Vec<Option<f64>>,
    pub failures: Vec<String>,
}

impl EconomicsReport {
    /// Median IRR over the iterations that have one.
    pub fn irr_p50(&self) -> Option<f64> {
        let mut values: Vec<f64> = self.irr.iter().flatten().copied().collect();
        values.sort_by(f64::total_cmp);
        nearest_rank(&values, 0.5)
    }

    pub fn iterations_without_irr(&self) -> usize {
        self.irr.iter().filter(|irr| irr.is_none()).count()
    }
}
