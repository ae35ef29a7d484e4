use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::frequency::{Frequency, FrequencyError, period_start};
use crate::domain::prob_var::ProbVarError;
use crate::domain::time::{TimeError, TimeMode, TimeValue};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ForecastError {
    #[error(transparent)]
    Time(#[from] TimeError),
    #[error(transparent)]
    Frequency(#[from] FrequencyError),
    #[error(transparent)]
    Parameter(#[from] ProbVarError),
    #[error("an end time is required when no time list is given")]
    MissingEnd,
    #[error("time axis is empty")]
    EmptyTimeAxis,
    #[error("time axis uses {axis:?} values but the model anchor uses {anchor:?} values")]
    ModeMismatch { anchor: TimeMode, axis: TimeMode },
    #[error("only one of fluid_rate, bsw and wor can drive the water stream")]
    WaterDrivers,
    #[error("only one of gor and glr can drive the gas stream")]
    GasDrivers,
    #[error("glr requires a fluid_rate, bsw or wor driver")]
    GlrWithoutFluid,
    #[error("resampling requires calendar dates")]
    ResampleNumbers,
}

/// One (time, iteration) row of a forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRecord {
    pub time: TimeValue,
    pub iteration: usize,
    pub oil_rate: f64,
    pub oil_cum: f64,
    pub oil_volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_cum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub water_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bsw: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluid_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluid_cum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fluid_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_cum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gor: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glr: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub well: Option<String>,
}

impl ForecastRecord {
    pub fn new(time: TimeValue, iteration: usize, oil_rate: f64, oil_cum: f64, oil_volume: f64) -> Self {
        Self {
            time,
            iteration,
            oil_rate,
            oil_cum,
            oil_volume,
            water_rate: None,
            water_cum: None,
            water_volume: None,
            bsw: None,
            wor: None,
            fluid_rate: None,
            fluid_cum: None,
            fluid_volume: None,
            gas_rate: None,
            gas_cum: None,
            gas_volume: None,
            gor: None,
            glr: None,
            period: None,
            scenario: None,
            well: None,
        }
    }

    /// Numeric column by name, `None` when the column is unknown or unset.
    pub fn value(&self, column: &str) -> Option<f64> {
        match column {
            "oil_rate" => Some(self.oil_rate),
            "oil_cum" => Some(self.oil_cum),
            "oil_volume" => Some(self.oil_volume),
            "water_rate" => self.water_rate,
            "water_cum" => self.water_cum,
            "water_volume" => self.water_volume,
            "bsw" => self.bsw,
            "wor" => self.wor,
            "fluid_rate" => self.fluid_rate,
            "fluid_cum" => self.fluid_cum,
            "fluid_volume" => self.fluid_volume,
            "gas_rate" => self.gas_rate,
            "gas_cum" => self.gas_cum,
            "gas_volume" => self.gas_volume,
            "gor" => self.gor,
            "glr" => self.glr,
            _ => None,
        }
    }
}

/// Tabular forecast of one or more iterations at a single output frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct Forecast {
    freq: Frequency,
    records: Vec<ForecastRecord>,
}

impl Forecast {
    pub fn new(freq: Frequency, records: Vec<ForecastRecord>) -> Self {
        Self { freq, records }
    }

    pub fn empty(freq: Frequency) -> Self {
        Self::new(freq, Vec::new())
    }

    pub fn freq(&self) -> Frequency {
        self.freq
    }

    pub fn records(&self) -> &[ForecastRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Distinct iteration indices in ascending order.
    pub fn iterations(&self) -> Vec<usize> {
        let mut iterations: Vec<usize> = self.records.iter().map(|r| r.iteration).collect();
        iterations.sort_unstable();
        iterations.dedup();
        iterations
    }

    /// Number of iterations, counting from zero up to the highest index.
    pub fn iteration_count(&self) -> usize {
        self.records.iter().map(|r| r.iteration + 1).max().unwrap_or(0)
    }

    pub fn rows_for(&self, iteration: usize) -> impl Iterator<Item = &ForecastRecord> {
        self.records.iter().filter(move |r| r.iteration == iteration)
    }

    pub fn time_mode(&self) -> Option<TimeMode> {
        self.records.first().map(|r| r.time.mode())
    }

    pub fn max_time(&self) -> Option<TimeValue> {
        self.records.iter().map(|r| r.time).max()
    }

    /// Last forecast time of every iteration, indexed by iteration.
    ///
    /// Iterations without rows inherit the overall last time so that
    /// dependent periods always receive one anchor per iteration.
    pub fn end_times(&self) -> Vec<TimeValue> {
        let Some(overall) = self.max_time() else {
            return Vec::new();
        };
        let mut ends = vec![None; self.iteration_count()];
        for record in &self.records {
            let slot = &mut ends[record.iteration];
            if slot.is_none_or(|end| record.time > end) {
                *slot = Some(record.time);
            }
        }
        ends.into_iter().map(|end| end.unwrap_or(overall)).collect()
    }

    pub fn append(&mut self, other: Forecast) {
        self.records.extend(other.records);
    }

    pub fn concat<I>(freq: Frequency, forecasts: I) -> Forecast
    where
        I: IntoIterator<Item = Forecast>,
    {
        let mut merged = Forecast::empty(freq);
        for forecast in forecasts {
            merged.append(forecast);
        }
        merged
    }

    pub fn stamp_period(&mut self, name: &str) {
        for record in &mut self.records {
            record.period = Some(name.to_string());
        }
    }

    pub fn stamp_scenario(&mut self, name: &str) {
        for record in &mut self.records {
            record.scenario = Some(name.to_string());
        }
    }

    pub fn stamp_well(&mut self, name: &str) {
        for record in &mut self.records {
            record.well = Some(name.to_string());
        }
    }

    /// Re-aggregates a calendar forecast to `freq`: rates and ratios are
    /// averaged, cumulatives keep their maximum and volumes are summed.
    pub fn resample(&self, freq: Frequency) -> Result<Forecast, ForecastError> {
        let mut groups: BTreeMap<(usize, NaiveDate), Vec<&ForecastRecord>> = BTreeMap::new();
        for record in &self.records {
            let date = record.time.as_date().ok_or(ForecastError::ResampleNumbers)?;
            groups
                .entry((record.iteration, period_start(date, freq)))
                .or_default()
                .push(record);
        }

        let records = groups
            .into_iter()
            .map(|((iteration, date), rows)| aggregate_rows(TimeValue::Date(date), iteration, &rows))
            .collect();
        Ok(Forecast::new(freq, records))
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn max(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
}

fn sum(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None, |acc: Option<f64>, v| Some(acc.unwrap_or(0.0) + v))
}

fn aggregate_rows(time: TimeValue, iteration: usize, rows: &[&ForecastRecord]) -> ForecastRecord {
    let col = |f: fn(&ForecastRecord) -> Option<f64>| rows.iter().filter_map(move |r| f(r));

    let mut record = ForecastRecord::new(
        time,
        iteration,
        mean(col(|r| Some(r.oil_rate))).unwrap_or(f64::NAN),
        max(col(|r| Some(r.oil_cum))).unwrap_or(f64::NAN),
        sum(col(|r| Some(r.oil_volume))).unwrap_or(f64::NAN),
    );
    record.water_rate = mean(col(|r| r.water_rate));
    record.water_cum = max(col(|r| r.water_cum));
    record.water_volume = sum(col(|r| r.water_volume));
    record.bsw = mean(col(|r| r.bsw));
    record.wor = mean(col(|r| r.wor));
    record.fluid_rate = mean(col(|r| r.fluid_rate));
    record.fluid_cum = max(col(|r| r.fluid_cum));
    record.fluid_volume = sum(col(|r| r.fluid_volume));
    record.gas_rate = mean(col(|r| r.gas_rate));
    record.gas_cum = max(col(|r| r.gas_cum));
    record.gas_volume = sum(col(|r| r.gas_volume));
    record.gor = mean(col(|r| r.gor));
    record.glr = mean(col(|r| r.glr));
    if let Some(first) = rows.first() {
        record.period = first.period.clone();
        record.scenario = first.scenario.clone();
        record.well = first.well.clone();
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::on_date;

    fn daily_row(day: u32, iteration: usize, rate: f64, cum: f64) -> ForecastRecord {
        ForecastRecord::new(TimeValue::Date(on_date(2021, 1, day)), iteration, rate, cum, rate)
    }

    #[test]
    fn end_times_are_per_iteration_maxima() {
        let forecast = Forecast::new(
            Frequency::Daily,
            vec![
                daily_row(1, 0, 10.0, 10.0),
                daily_row(5, 0, 9.0, 19.0),
                daily_row(1, 1, 10.0, 10.0),
                daily_row(9, 1, 8.0, 18.0),
            ],
        );
        assert_eq!(
            forecast.end_times(),
            vec![TimeValue::Date(on_date(2021, 1, 5)), TimeValue::Date(on_date(2021, 1, 9))]
        );
        assert_eq!(forecast.iterations(), vec![0, 1]);
    }

    #[test]
    fn resample_means_rates_maxes_cums_and_sums_volumes() {
        let mut rows = vec![
            daily_row(30, 0, 10.0, 100.0),
            daily_row(31, 0, 20.0, 120.0),
        ];
        let mut feb = ForecastRecord::new(TimeValue::Date(on_date(2021, 2, 1)), 0, 30.0, 150.0, 30.0);
        feb.water_rate = Some(5.0);
        rows.push(feb);

        let monthly = Forecast::new(Frequency::Daily, rows).resample(Frequency::Monthly).unwrap();
        let records = monthly.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].time, TimeValue::Date(on_date(2021, 1, 1)));
        assert_eq!(records[0].oil_rate, 15.0);
        assert_eq!(records[0].oil_cum, 120.0);
        assert_eq!(records[0].oil_volume, 30.0);
        assert_eq!(records[0].water_rate, None);
        assert_eq!(records[1].water_rate, Some(5.0));
    }

    #[test]
    fn resample_rejects_integer_axes() {
        let forecast = Forecast::new(
            Frequency::Monthly,
            vec![ForecastRecord::new(TimeValue::Int(0), 0, 1.0, 0.0, 0.0)],
        );
        assert_eq!(forecast.resample(Frequency::Annual).unwrap_err(), ForecastError::ResampleNumbers);
    }

    #[test]
    fn value_looks_up_columns_by_name() {
        let mut record = daily_row(1, 0, 10.0, 10.0);
        record.gas_volume = Some(3.0);
        assert_eq!(record.value("oil_volume"), Some(10.0));
        assert_eq!(record.value("gas_volume"), Some(3.0));
        assert_eq!(record.value("water_volume"), None);
        assert_eq!(record.value("unknown"), None);
    }
}
