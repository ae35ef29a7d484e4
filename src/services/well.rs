use tracing::{debug, warn};

use crate::domain::cashflow::CashFlowModel;
use crate::domain::forecast::Forecast;
use crate::domain::frequency::Frequency;
use crate::services::cashflow_params::CashFlowParams;
use crate::services::scenario::Scenario;
use crate::services::schedule::{
    RunOptions, ScheduleError, ScheduleNode, broadcast_append, cash_name, general_models, record_failure,
    split_params, unique_names,
};

/// Scenarios of one well. Their cashflow models are kept side by side, so a
/// well with two scenarios of ten iterations yields twenty models.
#[derive(Debug, Clone, PartialEq)]
pub struct Well {
    pub name: String,
    scenarios: Vec<Scenario>,
    pub cashflow_params: Vec<CashFlowParams>,
    pub iter: Option<usize>,
    pub seed: Option<u64>,
    pub ppf: Option<f64>,
    forecast: Option<Forecast>,
    cashflow: Option<Vec<CashFlowModel>>,
    included: Vec<usize>,
    failures: Vec<String>,
}

impl Well {
    pub fn new(name: &str, scenarios: Vec<Scenario>) -> Result<Self, ScheduleError> {
        let first = scenarios
            .first()
            .ok_or_else(|| ScheduleError::NoChildren(name.to_string()))?;
        unique_names(scenarios.iter().map(|scenario| scenario.name.as_str()))?;
        if scenarios.iter().any(|s| s.time_mode() != first.time_mode()) {
            return Err(ScheduleError::MixedTimeModes(name.to_string()));
        }
        if scenarios.iter().any(|s| s.freq_output() != first.freq_output()) {
            return Err(ScheduleError::MixedFrequencies(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            scenarios,
            cashflow_params: Vec::new(),
            iter: None,
            seed: None,
            ppf: None,
            forecast: None,
            cashflow: None,
            included: Vec::new(),
            failures: Vec::new(),
        })
    }

    pub fn with_cashflow_params(mut self, params: Vec<CashFlowParams>) -> Self {
        self.cashflow_params = params;
        self
    }

    pub fn scenarios(&self) -> &[Scenario] {
        &self.scenarios
    }

    pub fn scenario(&self, name: &str) -> Option<&Scenario> {
        self.scenarios.iter().find(|scenario| scenario.name == name)
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn freq_output(&self) -> Frequency {
        self.scenarios[0].freq_output()
    }

    fn run_options(&self, options: &RunOptions) -> RunOptions {
        RunOptions {
            freq_output: options.freq_output,
            iter: options.iter.or(self.iter),
            seed: options.seed.or(self.seed),
            ppf: options.ppf.or(self.ppf),
        }
    }

    pub fn generate_forecast(
        &mut self,
        options: &RunOptions,
        filter: Option<&[String]>,
    ) -> Result<&Forecast, ScheduleError> {
        let options = self.run_options(options);
        self.failures.clear();
        self.included.clear();

        let mut forecasts = Vec::new();
        for (i, scenario) in self.scenarios.iter_mut().enumerate() {
            if filter.is_some_and(|names| !names.contains(&scenario.name)) {
                continue;
            }
            match scenario.generate_forecast(&options, None) {
                Ok(forecast) => {
                    self.included.push(i);
                    forecasts.push(forecast.clone());
                }
                Err(error) => {
                    warn!(well = %self.name, scenario = %scenario.name, %error, "scenario forecast failed");
                    record_failure(&mut self.failures, &scenario.name);
                }
            }
        }

        if forecasts.is_empty() {
            return Err(ScheduleError::AllFailed {
                name: self.name.clone(),
                failures: self.failures.clone(),
            });
        }
        let freq = options.freq_output.unwrap_or(self.freq_output());
        let mut forecast = Forecast::concat(freq, forecasts);
        forecast.stamp_well(&self.name);
        debug!(well = %self.name, rows = forecast.len(), "well forecast generated");
        self.cashflow = None;
        Ok(self.forecast.insert(forecast))
    }

    /// Concatenates the models of every scenario and lays the general
    /// parameters over each of them.
    pub fn generate_cashflow(
        &mut self,
        options: &RunOptions,
        add_name: Option<&str>,
        inherited: &[CashFlowParams],
    ) -> Result<&[CashFlowModel], ScheduleError> {
        if self.forecast.is_none() {
            return Err(ScheduleError::MissingForecast(self.name.clone()));
        }
        let options = self.run_options(options);
        let (pass, general) = split_params(&self.cashflow_params, inherited);
        let cash_name = cash_name(add_name, &self.name);

        let mut models: Vec<CashFlowModel> = Vec::new();
        for &i in &self.included {
            let scenario = &mut self.scenarios[i];
            match scenario.generate_cashflow(&options, Some(&cash_name), &pass) {
                Ok(child) => models.extend_from_slice(child),
                Err(error) => {
                    warn!(well = %self.name, scenario = %scenario.name, %error, "scenario cashflow failed");
                    record_failure(&mut self.failures, &scenario.name);
                }
            }
        }
        if models.is_empty() {
            return Err(ScheduleError::AllFailed {
                name: self.name.clone(),
                failures: self.failures.clone(),
            });
        }

        if !general.is_empty() {
            let forecast = self
                .forecast
                .as_ref()
                .ok_or_else(|| ScheduleError::MissingForecast(self.name.clone()))?;
            let freq_input = self.scenarios[self.included[0]].freq_input();
            let extra = general_models(&self.name, &general, forecast, freq_input, models.len(), &options)?;
            broadcast_append(&self.name, &mut models, &extra)?;
        }

        debug!(well = %self.name, models = models.len(), "well cashflow generated");
        Ok(self.cashflow.insert(models))
    }
}

impl ScheduleNode for Well {
    fn name(&self) -> &str {
        &self.name
    }

    fn forecast(&self) -> Option<&Forecast> {
        self.forecast.as_ref()
    }

    fn cashflow(&self) -> Option<&[CashFlowModel]> {
        self.cashflow.as_deref()
    }
}

/// Wells evaluated together. Model `i` of the group aggregates model `i` of
/// every well, repeating wells that produce a single model.
#[derive(Debug, Clone, PartialEq)]
pub struct WellsGroup {
    pub name: String,
    wells: Vec<Well>,
    pub cashflow_params: Vec<CashFlowParams>,
    pub iter: Option<usize>,
    pub seed: Option<u64>,
    pub ppf: Option<f64>,
    forecast: Option<Forecast>,
    cashflow: Option<Vec<CashFlowModel>>,
    included: Vec<usize>,
    failures: Vec<String>,
}

impl WellsGroup {
    pub fn new(name: &str, wells: Vec<Well>) -> Result<Self, ScheduleError> {
        let first = wells
            .first()
            .ok_or_else(|| ScheduleError::NoChildren(name.to_string()))?;
        unique_names(wells.iter().map(|well| well.name.as_str()))?;
        let mode = first.scenarios[0].time_mode();
        if wells.iter().any(|well| well.scenarios[0].time_mode() != mode) {
            return Err(ScheduleError::MixedTimeModes(name.to_string()));
        }
        if wells.iter().any(|well| well.freq_output() != first.freq_output()) {
            return Err(ScheduleError::MixedFrequencies(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            wells,
            cashflow_params: Vec::new(),
            iter: None,
            seed: None,
            ppf: None,
            forecast: None,
            cashflow: None,
            included: Vec::new(),
            failures: Vec::new(),
        })
    }

    pub fn with_cashflow_params(mut self, params: Vec<CashFlowParams>) -> Self {
        self.cashflow_params = params;
        self
    }

    pub fn wells(&self) -> &[Well] {
        &self.wells
    }

    pub fn well(&self, name: &str) -> Option<&Well> {
        self.wells.iter().find(|well| well.name == name)
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    fn run_options(&self, options: &RunOptions) -> RunOptions {
        RunOptions {
            freq_output: options.freq_output,
            iter: options.iter.or(self.iter),
            seed: options.seed.or(self.seed),
            ppf: options.ppf.or(self.ppf),
        }
    }

    pub fn generate_forecast(
        &mut self,
        options: &RunOptions,
        filter: Option<&[String]>,
    ) -> Result<&Forecast, ScheduleError> {
        let options = self.run_options(options);
        self.failures.clear();
        self.included.clear();

        let mut forecasts = Vec::new();
        for (i, well) in self.wells.iter_mut().enumerate() {
            if filter.is_some_and(|names| !names.contains(&well.name)) {
                continue;
            }
            match well.generate_forecast(&options, None) {
                Ok(forecast) => {
                    self.included.push(i);
                    forecasts.push(forecast.clone());
                }
                Err(error) => {
                    warn!(group = %self.name, well = %well.name, %error, "well forecast failed");
                    record_failure(&mut self.failures, &well.name);
                }
            }
        }

        if forecasts.is_empty() {
            return Err(ScheduleError::AllFailed {
                name: self.name.clone(),
                failures: self.failures.clone(),
            });
        }
        let freq = options.freq_output.unwrap_or(self.wells[0].freq_output());
        let forecast = Forecast::concat(freq, forecasts);
        debug!(group = %self.name, rows = forecast.len(), "group forecast generated");
        self.cashflow = None;
        Ok(self.forecast.insert(forecast))
    }

    pub fn generate_cashflow(
        &mut self,
        options: &RunOptions,
        add_name: Option<&str>,
        inherited: &[CashFlowParams],
    ) -> Result<&[CashFlowModel], ScheduleError> {
        if self.forecast.is_none() {
            return Err(ScheduleError::MissingForecast(self.name.clone()));
        }
        let options = self.run_options(options);
        let (pass, general) = split_params(&self.cashflow_params, inherited);
        let cash_name = cash_name(add_name, &self.name);

        let mut children = Vec::new();
        for &i in &self.included {
            let well = &mut self.wells[i];
            match well.generate_cashflow(&options, Some(&cash_name), &pass) {
                Ok(models) => children.push(models.to_vec()),
                Err(error) => {
                    warn!(group = %self.name, well = %well.name, %error, "well cashflow failed");
                    record_failure(&mut self.failures, &well.name);
                }
            }
        }
        if children.is_empty() {
            return Err(ScheduleError::AllFailed {
                name: self.name.clone(),
                failures: self.failures.clone(),
            });
        }

        let count = children.iter().map(Vec::len).max().unwrap_or(1);
        let mut models: Vec<CashFlowModel> = (0..count)
            .map(|i| CashFlowModel::new(&format!("{}_{i}", self.name)))
            .collect();
        for child in &children {
            broadcast_append(&self.name, &mut models, child)?;
        }
        if !general.is_empty() {
            let forecast = self
                .forecast
                .as_ref()
                .ok_or_else(|| ScheduleError::MissingForecast(self.name.clone()))?;
            let well = &self.wells[self.included[0]];
            let freq_input = well.scenarios[well.included[0]].freq_input();
            let extra = general_models(&self.name, &general, forecast, freq_input, count, &options)?;
            broadcast_append(&self.name, &mut models, &extra)?;
        }

        debug!(group = %self.name, models = models.len(), "group cashflow generated");
        Ok(self.cashflow.insert(models))
    }
}

impl ScheduleNode for WellsGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn forecast(&self) -> Option<&Forecast> {
        self.forecast.as_ref()
    }

    fn cashflow(&self) -> Option<&[CashFlowModel]> {
        self.cashflow.as_deref()
    }
}
