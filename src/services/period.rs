use tracing::{debug, warn};

use crate::domain::cashflow::CashFlowModel;
use crate::domain::forecast::{Forecast, ForecastRecord};
use crate::domain::frequency::Frequency;
use crate::domain::prob_var::broadcast_len;
use crate::domain::time::{TimeAnchor, TimeMode, TimeValue};
use crate::services::cashflow_params::{
    CashFlowParams, CashSpan, ResolveContext, build_cashflow, multiply_column,
};
use crate::services::decline::{Decline, DeclineCurve, ForecastRequest};
use crate::services::schedule::{
    Depends, RunOptions, ScheduleError, ScheduleNode, cash_name, merge_params,
};

/// One decline model over a time range, with the cashflow parameters that
/// turn its forecast into money.
#[derive(Debug, Clone, PartialEq)]
pub struct Period {
    pub name: String,
    pub dca: Decline,
    pub start: Option<TimeValue>,
    pub end: Option<TimeValue>,
    pub time_list: Option<Vec<TimeValue>>,
    pub freq_input: Frequency,
    pub freq_output: Frequency,
    pub rate_limit: Option<f64>,
    pub cum_limit: Option<f64>,
    pub depends: Option<Depends>,
    pub cashflow_params: Vec<CashFlowParams>,
    pub iter: usize,
    pub seed: Option<u64>,
    pub ppf: Option<f64>,
    forecast: Option<Forecast>,
    cashflow: Option<Vec<CashFlowModel>>,
}

impl Period {
    pub fn new(name: &str, dca: Decline) -> Self {
        Self {
            name: name.to_string(),
            dca,
            start: None,
            end: None,
            time_list: None,
            freq_input: Frequency::Daily,
            freq_output: Frequency::Daily,
            rate_limit: None,
            cum_limit: None,
            depends: None,
            cashflow_params: Vec::new(),
            iter: 1,
            seed: None,
            ppf: None,
            forecast: None,
            cashflow: None,
        }
    }

    pub fn between(mut self, start: TimeValue, end: TimeValue) -> Self {
        self.start = Some(start);
        self.end = Some(end);
        self
    }

    pub fn with_freqs(mut self, freq_input: Frequency, freq_output: Frequency) -> Self {
        self.freq_input = freq_input;
        self.freq_output = freq_output;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: f64) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_depends(mut self, depends: Depends) -> Self {
        self.depends = Some(depends);
        self
    }

    pub fn with_cashflow_params(mut self, params: Vec<CashFlowParams>) -> Self {
        self.cashflow_params = params;
        self
    }

    pub fn time_mode(&self) -> TimeMode {
        self.dca.time_mode()
    }

    pub(crate) fn set_anchor(&mut self, anchor: TimeAnchor) {
        self.dca.set_anchor(anchor);
    }

    pub fn generate_forecast(&mut self, options: &RunOptions) -> Result<&Forecast, ScheduleError> {
        let options = options.or_node(self.iter, self.seed, self.ppf);
        let request = ForecastRequest {
            time_list: self.time_list.clone(),
            start: self.start,
            end: self.end,
            freq_input: self.freq_input,
            freq_output: options.freq_output.unwrap_or(self.freq_output),
            rate_limit: self.rate_limit,
            cum_limit: self.cum_limit,
            iter: options.iter.unwrap_or(1),
            ppf: options.ppf,
            seed: options.seed,
        };

        let mut forecast = self.dca.forecast(&request)?;
        forecast.stamp_period(&self.name);
        debug!(period = %self.name, rows = forecast.len(), "period forecast generated");
        self.cashflow = None;
        Ok(self.forecast.insert(forecast))
    }

    /// Last forecast time of every iteration.
    pub fn end_times(&self) -> Result<Vec<TimeValue>, ScheduleError> {
        let forecast = self
            .forecast
            .as_ref()
            .ok_or_else(|| ScheduleError::MissingForecast(self.name.clone()))?;
        if forecast.is_empty() {
            return Err(ScheduleError::EmptyForecast(self.name.clone()));
        }
        Ok(forecast.end_times())
    }

    /// Builds one cashflow model per iteration. The iteration count is the
    /// broadcast of the forecast iterations and every parameter's own count;
    /// a single forecast iteration is reused for every model.
    ///
    /// Parameters whose `multiply` column is missing from the forecast are
    /// logged and skipped.
    pub fn generate_cashflow(
        &mut self,
        options: &RunOptions,
        add_name: Option<&str>,
        inherited: &[CashFlowParams],
    ) -> Result<&[CashFlowModel], ScheduleError> {
        let forecast = self
            .forecast
            .as_ref()
            .ok_or_else(|| ScheduleError::MissingForecast(self.name.clone()))?;
        if forecast.is_empty() {
            return Err(ScheduleError::EmptyForecast(self.name.clone()));
        }
        let params = merge_params(&self.cashflow_params, inherited);
        if params.is_empty() {
            return Err(ScheduleError::MissingCashflowParams(self.name.clone()));
        }
        let options = options.or_node(self.iter, self.seed, self.ppf);

        let iterations = forecast.iterations();
        let mut lengths = vec![iterations.len()];
        lengths.extend(params.iter().map(|param| param.iter));
        let count = broadcast_len(&lengths)?;

        let freq = forecast.freq();
        let ctx = ResolveContext {
            count,
            seed: options.seed,
            ppf: options.ppf,
            freq,
        };
        let resolved = params
            .iter()
            .map(|param| Ok((param.value.resolve_all(&ctx)?, param.wi.resolve_all(&ctx)?)))
            .collect::<Result<Vec<_>, ScheduleError>>()?;

        let cash_name = cash_name(add_name, &self.name);

        let mut models = Vec::with_capacity(count);
        for i in 0..count {
            let iteration = if iterations.len() == 1 { iterations[0] } else { iterations[i] };
            let rows: Vec<&ForecastRecord> = forecast.rows_for(iteration).collect();
            let span = CashSpan::from_rows(rows.iter().copied(), self.freq_input, freq)?
                .ok_or_else(|| ScheduleError::EmptyForecast(self.name.clone()))?;

            let mut model = CashFlowModel::new(&format!("{}_{i}", self.name));
            for (param, (values, wis)) in params.iter().zip(&resolved) {
                let column = match &param.multiply {
                    Some(column) => match multiply_column(&rows, column) {
                        Some(values) => Some(values),
                        None => {
                            warn!(period = %self.name, param = %param.name, %column, "multiply column not in forecast, skipping");
                            continue;
                        }
                    },
                    None => None,
                };

                let name = format!("{}_{cash_name}", param.name);
                if let Some(mut cashflow) = build_cashflow(param, &name, &values[i], &wis[i], &span, column.as_deref())? {
                    if let Some(freq_output) = options.freq_output.filter(|f| *f != freq) {
                        cashflow = cashflow.with_freq_output(freq_output);
                    }
                    model.push(param.target, cashflow);
                }
            }
            models.push(model);
        }

        debug!(period = %self.name, models = models.len(), "period cashflow generated");
        Ok(self.cashflow.insert(models))
    }
}

impl ScheduleNode for Period {
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
