use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use tracing::{debug, warn};

use crate::domain::cashflow::CashFlowModel;
use crate::domain::forecast::Forecast;
use crate::domain::frequency::Frequency;
use crate::domain::time::{TimeAnchor, TimeMode};
use crate::services::cashflow_params::CashFlowParams;
use crate::services::period::Period;
use crate::services::schedule::{
    RunOptions, ScheduleError, ScheduleNode, broadcast_append, cash_name, general_models, record_failure,
    split_params, unique_names,
};

/// Periods of one development plan. Every period shares the time mode and
/// output frequency of the first one.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: String,
    periods: Vec<Period>,
    pub cashflow_params: Vec<CashFlowParams>,
    pub iter: Option<usize>,
    pub seed: Option<u64>,
    pub ppf: Option<f64>,
    forecast: Option<Forecast>,
    cashflow: Option<Vec<CashFlowModel>>,
    included: Vec<usize>,
    failures: Vec<String>,
}

impl Scenario {
    pub fn new(name: &str, periods: Vec<Period>) -> Result<Self, ScheduleError> {
        let first = periods
            .first()
            .ok_or_else(|| ScheduleError::NoChildren(name.to_string()))?;
        unique_names(periods.iter().map(|period| period.name.as_str()))?;
        if periods.iter().any(|period| period.time_mode() != first.time_mode()) {
            return Err(ScheduleError::MixedTimeModes(name.to_string()));
        }
        if periods.iter().any(|period| period.freq_output != first.freq_output) {
            return Err(ScheduleError::MixedFrequencies(name.to_string()));
        }

        Ok(Self {
            name: name.to_string(),
            periods,
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

    pub fn with_iter(mut self, iter: usize) -> Self {
        self.iter = Some(iter);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    pub fn period(&self, name: &str) -> Option<&Period> {
        self.periods.iter().find(|period| period.name == name)
    }

    /// Names of the periods that failed in the last run.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn time_mode(&self) -> TimeMode {
        self.periods[0].time_mode()
    }

    pub fn freq_output(&self) -> Frequency {
        self.periods[0].freq_output
    }

    pub(crate) fn freq_input(&self) -> Frequency {
        self.periods[0].freq_input
    }

    fn run_options(&self, options: &RunOptions) -> RunOptions {
        RunOptions {
            freq_output: options.freq_output,
            iter: options.iter.or(self.iter),
            seed: options.seed.or(self.seed),
            ppf: options.ppf.or(self.ppf),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.periods.iter().position(|period| period.name == name)
    }

    /// Period indices ordered so that every period comes after the one it
    /// depends on. Independent periods keep their declaration order.
    pub fn dependency_order(&self) -> Result<Vec<usize>, ScheduleError> {
        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();
        for (i, period) in self.periods.iter().enumerate() {
            indices.insert(period.name.as_str(), graph.add_node(i));
        }

        let mut parents: Vec<Option<usize>> = vec![None; self.periods.len()];
        for (i, period) in self.periods.iter().enumerate() {
            if let Some(depends) = &period.depends {
                let dep_idx = *indices
                    .get(depends.period.as_str())
                    .ok_or_else(|| ScheduleError::UnknownDependency {
                        period: period.name.clone(),
                        depends: depends.period.clone(),
                    })?;
                graph.add_edge(dep_idx, indices[period.name.as_str()], ());
                parents[i] = Some(graph[dep_idx]);
            }
        }

        toposort(&graph, None)
            .map_err(|cycle| ScheduleError::CyclicDependency(self.periods[graph[cycle.node_id()]].name.clone()))?;

        let depth = |mut i: usize| {
            let mut depth = 0;
            while let Some(parent) = parents[i] {
                depth += 1;
                i = parent;
            }
            depth
        };
        let mut order: Vec<usize> = (0..self.periods.len()).collect();
        order.sort_by_key(|i| depth(*i));
        Ok(order)
    }

    /// Selected periods plus every period they transitively depend on.
    fn required(&self, filter: Option<&[String]>) -> (HashSet<usize>, HashSet<usize>) {
        let selected: HashSet<usize> = match filter {
            Some(names) => names
                .iter()
                .filter_map(|name| {
                    let position = self.position(name);
                    if position.is_none() {
                        warn!(scenario = %self.name, period = %name, "unknown period in filter");
                    }
                    position
                })
                .collect(),
            None => (0..self.periods.len()).collect(),
        };

        let mut required = selected.clone();
        let mut pending: Vec<usize> = selected.iter().copied().collect();
        while let Some(i) = pending.pop() {
            let parent = self.periods[i]
                .depends
                .as_ref()
                .and_then(|depends| self.position(&depends.period));
            if let Some(parent) = parent {
                if required.insert(parent) {
                    pending.push(parent);
                }
            }
        }
        (selected, required)
    }

    /// Forecasts the periods in dependency order. A dependent period is
    /// anchored at the per-iteration end of the period it depends on, shifted
    /// by the delay. Failing periods are logged and recorded; the run fails
    /// only when no selected period succeeds.
    pub fn generate_forecast(
        &mut self,
        options: &RunOptions,
        filter: Option<&[String]>,
    ) -> Result<&Forecast, ScheduleError> {
        let options = self.run_options(options);
        let order = self.dependency_order()?;
        let (selected, required) = self.required(filter);

        self.failures.clear();
        self.included.clear();
        let mut failed: HashSet<usize> = HashSet::new();
        let mut forecasts = Vec::new();
        for i in order.into_iter().filter(|i| required.contains(i)) {
            match self.forecast_period(i, &options, &failed) {
                Ok(forecast) => {
                    if selected.contains(&i) {
                        self.included.push(i);
                        forecasts.push(forecast);
                    }
                }
                Err(error) => {
                    warn!(scenario = %self.name, period = %self.periods[i].name, %error, "period forecast failed");
                    failed.insert(i);
                    record_failure(&mut self.failures, &self.periods[i].name);
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
        forecast.stamp_scenario(&self.name);
        debug!(scenario = %self.name, rows = forecast.len(), "scenario forecast generated");
        self.cashflow = None;
        Ok(self.forecast.insert(forecast))
    }

    fn forecast_period(
        &mut self,
        i: usize,
        options: &RunOptions,
        failed: &HashSet<usize>,
    ) -> Result<Forecast, ScheduleError> {
        if let Some(depends) = self.periods[i].depends.clone() {
            let dep = self
                .position(&depends.period)
                .ok_or_else(|| ScheduleError::UnknownDependency {
                    period: self.periods[i].name.clone(),
                    depends: depends.period.clone(),
                })?;
            if failed.contains(&dep) {
                return Err(ScheduleError::MissingForecast(depends.period));
            }
            let delay = depends.delay.unwrap_or(0);
            let ends = self.periods[dep].end_times()?;
            let shifted = ends
                .iter()
                .map(|end| end.shifted(delay))
                .collect::<Result<Vec<_>, _>>()?;
            let anchor = TimeAnchor::new(shifted)?;
            debug!(period = %self.periods[i].name, depends = %depends.period, anchors = anchor.len(), "dependent period anchored");
            self.periods[i].set_anchor(anchor);
        }
        Ok(self.periods[i].generate_forecast(options)?.clone())
    }

    /// One model per iteration, `N` being the largest model count among the
    /// periods. Periods with a single model are repeated across all `N`.
    /// General parameters are laid over the whole scenario forecast.
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
            let period = &mut self.periods[i];
            match period.generate_cashflow(&options, Some(&cash_name), &pass) {
                Ok(models) => children.push(models.to_vec()),
                Err(error) => {
                    warn!(scenario = %self.name, period = %period.name, %error, "period cashflow failed");
                    record_failure(&mut self.failures, &period.name);
                }
            }
        }
        if children.is_empty() && general.is_empty() {
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
            let extra = general_models(&self.name, &general, forecast, self.freq_input(), count, &options)?;
            broadcast_append(&self.name, &mut models, &extra)?;
        }

        debug!(scenario = %self.name, models = models.len(), "scenario cashflow generated");
        Ok(self.cashflow.insert(models))
    }
}

impl ScheduleNode for Scenario {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cashflow::Target;
    use crate::domain::prob_var::ProbVar;
    use crate::domain::time::TimeValue;
    use crate::services::arps::Arps;
    use crate::services::cashflow_params::ParamValue;
    use crate::services::decline::{Decline, DeclineCurve};
    use crate::services::schedule::Depends;
    use crate::test_support::{arps_period, date};

    fn monthly_arps(qi: ProbVar, di: f64, ti: TimeValue) -> Decline {
        Decline::Arps(
            Arps::new(qi, ProbVar::fixed(di), ProbVar::fixed(0.0), TimeAnchor::single(ti))
                .with_freq_di(Frequency::Monthly),
        )
    }

    fn developed(name: &str) -> Period {
        Period::new(
            name,
            monthly_arps(ProbVar::array(vec![1500.0, 1000.0]).unwrap(), 0.1, date(2021, 1, 1)),
        )
        .between(date(2021, 1, 1), date(2026, 1, 1))
        .with_freqs(Frequency::Daily, Frequency::Monthly)
        .with_rate_limit(300.0)
    }

    fn undeveloped(name: &str, depends: &str, delay: Option<i64>) -> Period {
        Period::new(name, monthly_arps(ProbVar::fixed(3000.0), 0.05, date(2022, 1, 1)))
            .between(date(2021, 1, 1), date(2026, 1, 1))
            .with_freqs(Frequency::Daily, Frequency::Monthly)
            .with_rate_limit(300.0)
            .with_depends(Depends {
                period: depends.to_string(),
                delay,
            })
    }

    fn broken(name: &str) -> Period {
        arps_period(name).between(date(2021, 1, 1), date(2021, 1, 1))
    }

    #[test]
    fn dependent_period_starts_where_its_dependency_ends() {
        let mut scenario = Scenario::new(
            "base",
            vec![undeveloped("pud", "pdp", None), developed("pdp")],
        )
        .unwrap();
        scenario.generate_forecast(&RunOptions::default(), None).unwrap();

        let ends = scenario.period("pdp").unwrap().end_times().unwrap();
        assert_eq!(ends.len(), 2);
        assert_ne!(ends[0], ends[1]);
        let pud = scenario.period("pud").unwrap();
        assert_eq!(pud.dca.anchor().values(), ends.as_slice());

        let forecast = pud.forecast().unwrap();
        for (iteration, end) in ends.iter().enumerate() {
            let first = forecast.rows_for(iteration).map(|row| row.time).min();
            assert_eq!(first, Some(*end));
        }
    }

    #[test]
    fn delay_shifts_the_dependent_anchor() {
        let mut scenario = Scenario::new(
            "base",
            vec![developed("pdp"), undeveloped("pud", "pdp", Some(31))],
        )
        .unwrap();
        scenario.generate_forecast(&RunOptions::default(), None).unwrap();

        let ends = scenario.period("pdp").unwrap().end_times().unwrap();
        let shifted: Vec<TimeValue> = ends.iter().map(|end| end.shifted(31).unwrap()).collect();
        assert_eq!(scenario.period("pud").unwrap().dca.anchor().values(), shifted.as_slice());
    }

    #[test]
    fn out_of_range_delay_fails_the_dependent_period() {
        let mut scenario = Scenario::new(
            "base",
            vec![developed("pdp"), undeveloped("pud", "pdp", Some(i64::MAX))],
        )
        .unwrap();
        scenario.generate_forecast(&RunOptions::default(), None).unwrap();
        assert_eq!(scenario.failures(), ["pud".to_string()]);
        assert!(scenario.period("pud").unwrap().forecast().is_none());
    }

    #[test]
    fn forecast_is_stamped_and_concatenated() {
        let mut scenario = Scenario::new("base", vec![developed("pdp"), undeveloped("pud", "pdp", None)]).unwrap();
        let forecast = scenario.generate_forecast(&RunOptions::default(), None).unwrap();
        assert!(forecast.records().iter().all(|r| r.scenario.as_deref() == Some("base")));
        let periods: HashSet<&str> = forecast.records().iter().filter_map(|r| r.period.as_deref()).collect();
        assert_eq!(periods, HashSet::from(["pdp", "pud"]));
    }

    #[test]
    fn filter_forecasts_dependencies_but_reports_selection_only() {
        let mut scenario = Scenario::new("base", vec![developed("pdp"), undeveloped("pud", "pdp", None)]).unwrap();
        let filter = vec!["pud".to_string()];
        let forecast = scenario
            .generate_forecast(&RunOptions::default(), Some(filter.as_slice()))
            .unwrap();
        assert!(forecast.records().iter().all(|r| r.period.as_deref() == Some("pud")));
        assert!(scenario.period("pdp").unwrap().forecast().is_some());
    }

    #[test]
    fn cycles_and_unknown_dependencies_are_rejected() {
        let scenario = Scenario::new(
            "loop",
            vec![undeveloped("a", "b", None), undeveloped("b", "a", None)],
        )
        .unwrap();
        assert!(matches!(scenario.dependency_order(), Err(ScheduleError::CyclicDependency(_))));

        let scenario = Scenario::new("lonely", vec![undeveloped("a", "ghost", None)]).unwrap();
        assert_eq!(
            scenario.dependency_order().unwrap_err(),
            ScheduleError::UnknownDependency {
                period: "a".to_string(),
                depends: "ghost".to_string()
            }
        );
    }

    #[test]
    fn construction_checks_names_modes_and_frequencies() {
        assert_eq!(
            Scenario::new("s", vec![arps_period("p"), arps_period("p")]).unwrap_err(),
            ScheduleError::DuplicateName("p".to_string())
        );
        let daily = arps_period("d").with_freqs(Frequency::Daily, Frequency::Daily);
        assert_eq!(
            Scenario::new("s", vec![arps_period("m"), daily]).unwrap_err(),
            ScheduleError::MixedFrequencies("s".to_string())
        );
        let numbered = Period::new("n", monthly_arps(ProbVar::fixed(100.0), 0.1, TimeValue::Int(0)))
            .between(TimeValue::Int(0), TimeValue::Int(12))
            .with_freqs(Frequency::Monthly, Frequency::Monthly);
        assert_eq!(
            Scenario::new("s", vec![arps_period("m"), numbered]).unwrap_err(),
            ScheduleError::MixedTimeModes("s".to_string())
        );
        assert_eq!(
            Scenario::new("s", Vec::new()).unwrap_err(),
            ScheduleError::NoChildren("s".to_string())
        );
    }

    #[test]
    fn failing_periods_are_recorded_and_the_rest_continue() {
        let mut scenario = Scenario::new("base", vec![broken("bad"), arps_period("good")]).unwrap();
        let forecast = scenario.generate_forecast(&RunOptions::default(), None).unwrap();
        assert!(!forecast.is_empty());
        assert_eq!(scenario.failures(), ["bad".to_string()]);

        let mut scenario = Scenario::new("base", vec![broken("bad")]).unwrap();
        let error = scenario.generate_forecast(&RunOptions::default(), None).unwrap_err();
        assert_eq!(
            error,
            ScheduleError::AllFailed {
                name: "base".to_string(),
                failures: vec!["bad".to_string()]
            }
        );
    }

    #[test]
    fn dependents_of_failed_periods_fail_too() {
        let mut dependent = arps_period("after");
        dependent.depends = Some(Depends {
            period: "bad".to_string(),
            delay: None,
        });
        let mut scenario = Scenario::new("base", vec![broken("bad"), dependent, arps_period("good")]).unwrap();
        scenario.generate_forecast(&RunOptions::default(), None).unwrap();
        assert_eq!(scenario.failures(), ["bad".to_string(), "after".to_string()]);
    }

    #[test]
    fn cashflow_broadcasts_periods_and_adds_general_parameters() {
        let params = vec![
            CashFlowParams::new("income", ParamValue::Scalar(60.0), Target::Income)
                .unwrap()
                .multiplied_by("oil_volume"),
            CashFlowParams::new("overhead", ParamValue::Scalar(-1000.0), Target::Opex)
                .unwrap()
                .as_general(),
        ];
        let mut scenario = Scenario::new("base", vec![arps_period("p1"), developed("pdp")])
            .unwrap()
            .with_cashflow_params(params);
        scenario.generate_forecast(&RunOptions::default(), None).unwrap();
        let models = scenario.generate_cashflow(&RunOptions::default(), None, &[]).unwrap();

        assert_eq!(models.len(), 2);
        assert_eq!(models[1].name, "base_1");
        for model in models {
            assert_eq!(model.income.len(), 2);
            assert_eq!(model.opex.len(), 1);
            assert_eq!(model.opex[0].name, "overhead");
        }
        assert_eq!(models[0].income[0].name, "income_base-p1");

        let npv = scenario.npv(&[0.1], Frequency::Annual, Frequency::Monthly).unwrap();
        assert_eq!(npv.len(), 2);
        assert!(npv[0].npv > npv[1].npv);
    }

    #[test]
    fn a_period_failing_again_is_listed_once() {
        let priced = arps_period("priced").with_cashflow_params(vec![
            CashFlowParams::new("income", ParamValue::Scalar(60.0), Target::Income)
                .unwrap()
                .multiplied_by("oil_volume"),
        ]);
        let mut scenario = Scenario::new("base", vec![priced, arps_period("bare")]).unwrap();
        scenario.generate_forecast(&RunOptions::default(), None).unwrap();
        assert!(scenario.failures().is_empty());

        scenario.generate_cashflow(&RunOptions::default(), None, &[]).unwrap();
        let models = scenario.generate_cashflow(&RunOptions::default(), None, &[]).unwrap();
        assert_eq!(models.len(), 1);
        assert_eq!(scenario.failures(), ["bare".to_string()]);
    }

    #[test]
    fn cashflow_requires_a_forecast() {
        let mut scenario = Scenario::new("base", vec![arps_period("p1")]).unwrap();
        assert_eq!(
            scenario.generate_cashflow(&RunOptions::default(), None, &[]).unwrap_err(),
            ScheduleError::MissingForecast("base".to_string())
        );
    }
}
