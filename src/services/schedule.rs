//! Shared plumbing of the Period → Scenario → Well → WellsGroup hierarchy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::cashflow::{CashFlowError, CashFlowModel};
use crate::domain::forecast::{Forecast, ForecastError};
use crate::domain::frequency::Frequency;
use crate::domain::prob_var::ProbVarError;
use crate::domain::time::TimeError;
use crate::services::cashflow_params::{
    CashFlowParams, CashFlowParamsError, CashSpan, ResolveContext, build_cashflow,
};
use crate::services::economics::{NpvRecord, irr_cashflows, npv_cashflows};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScheduleError {
    #[error("{0} has no forecast")]
    MissingForecast(String),
    #[error("{0} has no cashflow")]
    MissingCashflow(String),
    #[error("{0} has no cashflow parameters")]
    MissingCashflowParams(String),
    #[error("{0} produced an empty forecast")]
    EmptyForecast(String),
    #[error("period {period} depends on unknown period {depends}")]
    UnknownDependency { period: String, depends: String },
    #[error("cyclic dependency involving period {0}")]
    CyclicDependency(String),
    #[error("duplicate name {0}")]
    DuplicateName(String),
    #[error("{0} has no children")]
    NoChildren(String),
    #[error("{0} mixes integer and date time modes")]
    MixedTimeModes(String),
    #[error("{0} mixes output frequencies")]
    MixedFrequencies(String),
    #[error("{name}: every child failed ({})", failures.join(", "))]
    AllFailed { name: String, failures: Vec<String> },
    #[error("{name}: cannot broadcast {got} cashflow models to {expected}")]
    Broadcast { name: String, got: usize, expected: usize },
    #[error(transparent)]
    Forecast(#[from] ForecastError),
    #[error(transparent)]
    CashFlow(#[from] CashFlowError),
    #[error(transparent)]
    Params(#[from] CashFlowParamsError),
    #[error(transparent)]
    ProbVar(#[from] ProbVarError),
    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Overrides applied to a whole run. Unset fields fall back to the values
/// stored on each node.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunOptions {
    pub freq_output: Option<Frequency>,
    pub iter: Option<usize>,
    pub seed: Option<u64>,
    pub ppf: Option<f64>,
}

impl RunOptions {
    /// Fills unset fields from a node's own settings.
    pub(crate) fn or_node(&self, iter: usize, seed: Option<u64>, ppf: Option<f64>) -> RunOptions {
        RunOptions {
            freq_output: self.freq_output,
            iter: Some(self.iter.unwrap_or(iter)),
            seed: self.seed.or(seed),
            ppf: self.ppf.or(ppf),
        }
    }
}

/// Start of a period tied to the end of another one. `delay` is in days for
/// dates and in steps for integer time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Depends {
    pub period: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<i64>,
}

/// Read access shared by every level of the hierarchy.
pub trait ScheduleNode {
    fn name(&self) -> &str;

    fn forecast(&self) -> Option<&Forecast>;

    fn cashflow(&self) -> Option<&[CashFlowModel]>;

    fn npv(&self, rates: &[f64], freq_rate: Frequency, freq_cashflow: Frequency) -> Result<Vec<NpvRecord>, ScheduleError> {
        let models = self
            .cashflow()
            .ok_or_else(|| ScheduleError::MissingCashflow(self.name().to_string()))?;
        Ok(npv_cashflows(models, rates, freq_rate, freq_cashflow)?)
    }

    fn irr(&self, freq_output: Option<Frequency>) -> Result<Vec<Option<f64>>, ScheduleError> {
        let models = self
            .cashflow()
            .ok_or_else(|| ScheduleError::MissingCashflow(self.name().to_string()))?;
        Ok(irr_cashflows(models, freq_output)?)
    }
}

/// Fails on the first name seen twice.
pub(crate) fn unique_names<'a, I>(names: I) -> Result<(), ScheduleError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ScheduleError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

/// Records a failing child once, however many steps it fails in.
pub(crate) fn record_failure(failures: &mut Vec<String>, name: &str) {
    if !failures.iter().any(|failed| failed == name) {
        failures.push(name.to_string());
    }
}

/// Name handed to children for their cashflow names.
pub(crate) fn cash_name(add_name: Option<&str>, name: &str) -> String {
    match add_name {
        Some(prefix) => format!("{prefix}-{name}"),
        None => name.to_string(),
    }
}

/// Parameters a node hands to its children: its own non-general parameters
/// followed by inherited ones it does not redefine. General parameters stay
/// on the node.
pub(crate) fn split_params(own: &[CashFlowParams], inherited: &[CashFlowParams]) -> (Vec<CashFlowParams>, Vec<CashFlowParams>) {
    let merged = merge_params(own, inherited);
    merged.into_iter().partition(|param| !param.general)
}

/// `own` followed by the inherited parameters whose names `own` lacks.
pub(crate) fn merge_params(own: &[CashFlowParams], inherited: &[CashFlowParams]) -> Vec<CashFlowParams> {
    let mut merged = own.to_vec();
    merged.extend(
        inherited
            .iter()
            .filter(|param| !own.iter().any(|p| p.name == param.name))
            .cloned(),
    );
    merged
}

/// Appends `child` models into `models`, repeating a single child model across
/// every iteration.
pub(crate) fn broadcast_append(
    name: &str,
    models: &mut [CashFlowModel],
    child: &[CashFlowModel],
) -> Result<(), ScheduleError> {
    match child.len() {
        1 => models.iter_mut().for_each(|model| model.append(&child[0])),
        len if len == models.len() => models
            .iter_mut()
            .zip(child)
            .for_each(|(model, child)| model.append(child)),
        len => {
            return Err(ScheduleError::Broadcast {
                name: name.to_string(),
                got: len,
                expected: models.len(),
            });
        }
    }
    Ok(())
}

/// Cashflow models of a node's general parameters, one per iteration, laid
/// over the node's whole forecast.
pub(crate) fn general_models(
    name: &str,
    params: &[CashFlowParams],
    forecast: &Forecast,
    freq_input: Frequency,
    count: usize,
    options: &RunOptions,
) -> Result<Vec<CashFlowModel>, ScheduleError> {
    let span = CashSpan::from_rows(forecast.records(), freq_input, forecast.freq())?
        .ok_or_else(|| ScheduleError::EmptyForecast(name.to_string()))?;
    let ctx = ResolveContext {
        count,
        seed: options.seed,
        ppf: options.ppf,
        freq: span.freq,
    };

    let mut models: Vec<CashFlowModel> = (0..count)
        .map(|_| CashFlowModel::new(&format!("{name}_general")))
        .collect();
    for param in params {
        let values = param.value.resolve_all(&ctx)?;
        let wis = param.wi.resolve_all(&ctx)?;
        for (i, model) in models.iter_mut().enumerate() {
            if let Some(cashflow) = build_cashflow(param, &param.name, &values[i], &wis[i], &span, None)? {
                model.push(param.target, cashflow);
            }
        }
    }
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cashflow::Target;
    use crate::services::cashflow_params::ParamValue;

    fn param(name: &str, general: bool) -> CashFlowParams {
        let param = CashFlowParams::new(name, ParamValue::Scalar(1.0), Target::Opex).unwrap();
        if general { param.as_general() } else { param }
    }

    #[test]
    fn children_keep_their_own_parameters() {
        let own = vec![param("opex", false)];
        let inherited = vec![param("opex", false), param("price", false)];
        let merged = merge_params(&own, &inherited);
        let names: Vec<&str> = merged.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["opex", "price"]);
    }

    #[test]
    fn general_parameters_stay_on_the_node() {
        let (pass, general) = split_params(&[param("tax", true), param("opex", false)], &[]);
        assert_eq!(pass.len(), 1);
        assert_eq!(general[0].name, "tax");
    }

    #[test]
    fn single_models_broadcast_and_mismatches_fail() {
        let mut models = vec![CashFlowModel::new("a"), CashFlowModel::new("b")];
        let mut child = CashFlowModel::new("c");
        child.push(
            Target::Opex,
            crate::domain::cashflow::CashFlow::new(
                "x",
                crate::domain::cashflow::CashValue::Constant(1.0),
                crate::domain::time::TimeValue::Int(0),
                crate::domain::time::TimeValue::Int(2),
                Frequency::Monthly,
            )
            .unwrap(),
        );
        broadcast_append("s", &mut models, std::slice::from_ref(&child)).unwrap();
        assert!(models.iter().all(|m| m.opex.len() == 1));

        let error = broadcast_append("s", &mut models, &[child.clone(), child.clone(), child]).unwrap_err();
        assert_eq!(
            error,
            ScheduleError::Broadcast {
                name: "s".to_string(),
                got: 3,
                expected: 2
            }
        );
    }
}
