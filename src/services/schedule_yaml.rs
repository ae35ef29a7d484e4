use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use thiserror::Error;

use crate::domain::cashflow::{CashFlowModel, FcfRow};
use crate::domain::forecast::{Forecast, ForecastRecord};
use crate::domain::frequency::Frequency;
use crate::domain::time::TimeValue;
use crate::services::cashflow_params::CashFlowParams;
use crate::services::decline::{Decline, FitRow, Observation};
use crate::services::period::Period;
use crate::services::scenario::Scenario;
use crate::services::schedule::{Depends, RunOptions, ScheduleError, ScheduleNode};
use crate::services::well::{Well, WellsGroup};

#[derive(Error, Debug)]
pub enum ScheduleYamlError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("model file must be a mapping")]
    NotAMapping,
    #[error("cannot tell the model kind: expected a dca, periods, scenarios or wells key")]
    UnknownModel,
    #[error("{0} entry without a name")]
    MissingName(&'static str),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("failed to write output: {0}")]
    Write(#[from] io::Error),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PeriodRecord {
    #[serde(default)]
    name: Option<String>,
    dca: Decline,
    #[serde(default)]
    start: Option<TimeValue>,
    #[serde(default)]
    end: Option<TimeValue>,
    #[serde(default)]
    time_list: Option<Vec<TimeValue>>,
    #[serde(default = "daily")]
    freq_input: Frequency,
    #[serde(default = "daily")]
    freq_output: Frequency,
    #[serde(default)]
    rate_limit: Option<f64>,
    #[serde(default)]
    cum_limit: Option<f64>,
    #[serde(default)]
    depends: Option<Depends>,
    #[serde(default)]
    cashflow_params: Vec<CashFlowParams>,
    #[serde(default = "one")]
    iter: usize,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    ppf: Option<f64>,
}

/// Fields shared by scenarios, wells and groups, read once their children
/// have been taken out.
#[derive(Deserialize)]
struct NodeRecord {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    cashflow_params: Vec<CashFlowParams>,
    #[serde(default)]
    iter: Option<usize>,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    ppf: Option<f64>,
}

fn daily() -> Frequency {
    Frequency::Daily
}

fn one() -> usize {
    1
}

/// A model file of any level of the hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub enum ScheduleModel {
    Period(Period),
    Scenario(Scenario),
    Well(Well),
    WellsGroup(WellsGroup),
}

impl ScheduleModel {
    pub fn kind(&self) -> &'static str {
        match self {
            ScheduleModel::Period(_) => "period",
            ScheduleModel::Scenario(_) => "scenario",
            ScheduleModel::Well(_) => "well",
            ScheduleModel::WellsGroup(_) => "wells group",
        }
    }

    pub fn generate_forecast(&mut self, options: &RunOptions) -> Result<&Forecast, ScheduleError> {
        match self {
            ScheduleModel::Period(period) => period.generate_forecast(options),
            ScheduleModel::Scenario(scenario) => scenario.generate_forecast(options, None),
            ScheduleModel::Well(well) => well.generate_forecast(options, None),
            ScheduleModel::WellsGroup(group) => group.generate_forecast(options, None),
        }
    }

    pub fn generate_cashflow(&mut self, options: &RunOptions) -> Result<&[CashFlowModel], ScheduleError> {
        match self {
            ScheduleModel::Period(period) => period.generate_cashflow(options, None, &[]),
            ScheduleModel::Scenario(scenario) => scenario.generate_cashflow(options, None, &[]),
            ScheduleModel::Well(well) => well.generate_cashflow(options, None, &[]),
            ScheduleModel::WellsGroup(group) => group.generate_cashflow(options, None, &[]),
        }
    }

    /// Children that failed in the last run.
    pub fn failures(&self) -> &[String] {
        match self {
            ScheduleModel::Period(_) => &[],
            ScheduleModel::Scenario(scenario) => scenario.failures(),
            ScheduleModel::Well(well) => well.failures(),
            ScheduleModel::WellsGroup(group) => group.failures(),
        }
    }

    fn node(&self) -> &dyn ScheduleNode {
        match self {
            ScheduleModel::Period(period) => period,
            ScheduleModel::Scenario(scenario) => scenario,
            ScheduleModel::Well(well) => well,
            ScheduleModel::WellsGroup(group) => group,
        }
    }
}

impl ScheduleNode for ScheduleModel {
    fn name(&self) -> &str {
        self.node().name()
    }

    fn forecast(&self) -> Option<&Forecast> {
        self.node().forecast()
    }

    fn cashflow(&self) -> Option<&[CashFlowModel]> {
        self.node().cashflow()
    }
}

pub fn load_model_from_yaml_file<P: AsRef<Path>>(path: P) -> Result<ScheduleModel, ScheduleYamlError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ScheduleYamlError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    model_from_str(&contents)
}

/// Parses a model file, telling its level from the keys it carries.
pub fn model_from_str(input: &str) -> Result<ScheduleModel, ScheduleYamlError> {
    let value: Value = serde_yaml::from_str(input)?;
    let mapping = value.as_mapping().ok_or(ScheduleYamlError::NotAMapping)?;
    let kind = ["dca", "periods", "scenarios", "wells"]
        .into_iter()
        .find(|key| mapping.contains_key(*key));

    match kind {
        Some("dca") => Ok(ScheduleModel::Period(period_from_value(None, value)?)),
        Some("periods") => Ok(ScheduleModel::Scenario(scenario_from_value(None, value)?)),
        Some("scenarios") => Ok(ScheduleModel::Well(well_from_value(None, value)?)),
        Some("wells") => Ok(ScheduleModel::WellsGroup(group_from_value(None, value)?)),
        _ => Err(ScheduleYamlError::UnknownModel),
    }
}

pub fn period_from_str(input: &str) -> Result<Period, ScheduleYamlError> {
    period_from_value(None, serde_yaml::from_str(input)?)
}

fn period_from_value(key: Option<String>, value: Value) -> Result<Period, ScheduleYamlError> {
    let record: PeriodRecord = serde_yaml::from_value(value)?;
    let name = record.name.or(key).ok_or(ScheduleYamlError::MissingName("period"))?;

    let mut period = Period::new(&name, record.dca);
    period.start = record.start;
    period.end = record.end;
    period.time_list = record.time_list;
    period.freq_input = record.freq_input;
    period.freq_output = record.freq_output;
    period.rate_limit = record.rate_limit;
    period.cum_limit = record.cum_limit;
    period.depends = record.depends;
    period.cashflow_params = record.cashflow_params;
    period.iter = record.iter;
    period.seed = record.seed;
    period.ppf = record.ppf;
    Ok(period)
}

/// Splits a node into its shared fields and its children, named after
/// their mapping key when the children come as a mapping.
fn split_node(
    value: Value,
    children_key: &str,
    kind: &'static str,
    key: Option<String>,
) -> Result<(String, NodeRecord, Vec<(Option<String>, Value)>), ScheduleYamlError> {
    let Value::Mapping(mut mapping) = value else {
        return Err(ScheduleYamlError::NotAMapping);
    };
    let children = match mapping.remove(children_key) {
        Some(Value::Sequence(items)) => items.into_iter().map(|item| (None, item)).collect(),
        Some(Value::Mapping(items)) => named_entries(items)?,
        _ => Vec::new(),
    };
    let record: NodeRecord = serde_yaml::from_value(Value::Mapping(mapping))?;
    let name = record.name.clone().or(key).ok_or(ScheduleYamlError::MissingName(kind))?;
    Ok((name, record, children))
}

fn named_entries(items: Mapping) -> Result<Vec<(Option<String>, Value)>, ScheduleYamlError> {
    items
        .into_iter()
        .map(|(key, item)| {
            let key: String = serde_yaml::from_value(key)?;
            Ok((Some(key), item))
        })
        .collect()
}

fn scenario_from_value(key: Option<String>, value: Value) -> Result<Scenario, ScheduleYamlError> {
    let (name, record, children) = split_node(value, "periods", "scenario", key)?;
    let periods = children
        .into_iter()
        .map(|(key, item)| period_from_value(key, item))
        .collect::<Result<Vec<_>, _>>()?;

    let mut scenario = Scenario::new(&name, periods)?.with_cashflow_params(record.cashflow_params);
    scenario.iter = record.iter;
    scenario.seed = record.seed;
    scenario.ppf = record.ppf;
    Ok(scenario)
}

fn well_from_value(key: Option<String>, value: Value) -> Result<Well, ScheduleYamlError> {
    let (name, record, children) = split_node(value, "scenarios", "well", key)?;
    let scenarios = children
        .into_iter()
        .map(|(key, item)| scenario_from_value(key, item))
        .collect::<Result<Vec<_>, _>>()?;

    let mut well = Well::new(&name, scenarios)?.with_cashflow_params(record.cashflow_params);
    well.iter = record.iter;
    well.seed = record.seed;
    well.ppf = record.ppf;
    Ok(well)
}

fn group_from_value(key: Option<String>, value: Value) -> Result<WellsGroup, ScheduleYamlError> {
    let (name, record, children) = split_node(value, "wells", "well", key)?;
    let wells = children
        .into_iter()
        .map(|(key, item)| well_from_value(key, item))
        .collect::<Result<Vec<_>, _>>()?;

    let mut group = WellsGroup::new(&name, wells)?.with_cashflow_params(record.cashflow_params);
    group.iter = record.iter;
    group.seed = record.seed;
    group.ppf = record.ppf;
    Ok(group)
}

/// Reads observed production as a YAML sequence of `{time, oil_rate,
/// oil_cum, bsw}` rows.
pub fn load_observations_from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Vec<Observation>, ScheduleYamlError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).map_err(|source| ScheduleYamlError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_yaml::from_str(&contents)?)
}

#[derive(Serialize)]
struct FitRecord<'a> {
    dca: &'a Decline,
    rows: &'a [FitRow],
}

/// Writes a fitted decline model together with the smoothed input and its
/// outlier flags.
pub fn serialize_fit_to_yaml<W: Write>(writer: &mut W, dca: &Decline, rows: &[FitRow]) -> Result<(), ScheduleYamlError> {
    let yaml = serde_yaml::to_string(&FitRecord { dca, rows })?;
    writer.write_all(yaml.as_bytes())?;
    Ok(())
}

/// Writes forecast rows as a flat YAML sequence.
pub fn serialize_forecast_to_yaml<W: Write>(writer: &mut W, forecast: &Forecast) -> Result<(), ScheduleYamlError> {
    let yaml = serde_yaml::to_string(forecast.records())?;
    writer.write_all(yaml.as_bytes())?;
    Ok(())
}

pub fn deserialize_forecast_from_yaml_str(input: &str, freq: Frequency) -> Result<Forecast, ScheduleYamlError> {
    let records: Vec<ForecastRecord> = serde_yaml::from_str(input)?;
    Ok(Forecast::new(freq, records))
}

#[derive(Serialize)]
struct FcfTableRecord<'a> {
    model: &'a str,
    rows: Vec<FcfRow>,
}

/// Writes the free cash flow table of every model.
pub fn serialize_cashflow_to_yaml<W: Write>(
    writer: &mut W,
    models: &[CashFlowModel],
    freq_output: Option<Frequency>,
) -> Result<(), ScheduleYamlError> {
    let tables = models
        .iter()
        .map(|model| {
            Ok(FcfTableRecord {
                model: &model.name,
                rows: model.fcf(freq_output).map_err(ScheduleError::from)?,
            })
        })
        .collect::<Result<Vec<_>, ScheduleYamlError>>()?;
    let yaml = serde_yaml::to_string(&tables)?;
    writer.write_all(yaml.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::cashflow::Target;
    use crate::services::cashflow_params::ParamValue;
    use crate::services::decline::DeclineCurve;
    use crate::test_support::date;

    const PERIOD: &str = r#"
name: pdp
dca:
  qi: 700
  di: 0.3
  b: 0
  ti: 2021-01-01
  freq_di: A
  fluid_rate: 250
start: 2021-01-01
end: 2022-01-01
freq_output: M
rate_limit: 70
cashflow_params:
  - name: fix_opex
    value: -5000
    target: opex
    freq_value: M
  - name: income
    value: [20, 30, 40, 60, 80]
    target: income
    multiply: oil_volume
    wi: 0.9
"#;

    const SCENARIO: &str = r#"
name: base
iter: 3
seed: 21
periods:
  pdp:
    dca:
      qi:
        dist: norm
        kw:
          loc: 1500
          scale: 200
      di: 0.025
      freq_di: M
      ti: 2021-01-01
    start: 2021-01-01
    end: 2027-01-01
    freq_output: A
    rate_limit: 300
  pud:
    dca:
      qi: 3000
      di: 0.3
      freq_di: A
      ti: 2022-01-01
    start: 2021-01-01
    end: 2027-01-01
    freq_output: A
    rate_limit: 300
    depends:
      period: pdp
cashflow_params:
  - name: income
    value: 60
    target: income
    multiply: oil_volume
"#;

    #[test]
    fn period_file_is_classified_and_parsed() {
        let model = model_from_str(PERIOD).unwrap();
        let ScheduleModel::Period(period) = &model else {
            panic!("expected a period, got a {}", model.kind());
        };
        assert_eq!(period.name, "pdp");
        assert_eq!(period.freq_output, Frequency::Monthly);
        assert_eq!(period.rate_limit, Some(70.0));
        assert_eq!(period.dca.anchor().values(), [date(2021, 1, 1)]);
        assert_eq!(period.cashflow_params.len(), 2);
        assert_eq!(period.cashflow_params[1].iter, 5);
        assert_eq!(period.cashflow_params[0].target, Target::Opex);
        assert_eq!(period.cashflow_params[1].value, ParamValue::List(vec![20.0, 30.0, 40.0, 60.0, 80.0]));
    }

    #[test]
    fn parsed_period_runs_end_to_end() {
        let mut model = model_from_str(PERIOD).unwrap();
        model.generate_forecast(&RunOptions::default()).unwrap();
        let models = model.generate_cashflow(&RunOptions::default()).unwrap();
        assert_eq!(models.len(), 5);
    }

    #[test]
    fn scenario_children_take_their_mapping_keys_as_names() {
        let model = model_from_str(SCENARIO).unwrap();
        let ScheduleModel::Scenario(scenario) = &model else {
            panic!("expected a scenario, got a {}", model.kind());
        };
        let names: Vec<&str> = scenario.periods().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["pdp", "pud"]);
        assert_eq!(scenario.iter, Some(3));
        assert_eq!(scenario.period("pud").unwrap().depends.as_ref().unwrap().period, "pdp");
    }

    #[test]
    fn scenario_file_runs_with_dependencies() {
        let mut model = model_from_str(SCENARIO).unwrap();
        let forecast = model.generate_forecast(&RunOptions::default()).unwrap();
        assert_eq!(forecast.iteration_count(), 3);
        let models = model.generate_cashflow(&RunOptions::default()).unwrap();
        assert_eq!(models.len(), 3);
        assert!(model.failures().is_empty());
    }

    #[test]
    fn list_children_need_names() {
        let input = r#"
name: base
periods:
  - dca: {qi: 100, di: 0.1, ti: 0}
    end: 10
"#;
        let error = model_from_str(input).unwrap_err();
        assert!(matches!(error, ScheduleYamlError::MissingName("period")));
    }

    #[test]
    fn unknown_files_are_rejected() {
        assert!(matches!(model_from_str("name: x\n").unwrap_err(), ScheduleYamlError::UnknownModel));
        assert!(matches!(model_from_str("- 1\n").unwrap_err(), ScheduleYamlError::NotAMapping));
    }

    #[test]
    fn schedule_errors_surface_through_the_loader() {
        let input = r#"
name: base
periods:
  a:
    dca: {qi: 100, di: 0.1, ti: 0}
    end: 10
    depends: {period: b}
  b:
    dca: {qi: 100, di: 0.1, ti: 0}
    end: 10
    depends: {period: a}
"#;
        let mut model = model_from_str(input).unwrap();
        let error = model.generate_forecast(&RunOptions::default()).unwrap_err();
        assert!(matches!(error, ScheduleError::CyclicDependency(_)));
    }

    #[test]
    fn forecast_rows_round_trip_through_yaml() {
        let mut period = period_from_str(PERIOD).unwrap();
        let forecast = period.generate_forecast(&RunOptions::default()).unwrap().clone();

        let mut buffer = Vec::new();
        serialize_forecast_to_yaml(&mut buffer, &forecast).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("period: pdp"));

        let parsed = deserialize_forecast_from_yaml_str(&text, Frequency::Monthly).unwrap();
        assert_eq!(parsed.len(), forecast.len());
        assert_eq!(parsed.records()[0].time, forecast.records()[0].time);
    }

    #[test]
    fn cashflow_tables_are_written_per_model() {
        let mut model = model_from_str(PERIOD).unwrap();
        model.generate_forecast(&RunOptions::default()).unwrap();
        let models = model.generate_cashflow(&RunOptions::default()).unwrap().to_vec();

        let mut buffer = Vec::new();
        serialize_cashflow_to_yaml(&mut buffer, &models, None).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("model: pdp_0"));
        assert!(text.contains("model: pdp_4"));
        assert!(text.contains("cum_fcf"));
    }

    #[test]
    fn fitted_model_is_written_with_its_rows() {
        let mut period = period_from_str(PERIOD).unwrap();
        let observed: String = (1..=12)
            .map(|day| format!("- time: 2021-03-{day:02}\n  oil_rate: {}\n", 900.0 * (-0.01 * f64::from(day - 1)).exp()))
            .collect();
        let observations: Vec<Observation> = serde_yaml::from_str(&observed).unwrap();
        assert_eq!(observations[0].time, date(2021, 3, 1));

        let rows = period
            .dca
            .fit(
                &observations,
                &crate::services::decline::FitOptions {
                    b: Some(0.0),
                    ..Default::default()
                },
            )
            .unwrap();
        let mut buffer = Vec::new();
        serialize_fit_to_yaml(&mut buffer, &period.dca, &rows).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.starts_with("dca:"));
        assert!(text.contains("rows:"));
        assert_eq!(text.matches("outlier: false").count(), 12);
    }
}
