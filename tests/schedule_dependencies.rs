use dcaforecast::domain::frequency::Frequency;
use dcaforecast::services::decline::DeclineCurve;
use dcaforecast::services::schedule::{RunOptions, ScheduleNode};
use dcaforecast::services::schedule_yaml::{ScheduleModel, model_from_str};

const SCENARIO_YAML: &str = r#"
name: base
iter: 10
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
    cashflow_params:
      - name: capex
        value:
          date: [2021-01-01]
          value: [-5000000]
        target: capex
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
      - name: wo
        value: -500000
        target: capex
        periods: 1
      - name: abandon
        value: -300000
        target: capex
        periods: -1
cashflow_params:
  - name: fix_opex
    value: -5000
    target: opex
    freq_value: M
  - name: var_opex
    value: -5
    target: opex
    multiply: oil_volume
  - name: income
    value: 60
    target: income
    multiply: oil_volume
"#;

fn scenario_model() -> ScheduleModel {
    model_from_str(SCENARIO_YAML).unwrap()
}

#[test]
fn dependent_period_is_anchored_at_each_iteration_end() {
    let mut model = scenario_model();
    let forecast = model.generate_forecast(&RunOptions::default()).unwrap();
    assert_eq!(forecast.iteration_count(), 10);
    assert_eq!(forecast.freq(), Frequency::Annual);

    let ScheduleModel::Scenario(scenario) = &model else {
        panic!("expected a scenario");
    };
    let ends = scenario.period("pdp").unwrap().end_times().unwrap();
    assert_eq!(ends.len(), 10);
    let pud = scenario.period("pud").unwrap();
    assert_eq!(pud.dca.anchor().values(), ends.as_slice());

    let pud_forecast = pud.forecast().unwrap();
    for (iteration, end) in ends.iter().enumerate() {
        let first = pud_forecast.rows_for(iteration).map(|row| row.time).min();
        assert_eq!(first, Some(*end));
    }
}

#[test]
fn seeded_runs_are_reproducible() {
    let mut first = scenario_model();
    let mut second = scenario_model();
    let a = first.generate_forecast(&RunOptions::default()).unwrap().clone();
    let b = second.generate_forecast(&RunOptions::default()).unwrap().clone();
    assert_eq!(a.records(), b.records());

    let mut reseeded = scenario_model();
    let options = RunOptions {
        seed: Some(7),
        ..RunOptions::default()
    };
    let c = reseeded.generate_forecast(&options).unwrap();
    assert_ne!(a.records(), c.records());
}

#[test]
fn scenario_cashflow_yields_one_model_per_iteration() {
    let mut model = scenario_model();
    model.generate_forecast(&RunOptions::default()).unwrap();
    let models = model.generate_cashflow(&RunOptions::default()).unwrap();
    assert_eq!(models.len(), 10);
    for cashflow in models {
        // drilling capex, workover and abandonment
        assert_eq!(cashflow.capex.len(), 3);
        // fixed and variable opex of both periods
        assert_eq!(cashflow.opex.len(), 4);
        assert_eq!(cashflow.income.len(), 2);
    }

    let npv = model.npv(&[0.1, 0.15], Frequency::Annual, Frequency::Annual).unwrap();
    assert_eq!(npv.len(), 20);
    for pair in npv.chunks(2) {
        assert!(pair[1].npv < pair[0].npv);
    }
    assert!(model.failures().is_empty());
}

#[test]
fn percentile_runs_collapse_distributions() {
    let mut model = scenario_model();
    let options = RunOptions {
        ppf: Some(0.5),
        ..RunOptions::default()
    };
    let forecast = model.generate_forecast(&options).unwrap();
    assert_eq!(forecast.iteration_count(), 1);
}
