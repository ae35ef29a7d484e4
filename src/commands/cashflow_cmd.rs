use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;

use crate::commands::base_commands::{CommandError, RunArgs};
use crate::commands::report_format::format_economics_report;
use dcaforecast::domain::frequency::Frequency;
use dcaforecast::services::economics::{EconomicsReport, summarize_npv};
use dcaforecast::services::schedule::ScheduleNode;
use dcaforecast::services::schedule_yaml::{load_model_from_yaml_file, serialize_cashflow_to_yaml};

pub struct CashflowArgs<'a> {
    pub input: &'a str,
    pub output: &'a str,
    pub run: &'a RunArgs,
    pub rates: &'a [f64],
    pub freq_rate: Frequency,
    pub freq_cashflow: Option<Frequency>,
    pub json: bool,
}

/// Runs the model, writes the free cash flow tables and returns the printed
/// report.
pub fn cashflow_command(args: &CashflowArgs<'_>) -> Result<String, CommandError> {
    let mut model = load_model_from_yaml_file(args.input)?;
    info!(model = %model.name(), kind = model.kind(), "evaluating cash flows");

    let options = args.run.options();
    let freq_forecast = model.generate_forecast(&options)?.freq();
    let freq_cashflow = args.freq_cashflow.unwrap_or(freq_forecast);
    let models = model.generate_cashflow(&options)?.to_vec();

    let file = File::create(args.output).map_err(|source| CommandError::Write {
        path: args.output.to_string(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serialize_cashflow_to_yaml(&mut writer, &models, Some(freq_cashflow))?;
    writer.flush().map_err(|source| CommandError::Write {
        path: args.output.to_string(),
        source,
    })?;

    let npv = model.npv(args.rates, args.freq_rate, freq_cashflow)?;
    let irr = model.irr(Some(freq_cashflow))?;

    let report = EconomicsReport {
        model: model.name().to_string(),
        kind: model.kind().to_string(),
        iterations: models.len(),
        freq_rate: args.freq_rate,
        freq_cashflow,
        npv: summarize_npv(&npv),
        irr,
        failures: model.failures().to_vec(),
    };
    if args.json {
        return Ok(serde_json::to_string_pretty(&report)?);
    }
    Ok(format!(
        "{}\nCash flow tables written to {}",
        format_economics_report(&report),
        args.output
    ))
}
