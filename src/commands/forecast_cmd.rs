use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;

use crate::commands::base_commands::{CommandError, RunArgs};
use dcaforecast::services::schedule::ScheduleNode;
use dcaforecast::services::schedule_yaml::{load_model_from_yaml_file, serialize_forecast_to_yaml};

pub fn forecast_command(input: &str, output: &str, run: &RunArgs) -> Result<String, CommandError> {
    let mut model = load_model_from_yaml_file(input)?;
    info!(model = %model.name(), kind = model.kind(), "forecasting");

    let forecast = model.generate_forecast(&run.options())?;
    let file = File::create(output).map_err(|source| CommandError::Write {
        path: output.to_string(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serialize_forecast_to_yaml(&mut writer, forecast)?;
    writer.flush().map_err(|source| CommandError::Write {
        path: output.to_string(),
        source,
    })?;

    let mut message = format!(
        "Forecast with {} rows over {} iterations written to {output}",
        forecast.len(),
        forecast.iteration_count()
    );
    if !model.failures().is_empty() {
        message.push_str(&format!("\nFailed: {}", model.failures().join(", ")));
    }
    Ok(message)
}
