use std::fs::File;
use std::io::{BufWriter, Write};

use tracing::info;

use crate::commands::base_commands::CommandError;
use dcaforecast::services::decline::{DeclineCurve, FitOptions};
use dcaforecast::services::filters::{FilterRegistry, beta_from_days};
use dcaforecast::services::schedule::ScheduleNode;
use dcaforecast::services::schedule_yaml::{
    ScheduleModel, load_model_from_yaml_file, load_observations_from_yaml_file, serialize_fit_to_yaml,
};

pub struct FitArgs<'a> {
    pub input: &'a str,
    pub data: &'a str,
    pub output: &'a str,
    pub filter: Option<&'a str>,
    pub smoothing_days: Option<f64>,
    pub b: Option<f64>,
    pub probabilistic: bool,
}

pub fn fit_command(args: &FitArgs<'_>) -> Result<String, CommandError> {
    let mut period = match load_model_from_yaml_file(args.input)? {
        ScheduleModel::Period(period) => period,
        other => return Err(CommandError::NotAPeriod(other.kind())),
    };
    let observations = load_observations_from_yaml_file(args.data)?;

    let registry = FilterRegistry::default();
    let filter = args.filter.map(|name| registry.resolve(name)).transpose()?;
    let options = FitOptions {
        b: args.b,
        filter,
        smoothing_beta: args.smoothing_days.map(beta_from_days),
        probabilistic: args.probabilistic,
    };
    info!(period = %period.name(), points = observations.len(), "fitting decline");
    let rows = period.dca.fit(&observations, &options)?;

    let file = File::create(args.output).map_err(|source| CommandError::Write {
        path: args.output.to_string(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    serialize_fit_to_yaml(&mut writer, &period.dca, &rows)?;
    writer.flush().map_err(|source| CommandError::Write {
        path: args.output.to_string(),
        source,
    })?;

    let outliers = rows.iter().filter(|row| row.outlier).count();
    Ok(format!(
        "Fitted {} on {} points ({outliers} outliers)\nFit written to {}",
        period.dca,
        rows.len(),
        args.output
    ))
}
