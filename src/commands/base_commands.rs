use std::io;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use thiserror::Error;

use dcaforecast::domain::frequency::Frequency;
use dcaforecast::services::fit::FitError;
use dcaforecast::services::schedule::{RunOptions, ScheduleError};
use dcaforecast::services::schedule_yaml::ScheduleYamlError;

#[derive(Parser)]
#[command(author, version, about)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Forecast production of a period, scenario, well or wells group file
    Forecast {
        /// Model YAML file
        #[arg(short, long)]
        input: String,
        /// Output YAML file with one row per time step and iteration
        #[arg(short, long)]
        output: String,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Forecast a model and evaluate its cash flows
    Cashflow {
        /// Model YAML file
        #[arg(short, long)]
        input: String,
        /// Output YAML file with the free cash flow table of every iteration
        #[arg(short, long)]
        output: String,
        #[command(flatten)]
        run: RunArgs,
        /// Discount rates
        #[arg(short, long = "rate", default_values_t = [0.1])]
        rates: Vec<f64>,
        /// Period the discount rates are quoted for (A, M or D)
        #[arg(long, default_value_t = Frequency::Annual)]
        freq_rate: Frequency,
        /// Period of the discounted cash flows, defaults to the forecast frequency
        #[arg(long)]
        freq_cashflow: Option<Frequency>,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fit the decline model of a period file to observed production
    Fit {
        /// Period YAML file
        #[arg(short, long)]
        input: String,
        /// Observed production YAML file
        #[arg(short, long)]
        data: String,
        /// Output YAML file with the fitted model and the filtered input
        #[arg(short, long)]
        output: String,
        /// Outlier filter applied before fitting
        #[arg(long)]
        filter: Option<String>,
        /// Smooth the rates with a moving average over about this many samples
        #[arg(long)]
        smoothing_days: Option<f64>,
        /// Hold the Arps exponent fixed
        #[arg(short, long)]
        b: Option<f64>,
        /// Store fitted parameters as normal distributions
        #[arg(long)]
        probabilistic: bool,
    },
    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Overrides shared by every command that runs a model.
#[derive(clap::Args, Debug, Clone, PartialEq)]
pub struct RunArgs {
    /// Number of iterations
    #[arg(short = 'n', long)]
    pub iterations: Option<usize>,
    /// Seed of every random draw
    #[arg(long)]
    pub seed: Option<u64>,
    /// Evaluate distributions at this percentile instead of sampling
    #[arg(long)]
    pub ppf: Option<f64>,
    /// Output frequency (A, M or D)
    #[arg(short, long)]
    pub freq: Option<Frequency>,
}

impl RunArgs {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            freq_output: self.freq,
            iter: self.iterations,
            seed: self.seed,
            ppf: self.ppf,
        }
    }
}

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Yaml(#[from] ScheduleYamlError),
    #[error("failed to run model: {0}")]
    Run(#[from] ScheduleError),
    #[error("failed to fit decline: {0}")]
    Fit(#[from] FitError),
    #[error("fit needs a period model file, got a {0}")]
    NotAPeriod(&'static str),
    #[error("failed to encode report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}
