mod commands;

use std::io;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};

use crate::commands::base_commands::{CliArgs, Commands};
use crate::commands::cashflow_cmd::{CashflowArgs, cashflow_command};
use crate::commands::fit_cmd::{FitArgs, fit_command};
use crate::commands::forecast_cmd::forecast_command;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let args = CliArgs::parse();
    let result = match &args.command {
        Commands::Forecast { input, output, run } => forecast_command(input, output, run),
        Commands::Cashflow {
            input,
            output,
            run,
            rates,
            freq_rate,
            freq_cashflow,
            json,
        } => cashflow_command(&CashflowArgs {
            input,
            output,
            run,
            rates,
            freq_rate: *freq_rate,
            freq_cashflow: *freq_cashflow,
            json: *json,
        }),
        Commands::Fit {
            input,
            data,
            output,
            filter,
            smoothing_days,
            b,
            probabilistic,
        } => fit_command(&FitArgs {
            input,
            data,
            output,
            filter: filter.as_deref(),
            smoothing_days: *smoothing_days,
            b: *b,
            probabilistic: *probabilistic,
        }),
        Commands::Completions { shell } => {
            let mut command = CliArgs::command();
            let name = command.get_name().to_string();
            clap_complete::generate(*shell, &mut command, name, &mut io::stdout());
            return ExitCode::SUCCESS;
        }
    };

    match result {
        Ok(message) => {
            println!("{message}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}
