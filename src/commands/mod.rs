pub mod base_commands;
pub mod cashflow_cmd;
pub mod fit_cmd;
pub mod forecast_cmd;
pub mod report_format;
