pub mod arps;
pub mod cashflow_params;
pub mod decline;
pub mod economics;
pub mod filters;
pub mod fit;
pub mod grid;
pub mod period;
pub mod scenario;
pub mod schedule;
pub mod schedule_yaml;
pub mod well;
pub mod wiener;
pub mod wor;
