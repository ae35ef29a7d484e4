//! Decline-curve production forecasting and cashflow evaluation.
//!
//! Decline models live in [`services::arps`] and [`services::wor`]; the
//! period, scenario, well and wells group hierarchy in
//! [`services::period`], [`services::scenario`] and [`services::well`].

pub mod domain;
pub mod services;

#[cfg(test)]
pub(crate) mod test_support;
