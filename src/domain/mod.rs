pub mod cashflow;
pub mod forecast;
pub mod frequency;
pub mod prob_var;
pub mod time;
