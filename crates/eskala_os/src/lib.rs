#![forbid(unsafe_code)]

pub mod attribution;
pub mod clock;
pub mod config;
pub mod formula_expr;
pub mod formulas;
pub mod fx_rates;
pub mod logging;
pub mod runtime;
pub mod vkvs;
