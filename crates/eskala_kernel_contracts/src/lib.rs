#![forbid(unsafe_code)]

pub mod actor;
pub mod audit;
pub mod common;
pub mod versioned;

pub use common::{ContractViolation, SchemaVersion, Timestamp, Validate};
