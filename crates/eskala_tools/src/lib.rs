#![forbid(unsafe_code)]

pub mod config_cli;
