#![forbid(unsafe_code)]

use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

pub const FALLBACK_FILTER: &str = "info";

/// Parses a filter directive, falling back to [`FALLBACK_FILTER`] when it is unparsable.
pub fn build_filter(filter: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(FALLBACK_FILTER))
}

/// Installs the global fmt subscriber, writing to stderr.
///
/// Returns `false` when a subscriber was already installed (tests, embedding hosts);
/// that is not an error.
pub fn init_logging(filter: &str) -> bool {
    tracing_subscriber::registry()
        .with(build_filter(filter))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .is_ok()
}
