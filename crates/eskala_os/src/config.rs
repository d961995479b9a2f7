#![forbid(unsafe_code)]

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use rust_decimal::Decimal;

pub const ENV_STORE_PATH: &str = "ESKALA_STORE_PATH";
pub const ENV_HISTORY_LIMIT: &str = "ESKALA_HISTORY_LIMIT";
pub const ENV_DEFAULT_FX_RATE: &str = "ESKALA_DEFAULT_FX_RATE";
pub const ENV_LOG: &str = "ESKALA_LOG";

pub const HISTORY_LIMIT_MIN: usize = 1;
pub const HISTORY_LIMIT_MAX: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: expected an integer in {min}..={max}, got '{value}'")]
    HistoryLimit {
        var: &'static str,
        value: String,
        min: usize,
        max: usize,
    },
    #[error("{var}: expected a positive decimal rate, got '{value}'")]
    DefaultFxRate { var: &'static str, value: String },
    #[error("{var}: must not be empty")]
    Empty { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EskalaConfig {
    /// Journal file; `None` keeps everything in memory.
    pub store_path: Option<PathBuf>,
    pub history_limit: usize,
    /// Reported for a currency pair that was never seeded.
    pub default_fx_rate: Decimal,
    pub log_filter: String,
}

impl EskalaConfig {
    pub fn mvp_v1() -> Self {
        Self {
            store_path: None,
            history_limit: 100,
            default_fx_rate: Decimal::new(25_2500, 4),
            log_filter: "info".to_string(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_var_map(|key| env::var(key).ok())
    }

    pub fn from_env_var_map<F>(mut env_getter: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let mut config = Self::mvp_v1();

        config.store_path = env_getter(ENV_STORE_PATH)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        if let Some(v) = env_getter(ENV_HISTORY_LIMIT) {
            config.history_limit = parse_history_limit(&v)?;
        }
        if let Some(v) = env_getter(ENV_DEFAULT_FX_RATE) {
            config.default_fx_rate = parse_default_fx_rate(&v)?;
        }
        if let Some(v) = env_getter(ENV_LOG) {
            let v = v.trim();
            if v.is_empty() {
                return Err(ConfigError::Empty { var: ENV_LOG });
            }
            config.log_filter = v.to_string();
        }
        Ok(config)
    }
}

impl Default for EskalaConfig {
    fn default() -> Self {
        Self::mvp_v1()
    }
}

fn parse_history_limit(raw: &str) -> Result<usize, ConfigError> {
    let err = || ConfigError::HistoryLimit {
        var: ENV_HISTORY_LIMIT,
        value: raw.to_string(),
        min: HISTORY_LIMIT_MIN,
        max: HISTORY_LIMIT_MAX,
    };
    let n: usize = raw.trim().parse().map_err(|_| err())?;
    if !(HISTORY_LIMIT_MIN..=HISTORY_LIMIT_MAX).contains(&n) {
        return Err(err());
    }
    Ok(n)
}

fn parse_default_fx_rate(raw: &str) -> Result<Decimal, ConfigError> {
    let err = || ConfigError::DefaultFxRate {
        var: ENV_DEFAULT_FX_RATE,
        value: raw.to_string(),
    };
    let rate = Decimal::from_str(raw.trim()).map_err(|_| err())?;
    if rate <= Decimal::ZERO {
        return Err(err());
    }
    Ok(rate)
}
