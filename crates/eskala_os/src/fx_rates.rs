#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use eskala_kernel_contracts::actor::ActorContext;
use eskala_kernel_contracts::versioned::{EntryId, EntryVersion, VersionedEntry};
use eskala_kernel_contracts::Timestamp;
use eskala_storage::store::{StorageError, SupersedeOutcome};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::attribution::{resolve_batch, UserDirectory};
use crate::vkvs::{SupersedeRequest, VersionedConfigEngine, VersionedConfigError};

pub const FX_RATES_TABLE: &str = "fx_rates";

const NAIVE_DATE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const NAIVE_ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";

/// Ordered pair of ISO 4217 codes. The rate is units of `from` per one `to`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CurrencyPair {
    from: String,
    to: String,
}

impl CurrencyPair {
    pub fn new(from: &str, to: &str) -> Result<Self, VersionedConfigError> {
        Ok(Self {
            from: currency_code(from)?,
            to: currency_code(to)?,
        })
    }

    pub fn from_currency(&self) -> &str {
        &self.from
    }

    pub fn to_currency(&self) -> &str {
        &self.to
    }

    /// Storage key, e.g. `fx_HNL_USD`.
    pub fn key(&self) -> String {
        format!("fx_{}_{}", self.from, self.to)
    }
}

impl Default for CurrencyPair {
    fn default() -> Self {
        Self {
            from: "HNL".to_string(),
            to: "USD".to_string(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.from, self.to)
    }
}

fn currency_code(raw: &str) -> Result<String, VersionedConfigError> {
    let code = raw.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(code.to_string())
    } else {
        Err(VersionedConfigError::InvalidArgument(format!(
            "currency code must be three uppercase letters, got '{raw}'"
        )))
    }
}

/// Parses a rate and checks it is strictly positive.
pub fn parse_rate(raw: &str) -> Result<Decimal, VersionedConfigError> {
    let rate = Decimal::from_str(raw.trim()).map_err(|_| {
        VersionedConfigError::InvalidArgument(format!("rate must be a decimal number, got '{raw}'"))
    })?;
    check_rate(rate)?;
    Ok(rate)
}

fn check_rate(rate: Decimal) -> Result<(), VersionedConfigError> {
    if rate <= Decimal::ZERO {
        return Err(VersionedConfigError::InvalidArgument(format!(
            "rate must be greater than zero, got {rate}"
        )));
    }
    Ok(())
}

/// `2025-01-31T12:00:00Z` (offset optional, UTC assumed) or `2025-01-31 12:00:00` (UTC).
pub fn parse_effective_date(raw: &str) -> Result<Timestamp, VersionedConfigError> {
    let text = raw.trim();
    let parsed = if text.contains('T') {
        DateTime::parse_from_rfc3339(text)
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(text, NAIVE_ISO_FORMAT).map(|n| n.and_utc()))
    } else {
        NaiveDateTime::parse_from_str(text, NAIVE_DATE_FORMAT).map(|n| n.and_utc())
    };
    parsed.map_err(|_| {
        VersionedConfigError::InvalidArgument(format!(
            "invalid date '{raw}': expected RFC 3339 or YYYY-MM-DD HH:MM:SS"
        ))
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FxRate {
    pub pair: CurrencyPair,
    pub rate: Decimal,
    pub entry_id: Option<EntryId>,
    pub version: Option<EntryVersion>,
    pub valid_from: Timestamp,
    pub valid_to: Option<Timestamp>,
    /// Set when the pair was never seeded and the configured default is reported.
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FxRateChange {
    pub entry_id: EntryId,
    pub version: EntryVersion,
    pub old_rate: Option<Decimal>,
    pub new_rate: Decimal,
    pub effective_date: Timestamp,
    /// `None` when no audit row exists (the seeded version).
    pub changed_by: Option<String>,
    pub changed_at: Option<Timestamp>,
    pub reason: Option<String>,
}

/// The `fx_rates` dataset: one versioned rate per currency pair.
#[derive(Clone)]
pub struct FxRateBook {
    engine: VersionedConfigEngine,
    directory: Arc<dyn UserDirectory>,
    default_rate: Decimal,
}

impl FxRateBook {
    pub fn new(
        engine: VersionedConfigEngine,
        directory: Arc<dyn UserDirectory>,
        default_rate: Decimal,
    ) -> Self {
        Self {
            engine,
            directory,
            default_rate,
        }
    }

    pub fn engine(&self) -> &VersionedConfigEngine {
        &self.engine
    }

    fn to_rate(&self, pair: &CurrencyPair, e: VersionedEntry) -> Result<FxRate, VersionedConfigError> {
        let rate = Decimal::from_str(e.value.as_str()).map_err(|_| {
            VersionedConfigError::Storage(StorageError::IntegrityViolation {
                detail: format!("stored rate for '{}' is not a decimal", e.key.as_str()),
            })
        })?;
        Ok(FxRate {
            pair: pair.clone(),
            rate,
            entry_id: Some(e.entry_id),
            version: Some(e.version),
            valid_from: e.valid_from,
            valid_to: e.valid_to,
            is_default: false,
        })
    }

    pub fn seed(&self, pair: &CurrencyPair, rate: Decimal) -> Result<FxRate, VersionedConfigError> {
        check_rate(rate)?;
        let entry = self.engine.initialize(
            &pair.key(),
            &rate.to_string(),
            Some(format!("{} to {}", pair.from, pair.to)),
        )?;
        self.to_rate(pair, entry)
    }

    pub fn current(&self, pair: &CurrencyPair) -> Result<FxRate, VersionedConfigError> {
        let entry = self.engine.get_current(&pair.key())?;
        self.to_rate(pair, entry)
    }

    /// Current rate, or the configured default when the pair was never seeded.
    pub fn current_or_default(&self, pair: &CurrencyPair) -> Result<FxRate, VersionedConfigError> {
        match self.current(pair) {
            Err(VersionedConfigError::NotFound(_)) => Ok(FxRate {
                pair: pair.clone(),
                rate: self.default_rate,
                entry_id: None,
                version: None,
                valid_from: self.engine.now(),
                valid_to: None,
                is_default: true,
            }),
            other => other,
        }
    }

    /// Every version, latest `valid_from` first.
    pub fn all(&self, pair: &CurrencyPair) -> Result<Vec<FxRate>, VersionedConfigError> {
        let mut rows = self
            .engine
            .history(&pair.key())?
            .into_iter()
            .map(|e| self.to_rate(pair, e))
            .collect::<Result<Vec<_>, _>>()?;
        rows.sort_by(|a, b| b.valid_from.cmp(&a.valid_from).then(b.version.cmp(&a.version)));
        Ok(rows)
    }

    pub fn rate_at(&self, pair: &CurrencyPair, at: Timestamp) -> Result<FxRate, VersionedConfigError> {
        let entry = self.engine.get_as_of(&pair.key(), at)?;
        self.to_rate(pair, entry)
    }

    pub fn update(
        &self,
        pair: &CurrencyPair,
        rate: Decimal,
        effective_at: Timestamp,
        reason: &str,
        actor: ActorContext,
        expected_version: Option<EntryVersion>,
    ) -> Result<SupersedeOutcome, VersionedConfigError> {
        check_rate(rate)?;
        self.engine.supersede(SupersedeRequest {
            key: pair.key(),
            new_value: rate.to_string(),
            effective_at,
            reason: reason.to_string(),
            actor,
            expected_version,
        })
    }

    /// Per version, newest first: the rate it replaced, the new rate, and who changed it.
    pub fn change_history(
        &self,
        pair: &CurrencyPair,
    ) -> Result<Vec<FxRateChange>, VersionedConfigError> {
        let rates = self.all(pair)?;
        let mut audits = Vec::with_capacity(rates.len());
        for r in &rates {
            let audit = match r.entry_id {
                Some(id) => self.engine.audit_for_entry(id)?.into_iter().next(),
                None => None,
            };
            audits.push(audit);
        }
        let present: Vec<_> = audits.iter().flatten().cloned().collect();
        let mut names = resolve_batch(&present, self.directory.as_ref()).into_iter();

        let mut out = Vec::with_capacity(rates.len());
        for (r, audit) in rates.iter().zip(audits) {
            // The predecessor is the version whose window closed where this one opened.
            let old_rate = rates
                .iter()
                .find(|p| p.valid_to == Some(r.valid_from) && p.version < r.version)
                .map(|p| p.rate);
            let (changed_by, changed_at, reason) = match audit {
                Some(a) => (names.next(), Some(a.changed_at), Some(a.diff.reason)),
                None => (None, None, None),
            };
            out.push(FxRateChange {
                entry_id: r.entry_id.unwrap_or(EntryId(0)),
                version: r.version.unwrap_or(EntryVersion::FIRST),
                old_rate,
                new_rate: r.rate,
                effective_date: r.valid_from,
                changed_by,
                changed_at,
                reason,
            });
        }
        Ok(out)
    }

    /// `amount` in `pair.from` converted to `pair.to` at the rate valid at `at`.
    pub fn convert(
        &self,
        pair: &CurrencyPair,
        amount: Decimal,
        at: Timestamp,
    ) -> Result<Decimal, VersionedConfigError> {
        let rate = self.rate_at(pair, at)?.rate;
        amount.checked_div(rate).ok_or_else(|| {
            VersionedConfigError::InvalidArgument(format!("cannot convert {amount} at rate {rate}"))
        })
    }
}
