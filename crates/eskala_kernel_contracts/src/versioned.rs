#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::actor::ActorContext;
use crate::common::{validate_opt_text, validate_text};
use crate::{ContractViolation, SchemaVersion, Timestamp, Validate};

pub const VERSIONED_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const CONFIG_KEY_MAX_LEN: usize = 128;
pub const CONFIG_VALUE_MAX_LEN: usize = 4096;
pub const DESCRIPTION_MAX_LEN: usize = 1024;
pub const REASON_MAX_LEN: usize = 512;

fn is_ascii_lower_snake(s: &str) -> bool {
    let b = s.as_bytes();
    if b.is_empty() || !b[0].is_ascii_lowercase() {
        return false;
    }
    b.iter()
        .skip(1)
        .all(|&c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == b'_')
}

/// Logical name of a versioned dataset (`formulas`, `fx_rates`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubjectTable(String);

impl SubjectTable {
    pub fn new(name: impl Into<String>) -> Result<Self, ContractViolation> {
        let t = Self(name.into());
        t.validate()?;
        Ok(t)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for SubjectTable {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.len() > 64 {
            return Err(ContractViolation::InvalidValue {
                field: "subject_table",
                reason: "must be <= 64 chars",
            });
        }
        if !is_ascii_lower_snake(&self.0) {
            return Err(ContractViolation::InvalidValue {
                field: "subject_table",
                reason: "must be lower_snake_case (a-z0-9_)",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConfigKey(String);

impl ConfigKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let k = Self(key.into());
        k.validate()?;
        Ok(k)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ConfigKey {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "config_key",
                reason: "must not be empty",
            });
        }
        if self.0.len() > CONFIG_KEY_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "config_key",
                reason: "must be <= 128 bytes",
            });
        }
        if self
            .0
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(ContractViolation::InvalidValue {
                field: "config_key",
                reason: "must not contain whitespace or control characters",
            });
        }
        Ok(())
    }
}

/// Opaque payload. Interpretation (expression, decimal rate) belongs to the dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigValue(String);

impl ConfigValue {
    pub fn new(value: impl Into<String>) -> Result<Self, ContractViolation> {
        let v = Self(value.into());
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for ConfigValue {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_text("config_value", &self.0, CONFIG_VALUE_MAX_LEN)
    }
}

/// Row identifier of a stored entry; unique across all datasets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl Validate for EntryId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "entry_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryVersion(pub u32);

impl EntryVersion {
    pub const FIRST: EntryVersion = EntryVersion(1);

    pub fn next(self) -> Option<EntryVersion> {
        self.0.checked_add(1).map(EntryVersion)
    }
}

impl Validate for EntryVersion {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "entry_version",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// One value of a named key, effective over `[valid_from, valid_to)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedEntry {
    pub schema_version: SchemaVersion,
    pub entry_id: EntryId,
    pub table: SubjectTable,
    pub key: ConfigKey,
    pub value: ConfigValue,
    pub version: EntryVersion,
    pub valid_from: Timestamp,
    /// `None` marks the open entry.
    pub valid_to: Option<Timestamp>,
    pub description: Option<String>,
}

impl VersionedEntry {
    pub fn is_open(&self) -> bool {
        self.valid_to.is_none()
    }

    /// Half-open containment; an open entry extends forever.
    pub fn covers(&self, at: Timestamp) -> bool {
        self.valid_from <= at && self.valid_to.map(|end| at < end).unwrap_or(true)
    }
}

impl Validate for VersionedEntry {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != VERSIONED_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "versioned_entry.schema_version",
                reason: "must match VERSIONED_CONTRACT_VERSION",
            });
        }
        self.entry_id.validate()?;
        self.table.validate()?;
        self.key.validate()?;
        self.value.validate()?;
        self.version.validate()?;
        if let Some(end) = self.valid_to {
            if end < self.valid_from {
                return Err(ContractViolation::InvalidValue {
                    field: "versioned_entry.valid_to",
                    reason: "must be >= valid_from",
                });
            }
        }
        validate_opt_text(
            "versioned_entry.description",
            &self.description,
            DESCRIPTION_MAX_LEN,
        )
    }
}

/// Request to create version 1 of a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInitInput {
    pub table: SubjectTable,
    pub key: ConfigKey,
    pub value: ConfigValue,
    pub description: Option<String>,
    pub valid_from: Timestamp,
}

impl EntryInitInput {
    pub fn v1(
        table: SubjectTable,
        key: ConfigKey,
        value: ConfigValue,
        description: Option<String>,
        valid_from: Timestamp,
    ) -> Result<Self, ContractViolation> {
        let i = Self {
            table,
            key,
            value,
            description,
            valid_from,
        };
        i.validate()?;
        Ok(i)
    }
}

impl Validate for EntryInitInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.table.validate()?;
        self.key.validate()?;
        self.value.validate()?;
        validate_opt_text(
            "entry_init_input.description",
            &self.description,
            DESCRIPTION_MAX_LEN,
        )
    }
}

/// Request to close the open entry of a key and open its successor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersedeInput {
    pub table: SubjectTable,
    pub key: ConfigKey,
    pub new_value: ConfigValue,
    pub effective_at: Timestamp,
    pub reason: String,
    pub actor: ActorContext,
    /// When set, the supersede only proceeds if the open entry still has this version.
    pub expected_version: Option<EntryVersion>,
}

impl SupersedeInput {
    #[allow(clippy::too_many_arguments)]
    pub fn v1(
        table: SubjectTable,
        key: ConfigKey,
        new_value: ConfigValue,
        effective_at: Timestamp,
        reason: String,
        actor: ActorContext,
        expected_version: Option<EntryVersion>,
    ) -> Result<Self, ContractViolation> {
        let i = Self {
            table,
            key,
            new_value,
            effective_at,
            reason,
            actor,
            expected_version,
        };
        i.validate()?;
        Ok(i)
    }
}

impl Validate for SupersedeInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.table.validate()?;
        self.key.validate()?;
        self.new_value.validate()?;
        validate_text("supersede_input.reason", &self.reason, REASON_MAX_LEN)?;
        self.actor.validate()?;
        if let Some(v) = &self.expected_version {
            v.validate()?;
        }
        Ok(())
    }
}
