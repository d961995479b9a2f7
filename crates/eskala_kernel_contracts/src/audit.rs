#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::actor::{UserId, ACTOR_DISPLAY_NAME_MAX_LEN};
use crate::common::{validate_opt_text, validate_text};
use crate::versioned::{
    EntryId, EntryVersion, SubjectTable, CONFIG_VALUE_MAX_LEN, REASON_MAX_LEN,
};
use crate::{ContractViolation, SchemaVersion, Timestamp, Validate};

pub const AUDIT_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AuditRecordId(pub u64);

impl Validate for AuditRecordId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "audit_record_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Kind of transition. Open-ended so new datasets can log their own actions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    ValueChanged,
    Other(String),
}

impl AuditAction {
    pub fn as_str(&self) -> &str {
        match self {
            AuditAction::ValueChanged => "VALUE_CHANGED",
            AuditAction::Other(s) => s,
        }
    }
}

impl Validate for AuditAction {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let AuditAction::Other(s) = self {
            validate_text("audit_action.other", s, 64)?;
        }
        Ok(())
    }
}

/// Structured payload of one transition.
///
/// `actor_display_name` is copied at write time so history survives renames and deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditDiff {
    pub old_value: Option<String>,
    pub new_value: String,
    pub old_version: Option<EntryVersion>,
    pub new_version: EntryVersion,
    pub reason: String,
    pub effective_at: Option<Timestamp>,
    pub actor_display_name: Option<String>,
}

impl Validate for AuditDiff {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_opt_text("audit_diff.old_value", &self.old_value, CONFIG_VALUE_MAX_LEN)?;
        validate_text("audit_diff.new_value", &self.new_value, CONFIG_VALUE_MAX_LEN)?;
        self.new_version.validate()?;
        if let Some(old) = self.old_version {
            old.validate()?;
            if old >= self.new_version {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_diff.new_version",
                    reason: "must be greater than old_version",
                });
            }
        }
        validate_text("audit_diff.reason", &self.reason, REASON_MAX_LEN)?;
        // Empty names are tolerated here; attribution treats them as absent.
        if let Some(name) = &self.actor_display_name {
            if name.len() > ACTOR_DISPLAY_NAME_MAX_LEN {
                return Err(ContractViolation::InvalidValue {
                    field: "audit_diff.actor_display_name",
                    reason: "exceeds max length",
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRecordInput {
    pub subject_table: SubjectTable,
    pub subject_key: EntryId,
    pub action: AuditAction,
    pub diff: AuditDiff,
    pub changed_by: Option<UserId>,
    pub changed_at: Timestamp,
}

impl AuditRecordInput {
    pub fn v1(
        subject_table: SubjectTable,
        subject_key: EntryId,
        action: AuditAction,
        diff: AuditDiff,
        changed_by: Option<UserId>,
        changed_at: Timestamp,
    ) -> Result<Self, ContractViolation> {
        let i = Self {
            subject_table,
            subject_key,
            action,
            diff,
            changed_by,
            changed_at,
        };
        i.validate()?;
        Ok(i)
    }
}

impl Validate for AuditRecordInput {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.subject_table.validate()?;
        self.subject_key.validate()?;
        self.action.validate()?;
        self.diff.validate()?;
        if let Some(id) = &self.changed_by {
            id.validate()?;
        }
        Ok(())
    }
}

/// Immutable log row. Never rewritten once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub schema_version: SchemaVersion,
    pub record_id: AuditRecordId,
    pub subject_table: SubjectTable,
    pub subject_key: EntryId,
    pub action: AuditAction,
    pub diff: AuditDiff,
    pub changed_by: Option<UserId>,
    pub changed_at: Timestamp,
}

impl AuditRecord {
    pub fn from_input_v1(
        record_id: AuditRecordId,
        input: AuditRecordInput,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            schema_version: AUDIT_CONTRACT_VERSION,
            record_id,
            subject_table: input.subject_table,
            subject_key: input.subject_key,
            action: input.action,
            diff: input.diff,
            changed_by: input.changed_by,
            changed_at: input.changed_at,
        };
        r.validate()?;
        Ok(r)
    }
}

impl Validate for AuditRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != AUDIT_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "audit_record.schema_version",
                reason: "must match AUDIT_CONTRACT_VERSION",
            });
        }
        self.record_id.validate()?;
        self.subject_table.validate()?;
        self.subject_key.validate()?;
        self.action.validate()?;
        self.diff.validate()?;
        if let Some(id) = &self.changed_by {
            id.validate()?;
        }
        Ok(())
    }
}
