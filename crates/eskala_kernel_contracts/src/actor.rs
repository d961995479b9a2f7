#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::validate_opt_text;
use crate::{ContractViolation, Validate};

pub const ACTOR_DISPLAY_NAME_MAX_LEN: usize = 128;

/// Numeric identifier of a row in the external user directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl Validate for UserId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Identity of whoever triggered a write, as supplied by the caller's session.
///
/// The store never authenticates; it records exactly what it is handed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ActorContext {
    pub user_id: Option<UserId>,
    pub display_name: Option<String>,
}

impl ActorContext {
    pub fn v1(
        user_id: Option<UserId>,
        display_name: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let a = Self {
            user_id,
            display_name,
        };
        a.validate()?;
        Ok(a)
    }

    /// A change with no human behind it.
    pub fn system() -> Self {
        Self::default()
    }

    pub fn is_system(&self) -> bool {
        self.user_id.is_none() && self.display_name.is_none()
    }
}

impl Validate for ActorContext {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(id) = &self.user_id {
            id.validate()?;
        }
        validate_opt_text(
            "actor_context.display_name",
            &self.display_name,
            ACTOR_DISPLAY_NAME_MAX_LEN,
        )
    }
}
