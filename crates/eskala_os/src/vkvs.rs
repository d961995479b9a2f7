#![forbid(unsafe_code)]

use std::sync::Arc;

use eskala_kernel_contracts::actor::ActorContext;
use eskala_kernel_contracts::audit::AuditRecord;
use eskala_kernel_contracts::versioned::{
    ConfigKey, ConfigValue, EntryId, EntryInitInput, EntryVersion, SubjectTable, SupersedeInput,
    VersionedEntry,
};
use eskala_kernel_contracts::{ContractViolation, Timestamp};
use eskala_storage::audit::AuditTrail;
use eskala_storage::shared::SharedConfigStore;
use eskala_storage::store::{StorageError, SupersedeOutcome};

use crate::clock::Clock;

/// Caller-facing failures. Everything except `Storage` is an expected outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionedConfigError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage fault: {0}")]
    Storage(#[source] StorageError),
}

impl VersionedConfigError {
    pub fn is_expected(&self) -> bool {
        !matches!(self, VersionedConfigError::Storage(_))
    }
}

impl From<StorageError> for VersionedConfigError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => VersionedConfigError::NotFound(err.to_string()),
            StorageError::DuplicateKey { .. } => {
                VersionedConfigError::AlreadyExists(err.to_string())
            }
            StorageError::StaleVersion { .. } => VersionedConfigError::Conflict(err.to_string()),
            StorageError::TemporalOrderViolation { .. } | StorageError::ContractViolation(_) => {
                VersionedConfigError::InvalidArgument(err.to_string())
            }
            StorageError::ForeignKeyViolation { .. }
            | StorageError::AppendOnlyViolation { .. }
            | StorageError::IntegrityViolation { .. }
            | StorageError::Journal { .. }
            | StorageError::LockPoisoned => VersionedConfigError::Storage(err),
        }
    }
}

impl From<ContractViolation> for VersionedConfigError {
    fn from(err: ContractViolation) -> Self {
        VersionedConfigError::InvalidArgument(err.to_string())
    }
}

/// One supersede call: new value, when it takes effect, why, and who asked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersedeRequest {
    pub key: String,
    pub new_value: String,
    pub effective_at: Timestamp,
    pub reason: String,
    pub actor: ActorContext,
    pub expected_version: Option<EntryVersion>,
}

/// Generic versioned key-value engine for one dataset.
///
/// Every key has a gapless chain of versions; exactly one (the last) is open. Writes go
/// through the shared store's write lock, so two supersedes on the same key serialise and
/// the second one closes the first one's successor. Pass `expected_version` to turn that
/// into a `Conflict` instead.
#[derive(Clone)]
pub struct VersionedConfigEngine {
    table: SubjectTable,
    store: SharedConfigStore,
    trail: AuditTrail,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for VersionedConfigEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedConfigEngine")
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl VersionedConfigEngine {
    pub fn new(table: SubjectTable, store: SharedConfigStore, clock: Arc<dyn Clock>) -> Self {
        let trail = AuditTrail::new(store.clone());
        Self {
            table,
            store,
            trail,
            clock,
        }
    }

    pub fn table(&self) -> &SubjectTable {
        &self.table
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    fn key(&self, key: &str) -> Result<ConfigKey, VersionedConfigError> {
        Ok(ConfigKey::new(key)?)
    }

    fn not_found(&self, key: &ConfigKey) -> VersionedConfigError {
        VersionedConfigError::NotFound(format!(
            "{}: no entry for key '{}'",
            self.table.as_str(),
            key.as_str()
        ))
    }

    /// The open entry. A future-dated open entry is still the current one.
    pub fn get_current(&self, key: &str) -> Result<VersionedEntry, VersionedConfigError> {
        let key = self.key(key)?;
        self.store
            .read(|s| s.current_entry(&self.table, &key).cloned())?
            .ok_or_else(|| self.not_found(&key))
    }

    pub fn get_as_of(
        &self,
        key: &str,
        at: Timestamp,
    ) -> Result<VersionedEntry, VersionedConfigError> {
        let key = self.key(key)?;
        self.store
            .read(|s| s.entry_as_of(&self.table, &key, at).cloned())?
            .ok_or_else(|| {
                VersionedConfigError::NotFound(format!(
                    "{}: no entry for key '{}' covers {}",
                    self.table.as_str(),
                    key.as_str(),
                    at.to_rfc3339()
                ))
            })
    }

    /// Opens version 1 effective now. No audit row is written.
    pub fn initialize(
        &self,
        key: &str,
        value: &str,
        description: Option<String>,
    ) -> Result<VersionedEntry, VersionedConfigError> {
        let result = self.try_initialize(key, value, description);
        match &result {
            Ok(entry) => tracing::info!(
                table = self.table.as_str(),
                key = entry.key.as_str(),
                version = entry.version.0,
                "versioned entry initialized"
            ),
            Err(err) => self.log_failure("initialize", key, err),
        }
        result
    }

    fn try_initialize(
        &self,
        key: &str,
        value: &str,
        description: Option<String>,
    ) -> Result<VersionedEntry, VersionedConfigError> {
        let input = EntryInitInput::v1(
            self.table.clone(),
            self.key(key)?,
            ConfigValue::new(value)?,
            description,
            self.clock.now(),
        )?;
        Ok(self.store.initialize(input)?)
    }

    /// Closes the open entry at `effective_at` and opens its successor, with one audit row,
    /// as a single unit.
    pub fn supersede(
        &self,
        req: SupersedeRequest,
    ) -> Result<SupersedeOutcome, VersionedConfigError> {
        let key = req.key.clone();
        let result = self.try_supersede(req);
        match &result {
            Ok(out) => tracing::info!(
                table = self.table.as_str(),
                key = key.as_str(),
                old_version = out.old_version().0,
                new_version = out.new_version().0,
                audit_record_id = out.audit_record_id.0,
                "versioned entry superseded"
            ),
            Err(err) => self.log_failure("supersede", &key, err),
        }
        result
    }

    fn try_supersede(
        &self,
        req: SupersedeRequest,
    ) -> Result<SupersedeOutcome, VersionedConfigError> {
        let input = SupersedeInput::v1(
            self.table.clone(),
            self.key(&req.key)?,
            ConfigValue::new(req.new_value)?,
            req.effective_at,
            req.reason,
            req.actor,
            req.expected_version,
        )?;
        Ok(self.store.supersede(input, self.clock.now())?)
    }

    /// All versions of `key`, newest first. Empty for an unknown key.
    pub fn history(&self, key: &str) -> Result<Vec<VersionedEntry>, VersionedConfigError> {
        let key = self.key(key)?;
        Ok(self.store.read(|s| {
            s.entry_history(&self.table, &key)
                .into_iter()
                .cloned()
                .collect()
        })?)
    }

    /// Open entries of this dataset, ordered by key.
    pub fn current_entries(&self) -> Result<Vec<VersionedEntry>, VersionedConfigError> {
        Ok(self.store.read(|s| {
            s.current_entries(&self.table)
                .into_iter()
                .cloned()
                .collect()
        })?)
    }

    pub fn closed_entries(&self) -> Result<Vec<VersionedEntry>, VersionedConfigError> {
        Ok(self.store.read(|s| {
            s.closed_entries(&self.table)
                .into_iter()
                .cloned()
                .collect()
        })?)
    }

    pub fn entry(&self, entry_id: EntryId) -> Result<Option<VersionedEntry>, VersionedConfigError> {
        Ok(self.store.read(|s| {
            s.entry(entry_id)
                .filter(|e| e.table == self.table)
                .cloned()
        })?)
    }

    pub fn audit_for_entry(
        &self,
        entry_id: EntryId,
    ) -> Result<Vec<AuditRecord>, VersionedConfigError> {
        Ok(self.trail.query_by_subject(&self.table, entry_id)?)
    }

    pub fn recent_audit(&self, limit: usize) -> Result<Vec<AuditRecord>, VersionedConfigError> {
        Ok(self.trail.query_recent(&self.table, limit)?)
    }

    fn log_failure(&self, op: &'static str, key: &str, err: &VersionedConfigError) {
        if err.is_expected() {
            tracing::warn!(table = self.table.as_str(), key, op, error = %err, "versioned write rejected");
        } else {
            tracing::error!(table = self.table.as_str(), key, op, error = %err, "versioned write failed");
        }
    }
}
