#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use eskala_kernel_contracts::audit::{AuditRecordId, AuditRecordInput};
use eskala_kernel_contracts::versioned::{EntryInitInput, SupersedeInput, VersionedEntry};
use eskala_kernel_contracts::Timestamp;

use crate::journal::StoreJournal;
use crate::store::{StorageError, StoreMutation, SupersedeOutcome, VersionedConfigStore};

#[derive(Debug)]
struct SharedState {
    store: VersionedConfigStore,
    journal: Option<StoreJournal>,
}

/// Thread-safe handle over the tables.
///
/// Concurrency contract: every write plans, journals and applies while holding the single
/// write lock, so writers on the same key are strictly serialised (pessimistic locking).
/// Readers hold the read lock and only ever see committed state.
#[derive(Debug, Clone)]
pub struct SharedConfigStore {
    state: Arc<RwLock<SharedState>>,
}

impl SharedConfigStore {
    pub fn in_memory() -> Self {
        Self::from_parts(VersionedConfigStore::new_in_memory(), None)
    }

    /// Opens (or creates) a journal and rebuilds the tables from it.
    pub fn open_journaled(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let journal = StoreJournal::open(path)?;
        let mut store = VersionedConfigStore::new_in_memory();
        let replayed = journal.replay_into(&mut store)?;
        store.verify_all()?;
        tracing::info!(
            path = %journal.path().display(),
            replayed,
            "config store journal replayed"
        );
        Ok(Self::from_parts(store, Some(journal)))
    }

    fn from_parts(store: VersionedConfigStore, journal: Option<StoreJournal>) -> Self {
        Self {
            state: Arc::new(RwLock::new(SharedState { store, journal })),
        }
    }

    pub fn is_journaled(&self) -> Result<bool, StorageError> {
        self.read_state(|s| s.journal.is_some())
    }

    fn read_state<R>(&self, f: impl FnOnce(&SharedState) -> R) -> Result<R, StorageError> {
        let state = self.state.read().map_err(|_| {
            tracing::error!("config store lock poisoned");
            StorageError::LockPoisoned
        })?;
        Ok(f(&state))
    }

    /// Runs `f` against a consistent snapshot of the tables.
    pub fn read<R>(&self, f: impl FnOnce(&VersionedConfigStore) -> R) -> Result<R, StorageError> {
        self.read_state(|s| f(&s.store))
    }

    pub fn initialize(&self, input: EntryInitInput) -> Result<VersionedEntry, StorageError> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let entry = state.store.plan_initialize(input)?;
        let mutation = StoreMutation::InitializeEntry(entry.clone());
        if let Some(journal) = &mut state.journal {
            journal.append(&mutation)?;
        }
        state.store.apply_initialize(&entry)?;
        Ok(entry)
    }

    /// Close-and-open under the write lock. Nothing is journaled or applied unless the
    /// whole plan (close, successor, audit row) validated.
    pub fn supersede(
        &self,
        input: SupersedeInput,
        changed_at: Timestamp,
    ) -> Result<SupersedeOutcome, StorageError> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let plan = state.store.plan_supersede(input, changed_at)?;
        if let Some(journal) = &mut state.journal {
            journal.append(&StoreMutation::SupersedeEntry(plan.clone()))?;
        }
        state.store.apply_supersede(&plan)
    }

    pub fn append_audit(&self, input: AuditRecordInput) -> Result<AuditRecordId, StorageError> {
        let mut state = self.state.write().map_err(|_| StorageError::LockPoisoned)?;
        let record = state.store.plan_audit_append(input)?;
        let record_id = record.record_id;
        let mutation = StoreMutation::AppendAudit(record);
        if let Some(journal) = &mut state.journal {
            journal.append(&mutation)?;
        }
        state.store.apply_mutation(&mutation)?;
        Ok(record_id)
    }
}
