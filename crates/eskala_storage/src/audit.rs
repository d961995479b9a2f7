#![forbid(unsafe_code)]

use eskala_kernel_contracts::audit::{AuditRecord, AuditRecordId, AuditRecordInput};
use eskala_kernel_contracts::versioned::{EntryId, SubjectTable};

use crate::shared::SharedConfigStore;
use crate::store::{StorageError, VersionedConfigStore};

/// Audit trail over the shared `audit_log` table.
///
/// Append and query only.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    store: SharedConfigStore,
}

impl AuditTrail {
    pub fn new(store: SharedConfigStore) -> Self {
        Self { store }
    }

    /// Direct append into unshared tables (single-threaded callers and tests).
    pub fn emit(
        store: &mut VersionedConfigStore,
        input: AuditRecordInput,
    ) -> Result<AuditRecordId, StorageError> {
        store.append_audit_record(input)
    }

    pub fn append(&self, input: AuditRecordInput) -> Result<AuditRecordId, StorageError> {
        self.store.append_audit(input)
    }

    /// Who changed this specific row, newest first.
    pub fn query_by_subject(
        &self,
        table: &SubjectTable,
        subject_key: EntryId,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        self.store.read(|s| {
            s.audit_records_by_subject(table, subject_key)
                .into_iter()
                .cloned()
                .collect()
        })
    }

    pub fn query_recent(
        &self,
        table: &SubjectTable,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        self.store.read(|s| {
            s.recent_audit_records(table, limit)
                .into_iter()
                .cloned()
                .collect()
        })
    }
}
