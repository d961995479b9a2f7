#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use eskala_kernel_contracts::audit::{AuditRecord, AuditRecordId, AuditRecordInput};
use eskala_kernel_contracts::versioned::{
    ConfigKey, EntryId, EntryInitInput, SubjectTable, SupersedeInput, VersionedEntry,
};
use eskala_kernel_contracts::Timestamp;

use crate::audit::AuditTrail;
use crate::store::{StorageError, SupersedeOutcome, VersionedConfigStore};

/// Typed repository interface for the `versioned_entries` table.
pub trait VersionedEntryTablesRepo {
    fn initialize_entry_row(&mut self, input: EntryInitInput) -> Result<VersionedEntry, StorageError>;
    fn supersede_entry_row(
        &mut self,
        input: SupersedeInput,
        changed_at: Timestamp,
    ) -> Result<SupersedeOutcome, StorageError>;
    fn entry_rows(&self) -> &BTreeMap<EntryId, VersionedEntry>;
    fn current_entry_row(&self, table: &SubjectTable, key: &ConfigKey) -> Option<&VersionedEntry>;
    fn entry_row_as_of(
        &self,
        table: &SubjectTable,
        key: &ConfigKey,
        at: Timestamp,
    ) -> Option<&VersionedEntry>;
    fn entry_history_rows(&self, table: &SubjectTable, key: &ConfigKey) -> Vec<&VersionedEntry>;
    fn current_entry_rows(&self, table: &SubjectTable) -> Vec<&VersionedEntry>;
    fn rebuild_entry_key_index(&mut self);
}

/// Typed repository interface for the append-only `audit_log` table.
pub trait AuditLogTablesRepo {
    fn append_audit_row(&mut self, input: AuditRecordInput) -> Result<AuditRecordId, StorageError>;
    fn audit_rows(&self) -> &[AuditRecord];
    fn audit_rows_by_subject(&self, table: &SubjectTable, subject_key: EntryId) -> Vec<&AuditRecord>;
    fn recent_audit_rows(&self, table: &SubjectTable, limit: usize) -> Vec<&AuditRecord>;
}

impl VersionedEntryTablesRepo for VersionedConfigStore {
    fn initialize_entry_row(&mut self, input: EntryInitInput) -> Result<VersionedEntry, StorageError> {
        self.initialize_entry(input)
    }

    fn supersede_entry_row(
        &mut self,
        input: SupersedeInput,
        changed_at: Timestamp,
    ) -> Result<SupersedeOutcome, StorageError> {
        self.supersede_entry(input, changed_at)
    }

    fn entry_rows(&self) -> &BTreeMap<EntryId, VersionedEntry> {
        VersionedConfigStore::entry_rows(self)
    }

    fn current_entry_row(&self, table: &SubjectTable, key: &ConfigKey) -> Option<&VersionedEntry> {
        self.current_entry(table, key)
    }

    fn entry_row_as_of(
        &self,
        table: &SubjectTable,
        key: &ConfigKey,
        at: Timestamp,
    ) -> Option<&VersionedEntry> {
        self.entry_as_of(table, key, at)
    }

    fn entry_history_rows(&self, table: &SubjectTable, key: &ConfigKey) -> Vec<&VersionedEntry> {
        self.entry_history(table, key)
    }

    fn current_entry_rows(&self, table: &SubjectTable) -> Vec<&VersionedEntry> {
        self.current_entries(table)
    }

    fn rebuild_entry_key_index(&mut self) {
        self.rebuild_key_index_from_entries()
    }
}

impl AuditLogTablesRepo for VersionedConfigStore {
    fn append_audit_row(&mut self, input: AuditRecordInput) -> Result<AuditRecordId, StorageError> {
        AuditTrail::emit(self, input)
    }

    fn audit_rows(&self) -> &[AuditRecord] {
        self.audit_records()
    }

    fn audit_rows_by_subject(&self, table: &SubjectTable, subject_key: EntryId) -> Vec<&AuditRecord> {
        self.audit_records_by_subject(table, subject_key)
    }

    fn recent_audit_rows(&self, table: &SubjectTable, limit: usize) -> Vec<&AuditRecord> {
        self.recent_audit_records(table, limit)
    }
}
