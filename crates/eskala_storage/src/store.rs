#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use eskala_kernel_contracts::audit::{
    AuditAction, AuditDiff, AuditRecord, AuditRecordId, AuditRecordInput,
};
use eskala_kernel_contracts::versioned::{
    ConfigKey, EntryId, EntryInitInput, EntryVersion, SubjectTable, SupersedeInput,
    VersionedEntry, VERSIONED_CONTRACT_VERSION,
};
use eskala_kernel_contracts::{ContractViolation, Timestamp, Validate};
use serde::{Deserialize, Serialize};

pub const VERSIONED_ENTRIES_TABLE: &str = "versioned_entries";
pub const AUDIT_LOG_TABLE: &str = "audit_log";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("{table}: no entry for key '{key}'")]
    NotFound { table: String, key: String },
    #[error("{table}: key '{key}' already exists")]
    DuplicateKey { table: String, key: String },
    #[error("{table}: key '{key}' is at version {found}, caller expected {expected}")]
    StaleVersion {
        table: String,
        key: String,
        expected: u32,
        found: u32,
    },
    #[error("{table}: effective instant for key '{key}' precedes the open entry's valid_from")]
    TemporalOrderViolation { table: String, key: String },
    #[error("{table}: referenced row '{key}' does not exist")]
    ForeignKeyViolation { table: &'static str, key: String },
    #[error("{table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("integrity violation: {detail}")]
    IntegrityViolation { detail: String },
    #[error("journal '{path}': {message}")]
    Journal { path: String, message: String },
    #[error("store lock poisoned")]
    LockPoisoned,
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

fn integrity(detail: impl Into<String>) -> StorageError {
    StorageError::IntegrityViolation {
        detail: detail.into(),
    }
}

/// Fully computed supersede: close one row, open its successor, log the transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupersedePlan {
    pub closed_entry_id: EntryId,
    pub valid_to: Timestamp,
    pub new_entry: VersionedEntry,
    pub audit: AuditRecord,
}

/// Unit of change. Planned under the write lock, journaled, then applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMutation {
    InitializeEntry(VersionedEntry),
    SupersedeEntry(SupersedePlan),
    AppendAudit(AuditRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupersedeOutcome {
    pub closed_entry: VersionedEntry,
    pub opened_entry: VersionedEntry,
    pub audit_record_id: AuditRecordId,
}

impl SupersedeOutcome {
    pub fn old_version(&self) -> EntryVersion {
        self.closed_entry.version
    }

    pub fn new_version(&self) -> EntryVersion {
        self.opened_entry.version
    }
}

/// Versioned-entry and audit-log tables.
///
/// Entries are never deleted; the only in-place change is stamping `valid_to` on the
/// row being superseded. The audit log only grows.
#[derive(Debug, Clone)]
pub struct VersionedConfigStore {
    entries: BTreeMap<EntryId, VersionedEntry>,
    // (table, key) -> entry ids in version order; only the last may be open.
    key_versions: BTreeMap<(SubjectTable, ConfigKey), Vec<EntryId>>,
    next_entry_id: u64,

    audit_log: Vec<AuditRecord>,
    next_audit_record_id: u64,
}

impl Default for VersionedConfigStore {
    fn default() -> Self {
        Self::new_in_memory()
    }
}

impl VersionedConfigStore {
    pub fn new_in_memory() -> Self {
        Self {
            entries: BTreeMap::new(),
            key_versions: BTreeMap::new(),
            next_entry_id: 1,
            audit_log: Vec::new(),
            next_audit_record_id: 1,
        }
    }

    // ------------------------
    // Planning (read-only).
    // ------------------------

    pub fn plan_initialize(&self, input: EntryInitInput) -> Result<VersionedEntry, StorageError> {
        input.validate()?;
        if self
            .key_versions
            .contains_key(&(input.table.clone(), input.key.clone()))
        {
            return Err(StorageError::DuplicateKey {
                table: input.table.as_str().to_string(),
                key: input.key.as_str().to_string(),
            });
        }
        let entry = VersionedEntry {
            schema_version: VERSIONED_CONTRACT_VERSION,
            entry_id: EntryId(self.next_entry_id),
            table: input.table,
            key: input.key,
            value: input.value,
            version: EntryVersion::FIRST,
            valid_from: input.valid_from,
            valid_to: None,
            description: input.description,
        };
        entry.validate()?;
        Ok(entry)
    }

    pub fn plan_supersede(
        &self,
        input: SupersedeInput,
        changed_at: Timestamp,
    ) -> Result<SupersedePlan, StorageError> {
        input.validate()?;
        let current = self
            .current_entry(&input.table, &input.key)
            .ok_or_else(|| StorageError::NotFound {
                table: input.table.as_str().to_string(),
                key: input.key.as_str().to_string(),
            })?;

        if let Some(expected) = input.expected_version {
            if expected != current.version {
                return Err(StorageError::StaleVersion {
                    table: input.table.as_str().to_string(),
                    key: input.key.as_str().to_string(),
                    expected: expected.0,
                    found: current.version.0,
                });
            }
        }
        if input.effective_at < current.valid_from {
            return Err(StorageError::TemporalOrderViolation {
                table: input.table.as_str().to_string(),
                key: input.key.as_str().to_string(),
            });
        }
        let new_version = current
            .version
            .next()
            .ok_or_else(|| integrity("entry version overflow"))?;

        let new_entry = VersionedEntry {
            schema_version: VERSIONED_CONTRACT_VERSION,
            entry_id: EntryId(self.next_entry_id),
            table: input.table.clone(),
            key: input.key,
            value: input.new_value,
            version: new_version,
            valid_from: input.effective_at,
            valid_to: None,
            description: current.description.clone(),
        };
        new_entry.validate()?;

        let diff = AuditDiff {
            old_value: Some(current.value.as_str().to_string()),
            new_value: new_entry.value.as_str().to_string(),
            old_version: Some(current.version),
            new_version,
            reason: input.reason,
            effective_at: Some(input.effective_at),
            actor_display_name: input.actor.display_name,
        };
        let audit = AuditRecord::from_input_v1(
            AuditRecordId(self.next_audit_record_id),
            AuditRecordInput::v1(
                input.table,
                new_entry.entry_id,
                AuditAction::ValueChanged,
                diff,
                input.actor.user_id,
                changed_at,
            )?,
        )?;

        Ok(SupersedePlan {
            closed_entry_id: current.entry_id,
            valid_to: input.effective_at,
            new_entry,
            audit,
        })
    }

    pub fn plan_audit_append(&self, input: AuditRecordInput) -> Result<AuditRecord, StorageError> {
        input.validate()?;
        self.check_audit_subject(&input.subject_table, input.subject_key)?;
        Ok(AuditRecord::from_input_v1(
            AuditRecordId(self.next_audit_record_id),
            input,
        )?)
    }

    fn check_audit_subject(
        &self,
        table: &SubjectTable,
        subject_key: EntryId,
    ) -> Result<(), StorageError> {
        match self.entries.get(&subject_key) {
            Some(e) if &e.table == table => Ok(()),
            _ => Err(StorageError::ForeignKeyViolation {
                table: VERSIONED_ENTRIES_TABLE,
                key: subject_key.0.to_string(),
            }),
        }
    }

    // ------------------------
    // Applying. Every check runs before the first write.
    // ------------------------

    pub fn apply_mutation(&mut self, mutation: &StoreMutation) -> Result<(), StorageError> {
        match mutation {
            StoreMutation::InitializeEntry(entry) => self.apply_initialize(entry),
            StoreMutation::SupersedeEntry(plan) => self.apply_supersede(plan).map(|_| ()),
            StoreMutation::AppendAudit(record) => self.apply_audit_append(record),
        }
    }

    pub fn apply_initialize(&mut self, entry: &VersionedEntry) -> Result<(), StorageError> {
        entry.validate()?;
        if entry.entry_id.0 != self.next_entry_id {
            return Err(integrity(format!(
                "initialize expected entry_id {}, got {}",
                self.next_entry_id, entry.entry_id.0
            )));
        }
        if entry.version != EntryVersion::FIRST || !entry.is_open() {
            return Err(integrity("initialize must open version 1"));
        }
        let idx = (entry.table.clone(), entry.key.clone());
        if self.key_versions.contains_key(&idx) {
            return Err(StorageError::DuplicateKey {
                table: entry.table.as_str().to_string(),
                key: entry.key.as_str().to_string(),
            });
        }

        self.entries.insert(entry.entry_id, entry.clone());
        self.key_versions.insert(idx, vec![entry.entry_id]);
        self.next_entry_id = self.next_entry_id.saturating_add(1);
        Ok(())
    }

    pub fn apply_supersede(&mut self, plan: &SupersedePlan) -> Result<SupersedeOutcome, StorageError> {
        let new_entry = &plan.new_entry;
        new_entry.validate()?;
        plan.audit.validate()?;

        let current = self
            .current_entry(&new_entry.table, &new_entry.key)
            .ok_or_else(|| StorageError::NotFound {
                table: new_entry.table.as_str().to_string(),
                key: new_entry.key.as_str().to_string(),
            })?;
        if current.entry_id != plan.closed_entry_id {
            return Err(integrity(format!(
                "entry {} is not the open entry for '{}'",
                plan.closed_entry_id.0,
                new_entry.key.as_str()
            )));
        }
        if plan.valid_to < current.valid_from {
            return Err(StorageError::TemporalOrderViolation {
                table: new_entry.table.as_str().to_string(),
                key: new_entry.key.as_str().to_string(),
            });
        }
        if new_entry.valid_from != plan.valid_to || !new_entry.is_open() {
            return Err(integrity("successor must open exactly where its predecessor closes"));
        }
        if Some(new_entry.version) != current.version.next() {
            return Err(integrity("successor version must be contiguous"));
        }
        if new_entry.entry_id.0 != self.next_entry_id {
            return Err(integrity(format!(
                "supersede expected entry_id {}, got {}",
                self.next_entry_id, new_entry.entry_id.0
            )));
        }
        if plan.audit.record_id.0 != self.next_audit_record_id {
            return Err(integrity(format!(
                "supersede expected audit record_id {}, got {}",
                self.next_audit_record_id, plan.audit.record_id.0
            )));
        }
        if plan.audit.subject_key != new_entry.entry_id
            || plan.audit.subject_table != new_entry.table
        {
            return Err(integrity("audit record must reference the opened entry"));
        }

        let idx = (new_entry.table.clone(), new_entry.key.clone());
        let closed_entry = match self.entries.get_mut(&plan.closed_entry_id) {
            Some(row) => {
                row.valid_to = Some(plan.valid_to);
                row.clone()
            }
            None => return Err(integrity("open entry vanished while applying supersede")),
        };
        self.entries.insert(new_entry.entry_id, new_entry.clone());
        self.key_versions
            .entry(idx)
            .or_default()
            .push(new_entry.entry_id);
        self.next_entry_id = self.next_entry_id.saturating_add(1);
        self.audit_log.push(plan.audit.clone());
        self.next_audit_record_id = self.next_audit_record_id.saturating_add(1);

        Ok(SupersedeOutcome {
            closed_entry,
            opened_entry: new_entry.clone(),
            audit_record_id: plan.audit.record_id,
        })
    }

    pub fn apply_audit_append(&mut self, record: &AuditRecord) -> Result<(), StorageError> {
        record.validate()?;
        if record.record_id.0 != self.next_audit_record_id {
            return Err(integrity(format!(
                "audit append expected record_id {}, got {}",
                self.next_audit_record_id, record.record_id.0
            )));
        }
        self.check_audit_subject(&record.subject_table, record.subject_key)?;
        self.audit_log.push(record.clone());
        self.next_audit_record_id = self.next_audit_record_id.saturating_add(1);
        Ok(())
    }

    // ------------------------
    // Direct (unjournaled) writes.
    // ------------------------

    pub fn initialize_entry(&mut self, input: EntryInitInput) -> Result<VersionedEntry, StorageError> {
        let entry = self.plan_initialize(input)?;
        self.apply_initialize(&entry)?;
        Ok(entry)
    }

    pub fn supersede_entry(
        &mut self,
        input: SupersedeInput,
        changed_at: Timestamp,
    ) -> Result<SupersedeOutcome, StorageError> {
        let plan = self.plan_supersede(input, changed_at)?;
        self.apply_supersede(&plan)
    }

    pub(crate) fn append_audit_record(
        &mut self,
        input: AuditRecordInput,
    ) -> Result<AuditRecordId, StorageError> {
        let record = self.plan_audit_append(input)?;
        self.apply_audit_append(&record)?;
        Ok(record.record_id)
    }

    // ------------------------
    // Versioned entry reads.
    // ------------------------

    pub fn entry(&self, entry_id: EntryId) -> Option<&VersionedEntry> {
        self.entries.get(&entry_id)
    }

    pub fn entry_rows(&self) -> &BTreeMap<EntryId, VersionedEntry> {
        &self.entries
    }

    pub fn current_entry(&self, table: &SubjectTable, key: &ConfigKey) -> Option<&VersionedEntry> {
        self.key_versions
            .get(&(table.clone(), key.clone()))
            .and_then(|ids| ids.last())
            .and_then(|id| self.entries.get(id))
            .filter(|e| e.is_open())
    }

    pub fn entry_as_of(
        &self,
        table: &SubjectTable,
        key: &ConfigKey,
        at: Timestamp,
    ) -> Option<&VersionedEntry> {
        self.key_versions
            .get(&(table.clone(), key.clone()))?
            .iter()
            .rev()
            .filter_map(|id| self.entries.get(id))
            .find(|e| e.covers(at))
    }

    /// Every version of `key`, newest first.
    pub fn entry_history(&self, table: &SubjectTable, key: &ConfigKey) -> Vec<&VersionedEntry> {
        self.key_versions
            .get(&(table.clone(), key.clone()))
            .map(|ids| {
                ids.iter()
                    .rev()
                    .filter_map(|id| self.entries.get(id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Open entries of a dataset, ordered by key.
    pub fn current_entries(&self, table: &SubjectTable) -> Vec<&VersionedEntry> {
        self.key_versions
            .iter()
            .filter(|((t, _), _)| t == table)
            .filter_map(|(_, ids)| ids.last())
            .filter_map(|id| self.entries.get(id))
            .filter(|e| e.is_open())
            .collect()
    }

    /// Closed entries of a dataset, most recently closed first.
    pub fn closed_entries(&self, table: &SubjectTable) -> Vec<&VersionedEntry> {
        let mut rows: Vec<&VersionedEntry> = self
            .entries
            .values()
            .filter(|e| &e.table == table && !e.is_open())
            .collect();
        rows.sort_by(|a, b| b.valid_to.cmp(&a.valid_to).then(b.entry_id.cmp(&a.entry_id)));
        rows
    }

    pub fn attempt_delete_entry(&mut self, _entry_id: EntryId) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: VERSIONED_ENTRIES_TABLE,
        })
    }

    // ------------------------
    // Audit log reads.
    // ------------------------

    pub fn audit_records(&self) -> &[AuditRecord] {
        &self.audit_log
    }

    /// Newest first.
    pub fn audit_records_by_subject(
        &self,
        table: &SubjectTable,
        subject_key: EntryId,
    ) -> Vec<&AuditRecord> {
        self.audit_log
            .iter()
            .rev()
            .filter(|r| &r.subject_table == table && r.subject_key == subject_key)
            .collect()
    }

    /// Newest first, at most `limit` rows.
    pub fn recent_audit_records(&self, table: &SubjectTable, limit: usize) -> Vec<&AuditRecord> {
        self.audit_log
            .iter()
            .rev()
            .filter(|r| &r.subject_table == table)
            .take(limit)
            .collect()
    }

    pub fn attempt_overwrite_audit_record(
        &mut self,
        _record_id: AuditRecordId,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: AUDIT_LOG_TABLE,
        })
    }

    // ------------------------
    // Index maintenance + integrity.
    // ------------------------

    pub fn rebuild_key_index_from_entries(&mut self) {
        self.key_versions.clear();
        let mut ordered: Vec<&VersionedEntry> = self.entries.values().collect();
        ordered.sort_by_key(|e| (e.table.clone(), e.key.clone(), e.version));
        for e in ordered {
            self.key_versions
                .entry((e.table.clone(), e.key.clone()))
                .or_default()
                .push(e.entry_id);
        }
    }

    /// Checks one key's timeline: versions 1..=N, one open row (the last), no gaps or overlaps.
    pub fn verify_key_timeline(
        &self,
        table: &SubjectTable,
        key: &ConfigKey,
    ) -> Result<(), StorageError> {
        let ids = self
            .key_versions
            .get(&(table.clone(), key.clone()))
            .ok_or_else(|| StorageError::NotFound {
                table: table.as_str().to_string(),
                key: key.as_str().to_string(),
            })?;
        let mut prev: Option<&VersionedEntry> = None;
        for (i, id) in ids.iter().enumerate() {
            let e = self
                .entries
                .get(id)
                .ok_or_else(|| integrity(format!("dangling entry id {}", id.0)))?;
            let expected = u32::try_from(i + 1).map_err(|_| integrity("too many versions"))?;
            if e.version.0 != expected {
                return Err(integrity(format!(
                    "'{}' version gap: expected {}, found {}",
                    key.as_str(),
                    expected,
                    e.version.0
                )));
            }
            let is_last = i + 1 == ids.len();
            if e.is_open() != is_last {
                return Err(integrity(format!(
                    "'{}' must have exactly one open entry, the latest",
                    key.as_str()
                )));
            }
            if let Some(p) = prev {
                if p.valid_to != Some(e.valid_from) {
                    return Err(integrity(format!(
                        "'{}' versions {} and {} are not contiguous",
                        key.as_str(),
                        p.version.0,
                        e.version.0
                    )));
                }
            }
            prev = Some(e);
        }
        Ok(())
    }

    pub fn verify_all(&self) -> Result<(), StorageError> {
        for (table, key) in self.key_versions.keys() {
            self.verify_key_timeline(table, key)?;
        }
        for r in &self.audit_log {
            self.check_audit_subject(&r.subject_table, r.subject_key)?;
        }
        Ok(())
    }
}
