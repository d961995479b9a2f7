#![forbid(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::store::{StorageError, StoreMutation, VersionedConfigStore};

pub const JOURNAL_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct JournalEntry {
    schema_version: u32,
    mutation: StoreMutation,
}

/// Append-only JSONL file of applied mutations; replayed on open.
///
/// A failed append truncates the file back to its previous length. If that truncation
/// also fails the journal refuses every later append.
#[derive(Debug, Clone)]
pub struct StoreJournal {
    path: PathBuf,
    failed: Option<String>,
}

fn write_line(file: &mut File, line: &[u8]) -> io::Result<()> {
    file.write_all(line)?;
    file.sync_data()
}

fn truncate_to(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len)?;
    file.sync_data()
}

impl StoreJournal {
    /// Creates parent directories and an empty file when missing.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let journal = Self {
            path: path.into(),
            failed: None,
        };
        if let Some(parent) = journal.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    journal.error(format!(
                        "failed to create directory '{}': {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        if !journal.path.exists() {
            File::create(&journal.path)
                .map_err(|err| journal.error(format!("failed to create: {err}")))?;
        }
        Ok(journal)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    fn error(&self, message: String) -> StorageError {
        StorageError::Journal {
            path: self.path.display().to_string(),
            message,
        }
    }

    /// Re-applies every journaled mutation in order. Returns how many were applied.
    pub fn replay_into(&self, store: &mut VersionedConfigStore) -> Result<usize, StorageError> {
        let file = File::open(&self.path)
            .map_err(|err| self.error(format!("failed to open: {err}")))?;
        let mut applied = 0usize;
        for (line_no, line_result) in BufReader::new(file).lines().enumerate() {
            let line = line_result.map_err(|err| {
                self.error(format!("failed reading line {}: {err}", line_no + 1))
            })?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: JournalEntry = serde_json::from_str(&line).map_err(|err| {
                self.error(format!("failed parsing line {}: {err}", line_no + 1))
            })?;
            if entry.schema_version != JOURNAL_SCHEMA_VERSION {
                return Err(self.error(format!(
                    "unsupported schema_version={} at line {}",
                    entry.schema_version,
                    line_no + 1
                )));
            }
            store.apply_mutation(&entry.mutation).map_err(|err| {
                self.error(format!("replay failed at line {}: {err}", line_no + 1))
            })?;
            applied += 1;
        }
        Ok(applied)
    }

    /// Durably appends one mutation (written and synced before returning).
    pub fn append(&mut self, mutation: &StoreMutation) -> Result<(), StorageError> {
        let entry = JournalEntry {
            schema_version: JOURNAL_SCHEMA_VERSION,
            mutation: mutation.clone(),
        };
        let mut line = serde_json::to_string(&entry)
            .map_err(|err| self.error(format!("failed to encode entry: {err}")))?;
        line.push('\n');
        self.append_line(line.as_bytes(), write_line, truncate_to)
    }

    fn append_line(
        &mut self,
        line: &[u8],
        write: impl FnOnce(&mut File, &[u8]) -> io::Result<()>,
        rollback: impl FnOnce(&File, u64) -> io::Result<()>,
    ) -> Result<(), StorageError> {
        if let Some(reason) = &self.failed {
            return Err(self.error(format!("journal is unusable: {reason}")));
        }
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| self.error(format!("failed opening for append: {err}")))?;
        let len = file
            .metadata()
            .map_err(|err| self.error(format!("failed reading length: {err}")))?
            .len();

        let Err(write_err) = write(&mut file, line) else {
            return Ok(());
        };
        match rollback(&file, len) {
            Ok(()) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %write_err,
                    "journal append failed, truncated back"
                );
                Err(self.error(format!("failed writing: {write_err}")))
            }
            Err(rollback_err) => {
                let reason = format!(
                    "append failed ({write_err}) and truncation to {len} bytes failed ({rollback_err})"
                );
                tracing::error!(path = %self.path.display(), %reason, "journal left torn");
                self.failed = Some(reason.clone());
                Err(self.error(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    use chrono::{TimeZone, Utc};
    use eskala_kernel_contracts::versioned::{
        ConfigKey, ConfigValue, EntryInitInput, SubjectTable,
    };

    fn temp_path(tag: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir()
            .join(format!("eskala_journal_{tag}_{}_{nanos}", std::process::id()))
            .join("journal.jsonl")
    }

    fn init_mutation(store: &VersionedConfigStore, key: &str) -> StoreMutation {
        let input = EntryInitInput::v1(
            SubjectTable::new("fx_rates").unwrap(),
            ConfigKey::new(key).unwrap(),
            ConfigValue::new("25.00").unwrap(),
            None,
            Utc.timestamp_opt(1_000, 0).unwrap(),
        )
        .unwrap();
        StoreMutation::InitializeEntry(store.plan_initialize(input).unwrap())
    }

    fn encoded(mutation: &StoreMutation) -> Vec<u8> {
        let entry = JournalEntry {
            schema_version: JOURNAL_SCHEMA_VERSION,
            mutation: mutation.clone(),
        };
        let mut line = serde_json::to_string(&entry).unwrap();
        line.push('\n');
        line.into_bytes()
    }

    #[test]
    fn at_journal_01_failed_append_is_truncated_away() {
        let path = temp_path("torn");
        let mut journal = StoreJournal::open(&path).unwrap();
        let store = VersionedConfigStore::new_in_memory();
        let first = init_mutation(&store, "fx_HNL_USD");

        // Half the line lands, then the sync fails.
        let err = journal
            .append_line(
                &encoded(&first),
                |file, line| {
                    file.write_all(&line[..line.len() / 2])?;
                    Err(io::Error::new(io::ErrorKind::Other, "disk gone"))
                },
                truncate_to,
            )
            .unwrap_err();
        assert!(matches!(err, StorageError::Journal { .. }));
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
        assert!(!journal.is_failed());

        journal.append(&first).unwrap();
        let mut replayed = VersionedConfigStore::new_in_memory();
        assert_eq!(journal.replay_into(&mut replayed).unwrap(), 1);
        assert_eq!(replayed.entry_rows().len(), 1);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn at_journal_02_failed_rollback_refuses_later_appends() {
        let path = temp_path("stuck");
        let mut journal = StoreJournal::open(&path).unwrap();
        let store = VersionedConfigStore::new_in_memory();
        let mutation = init_mutation(&store, "fx_HNL_USD");

        let err = journal
            .append_line(
                &encoded(&mutation),
                |_, _| Err(io::Error::new(io::ErrorKind::Other, "eio")),
                |_, _| Err(io::Error::new(io::ErrorKind::Other, "eio again")),
            )
            .unwrap_err();
        assert!(err.to_string().contains("truncation"), "{err}");
        assert!(journal.is_failed());

        let err = journal.append(&mutation).unwrap_err();
        assert!(err.to_string().contains("unusable"), "{err}");
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
