#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use eskala_kernel_contracts::actor::UserId;
use eskala_kernel_contracts::audit::AuditRecord;

/// Shown when a change cannot be tied to a live or recorded user.
pub const SYSTEM_ACTOR: &str = "System";

/// Read-only view of the external user table.
pub trait UserDirectory: Send + Sync {
    fn username(&self, user_id: UserId) -> Option<String>;

    /// One lookup for a whole set of ids. Ids with no user are left out of the map.
    fn usernames(&self, user_ids: &BTreeSet<UserId>) -> BTreeMap<UserId, String> {
        user_ids
            .iter()
            .filter_map(|id| self.username(*id).map(|name| (*id, name)))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub user_id: UserId,
    pub username: Option<String>,
    pub email: String,
}

impl UserRecord {
    /// Username when set and non-blank, else the email. `None` when both are blank.
    pub fn display_name(&self) -> Option<&str> {
        self.username
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .or_else(|| Some(self.email.trim()).filter(|email| !email.is_empty()))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryUserDirectory {
    users: RwLock<BTreeMap<UserId, UserRecord>>,
}

impl InMemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: impl IntoIterator<Item = UserRecord>) -> Self {
        let dir = Self::new();
        for user in users {
            dir.insert(user);
        }
        dir
    }

    pub fn insert(&self, user: UserRecord) {
        self.write_users().insert(user.user_id, user);
    }

    pub fn remove(&self, user_id: UserId) -> Option<UserRecord> {
        self.write_users().remove(&user_id)
    }

    // A panicked writer cannot leave the map half-updated, so poisoning is logged and cleared.
    fn read_users(&self) -> RwLockReadGuard<'_, BTreeMap<UserId, UserRecord>> {
        self.users.read().unwrap_or_else(|poisoned| {
            tracing::error!("user directory lock poisoned");
            PoisonError::into_inner(poisoned)
        })
    }

    fn write_users(&self) -> RwLockWriteGuard<'_, BTreeMap<UserId, UserRecord>> {
        self.users.write().unwrap_or_else(|poisoned| {
            tracing::error!("user directory lock poisoned");
            PoisonError::into_inner(poisoned)
        })
    }
}

impl UserDirectory for InMemoryUserDirectory {
    fn username(&self, user_id: UserId) -> Option<String> {
        self.read_users()
            .get(&user_id)
            .and_then(UserRecord::display_name)
            .map(str::to_string)
    }

    fn usernames(&self, user_ids: &BTreeSet<UserId>) -> BTreeMap<UserId, String> {
        let users = self.read_users();
        user_ids
            .iter()
            .filter_map(|id| {
                users
                    .get(id)
                    .and_then(UserRecord::display_name)
                    .map(|name| (*id, name.to_string()))
            })
            .collect()
    }
}

fn recorded_name(record: &AuditRecord) -> Option<&str> {
    record
        .diff
        .actor_display_name
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
}

/// Display name for whoever made the change: the name captured at write time, then the
/// live directory entry for `changed_by`, then [`SYSTEM_ACTOR`].
pub fn resolve(record: &AuditRecord, directory: &dyn UserDirectory) -> String {
    if let Some(name) = recorded_name(record) {
        return name.to_string();
    }
    record
        .changed_by
        .and_then(|id| directory.username(id))
        .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
}

/// Same as [`resolve`] for many records, with a single directory round trip.
pub fn resolve_batch(records: &[AuditRecord], directory: &dyn UserDirectory) -> Vec<String> {
    let wanted: BTreeSet<UserId> = records
        .iter()
        .filter(|r| recorded_name(r).is_none())
        .filter_map(|r| r.changed_by)
        .collect();
    let names = if wanted.is_empty() {
        BTreeMap::new()
    } else {
        directory.usernames(&wanted)
    };
    records
        .iter()
        .map(|r| {
            recorded_name(r)
                .map(str::to_string)
                .or_else(|| r.changed_by.and_then(|id| names.get(&id).cloned()))
                .unwrap_or_else(|| SYSTEM_ACTOR.to_string())
        })
        .collect()
}
