//! Read-mostly credential store consumed by admission and the main-channel
//! RPCs. Durability is the store's problem, not the mediator's; the mediator
//! only ever asks the four questions below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such user: {0}")]
    UnknownUser(String),
    #[error("user already exists: {0}")]
    DuplicateUser(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// The contract the mediator has with whatever keeps the credentials.
pub trait CredentialStore: Send + Sync {
    fn username_exists(&self, username: &str) -> Result<bool, StoreError>;
    fn password_of(&self, username: &str) -> Result<String, StoreError>;
    fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError>;
    fn all_usernames(&self) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserTable {
    users: BTreeMap<String, String>,
}

/// Credential store backed by a JSON file.
///
/// The table is loaded once at open and persisted on every mutation. Handles
/// are cheap clones sharing the loaded table, so each worker can hold its
/// own.
#[derive(Clone)]
pub struct JsonStore {
    inner: Arc<Inner>,
}

struct Inner {
    path: Option<PathBuf>,
    table: Mutex<UserTable>,
}

impl JsonStore {
    /// Open a store at `path`, creating an empty one when the file does not
    /// exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<JsonStore, StoreError> {
        let path = path.as_ref().to_path_buf();
        let table = if path.exists() {
            let content =
                std::fs::read_to_string(&path).map_err(|e| StoreError::Io(e.to_string()))?;
            serde_json::from_str(&content).map_err(|e| StoreError::Parse(e.to_string()))?
        } else {
            UserTable::default()
        };
        Ok(JsonStore {
            inner: Arc::new(Inner {
                path: Some(path),
                table: Mutex::new(table),
            }),
        })
    }

    /// An in-memory store that never touches disk. Used by tests and by
    /// deployments that provision users at startup.
    pub fn in_memory() -> JsonStore {
        JsonStore {
            inner: Arc::new(Inner {
                path: None,
                table: Mutex::new(UserTable::default()),
            }),
        }
    }

    fn persist(&self, table: &UserTable) -> Result<(), StoreError> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let content =
            serde_json::to_string_pretty(table).map_err(|e| StoreError::Parse(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| StoreError::Io(e.to_string()))
    }
}

impl CredentialStore for JsonStore {
    fn username_exists(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.inner.table.lock().unwrap().users.contains_key(username))
    }

    fn password_of(&self, username: &str) -> Result<String, StoreError> {
        self.inner
            .table
            .lock()
            .unwrap()
            .users
            .get(username)
            .cloned()
            .ok_or_else(|| StoreError::UnknownUser(username.to_string()))
    }

    fn add_user(&self, username: &str, password: &str) -> Result<(), StoreError> {
        let mut table = self.inner.table.lock().unwrap();
        if table.users.contains_key(username) {
            return Err(StoreError::DuplicateUser(username.to_string()));
        }
        table
            .users
            .insert(username.to_string(), password.to_string());
        self.persist(&table)
    }

    fn all_usernames(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.table.lock().unwrap().users.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_look_up_user() {
        let store = JsonStore::in_memory();
        store.add_user("alice", "pw").unwrap();
        assert!(store.username_exists("alice").unwrap());
        assert_eq!(store.password_of("alice").unwrap(), "pw");
        assert!(!store.username_exists("bob").unwrap());
    }

    #[test]
    fn test_duplicate_user_rejected() {
        let store = JsonStore::in_memory();
        store.add_user("alice", "pw").unwrap();
        assert!(matches!(
            store.add_user("alice", "other"),
            Err(StoreError::DuplicateUser(_))
        ));
    }

    #[test]
    fn test_unknown_password_lookup_fails() {
        let store = JsonStore::in_memory();
        assert!(matches!(
            store.password_of("ghost"),
            Err(StoreError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_usernames_listed() {
        let store = JsonStore::in_memory();
        store.add_user("alice", "a").unwrap();
        store.add_user("bob", "b").unwrap();
        assert_eq!(store.all_usernames().unwrap(), vec!["alice", "bob"]);
    }

    #[test]
    fn test_persisted_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        {
            let store = JsonStore::open(&path).unwrap();
            store.add_user("alice", "pw").unwrap();
        }
        let reopened = JsonStore::open(&path).unwrap();
        assert_eq!(reopened.password_of("alice").unwrap(), "pw");
    }
}
