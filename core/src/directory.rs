//! User directory: who can be picked as a chat peer
//!
//! The user list itself belongs to the identity/profile provider
//! ([`DirectorySource`]); this module only drops the caller from it and
//! filters it by display name.
use crate::error::{ChatError, Result};
use crate::messenger_types::UserRef;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Snapshot of another user, valid for the current session only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub display_name: String,
}

impl DirectoryEntry {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

impl From<UserRef> for DirectoryEntry {
    fn from(user: UserRef) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name,
        }
    }
}

/// Read-only list of every registered user
pub trait DirectorySource: Send + Sync {
    fn users(&self) -> Result<Vec<DirectoryEntry>>;
}

impl DirectorySource for Vec<DirectoryEntry> {
    fn users(&self) -> Result<Vec<DirectoryEntry>> {
        Ok(self.clone())
    }
}

#[derive(Clone)]
pub struct DirectoryIndex {
    source: Arc<dyn DirectorySource>,
}

impl DirectoryIndex {
    pub fn new(source: Arc<dyn DirectorySource>) -> Self {
        Self { source }
    }

    /// Everyone but `excluding_id`, in source order
    pub fn list(&self, excluding_id: &str) -> Result<Vec<DirectoryEntry>> {
        let mut entries = self.source.users()?;
        entries.retain(|e| e.id != excluding_id);
        debug!("Directory lists {} users for {}", entries.len(), excluding_id);
        Ok(entries)
    }

    /// Case-insensitive substring match on the display name.
    /// An empty query keeps everything.
    pub fn filter(entries: &[DirectoryEntry], query: &str) -> Vec<DirectoryEntry> {
        if query.is_empty() {
            return entries.to_vec();
        }
        let needle = query.to_lowercase();
        entries
            .iter()
            .filter(|e| e.display_name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct UserRecord {
    id: String,
    display_name: Option<String>,
    registered_at: String, // RFC3339
}

/// Sled-backed user directory, used when no external provider is wired in
#[derive(Clone)]
pub struct UserDirectory {
    db: sled::Db,
}

impl UserDirectory {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = sled::open(data_dir.join("users.db"))
            .map_err(|e| ChatError::StoreUnavailable(format!("users DB: {}", e)))?;
        Ok(Self { db })
    }

    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| ChatError::StoreUnavailable(format!("users DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Add or rename a user
    pub fn register(&self, user: &UserRef) -> Result<()> {
        let record = UserRecord {
            id: user.id.clone(),
            display_name: Some(user.display_name.clone()),
            registered_at: chrono::Utc::now().to_rfc3339(),
        };
        let val = serde_json::to_vec(&record)?;
        self.db
            .insert(user.id.as_bytes(), val)
            .map_err(|e| ChatError::StoreUnavailable(format!("register: {}", e)))?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<DirectoryEntry>> {
        match self
            .db
            .get(id.as_bytes())
            .map_err(|e| ChatError::StoreUnavailable(format!("get_user: {}", e)))?
        {
            Some(val) => {
                let record = serde_json::from_slice::<UserRecord>(&val)?;
                Ok(record.display_name.map(|name| DirectoryEntry::new(record.id, name)))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, id: &str) -> Result<bool> {
        let removed = self
            .db
            .remove(id.as_bytes())
            .map_err(|e| ChatError::StoreUnavailable(format!("remove_user: {}", e)))?;
        Ok(removed.is_some())
    }
}

impl DirectorySource for UserDirectory {
    fn users(&self) -> Result<Vec<DirectoryEntry>> {
        let mut out = Vec::new();
        for entry in self.db.iter() {
            let (key, val) =
                entry.map_err(|e| ChatError::StoreUnavailable(format!("list_users: {}", e)))?;
            match serde_json::from_slice::<UserRecord>(&val) {
                // No display name, nothing to show
                Ok(UserRecord {
                    display_name: None, ..
                }) => {}
                Ok(UserRecord {
                    id,
                    display_name: Some(name),
                    ..
                }) => out.push(DirectoryEntry::new(id, name)),
                Err(e) => warn!(
                    "Skipping unreadable user record {}: {}",
                    String::from_utf8_lossy(&key),
                    e
                ),
            }
        }
        Ok(out)
    }
}
