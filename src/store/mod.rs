//! List Stores
//!
//! Blacklist and exemption lists on top of a pluggable key-value backend.
//!
//! # Layout
//!
//! Each list owns a key prefix (`blacklist/`, `exemption/`). An entry is one
//! key holding the JSON-encoded [`ListEntry`], so adding, updating and
//! removing an identity is a single-key write and a reader sees either the
//! whole entry or nothing.
//!
//! # Backends
//!
//! - [`MemoryBackend`]: sharded in-process map
//! - [`FileBackend`]: in-process map persisted to a JSON snapshot file

pub mod file;
pub mod memory;

pub use file::FileBackend;
pub use memory::MemoryBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreError;

/// Key-value persistence contract. Reads after a completed write to the
/// same key must observe that write.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, String)>, StoreError>;
}

/// Which list a store holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListKind {
    Blacklist,
    Exemption,
}

impl ListKind {
    fn prefix(&self) -> &'static str {
        match self {
            ListKind::Blacklist => "blacklist/",
            ListKind::Exemption => "exemption/",
        }
    }
}

impl std::fmt::Display for ListKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListKind::Blacklist => write!(f, "blacklist"),
            ListKind::Exemption => write!(f, "exemption"),
        }
    }
}

/// One list member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListEntry {
    pub identity: String,
    pub reason: String,
    /// Unix seconds
    pub created_at: u64,
}

/// Membership store for one list, keyed uniquely by identity
#[derive(Clone)]
pub struct ListStore {
    kind: ListKind,
    backend: Arc<dyn KvBackend>,
}

impl ListStore {
    pub fn new(kind: ListKind, backend: Arc<dyn KvBackend>) -> Self {
        Self { kind, backend }
    }

    pub fn blacklist(backend: Arc<dyn KvBackend>) -> Self {
        Self::new(ListKind::Blacklist, backend)
    }

    pub fn exemptions(backend: Arc<dyn KvBackend>) -> Self {
        Self::new(ListKind::Exemption, backend)
    }

    pub fn kind(&self) -> ListKind {
        self.kind
    }

    fn key(&self, identity: &str) -> String {
        format!("{}{}", self.kind.prefix(), identity)
    }

    pub async fn contains(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.backend.get(&self.key(identity)).await?.is_some())
    }

    pub async fn get(&self, identity: &str) -> Result<Option<ListEntry>, StoreError> {
        let key = self.key(identity);
        match self.backend.get(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Insert or refresh an entry. Re-adding replaces reason and timestamp.
    pub async fn add(&self, identity: &str, reason: &str) -> Result<ListEntry, StoreError> {
        let entry = ListEntry {
            identity: identity.to_string(),
            reason: reason.to_string(),
            created_at: crate::unix_time_secs() as u64,
        };
        let key = self.key(identity);
        let value = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.backend.put(&key, value).await?;

        info!(list = %self.kind, identity = %identity, reason = %reason, "List entry added");
        Ok(entry)
    }

    /// Remove an entry. Returns whether it was present; absence is not an error.
    pub async fn remove(&self, identity: &str) -> Result<bool, StoreError> {
        let key = self.key(identity);
        let existed = self.backend.get(&key).await?.is_some();
        self.backend.delete(&key).await?;

        if existed {
            info!(list = %self.kind, identity = %identity, "List entry removed");
        } else {
            debug!(list = %self.kind, identity = %identity, "Remove of non-member ignored");
        }
        Ok(existed)
    }

    /// All entries, oldest first
    pub async fn list(&self) -> Result<Vec<ListEntry>, StoreError> {
        let mut entries = self
            .backend
            .scan(self.kind.prefix())
            .await?
            .into_iter()
            .map(|(key, raw)| decode(&key, &raw))
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.identity.cmp(&b.identity))
        });
        Ok(entries)
    }

    /// Remove every entry, returning how many were removed
    pub async fn clear(&self) -> Result<usize, StoreError> {
        let keys = self.backend.scan(self.kind.prefix()).await?;
        for (key, _) in &keys {
            self.backend.delete(key).await?;
        }
        info!(list = %self.kind, removed = keys.len(), "List cleared");
        Ok(keys.len())
    }
}

fn decode(key: &str, raw: &str) -> Result<ListEntry, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
