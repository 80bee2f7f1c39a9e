//! Versioned object storage with compliance-mode retention and an
//! independent legal-hold flag.
//!
//! Every `put` creates a new version. A version cannot be deleted while its
//! legal hold is on or before its retain-until date, by anyone. Retention is
//! fixed at write time and never shortened.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use thiserror::Error;

use crate::clock::SharedClock;
use crate::error::{Error, ValidationError};

/// Metadata of one stored object version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    /// Object key
    pub key: String,
    /// Backend-assigned version id
    pub version_id: String,
    /// Hex SHA-256 of the bytes
    pub sha256: String,
    /// Size in bytes
    pub size: u64,
    /// When this version was written
    pub created_at: DateTime<Utc>,
    /// Compliance retention date
    pub retain_until: DateTime<Utc>,
    /// Legal hold flag, orthogonal to retention
    pub legal_hold: bool,
    /// MIME type recorded at write time
    pub content_type: Option<String>,
}

impl ObjectMeta {
    /// Why this version may not be deleted at `now`, if it may not.
    pub fn lock_reason(&self, now: DateTime<Utc>) -> Option<String> {
        if self.legal_hold {
            Some("legal hold is on".to_string())
        } else if self.retain_until > now {
            Some(format!("retained until {}", self.retain_until.to_rfc3339()))
        } else {
            None
        }
    }
}

/// Lock settings applied atomically with a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOptions {
    /// Compliance retention date
    pub retain_until: DateTime<Utc>,
    /// Whether the version starts under legal hold
    pub legal_hold: bool,
    /// MIME type
    pub content_type: Option<String>,
}

/// Object backend failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObjectStoreError {
    /// No such key or version
    #[error("object '{key}' not found")]
    NotFound {
        /// Object key, with version when one was requested
        key: String,
    },
    /// Delete refused by retention or legal hold
    #[error("object '{key}' is locked: {reason}")]
    Locked {
        /// Object key
        key: String,
        /// Lock that applies
        reason: String,
    },
    /// Backend I/O failure
    #[error("object backend: {message}")]
    Backend {
        /// Whether a retry may succeed
        transient: bool,
        /// Backend description
        message: String,
    },
}

impl From<ObjectStoreError> for Error {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::NotFound { key } => Error::NotFound(format!("object '{key}'")),
            ObjectStoreError::Locked { key, reason } => {
                Error::Validation(ValidationError::ObjectLocked { key, reason })
            }
            ObjectStoreError::Backend { transient, message } => Error::Storage { transient, message },
        }
    }
}

/// Versioned WORM object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Writes a new version of `key` with its lock settings.
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        options: &PutOptions,
    ) -> Result<ObjectMeta, ObjectStoreError>;

    /// Latest version of `key` with its bytes.
    async fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError>;

    /// A specific version of `key` with its bytes.
    async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError>;

    /// Latest version metadata of `key`.
    async fn head(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError>;

    /// Every version of `key`, oldest first.
    async fn versions(&self, key: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError>;

    /// Latest version of every key under `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError>;

    /// Turns the legal hold of one version on or off.
    async fn set_legal_hold(
        &self,
        key: &str,
        version_id: &str,
        on: bool,
    ) -> Result<ObjectMeta, ObjectStoreError>;

    /// Permanently removes one version. Refused while locked.
    async fn delete_version(&self, key: &str, version_id: &str) -> Result<(), ObjectStoreError>;
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

struct StoredVersion {
    meta: ObjectMeta,
    bytes: Vec<u8>,
}

/// In-process object store enforcing compliance-mode locks against an
/// injected clock.
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<StoredVersion>>>,
    clock: SharedClock,
    fail_next: AtomicU32,
}

impl MemoryObjectStore {
    /// Creates an empty store.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            clock,
            fail_next: AtomicU32::new(0),
        }
    }

    /// Makes the next `n` writes fail with a transient error.
    pub fn fail_next_puts(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total number of stored versions across all keys.
    pub fn version_count(&self) -> usize {
        self.objects.read().values().map(Vec::len).sum()
    }

    /// Flips one byte of the latest version in place, bypassing the lock.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, key: &str) {
        if let Some(version) = self.objects.write().get_mut(key).and_then(|v| v.last_mut()) {
            if let Some(byte) = version.bytes.first_mut() {
                *byte ^= 0xFF;
            }
        }
    }

    fn not_found(key: &str) -> ObjectStoreError {
        ObjectStoreError::NotFound {
            key: key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &str,
        bytes: Vec<u8>,
        options: &PutOptions,
    ) -> Result<ObjectMeta, ObjectStoreError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ObjectStoreError::Backend {
                transient: true,
                message: "injected write failure".to_string(),
            });
        }

        let meta = ObjectMeta {
            key: key.to_string(),
            version_id: uuid::Uuid::new_v4().simple().to_string(),
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            created_at: self.clock.now(),
            retain_until: options.retain_until,
            legal_hold: options.legal_hold,
            content_type: options.content_type.clone(),
        };
        self.objects
            .write()
            .entry(key.to_string())
            .or_default()
            .push(StoredVersion {
                meta: meta.clone(),
                bytes,
            });
        Ok(meta)
    }

    async fn get(&self, key: &str) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError> {
        self.objects
            .read()
            .get(key)
            .and_then(|versions| versions.last())
            .map(|v| (v.meta.clone(), v.bytes.clone()))
            .ok_or_else(|| Self::not_found(key))
    }

    async fn get_version(
        &self,
        key: &str,
        version_id: &str,
    ) -> Result<(ObjectMeta, Vec<u8>), ObjectStoreError> {
        self.objects
            .read()
            .get(key)
            .and_then(|versions| versions.iter().find(|v| v.meta.version_id == version_id))
            .map(|v| (v.meta.clone(), v.bytes.clone()))
            .ok_or_else(|| Self::not_found(&format!("{key}@{version_id}")))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta, ObjectStoreError> {
        self.objects
            .read()
            .get(key)
            .and_then(|versions| versions.last())
            .map(|v| v.meta.clone())
            .ok_or_else(|| Self::not_found(key))
    }

    async fn versions(&self, key: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        Ok(self
            .objects
            .read()
            .get(key)
            .map(|versions| versions.iter().map(|v| v.meta.clone()).collect())
            .unwrap_or_default())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>, ObjectStoreError> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter_map(|(_, versions)| versions.last().map(|v| v.meta.clone()))
            .collect())
    }

    async fn set_legal_hold(
        &self,
        key: &str,
        version_id: &str,
        on: bool,
    ) -> Result<ObjectMeta, ObjectStoreError> {
        let mut objects = self.objects.write();
        let version = objects
            .get_mut(key)
            .and_then(|versions| versions.iter_mut().find(|v| v.meta.version_id == version_id))
            .ok_or_else(|| Self::not_found(&format!("{key}@{version_id}")))?;
        version.meta.legal_hold = on;
        Ok(version.meta.clone())
    }

    async fn delete_version(&self, key: &str, version_id: &str) -> Result<(), ObjectStoreError> {
        let now = self.clock.now();
        let mut objects = self.objects.write();
        let versions = objects.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        let position = versions
            .iter()
            .position(|v| v.meta.version_id == version_id)
            .ok_or_else(|| Self::not_found(&format!("{key}@{version_id}")))?;

        if let Some(reason) = versions[position].meta.lock_reason(now) {
            return Err(ObjectStoreError::Locked {
                key: key.to_string(),
                reason,
            });
        }

        versions.remove(position);
        if versions.is_empty() {
            objects.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn setup() -> (Arc<ManualClock>, MemoryObjectStore) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        let store = MemoryObjectStore::new(clock.clone());
        (clock, store)
    }

    fn options(clock: &ManualClock, days: i64, legal_hold: bool) -> PutOptions {
        use crate::clock::Clock;
        PutOptions {
            retain_until: clock.now() + Duration::days(days),
            legal_hold,
            content_type: None,
        }
    }

    #[tokio::test]
    async fn puts_create_versions() {
        let (clock, store) = setup();
        let v1 = store.put("a/x", b"one".to_vec(), &options(&clock, 1, false)).await.unwrap();
        let v2 = store.put("a/x", b"two".to_vec(), &options(&clock, 1, false)).await.unwrap();
        assert_ne!(v1.version_id, v2.version_id);
        assert_eq!(store.get("a/x").await.unwrap().1, b"two");
        assert_eq!(store.get_version("a/x", &v1.version_id).await.unwrap().1, b"one");
        assert_eq!(store.versions("a/x").await.unwrap().len(), 2);
        assert_eq!(v1.sha256, sha256_hex(b"one"));
        assert!(matches!(store.head("a/y").await, Err(ObjectStoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn list_is_prefix_scoped() {
        let (clock, store) = setup();
        for key in ["t1/a", "t1/b", "t10/a", "t2/a"] {
            store.put(key, b"x".to_vec(), &options(&clock, 1, false)).await.unwrap();
        }
        let keys: Vec<_> = store.list("t1/").await.unwrap().into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["t1/a", "t1/b"]);
    }

    #[tokio::test]
    async fn retention_blocks_delete_until_expiry() {
        let (clock, store) = setup();
        let meta = store.put("k", b"x".to_vec(), &options(&clock, 10, false)).await.unwrap();
        let err = store.delete_version("k", &meta.version_id).await.unwrap_err();
        assert!(matches!(err, ObjectStoreError::Locked { .. }));

        clock.advance(Duration::days(11));
        store.delete_version("k", &meta.version_id).await.unwrap();
        assert_eq!(store.version_count(), 0);
    }

    #[tokio::test]
    async fn legal_hold_overrides_expired_retention() {
        let (clock, store) = setup();
        let meta = store.put("k", b"x".to_vec(), &options(&clock, 1, true)).await.unwrap();
        assert!(meta.legal_hold);
        clock.advance(Duration::days(5));
        assert!(store.delete_version("k", &meta.version_id).await.is_err());

        store.set_legal_hold("k", &meta.version_id, false).await.unwrap();
        store.delete_version("k", &meta.version_id).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let (clock, store) = setup();
        store.fail_next_puts(1);
        let err: Error = store
            .put("k", b"x".to_vec(), &options(&clock, 1, false))
            .await
            .unwrap_err()
            .into();
        assert!(err.is_retryable());
        assert!(store.put("k", b"x".to_vec(), &options(&clock, 1, false)).await.is_ok());
    }
}
