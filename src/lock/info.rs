//! Lock metadata stored in the lock node

use crate::common::{timestamp_now_millis, Error, Result};
use serde::{Deserialize, Serialize};

/// Who holds a lock and until when.
///
/// `timeout` is the lease length in milliseconds. A lock with a timeout is
/// expired once `last_renewed_at + timeout` has passed, whether or not the
/// store has reclaimed its node yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_data: String,
    #[serde(default)]
    pub lock_id: String,
    #[serde(default)]
    pub granted_at: u64,
    #[serde(default)]
    pub last_renewed_at: u64,
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl LockInfo {
    pub fn new(owner_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            client_id: client_id.into(),
            ..Self::default()
        }
    }

    pub fn with_client_data(mut self, data: impl Into<String>) -> Self {
        self.client_data = data.into();
        self
    }

    pub fn with_lock_id(mut self, lock_id: impl Into<String>) -> Self {
        self.lock_id = lock_id.into();
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout = Some(timeout_ms);
        self
    }

    /// Fill in whatever the caller left unset
    pub(crate) fn stamp(&mut self, now: u64) {
        if self.lock_id.is_empty() {
            self.lock_id = uuid::Uuid::new_v4().to_string();
        }
        if self.granted_at == 0 {
            self.granted_at = now;
        }
        if self.last_renewed_at == 0 {
            self.last_renewed_at = self.granted_at;
        }
    }

    /// Start a fresh lease of `ttl_ms` at `now`
    pub(crate) fn grant(&mut self, now: u64, ttl_ms: u64) {
        if self.lock_id.is_empty() {
            self.lock_id = uuid::Uuid::new_v4().to_string();
        }
        self.granted_at = now;
        self.last_renewed_at = now;
        self.timeout = Some(ttl_ms);
    }

    /// Record a renewal; renewal times only move forward
    pub(crate) fn renew(&mut self, now: u64) {
        self.last_renewed_at = now.max(self.last_renewed_at.saturating_add(1));
    }

    /// When the lease runs out, if it has one
    pub fn expires_at(&self) -> Option<u64> {
        self.timeout
            .map(|timeout| self.last_renewed_at.saturating_add(timeout))
    }

    pub fn is_expired_at(&self, now: u64) -> bool {
        self.expires_at().is_some_and(|deadline| now > deadline)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(timestamp_now_millis())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(path: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| Error::corrupted(path, format!("unreadable lock info: {}", e)))
    }
}
