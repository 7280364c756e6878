//! Lock recipe over a [`MetaClient`]
//!
//! A lock is a single node holding a serialized [`LockInfo`]. Acquiring is
//! create-if-absent; an existing node whose lease ran out is taken over
//! with a versioned delete so two contenders cannot both win it.
//!
//! A create that timed out may still land. The next attempt then finds a
//! node carrying our own lock id, which counts as granted.

use super::guard::LockGuard;
use super::info::LockInfo;
use crate::client::{MetaClient, MetaClientFactory};
use crate::common::{timestamp_now_millis, Error, LockConfig, MetaClientConfig, Result};
use crate::store::EntryMode;
use std::sync::Arc;
use std::time::Duration;

/// How the lock node is kept alive
#[derive(Debug, Clone, Copy)]
enum Lease {
    Mode(EntryMode),
    Ttl(u64),
}

pub struct LockClient {
    client: Arc<MetaClient>,
    config: LockConfig,
    owns_client: bool,
}

impl LockClient {
    /// Lock client over a shared MetaClient; `close` leaves it open
    pub fn new(client: Arc<MetaClient>, config: LockConfig) -> Self {
        Self {
            client,
            config,
            owns_client: false,
        }
    }

    /// Lock client with its own session
    pub fn from_config(meta_config: &MetaClientConfig, config: LockConfig) -> Result<Self> {
        let client = MetaClientFactory::get_meta_client(meta_config)?;
        Ok(Self {
            client: Arc::new(client),
            config,
            owns_client: true,
        })
    }

    pub fn client(&self) -> &Arc<MetaClient> {
        &self.client
    }

    /// Acquire `path`. `Persistent` locks outlive the session; other modes
    /// end with it.
    pub async fn acquire_lock(&self, path: &str, info: LockInfo, mode: EntryMode) -> Result<LockInfo> {
        let mut info = info;
        info.stamp(timestamp_now_millis());
        self.acquire(path, info, Lease::Mode(mode)).await
    }

    /// Acquire `path` with a lease of `ttl_ms`. The store reclaims the node
    /// if the lease is not renewed in time.
    pub async fn acquire_lock_with_ttl(&self, path: &str, info: LockInfo, ttl_ms: u64) -> Result<LockInfo> {
        if ttl_ms == 0 {
            return Err(Error::InvalidConfig("lock TTL must be positive".into()));
        }
        let mut info = info;
        info.grant(timestamp_now_millis(), ttl_ms);
        self.acquire(path, info, Lease::Ttl(ttl_ms)).await
    }

    /// Acquire with a TTL lease and hold it in a guard.
    /// `None` uses the configured default TTL.
    pub async fn lock(&self, path: &str, info: LockInfo, ttl: Option<Duration>) -> Result<LockGuard> {
        let ttl_ms = ttl
            .map(|ttl| ttl.as_millis() as u64)
            .unwrap_or(self.config.default_ttl_ms);
        let info = self.acquire_lock_with_ttl(path, info, ttl_ms).await?;
        Ok(LockGuard::new(
            self.client.clone(),
            path.to_string(),
            info,
            self.config.renew_retries,
        ))
    }

    /// Extend the lease of the lock at `path`
    pub async fn renew_ttl_lock(&self, path: &str) -> Result<LockInfo> {
        renew(&self.client, path, None, self.config.renew_retries).await
    }

    /// Delete the lock at `path`. Absent locks and invalid paths are no-ops.
    pub async fn release_lock(&self, path: &str) -> Result<()> {
        match self.client.delete(path).await {
            Ok(true) => {
                tracing::info!("Released lock {}", path);
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(Error::InvalidPath { path, reason }) => {
                tracing::debug!("Ignoring release of invalid lock path {}: {}", path, reason);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current holder of `path`, `None` when unlocked or expired
    pub async fn retrieve_lock(&self, path: &str) -> Result<Option<LockInfo>> {
        match self.client.get(path).await {
            Ok(bytes) => {
                let info = LockInfo::from_bytes(path, &bytes)?;
                if info.is_expired() {
                    Ok(None)
                } else {
                    Ok(Some(info))
                }
            }
            Err(Error::NotFound(_)) | Err(Error::InvalidPath { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Close the session if this client opened it
    pub fn close(&self) -> Result<()> {
        if self.owns_client {
            self.client.close()
        } else {
            Ok(())
        }
    }

    // === Internals ===

    async fn acquire(&self, path: &str, info: LockInfo, lease: Lease) -> Result<LockInfo> {
        let bytes = info.to_bytes()?;
        // Room for one takeover plus the configured retries of timed-out writes
        let attempts = self.client.config().reconnect_policy.max_retries.max(2);
        let mut timed_out = None;

        for _ in 0..attempts {
            match self.create_node(path, &bytes, lease).await {
                Ok(()) => {
                    tracing::info!(
                        "Acquired lock {} for {} ({})",
                        path,
                        info.owner_id,
                        info.lock_id
                    );
                    return Ok(info);
                }
                Err(Error::NodeExists(_)) => {}
                Err(e @ Error::Timeout(_)) => {
                    tracing::debug!("Creating lock {} timed out; checking again", path);
                    timed_out = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let (held, version) = match self.client.get_with_stat(path).await {
                Ok((held_bytes, stat)) => (LockInfo::from_bytes(path, &held_bytes)?, stat.version),
                // Released between our create and read
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if held.lock_id == info.lock_id {
                tracing::info!(
                    "Acquired lock {} for {} ({}) by an earlier attempt",
                    path,
                    info.owner_id,
                    info.lock_id
                );
                return Ok(held);
            }
            if !held.is_expired() {
                return Err(Error::AlreadyLocked {
                    path: path.to_string(),
                    owner: held.owner_id,
                });
            }

            match self.client.delete_if_version(path, version).await {
                Ok(()) | Err(Error::NotFound(_)) => {
                    tracing::info!(
                        "Took over expired lock {} from {}",
                        path,
                        held.owner_id
                    );
                }
                Err(Error::VersionConflict { .. }) => {
                    // Renewed under us
                    return Err(Error::AlreadyLocked {
                        path: path.to_string(),
                        owner: held.owner_id,
                    });
                }
                Err(e @ Error::Timeout(_)) => timed_out = Some(e),
                Err(e) => return Err(e),
            }
        }

        if let Some(e) = timed_out {
            return Err(e);
        }

        let owner = match self.retrieve_lock(path).await? {
            Some(held) => held.owner_id,
            None => String::new(),
        };
        Err(Error::AlreadyLocked {
            path: path.to_string(),
            owner,
        })
    }

    async fn create_node(&self, path: &str, bytes: &[u8], lease: Lease) -> Result<()> {
        match lease {
            Lease::Mode(mode) => self.client.create(path, bytes, mode).await?,
            Lease::Ttl(ttl_ms) => {
                self.client
                    .create_with_ttl(path, bytes, Duration::from_millis(ttl_ms))
                    .await?
            }
        };
        Ok(())
    }
}

/// Refresh `last_renewed_at` with a versioned set; the set also renews the
/// node's TTL. With `lock_id`, a lock granted to anyone else is left
/// untouched and reported as `AlreadyLocked`.
pub(crate) async fn renew(
    client: &MetaClient,
    path: &str,
    lock_id: Option<&str>,
    retries: usize,
) -> Result<LockInfo> {
    for _ in 0..=retries {
        let (bytes, stat) = client.get_with_stat(path).await?;
        let mut info = LockInfo::from_bytes(path, &bytes)?;
        if info.is_expired() {
            return Err(Error::NotFound(path.to_string()));
        }
        if lock_id.is_some_and(|id| id != info.lock_id) {
            return Err(Error::AlreadyLocked {
                path: path.to_string(),
                owner: info.owner_id,
            });
        }

        info.renew(timestamp_now_millis());
        match client.set(path, &info.to_bytes()?, Some(stat.version)).await {
            Ok(_) => {
                tracing::debug!("Renewed lock {} until {:?}", path, info.expires_at());
                return Ok(info);
            }
            // A timed-out set may have landed; the next read shows it
            Err(Error::VersionConflict { .. }) | Err(Error::Timeout(_)) => continue,
            Err(e) => return Err(e),
        }
    }

    Err(Error::Timeout(format!(
        "could not renew lock {} after {} attempts",
        path,
        retries + 1
    )))
}
