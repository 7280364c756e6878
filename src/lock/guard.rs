//! Scoped lock handle

use super::client::renew;
use super::info::LockInfo;
use crate::client::MetaClient;
use crate::common::{Error, Result};
use std::sync::Arc;

/// A held lock.
///
/// Call [`LockGuard::release`] to release it and see the outcome. A guard
/// dropped without release deletes the lock from a spawned task, but only
/// while the node still carries this guard's lock id.
pub struct LockGuard {
    client: Arc<MetaClient>,
    path: String,
    info: LockInfo,
    renew_retries: usize,
    released: bool,
}

impl LockGuard {
    pub(crate) fn new(
        client: Arc<MetaClient>,
        path: String,
        info: LockInfo,
        renew_retries: usize,
    ) -> Self {
        Self {
            client,
            path,
            info,
            renew_retries,
            released: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn lock_id(&self) -> &str {
        &self.info.lock_id
    }

    /// Extend the lease. Fails with `NotFound` once it was lost, or with
    /// `AlreadyLocked` once someone else took it over.
    pub async fn renew(&mut self) -> Result<()> {
        self.info = renew(
            &self.client,
            &self.path,
            Some(&self.info.lock_id),
            self.renew_retries,
        )
        .await?;
        Ok(())
    }

    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        release_owned(&self.client, &self.path, &self.info.lock_id).await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Lock {} dropped outside a runtime; left to expire", self.path);
            return;
        };

        let client = self.client.clone();
        let path = std::mem::take(&mut self.path);
        let lock_id = std::mem::take(&mut self.info.lock_id);
        runtime.spawn(async move {
            if let Err(e) = release_owned(&client, &path, &lock_id).await {
                tracing::warn!("Failed to release dropped lock {}: {}", path, e);
            }
        });
    }
}

/// Delete the lock node if it still belongs to `lock_id`
async fn release_owned(client: &MetaClient, path: &str, lock_id: &str) -> Result<()> {
    let (bytes, stat) = match client.get_with_stat(path).await {
        Ok(found) => found,
        Err(Error::NotFound(_)) => return Ok(()),
        Err(e) => return Err(e),
    };
    let held = LockInfo::from_bytes(path, &bytes)?;
    if held.lock_id != lock_id {
        tracing::debug!("Lock {} now held by {}; not releasing", path, held.owner_id);
        return Ok(());
    }

    match client.delete_if_version(path, stat.version).await {
        Ok(()) | Err(Error::NotFound(_)) => {
            tracing::info!("Released lock {}", path);
            Ok(())
        }
        Err(Error::VersionConflict { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}
