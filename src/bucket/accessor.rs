//! Versioned, chunked record storage under a bucket path
//!
//! Layout under a bucket path `P`:
//!
//! ```text
//! P/LAST_WRITE               highest reserved version
//! P/LAST_SUCCESSFUL_WRITE    version readers should use
//! P/<v>                      chunk manifest of version v
//! P/<v>/<i>                  i-th chunk of the compressed record
//! ```
//!
//! A write reserves its version on `LAST_WRITE` first, writes the manifest
//! and chunks, then moves `LAST_SUCCESSFUL_WRITE` forward with a versioned
//! set. Readers follow `LAST_SUCCESSFUL_WRITE` and therefore only ever see
//! complete versions. Superseded versions are collected by the GC worker
//! after `version_ttl`.
//!
//! A pointer update that timed out may still land, so the CAS loops re-read
//! instead of failing. A reservation that landed unseen leaves a gap in the
//! version numbers; a publish that landed unseen is found on the re-read.

use super::codec::{self, ChunkManifest};
use super::gc::GcWorker;
use super::{parse_version, LAST_SUCCESSFUL_WRITE_KEY, LAST_WRITE_KEY};
use crate::client::MetaClient;
use crate::common::{join_path, timestamp_now_millis, BucketConfig, Error, Result};
use crate::store::{EntryMode, Stat};
use futures_util::future::try_join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub struct BucketDataAccessor {
    client: Arc<MetaClient>,
    config: BucketConfig,
    gc: GcWorker,
}

impl BucketDataAccessor {
    /// Create an accessor and start its GC worker. Requires a tokio runtime.
    pub fn new(client: Arc<MetaClient>, config: BucketConfig) -> Result<Self> {
        config.validate()?;
        let gc = GcWorker::spawn(client.clone(), config.min_retained_versions);
        Ok(Self { client, config, gc })
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn client(&self) -> &Arc<MetaClient> {
        &self.client
    }

    /// Write `value` as a new version of `path`. Returns the published version.
    pub async fn compressed_bucket_write<T: Serialize>(&self, path: &str, value: &T) -> Result<u64> {
        let payload = codec::encode(value)?;
        let manifest = ChunkManifest::describe(&payload, self.config.max_chunk_size);

        let version = self.reserve_version(path).await?;
        let version_path = join_path(path, &version.to_string());

        if let Err(e) = self.write_chunks(&version_path, &payload, &manifest).await {
            // Nothing points at this version; drop what was written
            if let Err(cleanup) = self.client.delete_recursive(&version_path).await {
                tracing::warn!("Failed to clean up {}: {}", version_path, cleanup);
            }
            return Err(e);
        }

        let previous = self.publish(path, version).await?;
        tracing::debug!(
            "Wrote {} v{} ({} bytes in {} chunks)",
            path,
            version,
            manifest.data_size,
            manifest.chunk_count
        );

        let ttl = self.config.version_ttl();
        self.gc.schedule(path, version, ttl);
        if let Some((prev_version, prev_stat)) = previous {
            // The previous publish is already older than the TTL, so
            // everything it superseded can go now
            let age = timestamp_now_millis().saturating_sub(prev_stat.mtime_ms);
            if age >= ttl.as_millis() as u64 {
                self.gc.schedule(path, prev_version, Duration::ZERO);
            }
        }

        Ok(version)
    }

    /// Read the latest published version of `path`
    pub async fn compressed_bucket_read<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let version = self
            .published_version(path)
            .await?
            .ok_or_else(|| Error::NotFound(path.to_string()))?;

        match self.read_version(path, version).await {
            Err(Error::NotFound(missing)) => Err(Error::corrupted(
                path,
                format!("published version {} is missing ({})", version, missing),
            )),
            other => other,
        }
    }

    /// Read a specific version. Fails with `NotFound` once it was collected.
    pub async fn read_version<T: DeserializeOwned>(&self, path: &str, version: u64) -> Result<T> {
        let version_path = join_path(path, &version.to_string());
        let manifest_bytes = self.client.get(&version_path).await?;
        let manifest = ChunkManifest::from_bytes(&version_path, &manifest_bytes)?;

        let reads = (0..manifest.chunk_count).map(|index| {
            let chunk_path = join_path(&version_path, &index.to_string());
            async move {
                match self.client.get(&chunk_path).await {
                    Err(Error::NotFound(_)) => Err(Error::corrupted(
                        &chunk_path,
                        format!("missing chunk {} of {}", index, manifest.chunk_count),
                    )),
                    other => other,
                }
            }
        });
        let chunks = try_join_all(reads).await?;

        let payload = codec::assemble(&version_path, &manifest, chunks)?;
        codec::decode(&version_path, &payload)
    }

    /// Version readers currently see, `None` before the first write
    pub async fn published_version(&self, path: &str) -> Result<Option<u64>> {
        self.read_pointer(path, LAST_SUCCESSFUL_WRITE_KEY).await
    }

    /// Highest version handed out to a writer, `None` before the first write
    pub async fn last_write_version(&self, path: &str) -> Result<Option<u64>> {
        self.read_pointer(path, LAST_WRITE_KEY).await
    }

    /// Remove `path` with every version. Absent paths are fine.
    pub async fn compressed_bucket_delete(&self, path: &str) -> Result<()> {
        let removed = self.client.delete_recursive(path).await?;
        tracing::debug!("Deleted bucket {} ({} nodes)", path, removed);
        Ok(())
    }

    /// Stop the GC worker; pending passes are dropped
    pub fn disconnect(&self) {
        self.gc.shutdown();
    }

    // === Internals ===

    async fn read_pointer(&self, path: &str, key: &str) -> Result<Option<u64>> {
        let pointer = join_path(path, key);
        match self.client.get(&pointer).await {
            Ok(bytes) => Ok(Some(parse_version(&pointer, &bytes)?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Claim the next version number on `LAST_WRITE`, creating the bucket
    /// on its first write
    async fn reserve_version(&self, path: &str) -> Result<u64> {
        let pointer = join_path(path, LAST_WRITE_KEY);

        for _ in 0..=self.config.cas_retries {
            match self.client.get_with_stat(&pointer).await {
                Ok((bytes, stat)) => {
                    let next = parse_version(&pointer, &bytes)? + 1;
                    match self
                        .client
                        .set(&pointer, next.to_string().as_bytes(), Some(stat.version))
                        .await
                    {
                        Ok(_) => return Ok(next),
                        Err(Error::VersionConflict { .. }) | Err(Error::Timeout(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::NotFound(_)) => {
                    match self
                        .client
                        .create_recursive(&pointer, b"0", EntryMode::Persistent)
                        .await
                    {
                        Ok(_) => return Ok(0),
                        Err(Error::NodeExists(_)) | Err(Error::Timeout(_)) => continue,
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Timeout(format!(
            "could not reserve a version under {} after {} attempts",
            path,
            self.config.cas_retries + 1
        )))
    }

    async fn write_chunks(
        &self,
        version_path: &str,
        payload: &[u8],
        manifest: &ChunkManifest,
    ) -> Result<()> {
        self.client
            .create(version_path, &manifest.to_bytes()?, EntryMode::Persistent)
            .await?;

        let writes = codec::split(payload, self.config.max_chunk_size)
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| {
                let chunk_path = join_path(version_path, &index.to_string());
                async move {
                    self.client
                        .create(&chunk_path, chunk, EntryMode::Persistent)
                        .await
                }
            });
        try_join_all(writes).await?;
        Ok(())
    }

    /// Move `LAST_SUCCESSFUL_WRITE` to `version`. Returns what it replaced.
    async fn publish(&self, path: &str, version: u64) -> Result<Option<(u64, Stat)>> {
        let pointer = join_path(path, LAST_SUCCESSFUL_WRITE_KEY);
        let value = version.to_string();
        // Pointer state seen by an attempt that timed out
        let mut pending = None;

        for _ in 0..=self.config.cas_retries {
            match self.client.get_with_stat(&pointer).await {
                Ok((bytes, stat)) => {
                    let current = parse_version(&pointer, &bytes)?;
                    if current == version {
                        // Versions are never handed out twice: this is our
                        // own timed-out attempt
                        return Ok(pending);
                    }
                    if current > version {
                        // A newer write already published; ours is left for GC
                        return Err(Error::VersionConflict {
                            path: pointer,
                            expected: version,
                            actual: current,
                        });
                    }
                    match self
                        .client
                        .set(&pointer, value.as_bytes(), Some(stat.version))
                        .await
                    {
                        Ok(_) => return Ok(Some((current, stat))),
                        Err(Error::VersionConflict { .. }) => continue,
                        Err(Error::Timeout(_)) => {
                            pending = Some((current, stat));
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::NotFound(_)) => {
                    match self
                        .client
                        .create(&pointer, value.as_bytes(), EntryMode::Persistent)
                        .await
                    {
                        Ok(_) => return Ok(None),
                        Err(Error::NodeExists(_)) => continue,
                        Err(Error::Timeout(_)) => {
                            pending = None;
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Timeout(format!(
            "could not publish {} v{} after {} attempts",
            path,
            version,
            self.config.cas_retries + 1
        )))
    }
}

impl Drop for BucketDataAccessor {
    fn drop(&mut self) {
        self.gc.shutdown();
    }
}
