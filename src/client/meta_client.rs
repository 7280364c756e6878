//! Async client over a [`CoordinationStore`]
//!
//! The client owns one store session. Every call:
//! - validates the path (syntax and reserved namespaces)
//! - runs the blocking store call on the blocking pool
//! - is bounded by the configured operation timeout
//! - is retried with backoff on transient failures
//!
//! A timed-out call keeps running on the blocking pool and may still land.
//! Calls whose replay would act on that outcome (create, versioned set and
//! delete) are therefore not retried after a timeout; the caller gets
//! `Timeout` and resolves it by reading back.
//!
//! While a tokio runtime is available a background task heartbeats the
//! session and purges expired TTL nodes.

use crate::common::utils::check_reserved;
use crate::common::{retry_with_backoff, validate_path, Error, MetaClientConfig, Result};
use crate::store::{CoordinationStore, CreateOptions, EntryMode, SessionId, Stat};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Whether a store call may be issued again after it timed out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replay {
    /// Issuing it twice leaves the same state as once
    Safe,
    /// A second attempt would observe the first one's effect
    Unsafe,
}

/// Handle to a store session
pub struct MetaClient {
    store: Arc<dyn CoordinationStore>,
    session: SessionId,
    config: MetaClientConfig,
    closed: AtomicBool,
    lapsed: Arc<AtomicBool>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

impl MetaClient {
    /// Open a session on `store` and start keeping it alive
    pub fn new(store: Arc<dyn CoordinationStore>, config: MetaClientConfig) -> Result<Self> {
        config.validate()?;
        let session = store.open_session(config.session_timeout_ms)?;
        tracing::info!(
            "Opened session {} on {}",
            session,
            config.connection_address
        );

        let client = Self {
            store,
            session,
            config,
            closed: AtomicBool::new(false),
            lapsed: Arc::new(AtomicBool::new(false)),
            keepalive: Mutex::new(None),
        };
        client.start_keepalive();
        Ok(client)
    }

    pub fn session_id(&self) -> SessionId {
        self.session
    }

    pub fn config(&self) -> &MetaClientConfig {
        &self.config
    }

    /// Closed by the caller, or lapsed because it was not kept alive
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.lapsed.load(Ordering::SeqCst)
    }

    fn start_keepalive(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("No tokio runtime; session {} is not kept alive", self.session);
            return;
        };
        let Ok(mut slot) = self.keepalive.lock() else {
            return;
        };

        let heartbeat = (self.config.session_timeout() / 3).max(Duration::from_millis(1));
        let reap = match self.config.ttl_reap_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        *slot = Some(runtime.spawn(keepalive(
            Arc::downgrade(&self.store),
            self.session,
            self.lapsed.clone(),
            heartbeat,
            reap,
        )));
    }

    /// End the session; ephemeral nodes it owns are removed. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Ok(mut slot) = self.keepalive.lock() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let removed = self.store.close_session(self.session)?;
        tracing::info!(
            "Closed session {} ({} ephemeral nodes removed)",
            self.session,
            removed
        );
        Ok(())
    }

    // === Node operations ===

    /// Create a node; the parent must exist
    pub async fn create(&self, path: &str, data: &[u8], mode: EntryMode) -> Result<Stat> {
        let opts = CreateOptions::new(mode, self.session);
        self.create_with(path, data, opts).await
    }

    /// Create a node and any missing ancestors
    pub async fn create_recursive(&self, path: &str, data: &[u8], mode: EntryMode) -> Result<Stat> {
        let opts = CreateOptions::new(mode, self.session).with_parents();
        self.create_with(path, data, opts).await
    }

    /// Create a persistent node that expires `ttl` after its last modification
    pub async fn create_with_ttl(&self, path: &str, data: &[u8], ttl: Duration) -> Result<Stat> {
        let opts =
            CreateOptions::new(EntryMode::Persistent, self.session).with_ttl(ttl.as_millis() as u64);
        self.create_with(path, data, opts).await
    }

    async fn create_with(&self, path: &str, data: &[u8], opts: CreateOptions) -> Result<Stat> {
        self.check_path(path)?;
        let data = data.to_vec();
        self.run("create", path, Replay::Unsafe, move |store, path| {
            store.create(path, &data, &opts)
        })
        .await
    }

    pub async fn get(&self, path: &str) -> Result<Vec<u8>> {
        Ok(self.get_with_stat(path).await?.0)
    }

    pub async fn get_with_stat(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.check_path(path)?;
        self.run("get", path, Replay::Safe, |store, path| store.get(path)).await
    }

    /// Metadata of a node, `None` when absent
    pub async fn stat(&self, path: &str) -> Result<Option<Stat>> {
        self.check_path(path)?;
        self.run("stat", path, Replay::Safe, |store, path| store.stat(path)).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// Replace the payload. With `expected_version`, fails with
    /// `VersionConflict` if another write got there first.
    pub async fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> Result<u64> {
        self.check_path(path)?;
        let data = data.to_vec();
        let replay = match expected_version {
            Some(_) => Replay::Unsafe,
            None => Replay::Safe,
        };
        let stat = self
            .run("set", path, replay, move |store, path| {
                store.set(path, &data, expected_version)
            })
            .await?;
        Ok(stat.version)
    }

    /// Refresh a TTL node's modification time without changing its payload
    pub async fn renew_ttl_node(&self, path: &str) -> Result<Stat> {
        self.check_path(path)?;
        self.run("renew", path, Replay::Safe, |store, path| {
            let (data, stat) = store.get(path)?;
            if stat.ttl_ms.is_none() {
                return Err(Error::invalid_path(path, "not a TTL node"));
            }
            store.set(path, &data, Some(stat.version))
        })
        .await
    }

    /// Delete a leaf node. Returns false when it was already gone.
    pub async fn delete(&self, path: &str) -> Result<bool> {
        self.check_path(path)?;
        match self
            .run("delete", path, Replay::Safe, |store, path| store.delete(path, None))
            .await
        {
            Ok(()) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Delete a leaf node only at `expected_version`
    pub async fn delete_if_version(&self, path: &str, expected_version: u64) -> Result<()> {
        self.check_path(path)?;
        self.run("delete", path, Replay::Unsafe, move |store, path| {
            store.delete(path, Some(expected_version))
        })
        .await
    }

    /// Delete a subtree. Returns the number of nodes removed.
    pub async fn delete_recursive(&self, path: &str) -> Result<usize> {
        self.check_path(path)?;
        self.run("delete_recursive", path, Replay::Safe, |store, path| {
            store.delete_recursive(path)
        })
        .await
    }

    pub async fn get_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_path(path)?;
        self.run("get_children", path, Replay::Safe, |store, path| store.children(path))
            .await
    }

    // === Internals ===

    fn check_path(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        check_reserved(path, &self.config.reserved_namespaces)
    }

    /// Run a blocking store call with timeout and reconnect policy
    async fn run<T, F>(&self, op: &'static str, path: &str, replay: Replay, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(&dyn CoordinationStore, &str) -> Result<T> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        let policy = &self.config.reconnect_policy;
        let timeout = self.config.operation_timeout();
        let should_retry = move |e: &Error| match e {
            Error::Timeout(_) => replay == Replay::Safe,
            other => other.is_retryable(),
        };

        retry_with_backoff(
            || {
                let store = self.store.clone();
                let f = f.clone();
                let path = path.to_string();
                async move {
                    if self.is_closed() {
                        return Err(Error::SessionClosed);
                    }
                    let call = tokio::task::spawn_blocking(move || (*f)(store.as_ref(), &path));
                    match tokio::time::timeout(timeout, call).await {
                        Ok(joined) => joined?,
                        Err(_) => Err(Error::Timeout(format!("{} exceeded {:?}", op, timeout))),
                    }
                }
            },
            should_retry,
            policy.max_retries,
            policy.initial_backoff(),
            policy.max_backoff(),
        )
        .await
        .map_err(|e| {
            if e.is_retryable() {
                tracing::warn!("{} {} failed after retries: {}", op, path, e);
            }
            e
        })
    }
}

/// Heartbeat `session` and purge expired TTL nodes until the store goes away
/// or the session lapses
async fn keepalive(
    store: Weak<dyn CoordinationStore>,
    session: SessionId,
    lapsed: Arc<AtomicBool>,
    heartbeat: Duration,
    reap: Option<Duration>,
) {
    let mut heartbeat = tokio::time::interval(heartbeat);
    let mut reaper = tokio::time::interval(reap.unwrap_or(Duration::from_secs(3600)));

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                let Some(store) = store.upgrade() else { break };
                match tokio::task::spawn_blocking(move || store.touch_session(session)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(Error::SessionClosed)) => {
                        tracing::warn!("Session {} lapsed; its ephemeral nodes are gone", session);
                        lapsed.store(true, Ordering::SeqCst);
                        break;
                    }
                    Ok(Err(e)) => tracing::warn!("Heartbeat for session {} failed: {}", session, e),
                    Err(e) => tracing::warn!("Heartbeat task failed: {}", e),
                }
            }
            _ = reaper.tick(), if reap.is_some() => {
                let Some(store) = store.upgrade() else { break };
                match tokio::task::spawn_blocking(move || store.purge_expired()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => tracing::warn!("TTL reaper pass failed: {}", e),
                    Err(e) => tracing::warn!("TTL reaper task failed: {}", e),
                }
            }
        }
    }
}

impl Drop for MetaClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close session {}: {}", self.session, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::StoreType;
    use crate::store::StoreBackend;

    fn client() -> MetaClient {
        let store = Arc::new(StoreBackend::open(&StoreType::Memory).unwrap());
        MetaClient::new(store, MetaClientConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_create_get_set() {
        let client = client();
        client.create("/a", b"one", EntryMode::Persistent).await.unwrap();
        assert_eq!(client.get("/a").await.unwrap(), b"one");
        assert!(client.exists("/a").await.unwrap());

        let version = client.set("/a", b"two", Some(0)).await.unwrap();
        assert_eq!(version, 1);
        assert!(matches!(
            client.set("/a", b"three", Some(0)).await,
            Err(Error::VersionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_parent_is_invalid_path() {
        let client = client();
        let err = client
            .create("/a/b/c", b"", EntryMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));

        client
            .create_recursive("/a/b/c", b"", EntryMode::Persistent)
            .await
            .unwrap();
        assert_eq!(client.get_children("/a/b").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_reserved_namespace_rejected() {
        let client = client();
        let err = client
            .create_recursive("/_invalid/a/b/c", b"", EntryMode::Persistent)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPath { .. }));
        assert!(client.get_children("/").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let client = client();
        client.create("/a", b"", EntryMode::Persistent).await.unwrap();
        assert!(client.delete("/a").await.unwrap());
        assert!(!client.delete("/a").await.unwrap());
        assert_eq!(client.delete_recursive("/a").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_removes_ephemeral_nodes() {
        let store: Arc<dyn CoordinationStore> =
            Arc::new(StoreBackend::open(&StoreType::Memory).unwrap());
        let owner = MetaClient::new(store.clone(), MetaClientConfig::default()).unwrap();
        let observer = MetaClient::new(store, MetaClientConfig::default()).unwrap();

        owner.create("/leader", b"me", EntryMode::Ephemeral).await.unwrap();
        assert!(observer.exists("/leader").await.unwrap());

        owner.close().unwrap();
        assert!(!observer.exists("/leader").await.unwrap());
        assert!(matches!(owner.get("/leader").await, Err(Error::SessionClosed)));
    }

    #[tokio::test]
    async fn test_renew_ttl_node() {
        let client = client();
        client
            .create_with_ttl("/lease", b"x", Duration::from_millis(80))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stat = client.renew_ttl_node("/lease").await.unwrap();
        assert_eq!(stat.version, 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(client.exists("/lease").await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!client.exists("/lease").await.unwrap());
        assert!(matches!(
            client.renew_ttl_node("/lease").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_ttl_reaper_purges() {
        let store: Arc<dyn CoordinationStore> =
            Arc::new(StoreBackend::open(&StoreType::Memory).unwrap());
        let config = MetaClientConfig {
            ttl_reap_interval_ms: 10,
            ..MetaClientConfig::default()
        };
        let client = MetaClient::new(store.clone(), config).unwrap();
        client
            .create_with_ttl("/short", b"", Duration::from_millis(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // Reaped physically: the root no longer counts it
        assert_eq!(store.stat("/").unwrap().unwrap().num_children, 0);
    }

    #[tokio::test]
    async fn test_keepalive_outlives_session_timeout() {
        let store: Arc<dyn CoordinationStore> =
            Arc::new(StoreBackend::open(&StoreType::Memory).unwrap());
        let config = MetaClientConfig {
            session_timeout_ms: 60,
            ttl_reap_interval_ms: 10,
            ..MetaClientConfig::default()
        };
        let client = MetaClient::new(store, config).unwrap();
        client.create("/leader", b"me", EntryMode::Ephemeral).await.unwrap();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!client.is_closed());
        assert!(client.exists("/leader").await.unwrap());
    }

    #[tokio::test]
    async fn test_ended_session_fails_operations() {
        let store: Arc<dyn CoordinationStore> =
            Arc::new(StoreBackend::open(&StoreType::Memory).unwrap());
        let config = MetaClientConfig {
            session_timeout_ms: 30,
            ..MetaClientConfig::default()
        };
        let client = MetaClient::new(store.clone(), config).unwrap();
        client.create("/leader", b"me", EntryMode::Ephemeral).await.unwrap();

        // The store drops the session, as it does when heartbeats stop
        store.close_session(client.session_id()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(client.is_closed());
        assert!(matches!(client.exists("/leader").await, Err(Error::SessionClosed)));
        assert!(store.stat("/leader").unwrap().is_none());
    }
}
