//! Shared helpers for integration tests

#![allow(dead_code)]

use metacoord::common::ReconnectPolicy;
use metacoord::store::{CreateOptions, SessionId, StoreBackend};
use metacoord::{CoordinationStore, Error, MetaClient, MetaClientConfig, Result, Stat, StoreType};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a subscriber once per test binary; honours RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

pub fn memory_store() -> Arc<dyn CoordinationStore> {
    Arc::new(StoreBackend::open(&StoreType::Memory).unwrap())
}

pub fn client_on(store: &Arc<dyn CoordinationStore>) -> Arc<MetaClient> {
    Arc::new(MetaClient::new(store.clone(), MetaClientConfig::default()).unwrap())
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Client config with a short operation timeout and fast retries
pub fn fast_retry_config(max_retries: usize, timeout_ms: u64) -> MetaClientConfig {
    MetaClientConfig {
        operation_timeout_ms: timeout_ms,
        reconnect_policy: ReconnectPolicy {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
        ..MetaClientConfig::default()
    }
}

/// Memory store with injected faults.
///
/// Node operations run one at a time, so an operation stalled with
/// [`FaultyStore::stall_write_to`] holds back everything behind it, the way
/// a slow server would.
pub struct FaultyStore {
    inner: StoreBackend,
    failures: AtomicUsize,
    stall: Duration,
    stalled_write: Mutex<Option<(String, Duration)>>,
    broken_create: Mutex<Option<String>>,
    serial: Mutex<()>,
    pub calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: StoreBackend::open(&StoreType::Memory).unwrap(),
            failures: AtomicUsize::new(0),
            stall: Duration::ZERO,
            stalled_write: Mutex::new(None),
            broken_create: Mutex::new(None),
            serial: Mutex::new(()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `n` node operations with `ConnectionFailed`
    pub fn failing(mut self, n: usize) -> Self {
        self.failures = AtomicUsize::new(n);
        self
    }

    /// Delay every node operation
    pub fn stalling(mut self, stall: Duration) -> Self {
        self.stall = stall;
        self
    }

    /// Delay the next create or set of `path`; it still lands afterwards
    pub fn stall_write_to(&self, path: &str, stall: Duration) {
        *self.stalled_write.lock().unwrap() = Some((path.to_string(), stall));
    }

    /// Fail the next create of `path` with an I/O error
    pub fn break_create_of(&self, path: &str) {
        *self.broken_create.lock().unwrap() = Some(path.to_string());
    }

    fn fault(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.stall.is_zero() {
            std::thread::sleep(self.stall);
        }
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match remaining {
            Ok(_) => Err(Error::ConnectionFailed("connection reset".into())),
            Err(_) => Ok(()),
        }
    }

    fn stall_write(&self, path: &str) {
        let mut stalled = self.stalled_write.lock().unwrap();
        if let Some((target, stall)) = stalled.take() {
            if target == path {
                drop(stalled);
                std::thread::sleep(stall);
            } else {
                *stalled = Some((target, stall));
            }
        }
    }

    fn broken(&self, path: &str) -> Result<()> {
        let mut broken = self.broken_create.lock().unwrap();
        if broken.as_deref() == Some(path) {
            *broken = None;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(())
    }
}

impl CoordinationStore for FaultyStore {
    fn open_session(&self, timeout_ms: u64) -> Result<SessionId> {
        self.inner.open_session(timeout_ms)
    }

    fn touch_session(&self, session: SessionId) -> Result<()> {
        self.inner.touch_session(session)
    }

    fn close_session(&self, session: SessionId) -> Result<usize> {
        self.inner.close_session(session)
    }

    fn create(&self, path: &str, data: &[u8], opts: &CreateOptions) -> Result<Stat> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.broken(path)?;
        self.stall_write(path);
        self.inner.create(path, data, opts)
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.inner.get(path)
    }

    fn stat(&self, path: &str) -> Result<Option<Stat>> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.inner.stat(path)
    }

    fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> Result<Stat> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.stall_write(path);
        self.inner.set(path, data, expected_version)
    }

    fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.inner.delete(path, expected_version)
    }

    fn delete_recursive(&self, path: &str) -> Result<usize> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.inner.delete_recursive(path)
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.fault()?;
        let _serial = self.serial.lock().unwrap();
        self.inner.children(path)
    }

    fn purge_expired(&self) -> Result<usize> {
        self.inner.purge_expired()
    }
}
