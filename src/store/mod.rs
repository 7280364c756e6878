//! Hierarchical coordination store
//!
//! The store is the consistent backbone every recipe builds on:
//! - `/a/b/c` path namespace, byte payloads
//! - per-node version counters with compare-and-swap `set` / `delete`
//! - PERSISTENT, EPHEMERAL (session scoped) and CONTAINER nodes
//! - TTL nodes reclaimed once `mtime + ttl` has passed
//!
//! The semantics live once in [`Tree`]; a backend only supplies a
//! [`NodeTable`] that loads and saves nodes.

pub mod memory;
pub mod rocks;
pub mod tree;

use crate::common::{Result, StoreType};
use serde::{Deserialize, Serialize};

pub use memory::MemTable;
pub use rocks::RocksTable;
pub use tree::{Node, NodeTable, Tree, MAX_NODE_SIZE};

/// Identifier of a client session
pub type SessionId = u64;

/// Lifetime of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryMode {
    /// Survives session loss
    Persistent,
    /// Removed when the creating session ends
    Ephemeral,
    /// Removed when its last child is deleted
    Container,
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntryMode::Persistent => write!(f, "persistent"),
            EntryMode::Ephemeral => write!(f, "ephemeral"),
            EntryMode::Container => write!(f, "container"),
        }
    }
}

/// Options for [`CoordinationStore::create`]
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub mode: EntryMode,
    /// Expire the node this long after its last modification
    pub ttl_ms: Option<u64>,
    /// Owner of ephemeral nodes
    pub session: SessionId,
    /// Create missing ancestors as persistent nodes
    pub create_parents: bool,
}

impl CreateOptions {
    pub fn new(mode: EntryMode, session: SessionId) -> Self {
        Self {
            mode,
            ttl_ms: None,
            session,
            create_parents: false,
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }
}

/// Node metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    /// Data version, bumped on every `set`
    pub version: u64,
    /// Children version, bumped on every child create/delete
    pub cversion: u64,
    pub ctime_ms: u64,
    pub mtime_ms: u64,
    pub num_children: u64,
    pub mode: EntryMode,
    pub ephemeral_owner: Option<SessionId>,
    pub ttl_ms: Option<u64>,
}

impl Stat {
    /// Has this TTL node outlived its last modification?
    pub fn is_expired(&self, now_ms: u64) -> bool {
        match self.ttl_ms {
            Some(ttl) => self.num_children == 0 && now_ms > self.mtime_ms.saturating_add(ttl),
            None => false,
        }
    }
}

/// Capability surface of a hierarchical, strongly-consistent store.
///
/// Every call is atomic for the single path it touches. Calls block; async
/// callers run them on the blocking pool.
pub trait CoordinationStore: Send + Sync {
    /// Open a session that lapses unless touched within `timeout_ms`
    fn open_session(&self, timeout_ms: u64) -> Result<SessionId>;

    /// Keep a session alive. Fails with `SessionClosed` once it lapsed or ended.
    fn touch_session(&self, session: SessionId) -> Result<()>;

    /// End a session, removing its ephemeral nodes. Returns how many were removed.
    fn close_session(&self, session: SessionId) -> Result<usize>;

    fn create(&self, path: &str, data: &[u8], opts: &CreateOptions) -> Result<Stat>;

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)>;

    /// `None` when the node does not exist
    fn stat(&self, path: &str) -> Result<Option<Stat>>;

    /// Replace the payload, optionally only at `expected_version`
    fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> Result<Stat>;

    /// Delete a leaf node, optionally only at `expected_version`
    fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()>;

    /// Delete a subtree; an absent path removes nothing
    fn delete_recursive(&self, path: &str) -> Result<usize>;

    /// Sorted child names
    fn children(&self, path: &str) -> Result<Vec<String>>;

    /// End lapsed sessions and physically remove expired TTL nodes.
    /// Returns the number of TTL nodes removed.
    fn purge_expired(&self) -> Result<usize>;
}

/// Built-in backends
pub enum StoreBackend {
    Memory(Tree<MemTable>),
    RocksDb(Tree<RocksTable>),
}

impl StoreBackend {
    pub fn open(store_type: &StoreType) -> Result<Self> {
        match store_type {
            StoreType::Memory => Ok(StoreBackend::Memory(Tree::open(MemTable::new())?)),
            StoreType::RocksDb { path } => {
                Ok(StoreBackend::RocksDb(Tree::open(RocksTable::open(path)?)?))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Memory(_) => "memory",
            StoreBackend::RocksDb(_) => "rocksdb",
        }
    }

    fn inner(&self) -> &dyn CoordinationStore {
        match self {
            StoreBackend::Memory(tree) => tree,
            StoreBackend::RocksDb(tree) => tree,
        }
    }
}

impl CoordinationStore for StoreBackend {
    fn open_session(&self, timeout_ms: u64) -> Result<SessionId> {
        self.inner().open_session(timeout_ms)
    }

    fn touch_session(&self, session: SessionId) -> Result<()> {
        self.inner().touch_session(session)
    }

    fn close_session(&self, session: SessionId) -> Result<usize> {
        self.inner().close_session(session)
    }

    fn create(&self, path: &str, data: &[u8], opts: &CreateOptions) -> Result<Stat> {
        self.inner().create(path, data, opts)
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        self.inner().get(path)
    }

    fn stat(&self, path: &str) -> Result<Option<Stat>> {
        self.inner().stat(path)
    }

    fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> Result<Stat> {
        self.inner().set(path, data, expected_version)
    }

    fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()> {
        self.inner().delete(path, expected_version)
    }

    fn delete_recursive(&self, path: &str) -> Result<usize> {
        self.inner().delete_recursive(path)
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        self.inner().children(path)
    }

    fn purge_expired(&self) -> Result<usize> {
        self.inner().purge_expired()
    }
}
