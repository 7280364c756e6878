//! Tree semantics shared by every backend
//!
//! A [`Tree`] serializes all mutations behind one mutex, which is what gives
//! each single-path operation its atomicity. Expired TTL nodes are treated as
//! absent by every read and removed lazily when touched.

use crate::common::utils::{join_path, node_name, parent_path, timestamp_now_millis, validate_path};
use crate::common::{Error, Result};
use crate::store::{CoordinationStore, CreateOptions, EntryMode, SessionId, Stat};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Largest payload a single node accepts
pub const MAX_NODE_SIZE: usize = 1024 * 1024;

const ROOT: &str = "/";

/// Stored node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub data: Vec<u8>,
    pub stat: Stat,
}

/// Raw node storage supplied by a backend
pub trait NodeTable: Send {
    fn load(&self, path: &str) -> Result<Option<Node>>;
    fn save(&mut self, path: &str, node: &Node) -> Result<()>;
    fn remove(&mut self, path: &str) -> Result<()>;
    /// Names of the direct children of `path`, sorted
    fn child_names(&self, path: &str) -> Result<Vec<String>>;
    /// Every stored node
    fn scan(&self) -> Result<Vec<(String, Node)>>;
}

/// Liveness of an open session
#[derive(Debug, Clone, Copy)]
struct SessionLease {
    timeout_ms: u64,
    last_seen_ms: u64,
}

impl SessionLease {
    fn lapsed(&self, now_ms: u64) -> bool {
        now_ms > self.last_seen_ms.saturating_add(self.timeout_ms)
    }
}

struct TreeState<T> {
    table: T,
    sessions: HashMap<SessionId, SessionLease>,
    next_session: SessionId,
}

/// Coordination store over a [`NodeTable`]
pub struct Tree<T: NodeTable> {
    state: Mutex<TreeState<T>>,
}

impl<T: NodeTable> Tree<T> {
    /// Wrap a table, creating the root and dropping ephemeral nodes whose
    /// sessions ended with a previous process.
    pub fn open(mut table: T) -> Result<Self> {
        if table.load(ROOT)?.is_none() {
            let now = timestamp_now_millis();
            table.save(
                ROOT,
                &Node {
                    data: Vec::new(),
                    stat: new_stat(EntryMode::Persistent, None, None, now),
                },
            )?;
        }

        let tree = Self {
            state: Mutex::new(TreeState {
                table,
                sessions: HashMap::new(),
                next_session: 1,
            }),
        };

        let stale = {
            let mut state = tree.lock()?;
            let orphans: Vec<String> = state
                .table
                .scan()?
                .into_iter()
                .filter(|(_, node)| node.stat.ephemeral_owner.is_some())
                .map(|(path, _)| path)
                .collect();
            for path in &orphans {
                remove_node(&mut state.table, path)?;
            }
            orphans.len()
        };
        if stale > 0 {
            tracing::info!("Dropped {} ephemeral nodes from previous sessions", stale);
        }

        Ok(tree)
    }

    fn lock(&self) -> Result<MutexGuard<'_, TreeState<T>>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("store mutex poisoned".into()))
    }

    /// Forget `session` and remove its ephemeral nodes
    fn end_session(state: &mut TreeState<T>, session: SessionId) -> Result<usize> {
        if state.sessions.remove(&session).is_none() {
            return Ok(0);
        }

        let owned: Vec<String> = state
            .table
            .scan()?
            .into_iter()
            .filter(|(_, node)| node.stat.ephemeral_owner == Some(session))
            .map(|(path, _)| path)
            .collect();
        for path in &owned {
            remove_node(&mut state.table, path)?;
        }
        Ok(owned.len())
    }

    fn create_node(
        state: &mut TreeState<T>,
        path: &str,
        data: &[u8],
        opts: &CreateOptions,
    ) -> Result<Stat> {
        if path == ROOT || load_live(&mut state.table, path)?.is_some() {
            return Err(Error::NodeExists(path.to_string()));
        }

        let parent = parent_path(path).ok_or_else(|| Error::invalid_path(path, "no parent"))?;
        let mut parent_node = match load_live(&mut state.table, parent)? {
            Some(node) => node,
            None if opts.create_parents => {
                let parent_opts = CreateOptions::new(EntryMode::Persistent, opts.session).with_parents();
                Self::create_node(state, parent, &[], &parent_opts)?;
                load_live(&mut state.table, parent)?
                    .ok_or_else(|| Error::Internal(format!("parent {} vanished", parent)))?
            }
            None => {
                return Err(Error::invalid_path(
                    path,
                    format!("parent {} does not exist", parent),
                ))
            }
        };

        if parent_node.stat.mode == EntryMode::Ephemeral {
            return Err(Error::invalid_path(path, "ephemeral nodes cannot have children"));
        }

        let owner = match opts.mode {
            EntryMode::Ephemeral => {
                if !state.sessions.contains_key(&opts.session) {
                    return Err(Error::SessionClosed);
                }
                if opts.ttl_ms.is_some() {
                    return Err(Error::InvalidConfig(
                        "ephemeral nodes cannot carry a ttl".into(),
                    ));
                }
                Some(opts.session)
            }
            EntryMode::Persistent | EntryMode::Container => None,
        };

        let now = timestamp_now_millis();
        let node = Node {
            data: data.to_vec(),
            stat: new_stat(opts.mode, owner, opts.ttl_ms, now),
        };
        state.table.save(path, &node)?;

        parent_node.stat.num_children += 1;
        parent_node.stat.cversion += 1;
        state.table.save(parent, &parent_node)?;

        Ok(node.stat)
    }
}

impl<T: NodeTable> CoordinationStore for Tree<T> {
    fn open_session(&self, timeout_ms: u64) -> Result<SessionId> {
        let mut state = self.lock()?;
        let session = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            session,
            SessionLease {
                timeout_ms,
                last_seen_ms: timestamp_now_millis(),
            },
        );
        Ok(session)
    }

    fn touch_session(&self, session: SessionId) -> Result<()> {
        let mut state = self.lock()?;
        let now = timestamp_now_millis();
        match state.sessions.get_mut(&session) {
            Some(lease) if !lease.lapsed(now) => {
                lease.last_seen_ms = now;
                Ok(())
            }
            _ => Err(Error::SessionClosed),
        }
    }

    fn close_session(&self, session: SessionId) -> Result<usize> {
        let mut state = self.lock()?;
        Self::end_session(&mut state, session)
    }

    fn create(&self, path: &str, data: &[u8], opts: &CreateOptions) -> Result<Stat> {
        validate_path(path)?;
        check_size(path, data)?;
        let mut state = self.lock()?;
        Self::create_node(&mut state, path, data, opts)
    }

    fn get(&self, path: &str) -> Result<(Vec<u8>, Stat)> {
        validate_path(path)?;
        let mut state = self.lock()?;
        match load_live(&mut state.table, path)? {
            Some(node) => Ok((node.data, node.stat)),
            None => Err(Error::NotFound(path.to_string())),
        }
    }

    fn stat(&self, path: &str) -> Result<Option<Stat>> {
        validate_path(path)?;
        let mut state = self.lock()?;
        Ok(load_live(&mut state.table, path)?.map(|node| node.stat))
    }

    fn set(&self, path: &str, data: &[u8], expected_version: Option<u64>) -> Result<Stat> {
        validate_path(path)?;
        check_size(path, data)?;
        let mut state = self.lock()?;
        let mut node =
            load_live(&mut state.table, path)?.ok_or_else(|| Error::NotFound(path.to_string()))?;

        check_version(path, &node.stat, expected_version)?;

        node.data = data.to_vec();
        node.stat.version += 1;
        node.stat.mtime_ms = timestamp_now_millis();
        state.table.save(path, &node)?;
        Ok(node.stat)
    }

    fn delete(&self, path: &str, expected_version: Option<u64>) -> Result<()> {
        validate_path(path)?;
        if path == ROOT {
            return Err(Error::invalid_path(path, "cannot delete the root"));
        }
        let mut state = self.lock()?;
        let node =
            load_live(&mut state.table, path)?.ok_or_else(|| Error::NotFound(path.to_string()))?;

        check_version(path, &node.stat, expected_version)?;
        if node.stat.num_children > 0 {
            return Err(Error::NotEmpty(path.to_string()));
        }

        remove_node(&mut state.table, path)
    }

    fn delete_recursive(&self, path: &str) -> Result<usize> {
        validate_path(path)?;
        if path == ROOT {
            return Err(Error::invalid_path(path, "cannot delete the root"));
        }
        let mut state = self.lock()?;
        if state.table.load(path)?.is_none() {
            return Ok(0);
        }

        // Post-order so every removal sees a leaf
        let mut order = Vec::new();
        let mut stack = vec![path.to_string()];
        while let Some(current) = stack.pop() {
            for child in state.table.child_names(&current)? {
                stack.push(join_path(&current, &child));
            }
            order.push(current);
        }
        let mut removed = 0;
        for node_path in order.iter().rev() {
            // An emptied container may already have taken itself out
            if state.table.load(node_path)?.is_some() {
                remove_node(&mut state.table, node_path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn children(&self, path: &str) -> Result<Vec<String>> {
        validate_path(path)?;
        let mut state = self.lock()?;
        if load_live(&mut state.table, path)?.is_none() {
            return Err(Error::NotFound(path.to_string()));
        }

        let mut live = Vec::new();
        for name in state.table.child_names(path)? {
            if load_live(&mut state.table, &join_path(path, &name))?.is_some() {
                live.push(name);
            }
        }
        Ok(live)
    }

    fn purge_expired(&self) -> Result<usize> {
        let mut state = self.lock()?;
        let now = timestamp_now_millis();

        let lapsed: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, lease)| lease.lapsed(now))
            .map(|(session, _)| *session)
            .collect();
        for session in lapsed {
            let removed = Self::end_session(&mut state, session)?;
            tracing::info!(
                "Session {} lapsed ({} ephemeral nodes removed)",
                session,
                removed
            );
        }

        let expired: Vec<String> = state
            .table
            .scan()?
            .into_iter()
            .filter(|(_, node)| node.stat.is_expired(now))
            .map(|(path, _)| path)
            .collect();

        let mut purged = 0;
        for path in &expired {
            // An earlier removal may have cascaded into this one
            if state.table.load(path)?.is_some() {
                remove_node(&mut state.table, path)?;
                purged += 1;
            }
        }
        if purged > 0 {
            tracing::debug!("Purged {} expired TTL nodes", purged);
        }
        Ok(purged)
    }
}

fn new_stat(mode: EntryMode, owner: Option<SessionId>, ttl_ms: Option<u64>, now: u64) -> Stat {
    Stat {
        version: 0,
        cversion: 0,
        ctime_ms: now,
        mtime_ms: now,
        num_children: 0,
        mode,
        ephemeral_owner: owner,
        ttl_ms,
    }
}

fn check_size(path: &str, data: &[u8]) -> Result<()> {
    if data.len() > MAX_NODE_SIZE {
        return Err(Error::NodeTooLarge {
            path: path.to_string(),
            size: data.len(),
            limit: MAX_NODE_SIZE,
        });
    }
    Ok(())
}

fn check_version(path: &str, stat: &Stat, expected: Option<u64>) -> Result<()> {
    match expected {
        Some(expected) if expected != stat.version => Err(Error::VersionConflict {
            path: path.to_string(),
            expected,
            actual: stat.version,
        }),
        _ => Ok(()),
    }
}

/// Load a node, reclaiming it first if its TTL has lapsed
fn load_live<T: NodeTable>(table: &mut T, path: &str) -> Result<Option<Node>> {
    match table.load(path)? {
        Some(node) if node.stat.is_expired(timestamp_now_millis()) => {
            tracing::debug!("Reclaiming expired node {}", path);
            remove_node(table, path)?;
            Ok(None)
        }
        other => Ok(other),
    }
}

/// Remove a leaf and fix up its parent; empty containers go with it
fn remove_node<T: NodeTable>(table: &mut T, path: &str) -> Result<()> {
    table.remove(path)?;

    let Some(parent) = parent_path(path) else {
        return Ok(());
    };
    let Some(mut parent_node) = table.load(parent)? else {
        return Ok(());
    };

    parent_node.stat.num_children = parent_node.stat.num_children.saturating_sub(1);
    parent_node.stat.cversion += 1;

    if parent_node.stat.mode == EntryMode::Container && parent_node.stat.num_children == 0 {
        tracing::debug!("Removing empty container {} (last child {})", parent, node_name(path));
        return remove_node(table, parent);
    }
    table.save(parent, &parent_node)
}
