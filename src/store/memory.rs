//! In-memory node table (default backend)

use crate::common::Result;
use crate::store::tree::{Node, NodeTable};
use std::collections::BTreeMap;

/// Nodes keyed by path; lost when the process exits
#[derive(Debug, Default)]
pub struct MemTable {
    nodes: BTreeMap<String, Node>,
}

impl MemTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeTable for MemTable {
    fn load(&self, path: &str) -> Result<Option<Node>> {
        Ok(self.nodes.get(path).cloned())
    }

    fn save(&mut self, path: &str, node: &Node) -> Result<()> {
        self.nodes.insert(path.to_string(), node.clone());
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.nodes.remove(path);
        Ok(())
    }

    fn child_names(&self, path: &str) -> Result<Vec<String>> {
        let prefix = child_prefix(path);
        Ok(self
            .nodes
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .filter_map(|key| direct_child(&prefix, key))
            .collect())
    }

    fn scan(&self) -> Result<Vec<(String, Node)>> {
        Ok(self
            .nodes
            .iter()
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect())
    }
}

/// Key prefix shared by every descendant of `path`
pub(crate) fn child_prefix(path: &str) -> String {
    if path == "/" {
        "/".to_string()
    } else {
        format!("{}/", path)
    }
}

/// Child name when `key` is exactly one level below `prefix`
pub(crate) fn direct_child(prefix: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    if rest.is_empty() || rest.contains('/') {
        None
    } else {
        Some(rest.to_string())
    }
}
