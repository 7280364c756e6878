//! RocksDB node table
//!
//! Nodes are keyed by their full path and encoded with bincode, so a
//! subtree is one contiguous key range.

use crate::common::Result;
use crate::store::memory::{child_prefix, direct_child};
use crate::store::tree::{Node, NodeTable};
use rocksdb::{Direction, IteratorMode, Options, DB};
use std::path::Path;

const CF_NODES: &str = "nodes";

/// Durable node table
pub struct RocksTable {
    db: DB,
}

impl RocksTable {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path.as_ref(), vec![CF_NODES])?;
        tracing::info!("Opened RocksDB store at {}", path.as_ref().display());

        Ok(Self { db })
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(CF_NODES)
            .ok_or_else(|| crate::Error::Internal("missing column family 'nodes'".into()))
    }
}

impl NodeTable for RocksTable {
    fn load(&self, path: &str) -> Result<Option<Node>> {
        match self.db.get_cf(self.cf()?, path.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&mut self, path: &str, node: &Node) -> Result<()> {
        let value = bincode::serialize(node)?;
        self.db.put_cf(self.cf()?, path.as_bytes(), value)?;
        Ok(())
    }

    fn remove(&mut self, path: &str) -> Result<()> {
        self.db.delete_cf(self.cf()?, path.as_bytes())?;
        Ok(())
    }

    fn child_names(&self, path: &str) -> Result<Vec<String>> {
        let prefix = child_prefix(path);
        let iter = self.db.iterator_cf(
            self.cf()?,
            IteratorMode::From(prefix.as_bytes(), Direction::Forward),
        );

        let mut names = Vec::new();
        for item in iter {
            let (key_bytes, _) = item?;
            let key = String::from_utf8(key_bytes.to_vec()).map_err(|_| {
                crate::Error::corrupted(path, "node key is not valid UTF-8")
            })?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(name) = direct_child(&prefix, &key) {
                names.push(name);
            }
        }
        Ok(names)
    }

    fn scan(&self) -> Result<Vec<(String, Node)>> {
        let iter = self.db.iterator_cf(self.cf()?, IteratorMode::Start);

        let mut nodes = Vec::new();
        for item in iter {
            let (key_bytes, value_bytes) = item?;
            let key = String::from_utf8(key_bytes.to_vec())
                .map_err(|_| crate::Error::corrupted("/", "node key is not valid UTF-8"))?;
            nodes.push((key, bincode::deserialize(&value_bytes)?));
        }
        Ok(nodes)
    }
}
