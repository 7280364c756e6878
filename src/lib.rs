//! # metacoord
//!
//! Client-side coordination toolkit over a hierarchical metadata store:
//! - `MetaClient`: async session handle with timeouts, reconnect policy and
//!   a kept-alive session lease
//! - Bucket accessor: versioned, chunked, compressed records larger than
//!   one node, with background collection of superseded versions
//! - Lock client: TTL-leased mutual exclusion with scoped guards
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────┐
//! │ BucketDataAccessor   │   │ LockClient       │
//! │  + GC worker         │   │  + LockGuard     │
//! └──────────┬───────────┘   └────────┬─────────┘
//!            └────────────┬───────────┘
//!                   ┌─────▼──────┐
//!                   │ MetaClient │  timeout, retry/backoff
//!                   └─────┬──────┘
//!              ┌──────────▼───────────┐
//!              │ CoordinationStore    │
//!              │  memory | RocksDB    │
//!              └──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use metacoord::{BucketConfig, BucketDataAccessor, MetaClientConfig, MetaClientFactory, MetaRecord};
//! use std::sync::Arc;
//!
//! # async fn example() -> metacoord::Result<()> {
//! let client = Arc::new(MetaClientFactory::connect(&MetaClientConfig::default()).await?);
//! let bucket = BucketDataAccessor::new(client, BucketConfig::default())?;
//!
//! let mut record = MetaRecord::new("resource");
//! record.set_simple_field("state", "ONLINE");
//! bucket.compressed_bucket_write("/cluster/resource", &record).await?;
//! let _read: MetaRecord = bucket.compressed_bucket_read("/cluster/resource").await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::result_large_err)]

pub mod bucket;
pub mod client;
pub mod common;
pub mod lock;
pub mod store;

// Re-export commonly used types
pub use bucket::{BucketDataAccessor, MetaRecord};
pub use client::{MetaClient, MetaClientFactory};
pub use common::{BucketConfig, Config, Error, LockConfig, MetaClientConfig, Result, StoreType};
pub use lock::{LockClient, LockGuard, LockInfo};
pub use store::{CoordinationStore, EntryMode, Stat};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
