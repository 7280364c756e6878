//! Common utilities and types shared across metacoord

pub mod config;
pub mod error;
pub mod utils;

pub use config::{BucketConfig, Config, LockConfig, MetaClientConfig, ReconnectPolicy, StoreType};
pub use error::{Error, Result};
pub use utils::{
    join_path, parent_path, parse_duration, retry_with_backoff,
    timestamp_now_millis, validate_path,
};
