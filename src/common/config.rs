//! Configuration for metacoord components

use crate::common::utils::parse_duration;
use crate::common::{Error, Result};
use crate::store::MAX_NODE_SIZE;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Global configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Store connection and session settings
    #[serde(default)]
    pub meta_client: MetaClientConfig,

    /// Chunked accessor settings
    #[serde(default)]
    pub bucket: BucketConfig,

    /// Lock recipe settings
    #[serde(default)]
    pub lock: LockConfig,
}

impl Config {
    /// Load from a file, with `METACOORD_*` environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("METACOORD").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.meta_client.validate()?;
        self.bucket.validate()
    }
}

/// Store backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum StoreType {
    /// In-process tree, lost when the process exits
    Memory,
    /// RocksDB database at `path`
    RocksDb { path: PathBuf },
}

impl Default for StoreType {
    fn default() -> Self {
        StoreType::Memory
    }
}

/// Bounded retry with exponential backoff for transient store failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_initial_backoff", deserialize_with = "duration_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff", deserialize_with = "duration_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> usize {
    5
}
fn default_initial_backoff() -> u64 {
    50
}
fn default_max_backoff() -> u64 {
    5_000
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl ReconnectPolicy {
    /// Fail on the first error
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Self::default()
        }
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// MetaClient configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaClientConfig {
    /// Address of the store; informational for in-process backends
    #[serde(default = "default_connection_address")]
    pub connection_address: String,

    #[serde(default)]
    pub store_type: StoreType,

    /// How long `MetaClientFactory::connect` keeps trying to open the store
    #[serde(default = "default_connection_init_timeout", deserialize_with = "duration_ms")]
    pub connection_init_timeout_ms: u64,

    /// A session not kept alive for this long lapses with its ephemeral nodes
    #[serde(default = "default_session_timeout", deserialize_with = "duration_ms")]
    pub session_timeout_ms: u64,

    /// Upper bound for a single store round-trip
    #[serde(default = "default_operation_timeout", deserialize_with = "duration_ms")]
    pub operation_timeout_ms: u64,

    #[serde(default)]
    pub reconnect_policy: ReconnectPolicy,

    /// First-segment prefixes reserved for the system
    #[serde(default = "default_reserved_namespaces")]
    pub reserved_namespaces: Vec<String>,

    /// How often expired TTL nodes are purged (0 disables the reaper)
    #[serde(default = "default_ttl_reap_interval", deserialize_with = "duration_ms")]
    pub ttl_reap_interval_ms: u64,
}

fn default_connection_address() -> String {
    "memory://local".to_string()
}
fn default_connection_init_timeout() -> u64 {
    60_000
}
fn default_session_timeout() -> u64 {
    30_000
}
fn default_operation_timeout() -> u64 {
    10_000
}
fn default_reserved_namespaces() -> Vec<String> {
    vec!["_".to_string(), "zookeeper".to_string()]
}
fn default_ttl_reap_interval() -> u64 {
    1_000
}

impl Default for MetaClientConfig {
    fn default() -> Self {
        Self {
            connection_address: default_connection_address(),
            store_type: StoreType::default(),
            connection_init_timeout_ms: default_connection_init_timeout(),
            session_timeout_ms: default_session_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            reconnect_policy: ReconnectPolicy::default(),
            reserved_namespaces: default_reserved_namespaces(),
            ttl_reap_interval_ms: default_ttl_reap_interval(),
        }
    }
}

impl MetaClientConfig {
    pub fn rocksdb(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            connection_address: format!("rocksdb://{}", path.display()),
            store_type: StoreType::RocksDb { path },
            ..Self::default()
        }
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn connection_init_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_init_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.operation_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "operation_timeout_ms must be positive".into(),
            ));
        }
        if self.connection_init_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "connection_init_timeout_ms must be positive".into(),
            ));
        }
        if self.session_timeout_ms < 3 {
            return Err(Error::InvalidConfig(
                "session_timeout_ms must be at least 3".into(),
            ));
        }
        if self.reconnect_policy.max_retries == 0 {
            return Err(Error::InvalidConfig(
                "reconnect_policy.max_retries must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Chunked versioned accessor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Largest chunk payload written to a single node
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// How long a superseded version stays readable
    #[serde(default = "default_version_ttl", deserialize_with = "duration_ms")]
    pub version_ttl_ms: u64,

    /// Versions at or below the published one that GC always keeps
    #[serde(default = "default_min_retained_versions")]
    pub min_retained_versions: usize,

    /// Compare-and-swap attempts on the pointer nodes
    #[serde(default = "default_cas_retries")]
    pub cas_retries: usize,
}

fn default_max_chunk_size() -> usize {
    50 * 1024
}
fn default_version_ttl() -> u64 {
    60_000
}
fn default_min_retained_versions() -> usize {
    1
}
fn default_cas_retries() -> usize {
    10
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            version_ttl_ms: default_version_ttl(),
            min_retained_versions: default_min_retained_versions(),
            cas_retries: default_cas_retries(),
        }
    }
}

impl BucketConfig {
    pub fn new(max_chunk_size: usize, version_ttl: Duration) -> Self {
        Self {
            max_chunk_size,
            version_ttl_ms: version_ttl.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn version_ttl(&self) -> Duration {
        Duration::from_millis(self.version_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_chunk_size == 0 || self.max_chunk_size > MAX_NODE_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_chunk_size must be between 1 and {} bytes",
                MAX_NODE_SIZE
            )));
        }
        if self.min_retained_versions == 0 {
            return Err(Error::InvalidConfig(
                "min_retained_versions must be at least 1".into(),
            ));
        }
        if self.cas_retries == 0 {
            return Err(Error::InvalidConfig("cas_retries must be at least 1".into()));
        }
        Ok(())
    }
}

/// Lock recipe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// TTL used by scoped locks when the caller gives none
    #[serde(default = "default_lock_ttl", deserialize_with = "duration_ms")]
    pub default_ttl_ms: u64,

    /// Compare-and-swap attempts when renewing
    #[serde(default = "default_cas_retries")]
    pub renew_retries: usize,
}

fn default_lock_ttl() -> u64 {
    30_000
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            default_ttl_ms: default_lock_ttl(),
            renew_retries: default_cas_retries(),
        }
    }
}

/// Accept either a millisecond count or a duration string ("500ms", "30s")
fn duration_ms<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Millis(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Millis(ms) => Ok(ms),
        Raw::Text(s) => match s.parse::<u64>() {
            Ok(ms) => Ok(ms),
            Err(_) => parse_duration(&s)
                .map(|d| d.as_millis() as u64)
                .map_err(serde::de::Error::custom),
        },
    }
}
