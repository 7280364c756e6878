//! Builds a [`MetaClient`] from configuration

use crate::client::MetaClient;
use crate::common::{Error, MetaClientConfig, Result};
use crate::store::{CoordinationStore, StoreBackend};
use std::sync::Arc;
use tokio::time::Instant;

pub struct MetaClientFactory;

impl MetaClientFactory {
    /// Open the configured backend and a session on it
    pub fn get_meta_client(config: &MetaClientConfig) -> Result<MetaClient> {
        config.validate()?;
        let backend = StoreBackend::open(&config.store_type)?;
        tracing::info!("Using {} store backend", backend.name());

        let store: Arc<dyn CoordinationStore> = Arc::new(backend);
        MetaClient::new(store, config.clone())
    }

    /// Like [`get_meta_client`](Self::get_meta_client), but keeps retrying
    /// while the backend cannot be opened yet (a RocksDB directory still
    /// locked by a closing handle, for instance). Gives up with
    /// `ConnectionFailed` after `connection_init_timeout_ms`.
    pub async fn connect(config: &MetaClientConfig) -> Result<MetaClient> {
        config.validate()?;
        let deadline = Instant::now() + config.connection_init_timeout();
        let policy = &config.reconnect_policy;
        let mut delay = policy.initial_backoff();

        loop {
            let attempt = config.clone();
            let opened =
                tokio::task::spawn_blocking(move || Self::get_meta_client(&attempt)).await?;
            let err = match opened {
                Ok(client) => return Ok(client),
                Err(e @ (Error::RocksDb(_) | Error::Io(_) | Error::ConnectionFailed(_))) => e,
                Err(e) => return Err(e),
            };

            if Instant::now() + delay >= deadline {
                return Err(Error::ConnectionFailed(format!(
                    "could not open {} within {:?}: {}",
                    config.connection_address,
                    config.connection_init_timeout(),
                    err
                )));
            }
            tracing::debug!("Store not ready ({}), retrying in {:?}", err, delay);
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(policy.max_backoff());
        }
    }
}
