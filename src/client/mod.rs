//! Client side of the coordination store
//!
//! [`MetaClient`] is the capability surface the recipes are written against;
//! [`MetaClientFactory`] picks the backend named by the configuration.

pub mod factory;
pub mod meta_client;

pub use factory::MetaClientFactory;
pub use meta_client::MetaClient;
