//! Distributed lock recipe

pub mod client;
pub mod guard;
pub mod info;

pub use client::LockClient;
pub use guard::LockGuard;
pub use info::LockInfo;
