//! Bucketized storage for records too large for a single node

pub mod accessor;
pub mod codec;
pub mod gc;
pub mod record;

pub use accessor::BucketDataAccessor;
pub use codec::ChunkManifest;
pub use gc::plan_gc;
pub use record::MetaRecord;

use crate::common::{Error, Result};

/// Pointer to the highest reserved version
pub const LAST_WRITE_KEY: &str = "LAST_WRITE";
/// Pointer to the version readers should use
pub const LAST_SUCCESSFUL_WRITE_KEY: &str = "LAST_SUCCESSFUL_WRITE";

/// Version pointers hold a UTF-8 decimal
pub(crate) fn parse_version(path: &str, bytes: &[u8]) -> Result<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::corrupted(path, "version pointer is not a decimal number"))
}
