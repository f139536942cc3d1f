//! Process-wide caches shared by every session: the compute cache that
//! memoizes expensive script functions, and the message cache that keeps
//! large outgoing deltas from being re-sent byte-for-byte.

mod compute;
mod disk;
mod messages;

pub use compute::{
    hash_args, ArgHasher, CacheRegion, ComputeCacheConfig, ComputeCacheTable, PersistentTier,
};
pub use disk::DiskTier;
pub use messages::MessageCache;
