//! Partitioned response cache.
//!
//! This module provides the storage side of the agent:
//! - Four partitions per version (static, dynamic, image, api)
//! - Capture timestamps on every entry, freshness judged lazily at read time
//! - Version sweep that drops every partition of older versions

mod storage;
mod tiers;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub(crate) use storage::{format_datetime, parse_datetime};
pub use tiers::{CacheTiers, TierConfig};
pub use traits::{system_clock, CachedResponse, Clock, Purpose, RequestKey, Retention};
