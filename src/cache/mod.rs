//! In-memory query cache shared by both engines.
//!
//! This module provides:
//! - Typed query keys hashed into opaque cache keys
//! - Stale-while-revalidate reads with background refetch
//! - Multi-entry optimistic writes applied in one step
//! - Per-key subscriptions that stop delivering once dropped
//! - Generation checks so an old fetch never overwrites newer local state

mod key;
mod store;
mod traits;

pub use key::{CacheKey, Family, QueryKey};
pub use store::{fetcher, CacheWriter, EntryInfo, FetchFuture, Fetcher, QueryCache, Subscription};
pub use traits::{CacheEvent, CacheResult, CacheSource, CachedValue, Cacheable};
