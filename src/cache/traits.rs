//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};

use crate::error::{RemoteError, SyncError, SyncResult};
use crate::model::{NotificationRecord, PageResult, TransactionRecord, UnreadAggregate};

/// A value held by one cache entry.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
  NotificationPage(PageResult<NotificationRecord>),
  Unread(UnreadAggregate),
  TransactionPage(PageResult<TransactionRecord>),
  Transaction(TransactionRecord),
}

impl CachedValue {
  /// Typed view of the value; an entry of the wrong shape is an internal error.
  pub fn decode<T: Cacheable>(&self) -> SyncResult<T> {
    T::from_cached(self).ok_or_else(|| {
      SyncError::Internal(format!("cached value is not a {}", T::entity_type()))
    })
  }
}

/// Types that can live in the cache.
///
/// Implementors convert to and from the matching [`CachedValue`] variant.
pub trait Cacheable: Clone + Send + Sync + 'static {
  fn from_cached(value: &CachedValue) -> Option<Self>;

  fn into_cached(self) -> CachedValue;

  /// Entity type name for logs (e.g., "unread", "transaction_page")
  fn entity_type() -> &'static str;
}

impl Cacheable for PageResult<NotificationRecord> {
  fn from_cached(value: &CachedValue) -> Option<Self> {
    match value {
      CachedValue::NotificationPage(page) => Some(page.clone()),
      _ => None,
    }
  }

  fn into_cached(self) -> CachedValue {
    CachedValue::NotificationPage(self)
  }

  fn entity_type() -> &'static str {
    "notification_page"
  }
}

impl Cacheable for UnreadAggregate {
  fn from_cached(value: &CachedValue) -> Option<Self> {
    match value {
      CachedValue::Unread(unread) => Some(*unread),
      _ => None,
    }
  }

  fn into_cached(self) -> CachedValue {
    CachedValue::Unread(self)
  }

  fn entity_type() -> &'static str {
    "unread"
  }
}

impl Cacheable for PageResult<TransactionRecord> {
  fn from_cached(value: &CachedValue) -> Option<Self> {
    match value {
      CachedValue::TransactionPage(page) => Some(page.clone()),
      _ => None,
    }
  }

  fn into_cached(self) -> CachedValue {
    CachedValue::TransactionPage(self)
  }

  fn entity_type() -> &'static str {
    "transaction_page"
  }
}

impl Cacheable for TransactionRecord {
  fn from_cached(value: &CachedValue) -> Option<Self> {
    match value {
      CachedValue::Transaction(record) => Some(record.clone()),
      _ => None,
    }
  }

  fn into_cached(self) -> CachedValue {
    CachedValue::Transaction(self)
  }

  fn entity_type() -> &'static str {
    "transaction"
  }
}

/// What subscribers of a key are told.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
  /// New value, either fetched or written optimistically
  Updated(CachedValue),
  /// Entry marked stale; a refetch may follow
  Invalidated,
  /// A refetch failed; the previous value is still served
  FetchFailed(RemoteError),
  /// The whole cache was dropped (session teardown)
  Cleared,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was last fetched (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: Option<DateTime<Utc>>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, considered stale; a background refetch is running
  CacheStale,
  /// A fetch result lost to newer local state; the newer state was served
  Superseded,
}
