//! Transaction query engine: filtered, paginated reads and lookup by id.
//!
//! Lookup by id tries the service's single-record endpoint first and falls
//! back to scanning unfiltered pages. Many deployments do not implement the
//! direct endpoint, so its failure is never fatal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{fetcher, Cacheable, Fetcher, QueryCache, QueryKey};
use crate::config::TransactionsConfig;
use crate::error::{SyncError, SyncResult};
use crate::model::{PageResult, Pagination, TransactionFilters, TransactionRecord};
use crate::query::Query;
use crate::remote::RemoteClient;

type TransactionPage = PageResult<TransactionRecord>;

/// How a lookup by id is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  /// Single-record endpoint first, page scan if that fails
  DirectLookup,
  /// Page scan only
  ScanFallback,
}

/// Bounds for the fallback page scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanLimits {
  pub page_size: u32,
  pub max_pages: u32,
}

impl From<&TransactionsConfig> for ScanLimits {
  fn from(config: &TransactionsConfig) -> Self {
    Self {
      page_size: config.scan_page_size.max(1),
      max_pages: config.scan_max_pages.max(1),
    }
  }
}

#[derive(Clone)]
pub struct TransactionEngine {
  remote: Arc<dyn RemoteClient>,
  cache: QueryCache,
  limits: ScanLimits,
  remember_unsupported: bool,
  /// Set once the direct endpoint answered "not implemented"
  lookup_unsupported: Arc<AtomicBool>,
}

impl TransactionEngine {
  pub fn new(remote: Arc<dyn RemoteClient>, cache: QueryCache, config: &TransactionsConfig) -> Self {
    Self {
      remote,
      cache,
      limits: ScanLimits::from(config),
      remember_unsupported: config.remember_unsupported_lookup,
      lookup_unsupported: Arc::new(AtomicBool::new(false)),
    }
  }

  /// One page of transactions matching every given filter.
  ///
  /// A page past the end comes back empty with the real totals.
  pub async fn fetch_page(
    &self,
    filters: &TransactionFilters,
    page: u32,
    limit: u32,
  ) -> SyncResult<TransactionPage> {
    if page == 0 || limit == 0 {
      return Err(SyncError::InvalidRequest(
        "page and limit must be at least 1".to_string(),
      ));
    }

    let key = page_key(filters, page, limit);
    match self
      .cache
      .fetch(&key, self.page_fetcher(filters.clone(), page, limit))
      .await
    {
      Ok(result) => result.data.decode(),
      Err(err) if err.is_connectivity() => {
        warn!(query = %key.description(), error = %err, "transactions unavailable; serving fallback");
        Ok(
          self
            .cache
            .get_as(&key)
            .unwrap_or_else(|| PageResult::empty(page, limit)),
        )
      }
      Err(err) => Err(err.into()),
    }
  }

  pub fn cached_page(
    &self,
    filters: &TransactionFilters,
    page: u32,
    limit: u32,
  ) -> Option<TransactionPage> {
    self.cache.get_as(&page_key(filters, page, limit))
  }

  fn page_fetcher(&self, filters: TransactionFilters, page: u32, limit: u32) -> Fetcher {
    let remote = self.remote.clone();
    fetcher(move || {
      let remote = remote.clone();
      let filters = filters.clone();
      async move {
        remote
          .list_transactions(&filters, page, limit)
          .await
          .map(|raw| raw.normalize(Pagination { page, limit }).into_cached())
      }
    })
  }

  /// Strategy the next `resolve_by_id` will use.
  pub fn strategy(&self) -> Resolution {
    if self.remember_unsupported && self.lookup_unsupported.load(Ordering::Relaxed) {
      Resolution::ScanFallback
    } else {
      Resolution::DirectLookup
    }
  }

  /// Find one transaction by id.
  ///
  /// Fails with `TransactionNotFound` only after both the direct lookup and
  /// the bounded scan came up empty. A page fetch failing mid-scan aborts
  /// with that error, since absence cannot be proven.
  pub async fn resolve_by_id(&self, id: &str) -> SyncResult<TransactionRecord> {
    let strategy = self.strategy();
    let direct = match strategy {
      Resolution::DirectLookup => self.direct_lookup(id).await,
      Resolution::ScanFallback => None,
    };

    let (record, resolved_by) = match direct {
      Some(record) => (record, Resolution::DirectLookup),
      None => (self.scan_for(id).await?, Resolution::ScanFallback),
    };

    info!(id, resolved_by = ?resolved_by, "transaction resolved");
    self.cache.set(
      &QueryKey::Transaction { id: id.to_string() },
      record.clone().into_cached(),
    );
    Ok(record)
  }

  pub fn cached_transaction(&self, id: &str) -> Option<TransactionRecord> {
    self.cache.get_as(&QueryKey::Transaction { id: id.to_string() })
  }

  /// Tier 1. Any failure only means "try the scan".
  async fn direct_lookup(&self, id: &str) -> Option<TransactionRecord> {
    match self.remote.transaction_by_id(id).await {
      Ok(record) if record.id == id => Some(record),
      Ok(record) => {
        warn!(id, returned = %record.id, "direct lookup returned another transaction");
        None
      }
      Err(err) => {
        if err.is_not_implemented() && self.remember_unsupported {
          self.lookup_unsupported.store(true, Ordering::Relaxed);
          info!("direct transaction lookup unsupported; scanning from now on");
        }
        warn!(id, kind = err.kind(), error = %err, "direct lookup failed; scanning pages");
        None
      }
    }
  }

  /// Tier 2. Ascending unfiltered pages until a match, a short page, or the
  /// page cap.
  async fn scan_for(&self, id: &str) -> SyncResult<TransactionRecord> {
    let filters = TransactionFilters::default();
    let ScanLimits {
      page_size,
      max_pages,
    } = self.limits;

    for page in 1..=max_pages {
      let batch = self
        .remote
        .list_transactions(&filters, page, page_size)
        .await?;
      let fetched = batch.records.len();

      if let Some(record) = batch.records.into_iter().find(|r| r.id == id) {
        debug!(id, page, "found by scan");
        return Ok(record);
      }
      if fetched < page_size as usize {
        debug!(id, page, "scan reached end of data");
        return Err(SyncError::TransactionNotFound { id: id.to_string() });
      }
    }

    debug!(id, max_pages, "scan reached page cap");
    Err(SyncError::TransactionNotFound { id: id.to_string() })
  }

  // ==========================================================================
  // Consumer handles
  // ==========================================================================

  pub fn page_query(&self, filters: TransactionFilters, page: u32, limit: u32) -> Query<TransactionPage> {
    let key = page_key(&filters, page, limit);
    let engine = self.clone();
    Query::new(move || {
      let engine = engine.clone();
      let filters = filters.clone();
      async move { engine.fetch_page(&filters, page, limit).await }
    })
    .bind(self.cache.subscribe(&key), TransactionPage::from_cached)
    .with_stale_time(self.cache.stale_after())
  }

  pub fn resolve_query(&self, id: String) -> Query<TransactionRecord> {
    let key = QueryKey::Transaction { id: id.clone() };
    let engine = self.clone();
    Query::new(move || {
      let engine = engine.clone();
      let id = id.clone();
      async move { engine.resolve_by_id(&id).await }
    })
    .bind(self.cache.subscribe(&key), TransactionRecord::from_cached)
    .with_stale_time(self.cache.stale_after())
  }
}

fn page_key(filters: &TransactionFilters, page: u32, limit: u32) -> QueryKey {
  QueryKey::TransactionPage {
    filters: filters.clone(),
    page,
    limit,
  }
}
