//! The query cache: keyed entries with staleness, subscriptions and
//! generation-guarded fetches.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use std::future::Future;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::key::{CacheKey, QueryKey};
use super::traits::{CacheEvent, CacheResult, CacheSource, CachedValue, Cacheable};
use crate::error::RemoteError;
use crate::remote::RemoteResult;

/// Future produced by a registered fetcher
pub type FetchFuture = BoxFuture<'static, RemoteResult<CachedValue>>;

/// Produces a fresh value for one key. Stored with the entry so invalidation
/// can refetch in the background.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Box a closure returning a future into a [`Fetcher`].
pub fn fetcher<F, Fut>(f: F) -> Fetcher
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = RemoteResult<CachedValue>> + Send + 'static,
{
  Arc::new(move || f().boxed())
}

struct Entry {
  query: QueryKey,
  value: Option<CachedValue>,
  fetched_at: Option<DateTime<Utc>>,
  fetched_instant: Option<Instant>,
  is_stale: bool,
  /// Bumped on every write or invalidation; taken from a cache-wide counter
  generation: u64,
  /// Token of the most recent fetch started for this entry
  latest_fetch: u64,
  in_flight: bool,
  fetcher: Option<Fetcher>,
}

impl Entry {
  fn new(query: QueryKey) -> Self {
    Self {
      query,
      value: None,
      fetched_at: None,
      fetched_instant: None,
      is_stale: true,
      generation: 0,
      latest_fetch: 0,
      in_flight: false,
      fetcher: None,
    }
  }

  fn is_stale(&self, stale_after: Duration) -> bool {
    self.is_stale
      || self
        .fetched_instant
        .map_or(true, |at| at.elapsed() >= stale_after)
  }
}

struct Subscriber {
  id: u64,
  tx: mpsc::UnboundedSender<CacheEvent>,
}

#[derive(Default)]
struct Inner {
  entries: HashMap<CacheKey, Entry>,
  subscribers: HashMap<CacheKey, Vec<Subscriber>>,
  counter: u64,
}

impl Inner {
  fn next(&mut self) -> u64 {
    self.counter += 1;
    self.counter
  }

  fn notify(&mut self, key: &CacheKey, event: &CacheEvent) {
    if let Some(subs) = self.subscribers.get_mut(key) {
      // A failed send means the receiver is gone; drop it.
      subs.retain(|sub| sub.tx.send(event.clone()).is_ok());
    }
  }

  fn has_subscribers(&mut self, key: &CacheKey) -> bool {
    match self.subscribers.get_mut(key) {
      Some(subs) => {
        subs.retain(|sub| !sub.tx.is_closed());
        !subs.is_empty()
      }
      None => false,
    }
  }

  fn begin_fetch(&mut self, key: &CacheKey, query: &QueryKey) -> FetchTicket {
    let token = self.next();
    let entry = self
      .entries
      .entry(key.clone())
      .or_insert_with(|| Entry::new(query.clone()));
    entry.latest_fetch = token;
    entry.in_flight = true;
    FetchTicket {
      key: key.clone(),
      generation: entry.generation,
      token,
    }
  }
}

/// Captures the entry generation at the moment a fetch starts.
#[derive(Debug, Clone)]
pub(crate) struct FetchTicket {
  key: CacheKey,
  generation: u64,
  token: u64,
}

/// How a completed fetch was handled
#[derive(Debug)]
pub(crate) enum FetchOutcome {
  /// Written to the entry
  Applied(CachedValue),
  /// The entry changed while the fetch was in flight; result dropped
  Superseded {
    current: Option<CachedValue>,
    fetched: CachedValue,
  },
  Failed(RemoteError),
}

/// Releases an entry's in-flight mark if the fetch future is dropped before
/// it completes (task aborted, caller timed out).
struct InFlightGuard<'a> {
  cache: &'a QueryCache,
  ticket: FetchTicket,
  armed: bool,
}

impl InFlightGuard<'_> {
  fn disarm(mut self) -> FetchTicket {
    self.armed = false;
    self.ticket.clone()
  }
}

impl Drop for InFlightGuard<'_> {
  fn drop(&mut self) {
    if !self.armed {
      return;
    }
    let ticket = &self.ticket;
    let mut inner = self.cache.lock();
    if let Some(entry) = inner.entries.get_mut(&ticket.key) {
      if entry.latest_fetch == ticket.token {
        entry.in_flight = false;
        debug!(query = %entry.query.description(), "fetch abandoned");
      }
    }
  }
}

/// Snapshot of an entry's metadata
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
  pub fetched_at: Option<DateTime<Utc>>,
  pub is_stale: bool,
  pub has_value: bool,
  pub in_flight: bool,
}

/// Process-wide (per session) store of query results.
///
/// Every method runs its state change inside one short critical section and
/// never holds the lock across an `.await`, so each change is a single
/// atomic step relative to all others. Network work happens outside the lock
/// and is reconciled through generation checks when it completes: a result is
/// only written if nothing touched the entry since the fetch started.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Mutex<Inner>>,
  stale_after: Duration,
}

impl QueryCache {
  pub fn new(stale_after: Duration) -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner::default())),
      stale_after,
    }
  }

  pub fn stale_after(&self) -> Duration {
    self.stale_after
  }

  fn lock(&self) -> MutexGuard<'_, Inner> {
    // Entries are plain data; a panic elsewhere cannot leave them half-written.
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Last known value, stale or not.
  pub fn get(&self, key: &QueryKey) -> Option<CachedValue> {
    let inner = self.lock();
    inner
      .entries
      .get(&key.cache_key())
      .and_then(|entry| entry.value.clone())
  }

  /// Typed variant of [`get`](Self::get).
  pub fn get_as<T: Cacheable>(&self, key: &QueryKey) -> Option<T> {
    self.get(key).as_ref().and_then(T::from_cached)
  }

  pub fn info(&self, key: &QueryKey) -> Option<EntryInfo> {
    let inner = self.lock();
    inner.entries.get(&key.cache_key()).map(|entry| EntryInfo {
      fetched_at: entry.fetched_at,
      is_stale: entry.is_stale(self.stale_after),
      has_value: entry.value.is_some(),
      in_flight: entry.in_flight,
    })
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Store an authoritative value, as if it had just been fetched.
  pub fn set(&self, key: &QueryKey, value: CachedValue) {
    let cache_key = key.cache_key();
    let mut inner = self.lock();
    let generation = inner.next();
    let entry = inner
      .entries
      .entry(cache_key.clone())
      .or_insert_with(|| Entry::new(key.clone()));
    entry.value = Some(value.clone());
    entry.fetched_at = Some(Utc::now());
    entry.fetched_instant = Some(Instant::now());
    entry.is_stale = false;
    entry.generation = generation;
    inner.notify(&cache_key, &CacheEvent::Updated(value));
  }

  /// Mark an entry stale. If anyone is subscribed and a fetcher is
  /// registered, a background refetch starts; otherwise the next read
  /// refetches.
  pub fn invalidate(&self, key: &QueryKey) {
    self.invalidate_where(|query| query == key);
  }

  /// Invalidate every entry whose query matches `predicate`.
  pub fn invalidate_where(&self, predicate: impl Fn(&QueryKey) -> bool) {
    self.invalidate_matching(predicate, false);
  }

  /// Invalidate every matching entry and refetch each one that has a
  /// registered fetcher right away, observed or not.
  pub fn reset_where(&self, predicate: impl Fn(&QueryKey) -> bool) {
    self.invalidate_matching(predicate, true);
  }

  fn invalidate_matching(&self, predicate: impl Fn(&QueryKey) -> bool, force: bool) {
    let mut to_refetch = Vec::new();
    {
      let mut inner = self.lock();
      let keys: Vec<CacheKey> = inner
        .entries
        .iter()
        .filter(|(_, entry)| predicate(&entry.query))
        .map(|(key, _)| key.clone())
        .collect();

      for key in keys {
        let generation = inner.next();
        if let Some(entry) = inner.entries.get_mut(&key) {
          entry.is_stale = true;
          entry.generation = generation;
          debug!(query = %entry.query.description(), "invalidated");
        }
        inner.notify(&key, &CacheEvent::Invalidated);
        if force || inner.has_subscribers(&key) {
          to_refetch.push(key);
        }
      }
    }

    for key in to_refetch {
      self.spawn_refetch(&key);
    }
  }

  /// Subscribe to changes of one key. Dropping the returned guard
  /// unsubscribes; nothing is delivered after that.
  pub fn subscribe(&self, key: &QueryKey) -> Subscription {
    let cache_key = key.cache_key();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut inner = self.lock();
    let id = inner.next();
    inner
      .subscribers
      .entry(cache_key.clone())
      .or_default()
      .push(Subscriber { id, tx });

    Subscription {
      key: cache_key,
      id,
      rx,
      cache: Arc::downgrade(&self.inner),
    }
  }

  /// Read through the cache with stale-while-revalidate.
  ///
  /// 1. Fresh value: returned immediately
  /// 2. Stale value: returned immediately, one background refetch started
  /// 3. Nothing cached: fetched from the network and stored
  pub async fn fetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
  ) -> RemoteResult<CacheResult<CachedValue>> {
    enum Plan {
      Cached(CacheResult<CachedValue>, bool),
      Miss(FetchTicket),
    }

    let cache_key = key.cache_key();
    let plan = {
      let mut inner = self.lock();
      let entry = inner
        .entries
        .entry(cache_key.clone())
        .or_insert_with(|| Entry::new(key.clone()));
      entry.fetcher = Some(fetcher.clone());

      let stale = entry.is_stale(self.stale_after);
      let spawn = stale && !entry.in_flight;
      let cached = entry
        .value
        .clone()
        .map(|value| CacheResult::from_cache(value, entry.fetched_at, stale));

      match cached {
        Some(result) => Plan::Cached(result, spawn),
        None => Plan::Miss(inner.begin_fetch(&cache_key, key)),
      }
    };

    match plan {
      Plan::Cached(result, spawn) => {
        debug!(query = %key.description(), source = ?result.source, "cache hit");
        if spawn {
          self.spawn_refetch(&cache_key);
        }
        Ok(result)
      }
      Plan::Miss(ticket) => {
        debug!(query = %key.description(), "cache miss");
        Self::outcome_to_result(self.run_fetch(ticket, fetcher).await)
      }
    }
  }

  /// Always go to the network, then store the result subject to the usual
  /// generation check.
  pub async fn refetch(
    &self,
    key: &QueryKey,
    fetcher: Fetcher,
  ) -> RemoteResult<CacheResult<CachedValue>> {
    let cache_key = key.cache_key();
    let ticket = {
      let mut inner = self.lock();
      let entry = inner
        .entries
        .entry(cache_key.clone())
        .or_insert_with(|| Entry::new(key.clone()));
      entry.fetcher = Some(fetcher.clone());
      inner.begin_fetch(&cache_key, key)
    };

    Self::outcome_to_result(self.run_fetch(ticket, fetcher).await)
  }

  /// Await `fetcher` for a started fetch and complete it. Dropping the
  /// returned future early still clears the entry's in-flight mark, so a
  /// later stale read can revalidate.
  async fn run_fetch(&self, ticket: FetchTicket, fetcher: Fetcher) -> FetchOutcome {
    let guard = InFlightGuard {
      cache: self,
      ticket,
      armed: true,
    };
    let result = fetcher().await;
    self.complete_fetch(guard.disarm(), result)
  }

  fn outcome_to_result(outcome: FetchOutcome) -> RemoteResult<CacheResult<CachedValue>> {
    match outcome {
      FetchOutcome::Applied(value) => Ok(CacheResult::from_network(value)),
      FetchOutcome::Superseded { current, fetched } => Ok(CacheResult {
        data: current.unwrap_or(fetched),
        source: CacheSource::Superseded,
        cached_at: None,
      }),
      FetchOutcome::Failed(err) => Err(err),
    }
  }

  /// Apply local (optimistic) writes to any number of entries in one step.
  ///
  /// Subscribers of every key written by `f` are notified before the lock is
  /// released, so no observer can see one write without the others.
  pub fn mutate<R>(&self, f: impl FnOnce(&mut CacheWriter<'_>) -> R) -> R {
    let mut inner = self.lock();
    let mut writer = CacheWriter {
      inner: &mut *inner,
      changed: Vec::new(),
    };
    let result = f(&mut writer);
    let changed = std::mem::take(&mut writer.changed);

    for key in changed {
      if let Some(value) = inner.entries.get(&key).and_then(|e| e.value.clone()) {
        inner.notify(&key, &CacheEvent::Updated(value));
      }
    }
    result
  }

  /// Drop every entry. Open subscriptions receive `Cleared`; fetches still in
  /// flight find no entry and are discarded.
  pub fn clear(&self) {
    let mut inner = self.lock();
    let count = inner.entries.len();
    inner.entries.clear();
    for subs in inner.subscribers.values_mut() {
      subs.retain(|sub| sub.tx.send(CacheEvent::Cleared).is_ok());
    }
    debug!(entries = count, "cache cleared");
  }

  /// Start a background refetch using the entry's registered fetcher.
  /// Skipped when no fetcher is known or no runtime is available.
  fn spawn_refetch(&self, cache_key: &CacheKey) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
      debug!("no runtime; refetch deferred to next read");
      return;
    };

    let (ticket, fetcher, description) = {
      let mut inner = self.lock();
      let Some(entry) = inner.entries.get(cache_key) else {
        return;
      };
      let Some(fetcher) = entry.fetcher.clone() else {
        return;
      };
      let query = entry.query.clone();
      (inner.begin_fetch(cache_key, &query), fetcher, query.description())
    };

    debug!(query = %description, "background refetch");
    let cache = self.clone();
    runtime.spawn(async move {
      cache.run_fetch(ticket, fetcher).await;
    });
  }

  /// Finish a fetch. The result is written only if the entry's generation is
  /// the one captured when the fetch began; fresher local state wins.
  pub(crate) fn complete_fetch(
    &self,
    ticket: FetchTicket,
    result: RemoteResult<CachedValue>,
  ) -> FetchOutcome {
    let mut reschedule = false;
    let outcome = {
      let mut inner = self.lock();
      let generation = inner.next();
      let has_subscribers = inner.has_subscribers(&ticket.key);

      let Some(entry) = inner.entries.get_mut(&ticket.key) else {
        // Cleared while in flight
        return match result {
          Ok(fetched) => FetchOutcome::Superseded {
            current: None,
            fetched,
          },
          Err(err) => FetchOutcome::Failed(err),
        };
      };

      let is_latest = entry.latest_fetch == ticket.token;
      if is_latest {
        entry.in_flight = false;
      }

      match result {
        Ok(value) if entry.generation == ticket.generation => {
          entry.value = Some(value.clone());
          entry.fetched_at = Some(Utc::now());
          entry.fetched_instant = Some(Instant::now());
          entry.is_stale = false;
          entry.generation = generation;
          let event = CacheEvent::Updated(value.clone());
          inner.notify(&ticket.key, &event);
          FetchOutcome::Applied(value)
        }
        Ok(fetched) => {
          debug!(
            query = %entry.query.description(),
            "fetch result superseded by newer local state"
          );
          reschedule = entry.is_stale && is_latest && has_subscribers;
          FetchOutcome::Superseded {
            current: entry.value.clone(),
            fetched,
          }
        }
        Err(err) => {
          warn!(query = %entry.query.description(), error = %err, "fetch failed");
          inner.notify(&ticket.key, &CacheEvent::FetchFailed(err.clone()));
          FetchOutcome::Failed(err)
        }
      }
    };

    if reschedule {
      self.spawn_refetch(&ticket.key);
    }
    outcome
  }

  #[cfg(test)]
  pub(crate) fn begin_fetch_for_test(&self, key: &QueryKey) -> FetchTicket {
    self.lock().begin_fetch(&key.cache_key(), key)
  }
}

/// Write access to all entries during [`QueryCache::mutate`].
pub struct CacheWriter<'a> {
  inner: &'a mut Inner,
  changed: Vec<CacheKey>,
}

impl CacheWriter<'_> {
  pub fn get(&self, key: &QueryKey) -> Option<&CachedValue> {
    self
      .inner
      .entries
      .get(&key.cache_key())
      .and_then(|entry| entry.value.as_ref())
  }

  /// Queries that currently hold a value and match `predicate`
  pub fn queries(&self, predicate: impl Fn(&QueryKey) -> bool) -> Vec<QueryKey> {
    self
      .inner
      .entries
      .values()
      .filter(|entry| entry.value.is_some() && predicate(&entry.query))
      .map(|entry| entry.query.clone())
      .collect()
  }

  /// Write a locally derived value. Freshness metadata is left alone; an
  /// entry created here starts out stale.
  pub fn put(&mut self, key: &QueryKey, value: CachedValue) {
    let cache_key = key.cache_key();
    let generation = self.inner.next();
    let entry = self
      .inner
      .entries
      .entry(cache_key.clone())
      .or_insert_with(|| Entry::new(key.clone()));
    entry.value = Some(value);
    entry.generation = generation;
    self.changed.push(cache_key);
  }
}

/// A live subscription to one cache key.
pub struct Subscription {
  key: CacheKey,
  id: u64,
  rx: mpsc::UnboundedReceiver<CacheEvent>,
  cache: Weak<Mutex<Inner>>,
}

impl Subscription {
  /// Wait for the next event. `None` once the cache is gone.
  pub async fn recv(&mut self) -> Option<CacheEvent> {
    self.rx.recv().await
  }

  /// Next pending event without waiting.
  pub fn try_recv(&mut self) -> Option<CacheEvent> {
    self.rx.try_recv().ok()
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(cache) = self.cache.upgrade() {
      let mut inner = cache.lock().unwrap_or_else(PoisonError::into_inner);
      if let Some(subs) = inner.subscribers.get_mut(&self.key) {
        subs.retain(|sub| sub.id != self.id);
        if subs.is_empty() {
          inner.subscribers.remove(&self.key);
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::UnreadAggregate;
  use std::sync::atomic::{AtomicU64, Ordering};

  fn unread(count: u64) -> CachedValue {
    CachedValue::Unread(UnreadAggregate::new(count))
  }

  /// Fetcher returning an increasing count on every call
  fn counting_fetcher(counter: Arc<AtomicU64>) -> Fetcher {
    fetcher(move || {
      let counter = counter.clone();
      async move {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(unread(n))
      }
    })
  }

  fn failing_fetcher() -> Fetcher {
    fetcher(|| async { Err(RemoteError::ConnectivityLost("offline".into())) })
  }

  #[tokio::test]
  async fn test_miss_then_fresh_hit() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let counter = Arc::new(AtomicU64::new(0));
    let key = QueryKey::UnreadAggregate;

    let first = cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(first.data, unread(1));

    let second = cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();
    assert_eq!(second.source, CacheSource::CacheFresh);
    assert_eq!(second.data, unread(1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_value_served_while_revalidating() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let counter = Arc::new(AtomicU64::new(0));
    let key = QueryKey::UnreadAggregate;

    cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();
    cache.invalidate(&key);
    assert_eq!(cache.get(&key), Some(unread(1)));

    let result = cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data, unread(1));

    // Let the background refetch land
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(cache.get(&key), Some(unread(2)));
    assert!(!cache.info(&key).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_fetch_started_before_local_write_is_discarded() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    cache.set(&key, unread(5));

    let ticket = cache.begin_fetch_for_test(&key);
    cache.mutate(|w| w.put(&key, unread(4)));

    let outcome = cache.complete_fetch(ticket, Ok(unread(5)));
    assert!(matches!(outcome, FetchOutcome::Superseded { .. }));
    assert_eq!(cache.get(&key), Some(unread(4)));
  }

  #[tokio::test]
  async fn test_fetch_started_after_local_write_is_applied() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    cache.mutate(|w| w.put(&key, unread(4)));

    let ticket = cache.begin_fetch_for_test(&key);
    let outcome = cache.complete_fetch(ticket, Ok(unread(3)));
    assert!(matches!(outcome, FetchOutcome::Applied(_)));
    assert_eq!(cache.get(&key), Some(unread(3)));
  }

  #[tokio::test]
  async fn test_invalidate_with_subscriber_refetches() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let counter = Arc::new(AtomicU64::new(0));
    let key = QueryKey::UnreadAggregate;
    cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();

    let mut sub = cache.subscribe(&key);
    cache.invalidate(&key);

    assert_eq!(sub.recv().await, Some(CacheEvent::Invalidated));
    assert_eq!(sub.recv().await, Some(CacheEvent::Updated(unread(2))));
  }

  #[tokio::test]
  async fn test_invalidate_without_subscriber_waits_for_next_read() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let counter = Arc::new(AtomicU64::new(0));
    let key = QueryKey::UnreadAggregate;
    cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();

    cache.invalidate(&key);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(cache.info(&key).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_reset_refetches_without_subscriber() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let counter = Arc::new(AtomicU64::new(0));
    let key = QueryKey::UnreadAggregate;
    cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();

    cache.reset_where(|query| *query == QueryKey::UnreadAggregate);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(cache.get(&key), Some(unread(2)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_cancelled_refetch_does_not_block_revalidation() {
    let cache = QueryCache::new(Duration::from_secs(30));
    let counter = Arc::new(AtomicU64::new(0));
    let key = QueryKey::UnreadAggregate;
    cache.set(&key, unread(7));

    let hung = fetcher(futures::future::pending::<RemoteResult<CachedValue>>);
    let timed_out = tokio::time::timeout(Duration::from_millis(10), cache.refetch(&key, hung)).await;
    assert!(timed_out.is_err());
    assert!(!cache.info(&key).unwrap().in_flight);

    tokio::time::sleep(Duration::from_secs(31)).await;
    let result = cache
      .fetch(&key, counting_fetcher(counter.clone()))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data, unread(7));

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(cache.get(&key), Some(unread(1)));
    assert!(!cache.info(&key).unwrap().is_stale);
  }

  #[tokio::test]
  async fn test_aborted_refetch_task_releases_entry() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    cache.set(&key, unread(1));

    let hung = fetcher(futures::future::pending::<RemoteResult<CachedValue>>);
    let task = tokio::spawn({
      let cache = cache.clone();
      let key = key.clone();
      async move { cache.refetch(&key, hung).await }
    });
    tokio::task::yield_now().await;
    assert!(cache.info(&key).unwrap().in_flight);

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(!cache.info(&key).unwrap().in_flight);
  }

  #[tokio::test]
  async fn test_dropped_subscription_receives_nothing() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    let sub = cache.subscribe(&key);
    drop(sub);

    cache.set(&key, unread(1));
    let inner = cache.lock();
    assert!(inner.subscribers.get(&key.cache_key()).is_none());
  }

  #[tokio::test]
  async fn test_mutate_notifies_every_changed_key() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let a = QueryKey::UnreadAggregate;
    let b = QueryKey::Transaction { id: "t1".into() };
    let mut sub_a = cache.subscribe(&a);
    let mut sub_b = cache.subscribe(&b);

    cache.mutate(|w| {
      w.put(&a, unread(7));
      w.put(&b, unread(8));
    });

    assert_eq!(sub_a.try_recv(), Some(CacheEvent::Updated(unread(7))));
    assert_eq!(sub_b.try_recv(), Some(CacheEvent::Updated(unread(8))));
  }

  #[tokio::test]
  async fn test_failed_miss_propagates_and_caches_nothing() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    let err = cache.fetch(&key, failing_fetcher()).await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(cache.get(&key), None);
  }

  #[tokio::test]
  async fn test_clear_drops_entries_and_tells_subscribers() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    let mut sub = cache.subscribe(&key);
    cache.set(&key, unread(1));
    assert_eq!(sub.try_recv(), Some(CacheEvent::Updated(unread(1))));

    let ticket = cache.begin_fetch_for_test(&key);
    cache.clear();
    assert!(cache.is_empty());
    assert_eq!(sub.try_recv(), Some(CacheEvent::Cleared));

    // In-flight result from before the clear is not written back
    cache.complete_fetch(ticket, Ok(unread(9)));
    assert_eq!(cache.get(&key), None);
  }

  #[tokio::test(start_paused = true)]
  async fn test_entry_goes_stale_with_age() {
    let cache = QueryCache::new(Duration::from_secs(30));
    let key = QueryKey::UnreadAggregate;
    cache.set(&key, unread(1));
    assert!(!cache.info(&key).unwrap().is_stale);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert!(cache.info(&key).unwrap().is_stale);
  }
}
