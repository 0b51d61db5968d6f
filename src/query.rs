//! Consumer-facing handles for reads and mutations.
//!
//! Inspired by TanStack Query: a `Query<T>` encapsulates async data fetching,
//! loading states and error handling, and can be bound to a cache key so it
//! follows every change to that entry. A `Mutation<A>` does the same for a
//! write entry point.
//!
//! # Example
//!
//! ```ignore
//! let mut unread = session.notifications().unread_query();
//! unread.fetch();
//!
//! // In event loop tick
//! if unread.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! match unread.data() {
//!     Some(count) => render_badge(count),
//!     None if unread.is_loading() => render_spinner(),
//!     None => {}
//! }
//! ```
//!
//! Dropping a handle drops its channels and its cache subscription, so results
//! that arrive afterwards go nowhere.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::cache::{CacheEvent, CachedValue, Subscription};
use crate::error::SyncError;

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(SyncError),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&SyncError> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// A boxed future that returns a Result<T, SyncError>
type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send>>;

/// A factory function that creates futures for fetching data
type FetcherFn<T> = Box<dyn Fn() -> BoxFuture<T> + Send + Sync>;

/// Cache subscription plus the decoder for this query's value type
struct Binding<T> {
  subscription: Subscription,
  decode: fn(&CachedValue) -> Option<T>,
}

/// Async query for data fetching with state management.
///
/// Query<T> encapsulates:
/// - The fetching logic (via a closure)
/// - Loading/success/error states
/// - Async result handling via channels
/// - The last good data, kept while refetching or after an error
/// - Optionally, a cache subscription that feeds updates in as they happen
pub struct Query<T> {
  state: QueryState<T>,
  last_data: Option<T>,
  fetcher: FetcherFn<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, SyncError>>>,
  binding: Option<Binding<T>>,
  /// A cache update arrived after the current fetch started
  updated_since_fetch: bool,
  invalidated: bool,
  fetched_at: Option<Instant>,
  stale_time: Duration,
}

impl<T: Clone + Send + 'static> Query<T> {
  /// Create a new query with the given fetcher function.
  ///
  /// The fetcher is a closure that returns a future. It will be called
  /// each time `fetch()` or `refetch()` is invoked.
  pub fn new<F, Fut>(fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
  {
    Self {
      state: QueryState::Idle,
      last_data: None,
      fetcher: Box::new(move || Box::pin(fetcher())),
      receiver: None,
      binding: None,
      updated_since_fetch: false,
      invalidated: false,
      fetched_at: None,
      stale_time: Duration::from_secs(60), // Default 1 minute
    }
  }

  /// Follow a cache entry: every update to it becomes this query's data.
  pub fn bind(mut self, subscription: Subscription, decode: fn(&CachedValue) -> Option<T>) -> Self {
    self.binding = Some(Binding {
      subscription,
      decode,
    });
    self
  }

  /// Set the stale time for this query.
  ///
  /// After this duration, the data is considered stale and `is_stale()` returns true.
  pub fn with_stale_time(mut self, duration: Duration) -> Self {
    self.stale_time = duration;
    self
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  /// Latest data: the current success value, or the last one seen while a
  /// refetch is running or after it failed.
  pub fn data(&self) -> Option<&T> {
    self.state.data().or(self.last_data.as_ref())
  }

  /// Loading with nothing to show yet.
  pub fn is_loading(&self) -> bool {
    self.state.is_loading() && self.last_data.is_none()
  }

  /// Any fetch in flight, including background refreshes.
  pub fn is_fetching(&self) -> bool {
    self.state.is_loading()
  }

  /// Check if the query succeeded.
  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  /// Check if the query failed.
  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  /// Get the error if the query failed.
  pub fn error(&self) -> Option<&SyncError> {
    self.state.error()
  }

  /// Check if the data is stale (invalidated, or older than stale_time).
  pub fn is_stale(&self) -> bool {
    if self.data().is_none() {
      return false;
    }
    self.invalidated
      || self
        .fetched_at
        .map(|t| t.elapsed() > self.stale_time)
        .unwrap_or(true)
  }

  /// Start fetching data if not already loading.
  ///
  /// This is a no-op if the query is already loading.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, even if already loading or data exists.
  pub fn refetch(&mut self) {
    // Cancel any pending fetch by dropping the receiver
    self.receiver = None;
    self.start_fetch();
  }

  /// Poll for results from a pending fetch and for cache updates.
  ///
  /// Returns `true` if the state changed.
  /// Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = self.poll_fetch();
    changed |= self.poll_cache();
    changed
  }

  fn poll_fetch(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    // Try to receive without blocking
    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.receiver = None;
        if self.updated_since_fetch {
          // The cache already delivered something newer
          if let Some(current) = self.last_data.clone() {
            self.state = QueryState::Success(current);
            return true;
          }
        }
        self.succeed(data);
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error);
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        // Sender dropped without sending - treat as error
        self.state = QueryState::Error(SyncError::Internal("Query was cancelled".to_string()));
        self.receiver = None;
        true
      }
    }
  }

  fn poll_cache(&mut self) -> bool {
    let mut events = Vec::new();
    let decode = match &mut self.binding {
      Some(binding) => {
        while let Some(event) = binding.subscription.try_recv() {
          events.push(event);
        }
        binding.decode
      }
      None => return false,
    };

    let changed = !events.is_empty();
    for event in events {
      match event {
        CacheEvent::Updated(value) => {
          if let Some(data) = decode(&value) {
            self.updated_since_fetch = true;
            if self.state.is_loading() {
              // Keep showing the fetch as running; expose the data meanwhile
              self.last_data = Some(data);
              self.fetched_at = Some(Instant::now());
              self.invalidated = false;
            } else {
              self.succeed(data);
            }
          }
        }
        CacheEvent::Invalidated => self.invalidated = true,
        CacheEvent::FetchFailed(error) => {
          if !self.state.is_loading() {
            self.state = QueryState::Error(error.into());
          }
        }
        CacheEvent::Cleared => {
          self.state = QueryState::Idle;
          self.last_data = None;
          self.fetched_at = None;
          self.receiver = None;
        }
      }
    }
    changed
  }

  fn succeed(&mut self, data: T) {
    self.last_data = Some(data.clone());
    self.state = QueryState::Success(data);
    self.fetched_at = Some(Instant::now());
    self.invalidated = false;
  }

  /// Internal: start the fetch operation
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    if let QueryState::Success(data) = &self.state {
      self.last_data = Some(data.clone());
    }
    self.state = QueryState::Loading;
    self.updated_since_fetch = false;

    let future = (self.fetcher)();
    tokio::spawn(async move {
      let result = future.await;
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(result);
    });
  }
}

// Query is not Clone because the fetcher is boxed and receiver is owned.
// If you need to share a query, wrap it in Arc<Mutex<Query<T>>>.

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("state", &self.state)
      .field("last_data", &self.last_data)
      .field("fetched_at", &self.fetched_at)
      .field("stale_time", &self.stale_time)
      .finish_non_exhaustive()
  }
}

// ============================================================================
// Mutations
// ============================================================================

/// The state of a mutation
#[derive(Debug, Clone, PartialEq)]
pub enum MutationState {
  Idle,
  Pending,
  Success,
  Error(SyncError),
}

type RunFn<A> = Box<dyn Fn(A) -> BoxFuture<()> + Send + Sync>;

/// Pending/error tracking for one mutation entry point.
///
/// The optimistic part of the mutation happens synchronously inside
/// `mutate()`, before it returns, so any bound query shows the change on its
/// next poll even while this handle is still pending.
pub struct Mutation<A> {
  state: MutationState,
  run: RunFn<A>,
  receiver: Option<mpsc::UnboundedReceiver<Result<(), SyncError>>>,
}

impl<A: Send + 'static> Mutation<A> {
  pub fn new<F, Fut>(run: F) -> Self
  where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
  {
    Self {
      state: MutationState::Idle,
      run: Box::new(move |arg| Box::pin(run(arg))),
      receiver: None,
    }
  }

  pub fn state(&self) -> &MutationState {
    &self.state
  }

  pub fn is_pending(&self) -> bool {
    self.state == MutationState::Pending
  }

  pub fn error(&self) -> Option<&SyncError> {
    match &self.state {
      MutationState::Error(e) => Some(e),
      _ => None,
    }
  }

  /// Run the mutation. A previous, still pending run is no longer tracked.
  pub fn mutate(&mut self, arg: A) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = MutationState::Pending;

    let future = (self.run)(arg);
    tokio::spawn(async move {
      let result = future.await;
      let _ = tx.send(result);
    });
  }

  /// Poll for completion. Returns `true` if the state changed.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return false,
    };

    match receiver.try_recv() {
      Ok(result) => {
        self.state = match result {
          Ok(()) => MutationState::Success,
          Err(e) => MutationState::Error(e),
        };
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = MutationState::Error(SyncError::Internal(
          "Mutation was cancelled".to_string(),
        ));
        self.receiver = None;
        true
      }
    }
  }

  /// Clear a finished state back to idle.
  pub fn reset(&mut self) {
    self.state = MutationState::Idle;
    self.receiver = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{fetcher, Cacheable, QueryCache, QueryKey};
  use crate::error::RemoteError;
  use crate::model::UnreadAggregate;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  fn unread(count: u64) -> UnreadAggregate {
    UnreadAggregate::new(count)
  }

  fn offline() -> SyncError {
    SyncError::Remote(RemoteError::ConnectivityLost("offline".to_string()))
  }

  fn bound_unread_query<F, Fut>(cache: &QueryCache, fetch: F) -> Query<UnreadAggregate>
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<UnreadAggregate, SyncError>> + Send + 'static,
  {
    Query::new(fetch).bind(
      cache.subscribe(&QueryKey::UnreadAggregate),
      <UnreadAggregate as Cacheable>::from_cached,
    )
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_last_count() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = Query::new({
      let calls = calls.clone();
      move || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          if call == 0 {
            Ok(unread(2))
          } else {
            Err(offline())
          }
        }
      }
    });

    query.fetch();
    assert!(query.is_loading());
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(query.poll());
    assert_eq!(query.data(), Some(&unread(2)));

    query.refetch();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(query.poll());
    assert!(query.is_error());
    assert!(query.error().is_some_and(SyncError::is_connectivity));
    assert!(!query.is_loading());
    assert_eq!(query.data(), Some(&unread(2)));
  }

  #[tokio::test]
  async fn test_own_fetch_older_than_cache_update_is_dropped() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let mut query = bound_unread_query(&cache, || async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok(unread(1))
    });

    query.fetch();
    cache.set(&QueryKey::UnreadAggregate, CachedValue::Unread(unread(5)));
    assert!(query.poll());
    assert!(query.is_fetching());
    assert_eq!(query.data(), Some(&unread(5)));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(query.poll());
    assert!(query.is_success());
    assert_eq!(query.data(), Some(&unread(5)));
  }

  #[tokio::test]
  async fn test_cache_fetch_failure_surfaces_with_data_kept() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    let mut query = bound_unread_query(&cache, || async { Ok(unread(0)) });

    cache.set(&key, CachedValue::Unread(unread(3)));
    assert!(query.poll());

    let failing = fetcher(|| async { Err(RemoteError::ConnectivityLost("offline".into())) });
    assert!(cache.refetch(&key, failing).await.is_err());

    assert!(query.poll());
    assert!(query.is_error());
    assert!(query.error().is_some_and(SyncError::is_connectivity));
    assert_eq!(query.data(), Some(&unread(3)));
  }

  #[tokio::test]
  async fn test_refetch_ignores_slower_earlier_fetch() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = Query::new({
      let calls = calls.clone();
      move || {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        async move {
          // The first request is the slow one
          let delay = if call == 0 { 80 } else { 10 };
          tokio::time::sleep(Duration::from_millis(delay)).await;
          Ok::<_, SyncError>(unread(u64::from(call) + 1))
        }
      }
    });

    query.fetch();
    query.refetch();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(query.poll());
    assert_eq!(query.data(), Some(&unread(2)));

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(!query.poll());
    assert_eq!(query.data(), Some(&unread(2)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_fetch_while_loading_starts_nothing() {
    let calls = Arc::new(AtomicU32::new(0));
    let mut query = Query::new({
      let calls = calls.clone();
      move || {
        calls.fetch_add(1, Ordering::SeqCst);
        async {
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok::<_, SyncError>(unread(1))
        }
      }
    });

    query.fetch();
    query.fetch();
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(query.poll());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!query.is_stale());
  }

  #[tokio::test]
  async fn test_refetch_keeps_previous_data_visible() {
    let mut query = Query::new(|| async {
      tokio::time::sleep(Duration::from_millis(50)).await;
      Ok::<_, SyncError>(7)
    });

    query.fetch();
    tokio::time::sleep(Duration::from_millis(80)).await;
    query.poll();

    query.refetch();
    assert!(query.is_fetching());
    assert!(!query.is_loading());
    assert_eq!(query.data(), Some(&7));
  }

  #[tokio::test]
  async fn test_bound_query_follows_cache_updates() {
    let cache = QueryCache::new(Duration::from_secs(60));
    let key = QueryKey::UnreadAggregate;
    let mut query = Query::new(|| async { Ok::<_, SyncError>(UnreadAggregate::new(0)) })
      .bind(cache.subscribe(&key), <UnreadAggregate as Cacheable>::from_cached);

    cache.set(&key, CachedValue::Unread(UnreadAggregate::new(3)));
    assert!(query.poll());
    assert_eq!(query.data(), Some(&UnreadAggregate::new(3)));

    cache.invalidate(&key);
    assert!(query.poll());
    assert!(query.is_stale());

    cache.clear();
    assert!(query.poll());
    assert!(query.data().is_none());
  }

  #[tokio::test]
  async fn test_mutation_reports_pending_then_error() {
    let mut mutation = Mutation::new(|id: String| async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      Err(SyncError::Remote(RemoteError::NotFound(id)))
    });

    assert_eq!(mutation.state(), &MutationState::Idle);
    mutation.mutate("n1".to_string());
    assert!(mutation.is_pending());
    assert!(!mutation.poll());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mutation.poll());
    assert!(matches!(
      mutation.error(),
      Some(SyncError::Remote(RemoteError::NotFound(id))) if id == "n1"
    ));

    mutation.reset();
    assert_eq!(mutation.state(), &MutationState::Idle);
  }
}
