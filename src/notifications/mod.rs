//! Notification sync engine.
//!
//! Reads go through the query cache with stale-while-revalidate. Every
//! mutation runs the same four steps:
//!
//! 1. apply the change to every cached list and the unread count in one step
//! 2. call the remote
//! 3. on success, invalidate the notification entries so observers refetch
//! 4. on failure, invalidate and refetch them unconditionally
//!
//! Failed mutations are not rolled back by computing an inverse. The server
//! state is refetched instead and replaces the optimistic guess.

mod optimistic;
mod watcher;

pub use optimistic::{apply_optimistic_change, NotificationChange, NotificationSnapshot};
pub use watcher::UnreadWatcher;

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{fetcher, Cacheable, CachedValue, Family, Fetcher, QueryCache, QueryKey};
use crate::error::{SyncError, SyncResult};
use crate::model::{NotificationFilters, NotificationRecord, PageResult, Pagination, UnreadAggregate};
use crate::query::{Mutation, Query};
use crate::remote::{RemoteClient, RemoteResult};

type NotificationPage = PageResult<NotificationRecord>;

/// Keeps cached notification lists and the unread count in step with the
/// remote store.
#[derive(Clone)]
pub struct NotificationSync {
  remote: Arc<dyn RemoteClient>,
  cache: QueryCache,
  unread_refresh: Duration,
}

impl NotificationSync {
  pub fn new(remote: Arc<dyn RemoteClient>, cache: QueryCache, unread_refresh: Duration) -> Self {
    Self {
      remote,
      cache,
      unread_refresh,
    }
  }

  // ==========================================================================
  // Reads
  // ==========================================================================

  /// One page of notifications. Connectivity loss degrades to the last cached
  /// page, or an empty one.
  pub async fn fetch_list(
    &self,
    filters: &NotificationFilters,
    pagination: Pagination,
  ) -> SyncResult<NotificationPage> {
    if pagination.page == 0 || pagination.limit == 0 {
      return Err(SyncError::InvalidRequest(
        "page and limit must be at least 1".to_string(),
      ));
    }

    let key = list_key(filters, pagination);
    match self
      .cache
      .fetch(&key, self.list_fetcher(filters.clone(), pagination))
      .await
    {
      Ok(result) => result.data.decode(),
      Err(err) if err.is_connectivity() => {
        warn!(query = %key.description(), error = %err, "notification list unavailable; serving fallback");
        Ok(
          self
            .cache
            .get_as(&key)
            .unwrap_or_else(|| PageResult::empty(pagination.page, pagination.limit)),
        )
      }
      Err(err) => Err(err.into()),
    }
  }

  /// The unread count. Never fails on connectivity loss: the cached count is
  /// served if there is one, zero otherwise. The fallback is not cached.
  pub async fn fetch_unread_aggregate(&self) -> SyncResult<UnreadAggregate> {
    let result = self
      .cache
      .fetch(&QueryKey::UnreadAggregate, self.unread_fetcher())
      .await;
    self.unread_or_default(result.map(|r| r.data))
  }

  /// Fetch the unread count from the network even if the cached one is fresh.
  pub async fn refresh_unread(&self) -> SyncResult<UnreadAggregate> {
    let result = self
      .cache
      .refetch(&QueryKey::UnreadAggregate, self.unread_fetcher())
      .await;
    self.unread_or_default(result.map(|r| r.data))
  }

  fn unread_or_default(&self, result: RemoteResult<CachedValue>) -> SyncResult<UnreadAggregate> {
    match result {
      Ok(value) => value.decode(),
      Err(err) if err.is_connectivity() => {
        warn!(error = %err, "unread count unavailable; serving fallback");
        Ok(self.cached_unread().unwrap_or_default())
      }
      Err(err) => Err(err.into()),
    }
  }

  pub fn cached_list(
    &self,
    filters: &NotificationFilters,
    pagination: Pagination,
  ) -> Option<NotificationPage> {
    self.cache.get_as(&list_key(filters, pagination))
  }

  pub fn cached_unread(&self) -> Option<UnreadAggregate> {
    self.cache.get_as(&QueryKey::UnreadAggregate)
  }

  fn list_fetcher(&self, filters: NotificationFilters, pagination: Pagination) -> Fetcher {
    let remote = self.remote.clone();
    fetcher(move || {
      let remote = remote.clone();
      let filters = filters.clone();
      async move {
        remote
          .list_notifications(&filters, pagination)
          .await
          .map(|page| page.normalize(pagination).into_cached())
      }
    })
  }

  fn unread_fetcher(&self) -> Fetcher {
    let remote = self.remote.clone();
    fetcher(move || {
      let remote = remote.clone();
      async move { remote.unread_aggregate().await.map(UnreadAggregate::into_cached) }
    })
  }

  // ==========================================================================
  // Mutations
  // ==========================================================================

  pub async fn mark_read(&self, id: &str) -> SyncResult<()> {
    self
      .run(NotificationChange::MarkRead { id: id.to_string() })
      .await
  }

  pub async fn mark_all_read(&self) -> SyncResult<()> {
    self.run(NotificationChange::MarkAllRead).await
  }

  pub async fn delete(&self, id: &str) -> SyncResult<()> {
    self
      .run(NotificationChange::Delete { id: id.to_string() })
      .await
  }

  async fn run(&self, change: NotificationChange) -> SyncResult<()> {
    self.apply_locally(&change);
    self.confirm(change).await
  }

  /// Step 1: write the optimistic result to every affected entry at once.
  fn apply_locally(&self, change: &NotificationChange) {
    let now = Utc::now();
    self.cache.mutate(|writer| {
      let lists: Vec<(QueryKey, NotificationPage)> = writer
        .queries(QueryKey::is_notification_list)
        .into_iter()
        .filter_map(|key| {
          let page = writer.get(&key).and_then(NotificationPage::from_cached)?;
          Some((key, page))
        })
        .collect();
      let (keys, pages): (Vec<QueryKey>, Vec<NotificationPage>) = lists.into_iter().unzip();

      let before = NotificationSnapshot {
        lists: pages,
        unread: writer
          .get(&QueryKey::UnreadAggregate)
          .and_then(UnreadAggregate::from_cached),
      };
      let after = apply_optimistic_change(&before, change, now);

      for ((key, old), new) in keys.iter().zip(&before.lists).zip(after.lists) {
        if *old != new {
          writer.put(key, new.into_cached());
        }
      }
      if after.unread != before.unread {
        if let Some(unread) = after.unread {
          writer.put(&QueryKey::UnreadAggregate, unread.into_cached());
        }
      }
      debug!(
        change = change.label(),
        lists = keys.len(),
        unread = ?after.unread.map(|u| u.count),
        "applied optimistic change"
      );
    });
  }

  /// Steps 2 to 4: remote call, then reconciliation either way.
  async fn confirm(&self, change: NotificationChange) -> SyncResult<()> {
    let result = match &change {
      NotificationChange::MarkRead { id } => self.remote.mark_notification_read(id).await,
      NotificationChange::MarkAllRead => self.remote.mark_all_notifications_read().await,
      NotificationChange::Delete { id } => self.remote.delete_notification(id).await,
    };

    let is_notification = |query: &QueryKey| query.family() == Family::Notifications;
    match result {
      Ok(()) => {
        info!(change = change.label(), "notification change confirmed");
        self.cache.invalidate_where(is_notification);
        Ok(())
      }
      Err(err) => {
        warn!(
          change = change.label(),
          kind = err.kind(),
          error = %err,
          "notification change failed; refetching server state"
        );
        self.cache.reset_where(is_notification);
        Err(err.into())
      }
    }
  }

  // ==========================================================================
  // Consumer handles
  // ==========================================================================

  /// Observable page of notifications, kept current by cache updates.
  pub fn list_query(
    &self,
    filters: NotificationFilters,
    pagination: Pagination,
  ) -> Query<NotificationPage> {
    let key = list_key(&filters, pagination);
    let sync = self.clone();
    Query::new(move || {
      let sync = sync.clone();
      let filters = filters.clone();
      async move { sync.fetch_list(&filters, pagination).await }
    })
    .bind(self.cache.subscribe(&key), NotificationPage::from_cached)
    .with_stale_time(self.cache.stale_after())
  }

  /// Observable unread count, kept current by cache updates.
  pub fn unread_query(&self) -> Query<UnreadAggregate> {
    let sync = self.clone();
    Query::new(move || {
      let sync = sync.clone();
      async move { sync.fetch_unread_aggregate().await }
    })
    .bind(
      self.cache.subscribe(&QueryKey::UnreadAggregate),
      UnreadAggregate::from_cached,
    )
    .with_stale_time(self.cache.stale_after())
  }

  /// Keep the unread count refreshed while it is on screen.
  pub fn watch_unread(&self) -> UnreadWatcher {
    UnreadWatcher::start(self.clone(), self.unread_refresh)
  }

  pub fn mark_read_mutation(&self) -> Mutation<String> {
    self.mutation(|id| NotificationChange::MarkRead { id })
  }

  pub fn mark_all_read_mutation(&self) -> Mutation<()> {
    self.mutation(|()| NotificationChange::MarkAllRead)
  }

  pub fn delete_mutation(&self) -> Mutation<String> {
    self.mutation(|id| NotificationChange::Delete { id })
  }

  /// The optimistic step runs inside `Mutation::mutate` itself; only the
  /// remote call and reconciliation are left to the spawned task.
  fn mutation<A: Send + 'static>(
    &self,
    to_change: fn(A) -> NotificationChange,
  ) -> Mutation<A> {
    let sync = self.clone();
    Mutation::new(move |arg: A| {
      let change = to_change(arg);
      sync.apply_locally(&change);
      let sync = sync.clone();
      async move { sync.confirm(change).await }
    })
  }
}

fn list_key(filters: &NotificationFilters, pagination: Pagination) -> QueryKey {
  QueryKey::NotificationList {
    filters: filters.clone(),
    pagination,
  }
}
