//! One signed-in session: the query cache and both engines that share it.

use std::sync::Arc;

use crate::cache::QueryCache;
use crate::config::Config;
use crate::notifications::NotificationSync;
use crate::remote::RemoteClient;
use crate::transactions::TransactionEngine;

/// Owns the cache for the lifetime of a login. Engines are cheap handles onto
/// it; `teardown` drops every cached entry.
pub struct Session {
  cache: QueryCache,
  notifications: NotificationSync,
  transactions: TransactionEngine,
}

impl Session {
  pub fn new(config: &Config, remote: Arc<dyn RemoteClient>) -> Self {
    let cache = QueryCache::new(config.sync.stale_after());
    let notifications = NotificationSync::new(
      remote.clone(),
      cache.clone(),
      config.sync.unread_refresh_interval(),
    );
    let transactions = TransactionEngine::new(remote, cache.clone(), &config.transactions);

    Self {
      cache,
      notifications,
      transactions,
    }
  }

  pub fn notifications(&self) -> &NotificationSync {
    &self.notifications
  }

  pub fn transactions(&self) -> &TransactionEngine {
    &self.transactions
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  /// Logout: forget everything cached. Fetches still in flight are discarded
  /// when they land.
  pub fn teardown(&self) {
    self.cache.clear();
  }
}

impl Drop for Session {
  fn drop(&mut self) {
    self.teardown();
  }
}
