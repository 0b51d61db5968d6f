//! In-process remote backed by plain vectors.
//!
//! Records every call it receives and can be told to fail, which makes it the
//! test double for both engines.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{RemoteClient, RemoteResult};
use crate::error::RemoteError;
use crate::model::{
  total_pages_for, NotificationFilters, NotificationRecord, Pagination, RemotePage,
  TransactionFilters, TransactionRecord, UnreadAggregate,
};

/// Operation names, used to count calls and to target injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
  ListNotifications,
  UnreadAggregate,
  MarkRead,
  MarkAllRead,
  Delete,
  ListTransactions,
  TransactionById,
}

/// One recorded call with its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
  ListNotifications { page: u32, limit: u32 },
  UnreadAggregate,
  MarkRead(String),
  MarkAllRead,
  Delete(String),
  ListTransactions { page: u32, limit: u32 },
  TransactionById(String),
}

impl RemoteCall {
  pub fn operation(&self) -> Operation {
    match self {
      Self::ListNotifications { .. } => Operation::ListNotifications,
      Self::UnreadAggregate => Operation::UnreadAggregate,
      Self::MarkRead(_) => Operation::MarkRead,
      Self::MarkAllRead => Operation::MarkAllRead,
      Self::Delete(_) => Operation::Delete,
      Self::ListTransactions { .. } => Operation::ListTransactions,
      Self::TransactionById(_) => Operation::TransactionById,
    }
  }
}

#[derive(Default)]
struct State {
  notifications: Vec<NotificationRecord>,
  transactions: Vec<TransactionRecord>,
  calls: Vec<RemoteCall>,
  failures: HashMap<Operation, VecDeque<RemoteError>>,
  offline: bool,
}

/// Remote that keeps the authoritative data in memory.
#[derive(Default)]
pub struct MemoryRemote {
  state: Mutex<State>,
  direct_lookup: bool,
}

impl MemoryRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_notifications(self, notifications: Vec<NotificationRecord>) -> Self {
    self.state().notifications = notifications;
    self
  }

  pub fn with_transactions(self, transactions: Vec<TransactionRecord>) -> Self {
    self.state().transactions = transactions;
    self
  }

  /// Serve `transaction_by_id` instead of reporting it as not implemented.
  pub fn with_direct_lookup(mut self, enabled: bool) -> Self {
    self.direct_lookup = enabled;
    self
  }

  /// Make the next call of `operation` fail with `error`. Queued failures are
  /// consumed in order.
  pub fn fail_next(&self, operation: Operation, error: RemoteError) {
    self
      .state()
      .failures
      .entry(operation)
      .or_default()
      .push_back(error);
  }

  /// While offline every call fails with `ConnectivityLost`.
  pub fn set_offline(&self, offline: bool) {
    self.state().offline = offline;
  }

  /// Change the authoritative notifications behind the engine's back, the way
  /// another session on the same account would.
  pub fn update_notifications(&self, f: impl FnOnce(&mut Vec<NotificationRecord>)) {
    f(&mut self.state().notifications);
  }

  pub fn notifications(&self) -> Vec<NotificationRecord> {
    self.state().notifications.clone()
  }

  pub fn calls(&self) -> Vec<RemoteCall> {
    self.state().calls.clone()
  }

  pub fn call_count(&self, operation: Operation) -> usize {
    self
      .state()
      .calls
      .iter()
      .filter(|call| call.operation() == operation)
      .count()
  }

  fn state(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Record the call and return the failure it should produce, if any.
  fn begin(&self, call: RemoteCall) -> RemoteResult<MutexGuard<'_, State>> {
    let mut state = self.state();
    let operation = call.operation();
    state.calls.push(call);

    if state.offline {
      return Err(RemoteError::ConnectivityLost("memory remote is offline".into()));
    }
    if let Some(error) = state.failures.get_mut(&operation).and_then(VecDeque::pop_front) {
      return Err(error);
    }
    Ok(state)
  }
}

fn paginate<T: Clone>(records: &[T], page: u32, limit: u32) -> RemoteResult<RemotePage<T>> {
  if limit == 0 || page == 0 {
    return Err(RemoteError::ValidationError(
      "page and limit must be positive".into(),
    ));
  }
  let total = records.len() as u64;
  let start = (page as usize - 1).saturating_mul(limit as usize);
  let slice = records
    .iter()
    .skip(start)
    .take(limit as usize)
    .cloned()
    .collect();

  Ok(RemotePage {
    records: slice,
    page: Some(page),
    limit: Some(limit),
    total: Some(total),
    total_pages: Some(total_pages_for(total, limit)),
  })
}

#[async_trait]
impl RemoteClient for MemoryRemote {
  async fn list_notifications(
    &self,
    filters: &NotificationFilters,
    pagination: Pagination,
  ) -> RemoteResult<RemotePage<NotificationRecord>> {
    let state = self.begin(RemoteCall::ListNotifications {
      page: pagination.page,
      limit: pagination.limit,
    })?;
    let matching: Vec<NotificationRecord> = state
      .notifications
      .iter()
      .filter(|n| filters.matches(n))
      .cloned()
      .collect();
    paginate(&matching, pagination.page, pagination.limit)
  }

  async fn unread_aggregate(&self) -> RemoteResult<UnreadAggregate> {
    let state = self.begin(RemoteCall::UnreadAggregate)?;
    let count = state.notifications.iter().filter(|n| !n.read).count() as u64;
    Ok(UnreadAggregate::new(count))
  }

  async fn mark_notification_read(&self, id: &str) -> RemoteResult<()> {
    let mut state = self.begin(RemoteCall::MarkRead(id.to_string()))?;
    let record = state
      .notifications
      .iter_mut()
      .find(|n| n.id == id)
      .ok_or_else(|| RemoteError::NotFound(format!("notification {}", id)))?;
    if !record.read {
      record.read = true;
      record.read_at = Some(Utc::now());
    }
    Ok(())
  }

  async fn mark_all_notifications_read(&self) -> RemoteResult<()> {
    let mut state = self.begin(RemoteCall::MarkAllRead)?;
    let now = Utc::now();
    for record in state.notifications.iter_mut().filter(|n| !n.read) {
      record.read = true;
      record.read_at = Some(now);
    }
    Ok(())
  }

  async fn delete_notification(&self, id: &str) -> RemoteResult<()> {
    let mut state = self.begin(RemoteCall::Delete(id.to_string()))?;
    let before = state.notifications.len();
    state.notifications.retain(|n| n.id != id);
    if state.notifications.len() == before {
      return Err(RemoteError::NotFound(format!("notification {}", id)));
    }
    Ok(())
  }

  async fn list_transactions(
    &self,
    filters: &TransactionFilters,
    page: u32,
    limit: u32,
  ) -> RemoteResult<RemotePage<TransactionRecord>> {
    let state = self.begin(RemoteCall::ListTransactions { page, limit })?;
    let matching: Vec<TransactionRecord> = state
      .transactions
      .iter()
      .filter(|t| filters.matches(t))
      .cloned()
      .collect();
    paginate(&matching, page, limit)
  }

  async fn transaction_by_id(&self, id: &str) -> RemoteResult<TransactionRecord> {
    let state = self.begin(RemoteCall::TransactionById(id.to_string()))?;
    if !self.direct_lookup {
      return Err(RemoteError::not_implemented("transaction_by_id"));
    }
    state
      .transactions
      .iter()
      .find(|t| t.id == id)
      .cloned()
      .ok_or_else(|| RemoteError::NotFound(format!("transaction {}", id)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_injected_failure_is_consumed_once() {
    let remote = MemoryRemote::new();
    remote.fail_next(
      Operation::UnreadAggregate,
      RemoteError::ServerError {
        status: 503,
        message: "maintenance".into(),
      },
    );

    assert!(remote.unread_aggregate().await.is_err());
    assert_eq!(remote.unread_aggregate().await, Ok(UnreadAggregate::new(0)));
    assert_eq!(remote.call_count(Operation::UnreadAggregate), 2);
  }

  #[tokio::test]
  async fn test_offline_fails_every_call() {
    let remote = MemoryRemote::new();
    remote.set_offline(true);
    let err = remote.mark_all_notifications_read().await.unwrap_err();
    assert!(err.is_connectivity());
  }

  #[tokio::test]
  async fn test_zero_limit_is_rejected() {
    let remote = MemoryRemote::new();
    let err = remote
      .list_transactions(&TransactionFilters::default(), 1, 0)
      .await
      .unwrap_err();
    assert!(matches!(err, RemoteError::ValidationError(_)));
  }
}
