//! The seam between the sync engines and the service that owns the data.
//!
//! Engines only ever talk to a [`RemoteClient`]. `HttpRemote` speaks to the
//! real REST API, `MemoryRemote` keeps everything in process for tests and
//! offline fixtures.

mod api_types;
mod http;
mod memory;

use async_trait::async_trait;

use crate::error::RemoteError;
use crate::model::{
  NotificationFilters, NotificationRecord, Pagination, RemotePage, TransactionFilters,
  TransactionRecord, UnreadAggregate,
};

pub use http::HttpRemote;
pub use memory::{MemoryRemote, Operation, RemoteCall};

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Operations the authoritative store must expose.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  async fn list_notifications(
    &self,
    filters: &NotificationFilters,
    pagination: Pagination,
  ) -> RemoteResult<RemotePage<NotificationRecord>>;

  async fn unread_aggregate(&self) -> RemoteResult<UnreadAggregate>;

  async fn mark_notification_read(&self, id: &str) -> RemoteResult<()>;

  async fn mark_all_notifications_read(&self) -> RemoteResult<()>;

  async fn delete_notification(&self, id: &str) -> RemoteResult<()>;

  async fn list_transactions(
    &self,
    filters: &TransactionFilters,
    page: u32,
    limit: u32,
  ) -> RemoteResult<RemotePage<TransactionRecord>>;

  /// Direct lookup by id. Many backends do not offer it; the default reports
  /// the endpoint as not implemented.
  async fn transaction_by_id(&self, _id: &str) -> RemoteResult<TransactionRecord> {
    Err(RemoteError::not_implemented("transaction_by_id"))
  }
}
