//! Typed query keys and their opaque cache hashes.

use sha2::{Digest, Sha256};
use std::fmt;

use crate::model::{NotificationFilters, Pagination, TransactionFilters};

/// Opaque, fixed-length identifier of one cached query
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Resource family a query belongs to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Family {
  Notifications,
  Transactions,
}

/// Every query the engines cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryKey {
  /// One page of notifications under a filter set
  NotificationList {
    filters: NotificationFilters,
    pagination: Pagination,
  },
  /// The unread badge count
  UnreadAggregate,
  /// One page of wallet transactions under a filter set
  TransactionPage {
    filters: TransactionFilters,
    page: u32,
    limit: u32,
  },
  /// A single transaction resolved by id
  Transaction { id: String },
}

impl QueryKey {
  pub fn family(&self) -> Family {
    match self {
      Self::NotificationList { .. } | Self::UnreadAggregate => Family::Notifications,
      Self::TransactionPage { .. } | Self::Transaction { .. } => Family::Transactions,
    }
  }

  pub fn is_notification_list(&self) -> bool {
    matches!(self, Self::NotificationList { .. })
  }

  /// SHA-256 over a normalized text form, so equal queries share an entry.
  pub fn cache_key(&self) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(self.normalized().as_bytes());
    CacheKey(hex::encode(hasher.finalize()))
  }

  fn normalized(&self) -> String {
    match self {
      Self::NotificationList {
        filters,
        pagination,
      } => format!(
        "notifications:{}:{}:read={}:kind={}",
        pagination.page,
        pagination.limit,
        opt(filters.read.map(|r| r.to_string())),
        opt(filters.kind.map(|k| k.as_str().to_string())),
      ),
      Self::UnreadAggregate => "notifications:unread".to_string(),
      Self::TransactionPage {
        filters,
        page,
        limit,
      } => {
        let (start, end) = filters
          .date_range
          .as_ref()
          .map(|r| {
            (
              r.start.map(|s| s.to_rfc3339()),
              r.end.map(|e| e.to_rfc3339()),
            )
          })
          .unwrap_or_default();
        format!(
          "transactions:{}:{}:dir={}:status={}:from={}:to={}:q={}",
          page,
          limit,
          opt(filters.direction.map(|d| d.as_str().to_string())),
          opt(filters.status.map(|s| s.as_str().to_string())),
          opt(start),
          opt(end),
          opt(
            filters
              .search_term
              .as_deref()
              .map(normalize_search)
              .filter(|s| !s.is_empty())
          ),
        )
      }
      Self::Transaction { id } => format!("transaction:{}", id),
    }
  }

  /// Human-readable form for logs
  pub fn description(&self) -> String {
    match self {
      Self::NotificationList { pagination, .. } => format!(
        "notifications page {} (limit {})",
        pagination.page, pagination.limit
      ),
      Self::UnreadAggregate => "unread count".to_string(),
      Self::TransactionPage { page, limit, .. } => {
        format!("transactions page {} (limit {})", page, limit)
      }
      Self::Transaction { id } => format!("transaction {}", id),
    }
  }
}

fn opt(value: Option<String>) -> String {
  value.unwrap_or_else(|| "*".to_string())
}

/// Trim and lowercase so "Refund " and "refund" hit the same entry.
fn normalize_search(term: &str) -> String {
  term.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Direction, NotificationKind};

  #[test]
  fn test_equal_queries_share_a_key() {
    let a = QueryKey::NotificationList {
      filters: NotificationFilters::default(),
      pagination: Pagination::default(),
    };
    assert_eq!(a.cache_key(), a.clone().cache_key());
    assert_eq!(a.cache_key().as_str().len(), 64);
  }

  #[test]
  fn test_filters_change_the_key() {
    let all = QueryKey::NotificationList {
      filters: NotificationFilters::default(),
      pagination: Pagination::default(),
    };
    let orders = QueryKey::NotificationList {
      filters: NotificationFilters {
        kind: Some(NotificationKind::Order),
        ..Default::default()
      },
      pagination: Pagination::default(),
    };
    assert_ne!(all.cache_key(), orders.cache_key());
  }

  #[test]
  fn test_search_term_is_normalized() {
    let key = |term: &str| QueryKey::TransactionPage {
      filters: TransactionFilters {
        direction: Some(Direction::Credit),
        search_term: Some(term.to_string()),
        ..Default::default()
      },
      page: 1,
      limit: 20,
    };
    assert_eq!(key("Refund ").cache_key(), key("refund").cache_key());
    assert_eq!(key("  ").cache_key(), {
      QueryKey::TransactionPage {
        filters: TransactionFilters {
          direction: Some(Direction::Credit),
          ..Default::default()
        },
        page: 1,
        limit: 20,
      }
      .cache_key()
    });
  }

  #[test]
  fn test_family() {
    assert_eq!(QueryKey::UnreadAggregate.family(), Family::Notifications);
    assert_eq!(
      QueryKey::Transaction { id: "t".into() }.family(),
      Family::Transactions
    );
  }
}
