//! Domain records, filters and page shapes shared by both engines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

// ============================================================================
// Notifications
// ============================================================================

/// Category of a seller notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
  Order,
  Delivery,
  #[serde(alias = "finance")]
  Payout,
  Support,
  Product,
  #[serde(other)]
  Other,
}

impl NotificationKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Order => "order",
      Self::Delivery => "delivery",
      Self::Payout => "payout",
      Self::Support => "support",
      Self::Product => "product",
      Self::Other => "other",
    }
  }
}

impl FromStr for NotificationKind {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "order" => Ok(Self::Order),
      "delivery" => Ok(Self::Delivery),
      "payout" | "finance" => Ok(Self::Payout),
      "support" => Ok(Self::Support),
      "product" => Ok(Self::Product),
      "other" => Ok(Self::Other),
      other => Err(format!("unknown notification kind: {}", other)),
    }
  }
}

/// Where the dashboard should navigate when a notification is opened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionTarget {
  #[serde(rename = "type")]
  pub target_type: String,
  pub target_id: Option<String>,
  pub url: Option<String>,
}

/// A single notification as cached locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: NotificationKind,
  pub title: String,
  #[serde(default)]
  pub message: String,
  #[serde(default)]
  pub read: bool,
  pub read_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub action_target: Option<ActionTarget>,
  #[serde(default)]
  pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Number of unread notifications. Unsigned so it can never go negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadAggregate {
  pub count: u64,
}

impl UnreadAggregate {
  pub fn new(count: u64) -> Self {
    Self { count }
  }
}

/// Optional, additive notification list filters
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NotificationFilters {
  pub read: Option<bool>,
  pub kind: Option<NotificationKind>,
}

impl NotificationFilters {
  pub fn matches(&self, record: &NotificationRecord) -> bool {
    self.read.map_or(true, |read| record.read == read)
      && self.kind.map_or(true, |kind| record.kind == kind)
  }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  Credit,
  Debit,
}

impl Direction {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Credit => "credit",
      Self::Debit => "debit",
    }
  }
}

impl FromStr for Direction {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "credit" | "in" => Ok(Self::Credit),
      "debit" | "out" => Ok(Self::Debit),
      other => Err(format!("unknown direction: {}", other)),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
  Pending,
  Completed,
  Failed,
  Cancelled,
}

impl TransactionStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    }
  }
}

impl FromStr for TransactionStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "pending" => Ok(Self::Pending),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      "cancelled" | "canceled" => Ok(Self::Cancelled),
      other => Err(format!("unknown transaction status: {}", other)),
    }
  }
}

/// Identifiers of the business objects a transaction settles
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionReferences {
  pub order_id: Option<String>,
  pub withdrawal_id: Option<String>,
}

/// A wallet transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
  pub id: String,
  pub amount: f64,
  #[serde(rename = "type")]
  pub direction: Option<Direction>,
  pub status: TransactionStatus,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub references: TransactionReferences,
}

impl TransactionRecord {
  /// Explicit direction, or the one implied by the sign of the amount
  pub fn effective_direction(&self) -> Direction {
    match self.direction {
      Some(direction) => direction,
      None if self.amount < 0.0 => Direction::Debit,
      None => Direction::Credit,
    }
  }
}

/// Inclusive creation-time window; either bound may be open
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DateRange {
  pub start: Option<DateTime<Utc>>,
  pub end: Option<DateTime<Utc>>,
}

impl DateRange {
  pub fn contains(&self, at: DateTime<Utc>) -> bool {
    self.start.map_or(true, |start| at >= start) && self.end.map_or(true, |end| at <= end)
  }
}

/// Transaction list filters, combined with AND semantics
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TransactionFilters {
  pub direction: Option<Direction>,
  pub status: Option<TransactionStatus>,
  pub date_range: Option<DateRange>,
  pub search_term: Option<String>,
}

impl TransactionFilters {
  /// Reference predicate for these filters. Search is case-insensitive over
  /// id, description and references.
  pub fn matches(&self, record: &TransactionRecord) -> bool {
    if let Some(direction) = self.direction {
      if record.effective_direction() != direction {
        return false;
      }
    }
    if let Some(status) = self.status {
      if record.status != status {
        return false;
      }
    }
    if let Some(range) = &self.date_range {
      if !range.contains(record.created_at) {
        return false;
      }
    }
    match self.search_term.as_deref().map(str::trim) {
      Some(term) if !term.is_empty() => {
        let term = term.to_lowercase();
        let refs = &record.references;
        record.id.to_lowercase().contains(&term)
          || record.description.to_lowercase().contains(&term)
          || refs
            .order_id
            .as_deref()
            .is_some_and(|id| id.to_lowercase().contains(&term))
          || refs
            .withdrawal_id
            .as_deref()
            .is_some_and(|id| id.to_lowercase().contains(&term))
      }
      _ => true,
    }
  }
}

// ============================================================================
// Pagination
// ============================================================================

/// 1-based page request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Pagination {
  pub page: u32,
  pub limit: u32,
}

impl Default for Pagination {
  fn default() -> Self {
    Self { page: 1, limit: 20 }
  }
}

/// A normalized page of records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult<T> {
  pub records: Vec<T>,
  pub page: u32,
  pub limit: u32,
  pub total: u64,
  pub total_pages: u32,
}

impl<T> PageResult<T> {
  /// Empty page used when a read degrades
  pub fn empty(page: u32, limit: u32) -> Self {
    Self {
      records: Vec::new(),
      page,
      limit,
      total: 0,
      total_pages: 0,
    }
  }
}

/// A page as returned by the remote, before normalization
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePage<T> {
  pub records: Vec<T>,
  pub page: Option<u32>,
  pub limit: Option<u32>,
  pub total: Option<u64>,
  pub total_pages: Option<u32>,
}

impl<T> RemotePage<T> {
  /// A page with no pagination metadata
  pub fn bare(records: Vec<T>) -> Self {
    Self {
      records,
      page: None,
      limit: None,
      total: None,
      total_pages: None,
    }
  }

  /// Fill in missing metadata from the request. `total_pages` falls back to
  /// `ceil(total / limit)`, and pages past the end never carry records.
  pub fn normalize(self, requested: Pagination) -> PageResult<T> {
    let page = self.page.unwrap_or(requested.page);
    let limit = self.limit.filter(|l| *l > 0).unwrap_or(requested.limit);
    let total = self.total.unwrap_or_else(|| {
      u64::from(page.saturating_sub(1)) * u64::from(limit) + self.records.len() as u64
    });
    let total_pages = self
      .total_pages
      .unwrap_or_else(|| total_pages_for(total, limit));

    let records = if page > total_pages {
      Vec::new()
    } else {
      self.records
    };

    PageResult {
      records,
      page,
      limit,
      total,
      total_pages,
    }
  }
}

/// `ceil(total / limit)`, zero when `limit` is zero
pub fn total_pages_for(total: u64, limit: u32) -> u32 {
  if limit == 0 {
    return 0;
  }
  let limit = u64::from(limit);
  u32::try_from(total.div_ceil(limit)).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  fn txn(id: &str, amount: f64, direction: Option<Direction>) -> TransactionRecord {
    TransactionRecord {
      id: id.to_string(),
      amount,
      direction,
      status: TransactionStatus::Completed,
      created_at: Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
      description: "Order payout".to_string(),
      references: TransactionReferences {
        order_id: Some("ORD-778".to_string()),
        withdrawal_id: None,
      },
    }
  }

  #[test]
  fn test_direction_inferred_from_sign() {
    assert_eq!(txn("a", -5.0, None).effective_direction(), Direction::Debit);
    assert_eq!(txn("b", 5.0, None).effective_direction(), Direction::Credit);
    assert_eq!(
      txn("c", 5.0, Some(Direction::Debit)).effective_direction(),
      Direction::Debit
    );
  }

  #[test]
  fn test_parse_filter_values() {
    assert_eq!("finance".parse::<NotificationKind>(), Ok(NotificationKind::Payout));
    assert_eq!("Credit".parse::<Direction>(), Ok(Direction::Credit));
    assert_eq!("canceled".parse::<TransactionStatus>(), Ok(TransactionStatus::Cancelled));
    assert!("sideways".parse::<Direction>().is_err());
  }

  #[test]
  fn test_search_term_matches_references() {
    let filters = TransactionFilters {
      search_term: Some("ord-77".to_string()),
      ..Default::default()
    };
    assert!(filters.matches(&txn("t1", 10.0, None)));

    let filters = TransactionFilters {
      search_term: Some("refund".to_string()),
      ..Default::default()
    };
    assert!(!filters.matches(&txn("t1", 10.0, None)));
  }

  #[test]
  fn test_date_range_is_inclusive() {
    let at = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap();
    let range = DateRange {
      start: Some(at),
      end: Some(at),
    };
    assert!(range.contains(at));
    assert!(!range.contains(at + chrono::Duration::seconds(1)));
  }

  #[test]
  fn test_normalize_computes_total_pages() {
    let page = RemotePage {
      records: vec![1, 2, 3],
      page: None,
      limit: None,
      total: Some(41),
      total_pages: None,
    }
    .normalize(Pagination { page: 1, limit: 20 });

    assert_eq!(page.total, 41);
    assert_eq!(page.total_pages, 3);
    assert_eq!(page.records.len(), 3);
  }

  #[test]
  fn test_normalize_prefers_server_metadata() {
    let page = RemotePage {
      records: vec![1],
      page: Some(2),
      limit: Some(10),
      total: Some(11),
      total_pages: Some(2),
    }
    .normalize(Pagination { page: 2, limit: 50 });

    assert_eq!(page.limit, 10);
    assert_eq!(page.total_pages, 2);
  }

  #[test]
  fn test_normalize_past_last_page_is_empty() {
    let page = RemotePage {
      records: vec![1, 2],
      page: Some(9),
      limit: Some(20),
      total: Some(30),
      total_pages: Some(2),
    }
    .normalize(Pagination { page: 9, limit: 20 });

    assert!(page.records.is_empty());
    assert_eq!(page.page, 9);
    assert_eq!(page.total, 30);
    assert_eq!(page.total_pages, 2);
  }

  #[test]
  fn test_unknown_kind_deserializes_as_other() {
    let json = r#"{"id":"n1","type":"marketing","title":"Hi","createdAt":"2026-01-01T00:00:00Z"}"#;
    let record: NotificationRecord = serde_json::from_str(json).unwrap();
    assert_eq!(record.kind, NotificationKind::Other);
    assert!(!record.read);
  }
}
