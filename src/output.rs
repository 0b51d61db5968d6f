//! Plain-text rendering of records for the command line.

use chrono::{DateTime, Utc};

use crate::model::{Direction, NotificationRecord, PageResult, TransactionRecord};

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max_len: usize) -> String {
  if s.chars().count() <= max_len {
    s.to_string()
  } else {
    let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
    format!("{}...", kept)
  }
}

fn short_time(at: DateTime<Utc>) -> String {
  at.format("%Y-%m-%d %H:%M").to_string()
}

/// Signed amount with two decimals, debit shown negative
pub fn format_amount(record: &TransactionRecord) -> String {
  let amount = record.amount.abs();
  match record.effective_direction() {
    Direction::Credit => format!("+{:.2}", amount),
    Direction::Debit => format!("-{:.2}", amount),
  }
}

pub fn notification_row(record: &NotificationRecord) -> String {
  format!(
    "{} {:<12} {:<9} {:<16} {}",
    if record.read { " " } else { "*" },
    truncate(&record.id, 12),
    record.kind.as_str(),
    short_time(record.created_at),
    truncate(&record.title, 60),
  )
}

pub fn transaction_row(record: &TransactionRecord) -> String {
  format!(
    "{:<14} {:>12} {:<10} {:<16} {}",
    truncate(&record.id, 14),
    format_amount(record),
    record.status.as_str(),
    short_time(record.created_at),
    truncate(&record.description, 48),
  )
}

/// Footer line under a listed page
pub fn page_footer<T>(page: &PageResult<T>) -> String {
  format!(
    "page {}/{} ({} total)",
    page.page,
    page.total_pages.max(1),
    page.total
  )
}
