//! Local effect of each notification mutation, as a pure function over the
//! cached lists and the unread count.
//!
//! Lists and count travel together in one snapshot, so a read-flag change
//! and its count delta cannot be applied separately.

use chrono::{DateTime, Utc};

use crate::model::{NotificationRecord, PageResult, UnreadAggregate};

/// A user-triggered notification mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationChange {
  MarkRead { id: String },
  MarkAllRead,
  Delete { id: String },
}

impl NotificationChange {
  pub fn label(&self) -> &'static str {
    match self {
      Self::MarkRead { .. } => "mark_read",
      Self::MarkAllRead => "mark_all_read",
      Self::Delete { .. } => "delete",
    }
  }
}

/// Every cached notification list plus the cached unread count
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NotificationSnapshot {
  pub lists: Vec<PageResult<NotificationRecord>>,
  pub unread: Option<UnreadAggregate>,
}

impl NotificationSnapshot {
  /// Whether any cached copy of `id` is unread. A record appearing in
  /// several lists still counts once.
  fn has_unread(&self, id: &str) -> bool {
    self
      .lists
      .iter()
      .flat_map(|list| list.records.iter())
      .any(|record| record.id == id && !record.read)
  }
}

/// Compute the snapshot after `change`, without touching the input.
///
/// - `MarkRead`: flips the record to read everywhere it is cached and
///   decrements the count only if some cached copy was unread
/// - `MarkAllRead`: every cached record read, count exactly zero
/// - `Delete`: removes the record from every list (and from each list's
///   total) and decrements the count only if the removed copy was unread
///
/// The count saturates at zero. A record that is not cached anywhere leaves
/// the count alone.
pub fn apply_optimistic_change(
  snapshot: &NotificationSnapshot,
  change: &NotificationChange,
  now: DateTime<Utc>,
) -> NotificationSnapshot {
  let mut next = snapshot.clone();

  match change {
    NotificationChange::MarkRead { id } => {
      let was_unread = snapshot.has_unread(id);
      for record in next
        .lists
        .iter_mut()
        .flat_map(|list| list.records.iter_mut())
        .filter(|record| record.id == *id && !record.read)
      {
        mark(record, now);
      }
      if was_unread {
        decrement(&mut next.unread);
      }
    }
    NotificationChange::MarkAllRead => {
      for record in next
        .lists
        .iter_mut()
        .flat_map(|list| list.records.iter_mut())
        .filter(|record| !record.read)
      {
        mark(record, now);
      }
      next.unread = Some(UnreadAggregate::new(0));
    }
    NotificationChange::Delete { id } => {
      let was_unread = snapshot.has_unread(id);
      for list in next.lists.iter_mut() {
        let before = list.records.len();
        list.records.retain(|record| record.id != *id);
        let removed = (before - list.records.len()) as u64;
        list.total = list.total.saturating_sub(removed);
      }
      if was_unread {
        decrement(&mut next.unread);
      }
    }
  }

  next
}

fn mark(record: &mut NotificationRecord, now: DateTime<Utc>) {
  record.read = true;
  record.read_at = Some(now);
}

fn decrement(unread: &mut Option<UnreadAggregate>) {
  if let Some(unread) = unread {
    unread.count = unread.count.saturating_sub(1);
  }
}
