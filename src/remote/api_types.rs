//! Serde types and decoders matching the seller API's JSON responses.
//!
//! The API is not consistent about envelopes: lists come back bare, inside a
//! `{ data: [...] }` object, or nested one level deeper. Decoding goes through
//! `serde_json::Value` so every shape lands in the same domain types.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;

use crate::model::{RemotePage, UnreadAggregate};

/// Keys under which a list of records may appear
const LIST_KEYS: [&str; 4] = ["data", "records", "notifications", "transactions"];

// ============================================================================
// Pagination metadata
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiPagination {
  pub page: Option<u32>,
  pub limit: Option<u32>,
  pub total: Option<u64>,
  #[serde(alias = "pages")]
  pub total_pages: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct ApiUnreadCount {
  #[serde(alias = "unreadCount", alias = "unread")]
  pub count: u64,
}

impl From<ApiUnreadCount> for UnreadAggregate {
  fn from(resp: ApiUnreadCount) -> Self {
    UnreadAggregate::new(resp.count)
  }
}

// ============================================================================
// Decoders
// ============================================================================

/// Siblings of `data` that describe the page rather than the payload
const PAGE_META_KEYS: [&str; 7] = [
  "pagination",
  "meta",
  "page",
  "limit",
  "total",
  "totalPages",
  "pages",
];

/// Strip a `{ "data": { ... } }` wrapper around an object payload. Page
/// metadata next to `data` moves inside unless the payload has its own.
fn unwrap_data_object(value: Value) -> Value {
  match value {
    Value::Object(mut obj) if matches!(obj.get("data"), Some(Value::Object(_))) => {
      let Some(Value::Object(mut inner)) = obj.remove("data") else {
        return Value::Object(obj);
      };
      for key in PAGE_META_KEYS {
        if let Some(meta) = obj.remove(key) {
          inner.entry(key).or_insert(meta);
        }
      }
      Value::Object(inner)
    }
    other => other,
  }
}

/// Decode a list response in any of the shapes the API uses.
pub fn decode_page<T: DeserializeOwned>(value: Value) -> serde_json::Result<RemotePage<T>> {
  let value = unwrap_data_object(value);

  let mut obj = match value {
    Value::Array(_) => return Ok(RemotePage::bare(serde_json::from_value(value)?)),
    Value::Object(obj) => obj,
    other => {
      // Let serde produce the type error
      let records: Vec<T> = serde_json::from_value(other)?;
      return Ok(RemotePage::bare(records));
    }
  };

  let records = LIST_KEYS
    .iter()
    .find_map(|key| match obj.remove(*key) {
      Some(list @ Value::Array(_)) => Some(list),
      _ => None,
    })
    .unwrap_or_else(|| Value::Array(Vec::new()));
  let records: Vec<T> = serde_json::from_value(records)?;

  // Metadata may sit in a nested object or next to the records
  let pagination: ApiPagination = match obj.remove("pagination").or_else(|| obj.remove("meta")) {
    Some(meta @ Value::Object(_)) => serde_json::from_value(meta)?,
    _ => serde_json::from_value(Value::Object(obj))?,
  };

  Ok(RemotePage {
    records,
    page: pagination.page,
    limit: pagination.limit,
    total: pagination.total,
    total_pages: pagination.total_pages,
  })
}

/// Decode a single-object response, with or without a `data` wrapper.
pub fn decode_one<T: DeserializeOwned>(value: Value) -> serde_json::Result<T> {
  serde_json::from_value(unwrap_data_object(value))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{NotificationKind, NotificationRecord, TransactionRecord};
  use serde_json::json;

  fn notification_json(id: &str) -> Value {
    json!({
      "id": id,
      "type": "order",
      "title": "New order",
      "message": "Order #1 placed",
      "read": false,
      "createdAt": "2026-02-01T10:00:00Z",
      "metadata": { "orderId": "1" }
    })
  }

  #[test]
  fn test_decode_bare_array() {
    let page: RemotePage<NotificationRecord> =
      decode_page(json!([notification_json("a"), notification_json("b")])).unwrap();
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.total, None);
    assert_eq!(page.records[0].kind, NotificationKind::Order);
  }

  #[test]
  fn test_decode_envelope_with_pagination() {
    let body = json!({
      "data": [notification_json("a")],
      "pagination": { "page": 2, "limit": 1, "total": 5, "totalPages": 5 }
    });
    let page: RemotePage<NotificationRecord> = decode_page(body).unwrap();
    assert_eq!(page.records[0].id, "a");
    assert_eq!(page.page, Some(2));
    assert_eq!(page.total_pages, Some(5));
  }

  #[test]
  fn test_decode_nested_data_envelope() {
    let body = json!({
      "success": true,
      "data": {
        "transactions": [{
          "id": "t1",
          "amount": -12.5,
          "status": "completed",
          "createdAt": "2026-02-01T10:00:00Z"
        }],
        "total": 1
      }
    });
    let page: RemotePage<TransactionRecord> = decode_page(body).unwrap();
    assert_eq!(page.records[0].id, "t1");
    assert_eq!(page.total, Some(1));
    assert_eq!(page.total_pages, None);
  }

  #[test]
  fn test_decode_nested_data_with_outer_pagination() {
    let body = json!({
      "data": {
        "transactions": [{
          "id": "t101",
          "amount": 40.0,
          "status": "pending",
          "createdAt": "2026-02-01T10:00:00Z"
        }]
      },
      "pagination": { "page": 2, "limit": 100, "total": 150, "totalPages": 2 }
    });
    let page: RemotePage<TransactionRecord> = decode_page(body).unwrap();
    assert_eq!(page.records[0].id, "t101");
    assert_eq!(page.page, Some(2));
    assert_eq!(page.total, Some(150));
    assert_eq!(page.total_pages, Some(2));
  }

  #[test]
  fn test_inner_pagination_wins_over_outer() {
    let body = json!({
      "data": {
        "notifications": [notification_json("a")],
        "pagination": { "page": 1, "total": 1 }
      },
      "pagination": { "page": 9, "total": 99 },
      "total": 99
    });
    let page: RemotePage<NotificationRecord> = decode_page(body).unwrap();
    assert_eq!(page.page, Some(1));
    assert_eq!(page.total, Some(1));
  }

  #[test]
  fn test_decode_unread_count_aliases() {
    let count: ApiUnreadCount = decode_one(json!({ "data": { "unreadCount": 4 } })).unwrap();
    assert_eq!(UnreadAggregate::from(count).count, 4);
  }
}
