use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;
use std::time::Duration;
use url::Url;

use super::api_types::{decode_one, decode_page, ApiUnreadCount};
use super::{RemoteClient, RemoteResult};
use crate::config::{ApiConfig, Config};
use crate::error::RemoteError;
use crate::model::{
  NotificationFilters, NotificationRecord, Pagination, RemotePage, TransactionFilters,
  TransactionRecord, UnreadAggregate,
};

/// Longest error body kept in a `RemoteError` message
const MAX_ERROR_BODY: usize = 200;

/// Seller API client over HTTP/JSON
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &ApiConfig) -> Result<Self> {
    let token = Config::get_api_token().ok();

    let mut base = config.base_url.trim().to_string();
    if !base.ends_with('/') {
      base.push('/');
    }
    let base_url =
      Url::parse(&base).map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn url(&self, path: &str) -> RemoteResult<Url> {
    self
      .base_url
      .join(path)
      .map_err(|e| RemoteError::ValidationError(format!("bad path {}: {}", path, e)))
  }

  /// URL of one record under `collection`, optionally followed by `action`.
  /// The id is pushed as a single percent-encoded path segment, so `/`, `?`
  /// and `#` inside it never change which endpoint is addressed.
  fn item_url(&self, collection: &str, id: &str, action: Option<&str>) -> RemoteResult<Url> {
    // Dot segments would be dropped by the URL parser and address the collection
    if matches!(id.trim(), "" | "." | "..") {
      return Err(RemoteError::ValidationError(format!("invalid record id {:?}", id)));
    }

    let mut url = self.url(collection)?;
    url
      .path_segments_mut()
      .map_err(|_| RemoteError::ValidationError(format!("cannot extend path {}", collection)))?
      .push(id)
      .extend(action);
    Ok(url)
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let builder = self.client.request(method, url);
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  /// Send a request and map failures onto `RemoteError`.
  async fn send(&self, builder: RequestBuilder) -> RemoteResult<reqwest::Response> {
    let response = builder.send().await.map_err(classify_transport)?;
    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let message = if body.is_empty() {
      status
        .canonical_reason()
        .unwrap_or("request failed")
        .to_string()
    } else {
      body.chars().take(MAX_ERROR_BODY).collect()
    };
    Err(classify_status(status.as_u16(), message))
  }

  async fn send_json(&self, builder: RequestBuilder) -> RemoteResult<Value> {
    let response = self.send(builder).await?;
    let status = response.status();
    response
      .json::<Value>()
      .await
      .map_err(|e| undecodable(status, e))
  }

  async fn send_empty(&self, builder: RequestBuilder) -> RemoteResult<()> {
    self.send(builder).await.map(|_| ())
  }
}

/// Map a transport-level failure. Anything that never produced a response is
/// treated as lost connectivity.
fn classify_transport(err: reqwest::Error) -> RemoteError {
  if let Some(status) = err.status() {
    return classify_status(status.as_u16(), err.to_string());
  }
  if err.is_connect() || err.is_timeout() || err.is_request() {
    return RemoteError::ConnectivityLost(err.to_string());
  }
  RemoteError::ServerError {
    status: 0,
    message: err.to_string(),
  }
}

pub(crate) fn classify_status(status: u16, message: String) -> RemoteError {
  match status {
    404 => RemoteError::NotFound(message),
    400 | 422 => RemoteError::ValidationError(message),
    _ => RemoteError::ServerError { status, message },
  }
}

fn undecodable(status: StatusCode, err: impl std::fmt::Display) -> RemoteError {
  RemoteError::ServerError {
    status: status.as_u16(),
    message: format!("undecodable response: {}", err),
  }
}

fn decode_error(err: serde_json::Error) -> RemoteError {
  undecodable(StatusCode::OK, err)
}

#[async_trait]
impl RemoteClient for HttpRemote {
  async fn list_notifications(
    &self,
    filters: &NotificationFilters,
    pagination: Pagination,
  ) -> RemoteResult<RemotePage<NotificationRecord>> {
    let mut url = self.url("notifications")?;
    {
      let mut query = url.query_pairs_mut();
      query
        .append_pair("page", &pagination.page.to_string())
        .append_pair("limit", &pagination.limit.to_string());
      if let Some(read) = filters.read {
        query.append_pair("read", if read { "true" } else { "false" });
      }
      if let Some(kind) = filters.kind {
        query.append_pair("type", kind.as_str());
      }
    }

    let body = self.send_json(self.request(Method::GET, url)).await?;
    decode_page(body).map_err(decode_error)
  }

  async fn unread_aggregate(&self) -> RemoteResult<UnreadAggregate> {
    let url = self.url("notifications/unread-count")?;
    let body = self.send_json(self.request(Method::GET, url)).await?;
    decode_one::<ApiUnreadCount>(body)
      .map(UnreadAggregate::from)
      .map_err(decode_error)
  }

  async fn mark_notification_read(&self, id: &str) -> RemoteResult<()> {
    let url = self.item_url("notifications", id, Some("read"))?;
    self.send_empty(self.request(Method::PATCH, url)).await
  }

  async fn mark_all_notifications_read(&self) -> RemoteResult<()> {
    let url = self.url("notifications/read-all")?;
    self.send_empty(self.request(Method::PATCH, url)).await
  }

  async fn delete_notification(&self, id: &str) -> RemoteResult<()> {
    let url = self.item_url("notifications", id, None)?;
    self.send_empty(self.request(Method::DELETE, url)).await
  }

  async fn list_transactions(
    &self,
    filters: &TransactionFilters,
    page: u32,
    limit: u32,
  ) -> RemoteResult<RemotePage<TransactionRecord>> {
    let mut url = self.url("wallet/transactions")?;
    {
      let mut query = url.query_pairs_mut();
      query
        .append_pair("page", &page.to_string())
        .append_pair("limit", &limit.to_string());
      if let Some(direction) = filters.direction {
        query.append_pair("type", direction.as_str());
      }
      if let Some(status) = filters.status {
        query.append_pair("status", status.as_str());
      }
      if let Some(range) = &filters.date_range {
        if let Some(start) = range.start {
          query.append_pair("startDate", &start.to_rfc3339());
        }
        if let Some(end) = range.end {
          query.append_pair("endDate", &end.to_rfc3339());
        }
      }
      if let Some(term) = filters.search_term.as_deref().map(str::trim) {
        if !term.is_empty() {
          query.append_pair("search", term);
        }
      }
    }

    let body = self.send_json(self.request(Method::GET, url)).await?;
    decode_page(body).map_err(decode_error)
  }

  async fn transaction_by_id(&self, id: &str) -> RemoteResult<TransactionRecord> {
    let url = self.item_url("wallet/transactions", id, None)?;
    let body = self.send_json(self.request(Method::GET, url)).await?;
    decode_one(body).map_err(decode_error)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpListener;

  fn remote(base_url: &str) -> HttpRemote {
    HttpRemote::new(&ApiConfig {
      base_url: base_url.to_string(),
      timeout_secs: 5,
    })
    .unwrap()
  }

  /// Accept one connection, answer 204 and hand back the request line.
  async fn serve_once(listener: TcpListener) -> String {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut request = Vec::new();
    let mut buf = [0u8; 1024];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
      let n = socket.read(&mut buf).await.unwrap();
      if n == 0 {
        break;
      }
      request.extend_from_slice(&buf[..n]);
    }
    socket
      .write_all(b"HTTP/1.1 204 No Content\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
      .await
      .unwrap();
    let text = String::from_utf8_lossy(&request);
    text.lines().next().unwrap_or_default().to_string()
  }

  #[test]
  fn test_classify_not_found() {
    assert!(matches!(
      classify_status(404, "gone".into()),
      RemoteError::NotFound(_)
    ));
  }

  #[test]
  fn test_classify_validation() {
    assert!(matches!(
      classify_status(422, "bad".into()),
      RemoteError::ValidationError(_)
    ));
    assert!(matches!(
      classify_status(400, "bad".into()),
      RemoteError::ValidationError(_)
    ));
  }

  #[test]
  fn test_classify_server_error_keeps_status() {
    assert_eq!(
      classify_status(503, "down".into()),
      RemoteError::ServerError {
        status: 503,
        message: "down".into()
      }
    );
    assert!(classify_status(501, String::new()).is_not_implemented());
  }

  #[test]
  fn test_base_url_gets_trailing_slash() {
    let remote = HttpRemote::new(&ApiConfig {
      base_url: "https://api.example.com/v1".to_string(),
      timeout_secs: 5,
    })
    .unwrap();
    assert_eq!(
      remote.url("notifications").unwrap().as_str(),
      "https://api.example.com/v1/notifications"
    );
  }

  #[test]
  fn test_item_url_encodes_id_as_one_segment() {
    let remote = remote("https://api.example.com/v1");
    assert_eq!(
      remote
        .item_url("notifications", "../wallet/transactions/tx-1", None)
        .unwrap()
        .as_str(),
      "https://api.example.com/v1/notifications/..%2Fwallet%2Ftransactions%2Ftx-1"
    );
    assert_eq!(
      remote
        .item_url("notifications", "n?1#x", Some("read"))
        .unwrap()
        .as_str(),
      "https://api.example.com/v1/notifications/n%3F1%23x/read"
    );
    assert_eq!(
      remote
        .item_url("wallet/transactions", "tx-42", None)
        .unwrap()
        .as_str(),
      "https://api.example.com/v1/wallet/transactions/tx-42"
    );
  }

  #[test]
  fn test_dot_ids_are_rejected() {
    let remote = remote("https://api.example.com/v1");
    for id in ["", ".", ".."] {
      assert!(matches!(
        remote.item_url("notifications", id, None),
        Err(RemoteError::ValidationError(_))
      ));
    }
  }

  #[tokio::test]
  async fn test_delete_stays_on_notifications_endpoint() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_once(listener));

    let remote = remote(&format!("http://{}/v1", addr));
    remote
      .delete_notification("../wallet/transactions/tx-1")
      .await
      .unwrap();

    let request_line = server.await.unwrap();
    assert_eq!(
      request_line,
      "DELETE /v1/notifications/..%2Fwallet%2Ftransactions%2Ftx-1 HTTP/1.1"
    );
  }

  #[tokio::test]
  async fn test_unreachable_host_is_connectivity_lost() {
    let remote = HttpRemote::new(&ApiConfig {
      base_url: "http://127.0.0.1:9/".to_string(),
      timeout_secs: 2,
    })
    .unwrap();
    let err = remote.unread_aggregate().await.unwrap_err();
    assert!(err.is_connectivity(), "unexpected error: {:?}", err);
  }
}
