//! Error types for remote calls and sync operations.

use thiserror::Error;

/// Failure kinds a remote client can report
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
  /// The service could not be reached (offline, DNS, timeout, reset)
  #[error("connectivity lost: {0}")]
  ConnectivityLost(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("server error ({status}): {message}")]
  ServerError { status: u16, message: String },
  #[error("validation error: {0}")]
  ValidationError(String),
}

impl RemoteError {
  /// Status used for endpoints the service does not implement
  pub const NOT_IMPLEMENTED: u16 = 501;

  pub fn not_implemented(operation: &str) -> Self {
    Self::ServerError {
      status: Self::NOT_IMPLEMENTED,
      message: format!("{} is not implemented", operation),
    }
  }

  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::ConnectivityLost(_))
  }

  pub fn is_not_implemented(&self) -> bool {
    matches!(
      self,
      Self::ServerError {
        status: Self::NOT_IMPLEMENTED,
        ..
      }
    )
  }

  /// Short label for log fields
  pub fn kind(&self) -> &'static str {
    match self {
      Self::ConnectivityLost(_) => "connectivity_lost",
      Self::NotFound(_) => "not_found",
      Self::ServerError { .. } => "server_error",
      Self::ValidationError(_) => "validation_error",
    }
  }
}

/// Errors surfaced by the sync engines
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SyncError {
  #[error(transparent)]
  Remote(#[from] RemoteError),
  /// Neither direct lookup nor the bounded scan found the transaction
  #[error("transaction {id} not found")]
  TransactionNotFound { id: String },
  /// Rejected locally before any remote call
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// A cache entry held a value of the wrong shape for its key
  #[error("internal error: {0}")]
  Internal(String),
}

impl SyncError {
  pub fn is_connectivity(&self) -> bool {
    matches!(self, Self::Remote(e) if e.is_connectivity())
  }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
