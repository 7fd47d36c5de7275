use std::time::Duration;
use thiserror::Error;

/// Failure reported by a provider call.
///
/// `Clone` because one in-flight result is shared by every caller attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
  #[error("credentials rejected by provider")]
  Unauthorized,

  #[error("rate limited, retry after {}s", .retry_after.as_secs())]
  RateLimited { retry_after: Duration },

  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("malformed payload: {0}")]
  Malformed(String),

  #[error("provider timed out after {}s", .0.as_secs())]
  Timeout(Duration),
}

/// How the coordinator reacts to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// Retried after backoff; cached data served meanwhile
  Transient,
  /// Surfaced immediately, never retried automatically
  Auth,
  /// Logged, never cached, retried like a transient failure
  Malformed,
}

impl ProviderError {
  pub fn class(&self) -> ErrorClass {
    match self {
      Self::Unauthorized => ErrorClass::Auth,
      Self::Malformed(_) => ErrorClass::Malformed,
      Self::RateLimited { .. } | Self::NetworkUnavailable(_) | Self::Timeout(_) => {
        ErrorClass::Transient
      }
    }
  }

  pub fn is_retriable(&self) -> bool {
    self.class() != ErrorClass::Auth
  }

  /// Minimum wait the provider asked for, if any.
  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      Self::RateLimited { retry_after } => Some(*retry_after),
      _ => None,
    }
  }
}
