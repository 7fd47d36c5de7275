//! External data sources behind a uniform fetch contract.
//!
//! The coordinator only sees `ProviderClient`; the concrete clients talk
//! HTTP to the fitness-data and chat-session backends.

mod chat;
mod error;
mod fitness;
mod http;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::cache::Payload;

pub use chat::{ChatSessionClient, ChatSessionSummary, ChatSessions};
pub use error::{ErrorClass, ProviderError};
pub use fitness::{FitnessClient, FitnessDay};
pub use http::HttpSettings;

/// Parameters for one provider fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchParams {
  pub user_id: String,
  /// Date-range bucket from the cache key
  pub bucket: Option<String>,
  /// When the previous snapshot was fetched, for incremental providers
  pub since: Option<DateTime<Utc>>,
  pub until: DateTime<Utc>,
}

/// A single external data source.
///
/// Implementations are stateless aside from credentials and are shared
/// read-only across concurrent fetches.
#[async_trait]
pub trait ProviderClient: Send + Sync + 'static {
  type Payload: Payload;

  /// Provider identity, used as the `provider` part of cache keys.
  fn name(&self) -> &'static str;

  async fn fetch(&self, params: &FetchParams) -> Result<Self::Payload, ProviderError>;
}

/// Remote deletion of chat sessions, used when history is pruned.
#[async_trait]
pub trait SessionDeleter: Send + Sync {
  async fn delete_sessions(&self, user_id: &str, session_ids: &[String]) -> Result<(), ProviderError>;
}
