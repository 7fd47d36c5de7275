//! Chat-session list provider (AI coaching history).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::error::ProviderError;
use super::http::{HttpProvider, HttpSettings};
use super::{FetchParams, ProviderClient, SessionDeleter};
use crate::cache::Payload;

/// Metadata of one coaching conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSessionSummary {
  pub id: String,
  #[serde(default)]
  pub title: Option<String>,
  pub last_message_at: DateTime<Utc>,
  pub message_count: u32,
}

/// The user's chat sessions, most recent first.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChatSessions {
  pub sessions: Vec<ChatSessionSummary>,
}

impl Payload for ChatSessions {
  fn payload_type() -> &'static str {
    "chat_sessions"
  }

  fn validate(&self) -> Result<(), String> {
    let mut seen = HashSet::new();
    for session in &self.sessions {
      if session.id.is_empty() {
        return Err("session without id".to_string());
      }
      if !seen.insert(session.id.as_str()) {
        return Err(format!("duplicate session id {}", session.id));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Serialize)]
struct BatchDeleteRequest<'a> {
  ids: &'a [String],
}

/// Chat-session API client.
#[derive(Clone)]
pub struct ChatSessionClient {
  http: HttpProvider,
}

impl ChatSessionClient {
  pub const NAME: &'static str = "chat_sessions";

  pub fn new(settings: &HttpSettings) -> Result<Self> {
    Ok(Self {
      http: HttpProvider::new(settings)?,
    })
  }
}

#[async_trait]
impl ProviderClient for ChatSessionClient {
  type Payload = ChatSessions;

  fn name(&self) -> &'static str {
    Self::NAME
  }

  async fn fetch(&self, params: &FetchParams) -> Result<ChatSessions, ProviderError> {
    let url = self
      .http
      .endpoint(&["v1", "users", &params.user_id, "chat", "sessions"]);

    let mut response: ChatSessions = self.http.get_json(url).await?;
    response
      .sessions
      .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
    Ok(response)
  }
}

#[async_trait]
impl SessionDeleter for ChatSessionClient {
  async fn delete_sessions(&self, user_id: &str, session_ids: &[String]) -> Result<(), ProviderError> {
    if session_ids.is_empty() {
      return Ok(());
    }

    let url = self
      .http
      .endpoint(&["v1", "users", user_id, "chat", "sessions", "batch-delete"]);
    self
      .http
      .post_json(url, &BatchDeleteRequest { ids: session_ids })
      .await
  }
}
