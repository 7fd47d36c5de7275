//! Cache keys: provider identity + owning user + optional date-range bucket.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifies one cached snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
  /// Provider name (e.g., "fitness", "chat_sessions")
  pub provider: String,
  /// Signed-in user that owns the data
  pub user_id: String,
  /// Optional date-range bucket (e.g., "2026-10-15")
  pub bucket: Option<String>,
}

impl CacheKey {
  pub fn new(provider: impl Into<String>, user_id: impl Into<String>) -> Self {
    Self {
      provider: provider.into(),
      user_id: user_id.into(),
      bucket: None,
    }
  }

  pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
    self.bucket = Some(bucket.into());
    self
  }

  /// Stable, fixed-length key for the persisted tier.
  pub fn cache_hash(&self) -> String {
    let input = format!(
      "{}:{}:{}",
      self.provider,
      self.user_id,
      self.bucket.as_deref().unwrap_or("")
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
  }

  /// Persistence namespace of the owning user.
  pub fn namespace(&self) -> String {
    user_namespace(&self.user_id)
  }
}

impl std::fmt::Display for CacheKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self.bucket {
      Some(bucket) => write!(f, "{}/{}@{}", self.provider, self.user_id, bucket),
      None => write!(f, "{}/{}", self.provider, self.user_id),
    }
  }
}

/// Namespace holding everything persisted for one signed-in user.
pub fn user_namespace(user_id: &str) -> String {
  format!("user:{}", user_id)
}
