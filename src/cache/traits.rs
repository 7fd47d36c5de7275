//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;

use crate::provider::ProviderError;

/// Trait for payloads a provider can return and the cache can hold.
///
/// Implementors must be serializable so the persisted tier can store them.
pub trait Payload: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
  /// Payload type name for storage organization (e.g., "fitness_day")
  fn payload_type() -> &'static str;

  /// Check the payload shape. A payload that fails validation is treated as
  /// malformed and never cached.
  fn validate(&self) -> Result<(), String> {
    Ok(())
  }
}

/// An immutable, timestamped payload as last fetched from a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot<T> {
  /// The fetched payload
  pub data: T,
  /// When the provider returned it
  pub fetched_at: DateTime<Utc>,
}

impl<T> Snapshot<T> {
  pub fn new(data: T, fetched_at: DateTime<Utc>) -> Self {
    Self { data, fetched_at }
  }
}

/// Cache tier an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
  /// In-process memory
  Memory,
  /// Device-local persisted store
  Persisted,
}

impl std::fmt::Display for Tier {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Self::Memory => write!(f, "memory"),
      Self::Persisted => write!(f, "persisted"),
    }
  }
}

/// A cached snapshot together with the tier it lives in and when it goes stale.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub snapshot: Arc<Snapshot<T>>,
  pub tier: Tier,
  pub expires_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

/// Result of a refresh, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct RefreshOutcome<T> {
  /// The snapshot handed to the caller
  pub snapshot: Arc<Snapshot<T>>,
  /// Where the snapshot came from
  pub source: CacheSource,
  /// Set when the snapshot is a fallback for a failed fetch
  pub error: Option<ProviderError>,
}

impl<T> RefreshOutcome<T> {
  /// Create a new outcome from fresh network data.
  pub fn from_network(snapshot: Arc<Snapshot<T>>) -> Self {
    Self {
      snapshot,
      source: CacheSource::Network,
      error: None,
    }
  }

  /// Create a new outcome from a fresh cache tier.
  pub fn from_cache(snapshot: Arc<Snapshot<T>>, tier: Tier) -> Self {
    Self {
      snapshot,
      source: match tier {
        Tier::Memory => CacheSource::Memory,
        Tier::Persisted => CacheSource::Persisted,
      },
      error: None,
    }
  }

  /// Create a new outcome serving stale data after a failed fetch.
  pub fn fallback(snapshot: Arc<Snapshot<T>>, error: ProviderError) -> Self {
    Self {
      snapshot,
      source: CacheSource::Fallback,
      error: Some(error),
    }
  }

  pub fn is_fallback(&self) -> bool {
    self.source == CacheSource::Fallback
  }
}

/// Indicates where a snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Memory tier, still considered fresh
  Memory,
  /// Persisted tier, still considered fresh
  Persisted,
  /// Fetch failed, serving the last known snapshot
  Fallback,
}
