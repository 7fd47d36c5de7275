//! Structured sync events and the single observability hook they go through.

use serde::Deserialize;
use std::sync::{Mutex, PoisonError};

use crate::cache::{CacheKey, Tier};
use crate::provider::ProviderError;

/// Something noteworthy that happened on the fetch path.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
  CacheHit { key: CacheKey, tier: Tier },
  CacheMiss { key: CacheKey, forced: bool },
  FetchStarted { key: CacheKey },
  /// A caller attached to an already in-flight fetch
  FetchJoined { key: CacheKey },
  FetchSucceeded { key: CacheKey },
  FetchFailed { key: CacheKey, error: ProviderError, fallback: bool },
  /// A result arrived after the session it belonged to ended
  FetchDiscarded { key: CacheKey },
  Eviction { namespace: String, sessions: Vec<String> },
}

impl SyncEvent {
  pub fn name(&self) -> &'static str {
    match self {
      Self::CacheHit { .. } => "cache_hit",
      Self::CacheMiss { .. } => "cache_miss",
      Self::FetchStarted { .. } => "fetch_started",
      Self::FetchJoined { .. } => "fetch_joined",
      Self::FetchSucceeded { .. } => "fetch_succeeded",
      Self::FetchFailed { .. } => "fetch_failed",
      Self::FetchDiscarded { .. } => "fetch_discarded",
      Self::Eviction { .. } => "eviction",
    }
  }

  fn is_failure(&self) -> bool {
    matches!(self, Self::FetchFailed { .. } | Self::FetchDiscarded { .. })
  }
}

/// Receives every sync event.
pub trait SyncObserver: Send + Sync {
  fn on_event(&self, event: &SyncEvent);
}

/// How much of the sync event stream reaches the log.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventVerbosity {
  Off,
  /// Failures, discards and evictions only
  Failures,
  #[default]
  All,
}

/// Emits sync events as `tracing` events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver {
  verbosity: EventVerbosity,
}

impl TracingObserver {
  pub fn new(verbosity: EventVerbosity) -> Self {
    Self { verbosity }
  }

  fn enabled(&self, event: &SyncEvent) -> bool {
    match self.verbosity {
      EventVerbosity::Off => false,
      EventVerbosity::Failures => {
        event.is_failure() || matches!(event, SyncEvent::Eviction { .. })
      }
      EventVerbosity::All => true,
    }
  }
}

impl SyncObserver for TracingObserver {
  fn on_event(&self, event: &SyncEvent) {
    if !self.enabled(event) {
      return;
    }

    let name = event.name();
    match event {
      SyncEvent::CacheHit { key, tier } => {
        tracing::debug!(event = name, key = %key, tier = %tier);
      }
      SyncEvent::CacheMiss { key, forced } => {
        tracing::debug!(event = name, key = %key, forced = *forced);
      }
      SyncEvent::FetchStarted { key }
      | SyncEvent::FetchJoined { key }
      | SyncEvent::FetchSucceeded { key } => {
        tracing::info!(event = name, key = %key);
      }
      SyncEvent::FetchFailed {
        key,
        error,
        fallback,
      } => {
        tracing::warn!(event = name, key = %key, error = %error, fallback = *fallback);
      }
      SyncEvent::FetchDiscarded { key } => {
        tracing::info!(event = name, key = %key);
      }
      SyncEvent::Eviction {
        namespace,
        sessions,
      } => {
        tracing::info!(event = name, namespace = %namespace, count = sessions.len(), sessions = ?sessions);
      }
    }
  }
}

/// Keeps every event in memory. Useful for tests and diagnostics screens.
#[derive(Debug, Default)]
pub struct RecordingObserver {
  events: Mutex<Vec<SyncEvent>>,
}

impl RecordingObserver {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<SyncEvent> {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn names(&self) -> Vec<&'static str> {
    self.events().iter().map(SyncEvent::name).collect()
  }

  pub fn count(&self, name: &str) -> usize {
    self.events().iter().filter(|e| e.name() == name).count()
  }
}

impl SyncObserver for RecordingObserver {
  fn on_event(&self, event: &SyncEvent) {
    self
      .events
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(event.clone());
  }
}
