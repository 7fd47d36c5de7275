//! Fetch coordination, fan-out to subscribers and background refresh.

mod clock;
mod coordinator;
mod eviction;
mod events;
mod hub;
mod scheduler;
mod session;

use std::sync::Arc;
use thiserror::Error;

use crate::cache::PersistenceAdapter;
use crate::provider::ProviderError;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::{CoordinatorPolicy, FetchCoordinator, FetchStatus};
pub use eviction::{EvictionLedger, EvictionPolicy, HistoryPruner, SessionMeta};
pub use events::{EventVerbosity, RecordingObserver, SyncEvent, SyncObserver, TracingObserver};
pub use hub::{BroadcastHub, Subscription, SubscriptionHandle, Update};
pub use scheduler::{BackgroundScheduler, Lifecycle, RefreshTarget};
pub use session::SessionScope;

/// Errors surfaced by the sync layer to its callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
  #[error(transparent)]
  Provider(#[from] ProviderError),

  #[error("no user is signed in")]
  NotSignedIn,

  #[error("cache key belongs to {key_user}, but {current} is signed in")]
  SessionMismatch { key_user: String, current: String },

  /// The session changed while the fetch was outstanding.
  #[error("result discarded after the session ended")]
  Discarded,

  #[error("no refresh target registered for provider {0}")]
  UnknownProvider(String),
}

/// Collaborators shared by every coordinator of one signed-in app.
#[derive(Clone)]
pub struct SyncContext {
  pub persistence: Arc<dyn PersistenceAdapter>,
  pub session: Arc<SessionScope>,
  pub clock: Arc<dyn Clock>,
  pub observer: Arc<dyn SyncObserver>,
}

impl SyncContext {
  /// Context with a fresh session scope, the system clock and a quiet
  /// tracing observer.
  pub fn new(persistence: Arc<dyn PersistenceAdapter>) -> Self {
    Self {
      persistence,
      session: Arc::new(SessionScope::new()),
      clock: Arc::new(SystemClock),
      observer: Arc::new(TracingObserver::new(EventVerbosity::Failures)),
    }
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
    self.observer = observer;
    self
  }
}

/// TTLs are configured as std durations but compared against wall-clock
/// timestamps.
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
  chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}
