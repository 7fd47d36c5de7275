//! Periodic background refresh, tied to app lifecycle.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{FetchCoordinator, SyncError};
use crate::cache::CacheKey;
use crate::provider::ProviderClient;

/// Something the scheduler can ask to refresh a key.
#[async_trait]
pub trait RefreshTarget: Send + Sync {
  /// Non-forced refresh: a no-op while the key is fresh.
  async fn refresh_if_stale(&self, key: &CacheKey);
}

#[async_trait]
impl<P: ProviderClient> RefreshTarget for FetchCoordinator<P> {
  async fn refresh_if_stale(&self, key: &CacheKey) {
    match self.refresh(key, false).await {
      Ok(outcome) if outcome.is_fallback() => {
        tracing::debug!(key = %key, "Background refresh served cached data");
      }
      Ok(_) => {}
      Err(e) => tracing::debug!(key = %key, error = %e, "Background refresh failed"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lifecycle {
  #[default]
  Foreground,
  Background,
}

struct Timer {
  target: Arc<dyn RefreshTarget>,
  period: Duration,
  /// None while paused
  token: Option<CancellationToken>,
}

impl Timer {
  fn cancel(&mut self) {
    if let Some(token) = self.token.take() {
      token.cancel();
    }
  }
}

#[derive(Default)]
struct SchedulerState {
  targets: HashMap<String, Arc<dyn RefreshTarget>>,
  timers: HashMap<CacheKey, Timer>,
  paused: bool,
  lifecycle: Lifecycle,
}

/// Runs one cancellable refresh timer per started key.
#[derive(Default)]
pub struct BackgroundScheduler {
  state: Mutex<SchedulerState>,
}

impl BackgroundScheduler {
  pub fn new() -> Self {
    Self::default()
  }

  /// Route keys of `provider` to `target`.
  pub fn register(&self, provider: impl Into<String>, target: Arc<dyn RefreshTarget>) {
    self.lock().targets.insert(provider.into(), target);
  }

  /// Refresh `key` every `period`, starting now. Restarts the timer if the
  /// key was already scheduled.
  pub fn start(&self, key: &CacheKey, period: Duration) -> Result<(), SyncError> {
    let mut state = self.lock();
    let target = state
      .targets
      .get(&key.provider)
      .cloned()
      .ok_or_else(|| SyncError::UnknownProvider(key.provider.clone()))?;

    let running = state.is_running();
    let mut timer = Timer {
      target,
      period,
      token: None,
    };
    if running {
      timer.token = Some(spawn_timer(key.clone(), &timer));
    }
    if let Some(mut previous) = state.timers.insert(key.clone(), timer) {
      previous.cancel();
    }

    tracing::debug!(key = %key, period_secs = period.as_secs(), running, "Scheduled background refresh");
    Ok(())
  }

  /// Cancel every timer, keeping them registered for `resume`.
  pub fn pause(&self) {
    let mut state = self.lock();
    state.paused = true;
    state.cancel_all();
  }

  /// Restart every timer; each one refreshes immediately.
  pub fn resume(&self) {
    let mut state = self.lock();
    state.paused = false;
    state.restart_all();
  }

  pub fn stop(&self, key: &CacheKey) {
    if let Some(mut timer) = self.lock().timers.remove(key) {
      timer.cancel();
    }
  }

  pub fn stop_all(&self) {
    let mut state = self.lock();
    state.cancel_all();
    state.timers.clear();
  }

  /// Backgrounding suspends every timer; returning to the foreground
  /// refreshes stale keys right away.
  pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
    let mut state = self.lock();
    if state.lifecycle == lifecycle {
      return;
    }
    state.lifecycle = lifecycle;
    tracing::debug!(?lifecycle, "Lifecycle changed");

    match lifecycle {
      Lifecycle::Background => state.cancel_all(),
      Lifecycle::Foreground => state.restart_all(),
    }
  }

  pub fn is_scheduled(&self, key: &CacheKey) -> bool {
    self.lock().timers.contains_key(key)
  }

  pub fn is_active(&self, key: &CacheKey) -> bool {
    self
      .lock()
      .timers
      .get(key)
      .is_some_and(|timer| timer.token.is_some())
  }

  fn lock(&self) -> MutexGuard<'_, SchedulerState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl SchedulerState {
  fn is_running(&self) -> bool {
    !self.paused && self.lifecycle == Lifecycle::Foreground
  }

  fn cancel_all(&mut self) {
    for timer in self.timers.values_mut() {
      timer.cancel();
    }
  }

  fn restart_all(&mut self) {
    if !self.is_running() {
      return;
    }
    for (key, timer) in self.timers.iter_mut() {
      if timer.token.is_none() {
        timer.token = Some(spawn_timer(key.clone(), timer));
      }
    }
  }
}

impl Drop for BackgroundScheduler {
  fn drop(&mut self) {
    self.lock().cancel_all();
  }
}

fn spawn_timer(key: CacheKey, timer: &Timer) -> CancellationToken {
  let token = CancellationToken::new();
  let cancelled = token.clone();
  let target = Arc::clone(&timer.target);
  let period = timer.period;

  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        _ = cancelled.cancelled() => break,
        _ = ticker.tick() => {
          // Stopping abandons a refresh that is still running
          tokio::select! {
            _ = cancelled.cancelled() => break,
            _ = target.refresh_if_stale(&key) => {}
          }
        }
      }
    }
    tracing::trace!(key = %key, "Background refresh stopped");
  });

  token
}
