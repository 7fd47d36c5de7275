//! Single-flight fetch coordination across cache tiers.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::hub::{BroadcastHub, Subscription, SubscriptionHandle, Update};
use super::{to_chrono, SyncContext, SyncError, SyncEvent};
use crate::cache::{CacheKey, CacheStore, Payload, RefreshOutcome, Snapshot, Tier};
use crate::provider::{ErrorClass, FetchParams, ProviderClient, ProviderError};

/// Per-provider freshness and failure policy.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorPolicy {
  pub memory_ttl: Duration,
  pub persisted_ttl: Duration,
  pub fetch_timeout: Duration,
  /// First cooldown after a failure; doubles per consecutive failure
  pub backoff_base: Duration,
  pub backoff_max: Duration,
  /// Serve the last snapshot when a fetch fails. When false, failures
  /// propagate even if a snapshot exists.
  pub serve_stale_on_error: bool,
}

impl CoordinatorPolicy {
  /// Fitness data: 30s memory TTL, refreshed in the background every 2 minutes.
  pub fn fitness() -> Self {
    Self {
      memory_ttl: Duration::from_secs(30),
      persisted_ttl: Duration::from_secs(30),
      ..Self::default()
    }
  }

  /// Chat sessions: 5 minutes in memory, 15 minutes from the device store.
  pub fn chat() -> Self {
    Self {
      memory_ttl: Duration::from_secs(5 * 60),
      persisted_ttl: Duration::from_secs(15 * 60),
      ..Self::default()
    }
  }

  /// Cooldown after `failures` consecutive failures.
  pub fn backoff(&self, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    self
      .backoff_base
      .saturating_mul(1u32 << exponent)
      .min(self.backoff_max)
  }
}

impl Default for CoordinatorPolicy {
  fn default() -> Self {
    Self {
      memory_ttl: Duration::from_secs(60),
      persisted_ttl: Duration::from_secs(60),
      fetch_timeout: Duration::from_secs(10),
      backoff_base: Duration::from_secs(5),
      backoff_max: Duration::from_secs(5 * 60),
      serve_stale_on_error: true,
    }
  }
}

/// Result shared by every caller attached to one flight.
#[derive(Debug, Clone)]
enum FlightResult<T> {
  Fetched(Arc<Snapshot<T>>),
  Failed(ProviderError),
  /// The session ended while the fetch was outstanding
  Discarded,
}

type Flight<T> = Shared<BoxFuture<'static, FlightResult<T>>>;

enum FetchState<T> {
  Idle,
  InFlight(Flight<T>),
  Cooldown { until: DateTime<Utc>, cause: ProviderError },
}

struct KeyState<T> {
  fetch: FetchState<T>,
  /// Consecutive failures, drives the backoff
  failures: u32,
}

impl<T> Default for KeyState<T> {
  fn default() -> Self {
    Self {
      fetch: FetchState::Idle,
      failures: 0,
    }
  }
}

/// Public view of a key's fetch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
  Idle,
  InFlight,
  Cooldown { until: DateTime<Utc> },
}

struct State<T> {
  store: CacheStore<T>,
  keys: HashMap<CacheKey, KeyState<T>>,
  /// Keys whose persisted record has already been looked up
  hydrated: HashSet<CacheKey>,
}

struct Inner<P: ProviderClient> {
  provider: Arc<P>,
  policy: CoordinatorPolicy,
  ctx: SyncContext,
  hub: BroadcastHub<P::Payload>,
  state: Mutex<State<P::Payload>>,
}

enum Begin<T> {
  Flight(Flight<T>),
  CoolingDown(ProviderError),
}

/// Serves snapshots for one provider: cache tiers first, then at most one
/// outstanding provider call per key.
pub struct FetchCoordinator<P: ProviderClient> {
  inner: Arc<Inner<P>>,
}

impl<P: ProviderClient> Clone for FetchCoordinator<P> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<P: ProviderClient> FetchCoordinator<P> {
  pub fn new(provider: Arc<P>, policy: CoordinatorPolicy, ctx: SyncContext) -> Self {
    Self {
      inner: Arc::new(Inner {
        provider,
        policy,
        ctx,
        hub: BroadcastHub::new(),
        state: Mutex::new(State {
          store: CacheStore::new(),
          keys: HashMap::new(),
          hydrated: HashSet::new(),
        }),
      }),
    }
  }

  pub fn provider_name(&self) -> &'static str {
    self.inner.provider.name()
  }

  pub fn policy(&self) -> &CoordinatorPolicy {
    &self.inner.policy
  }

  /// Cache key for the signed-in user.
  pub fn key_for_current_user(&self, bucket: Option<&str>) -> Result<CacheKey, SyncError> {
    let user = self
      .inner
      .ctx
      .session
      .current_user()
      .ok_or(SyncError::NotSignedIn)?;
    let key = CacheKey::new(self.provider_name(), user);
    Ok(match bucket {
      Some(bucket) => key.with_bucket(bucket),
      None => key,
    })
  }

  /// Return a fresh snapshot for `key`, fetching only when every tier is stale
  /// or `force` is set.
  ///
  /// 1. Fresh memory or persisted tier - returned with zero network calls
  /// 2. A fetch already in flight - attach to it
  /// 3. Cooling down after a failure - serve the fallback without a call
  /// 4. Otherwise start a fetch; on failure serve the last snapshot from any
  ///    tier, or propagate the error if there is none
  pub async fn refresh(&self, key: &CacheKey, force: bool) -> Result<RefreshOutcome<P::Payload>, SyncError> {
    let generation = self.inner.ctx.session.admit(key)?;

    if !force {
      if let Some(hit) = self.inner.fresh_hit(key) {
        return Ok(hit);
      }
      if self.inner.hydrate(key, generation).await {
        if let Some(hit) = self.inner.fresh_hit(key) {
          return Ok(hit);
        }
      }
    }

    self.inner.emit(SyncEvent::CacheMiss {
      key: key.clone(),
      forced: force,
    });

    let result = match self.begin(key, generation, force) {
      Begin::Flight(flight) => flight.await,
      Begin::CoolingDown(cause) => FlightResult::Failed(cause),
    };
    self.settle(key, generation, result).await
  }

  /// User-initiated refresh: bypasses TTLs, still joins an in-flight fetch.
  pub async fn force_refresh(&self, key: &CacheKey) -> Result<RefreshOutcome<P::Payload>, SyncError> {
    self.refresh(key, true).await
  }

  pub fn subscribe(&self, key: &CacheKey) -> Subscription<P::Payload> {
    self.inner.hub.subscribe(key)
  }

  pub fn subscribe_with<F>(&self, key: &CacheKey, callback: F) -> SubscriptionHandle
  where
    F: Fn(&Update<P::Payload>) + Send + Sync + 'static,
  {
    self.inner.hub.subscribe_with(key, callback)
  }

  pub fn unsubscribe(&self, handle: SubscriptionHandle) {
    self.inner.hub.unsubscribe(handle)
  }

  /// Latest published value for `key`, without touching the network.
  pub fn current(&self, key: &CacheKey) -> Update<P::Payload> {
    self.inner.hub.current(key)
  }

  pub fn cached(&self, key: &CacheKey, tier: Tier) -> Option<Arc<Snapshot<P::Payload>>> {
    self
      .inner
      .lock()
      .store
      .get(key, tier)
      .map(|entry| Arc::clone(&entry.snapshot))
  }

  /// Newest snapshot held for `key` in any tier, loading the persisted record
  /// if needed. Never calls the provider.
  pub async fn peek(&self, key: &CacheKey) -> Result<Option<Arc<Snapshot<P::Payload>>>, SyncError> {
    let generation = self.inner.ctx.session.admit(key)?;
    self.inner.hydrate(key, generation).await;
    Ok(self.inner.lock().store.latest(key))
  }

  pub fn status(&self, key: &CacheKey) -> FetchStatus {
    match self.inner.lock().keys.get(key).map(|k| &k.fetch) {
      Some(FetchState::InFlight(_)) => FetchStatus::InFlight,
      Some(FetchState::Cooldown { until, .. }) if *until > self.inner.ctx.clock.now() => {
        FetchStatus::Cooldown { until: *until }
      }
      Some(FetchState::Cooldown { .. }) | Some(FetchState::Idle) | None => FetchStatus::Idle,
    }
  }

  /// Drop every tier, fetch state and subscriber channel. Fetches still in
  /// flight finish but their results are discarded.
  ///
  /// Call after the session generation has moved on (sign-out).
  pub fn invalidate(&self) {
    {
      let mut state = self.inner.lock();
      state.store.clear();
      state.keys.clear();
      state.hydrated.clear();
    }
    self.inner.hub.clear(self.inner.ctx.session.generation());
  }

  fn begin(&self, key: &CacheKey, generation: u64, force: bool) -> Begin<P::Payload> {
    let now = self.inner.ctx.clock.now();
    let mut state = self.inner.lock();
    let since = state.store.latest(key).map(|s| s.fetched_at);

    let key_state = state.keys.entry(key.clone()).or_default();
    match &key_state.fetch {
      FetchState::InFlight(flight) => {
        let flight = flight.clone();
        drop(state);
        self.inner.emit(SyncEvent::FetchJoined { key: key.clone() });
        return Begin::Flight(flight);
      }
      // A forced refresh may cut a cooldown short, unless the provider asked
      // us to wait.
      FetchState::Cooldown { until, cause } if now < *until && (!force || cause.retry_after().is_some()) => {
        return Begin::CoolingDown(cause.clone());
      }
      FetchState::Cooldown { .. } | FetchState::Idle => {}
    }

    let flight = Inner::spawn_fetch(Arc::clone(&self.inner), key.clone(), generation, since);
    key_state.fetch = FetchState::InFlight(flight.clone());
    Begin::Flight(flight)
  }

  async fn settle(
    &self,
    key: &CacheKey,
    generation: u64,
    result: FlightResult<P::Payload>,
  ) -> Result<RefreshOutcome<P::Payload>, SyncError> {
    match result {
      FlightResult::Fetched(snapshot) => Ok(RefreshOutcome::from_network(snapshot)),
      FlightResult::Discarded => Err(SyncError::Discarded),
      FlightResult::Failed(error) => {
        if error.class() == ErrorClass::Auth || !self.inner.policy.serve_stale_on_error {
          return Err(SyncError::Provider(error));
        }

        // A forced refresh skipped the persisted lookup; it may hold the only
        // fallback there is.
        self.inner.hydrate(key, generation).await;
        let latest = self.inner.lock().store.latest(key);
        match latest {
          Some(snapshot) => Ok(RefreshOutcome::fallback(snapshot, error)),
          None => Err(SyncError::Provider(error)),
        }
      }
    }
  }
}

impl<P: ProviderClient> Inner<P> {
  fn lock(&self) -> MutexGuard<'_, State<P::Payload>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: SyncEvent) {
    self.ctx.observer.on_event(&event);
  }

  fn fresh_hit(&self, key: &CacheKey) -> Option<RefreshOutcome<P::Payload>> {
    let now = self.ctx.clock.now();
    let (snapshot, tier) = {
      let state = self.lock();
      let entry = state.store.fresh(key, now)?;
      (Arc::clone(&entry.snapshot), entry.tier)
    };

    self.emit(SyncEvent::CacheHit {
      key: key.clone(),
      tier,
    });
    Some(RefreshOutcome::from_cache(snapshot, tier))
  }

  /// Load the persisted record for `key` into the persisted tier, once.
  /// Returns true if a snapshot was loaded.
  async fn hydrate(&self, key: &CacheKey, generation: u64) -> bool {
    {
      let state = self.lock();
      if state.hydrated.contains(key) || state.store.contains(key, Tier::Persisted) {
        return false;
      }
    }

    let loaded = match self
      .ctx
      .persistence
      .get(&key.namespace(), &key.cache_hash())
      .await
    {
      Ok(Some(bytes)) => match serde_json::from_slice::<Snapshot<P::Payload>>(&bytes) {
        Ok(snapshot) => Some(Arc::new(snapshot)),
        Err(e) => {
          tracing::warn!(
            key = %key,
            payload = P::Payload::payload_type(),
            error = %e,
            "Ignoring unreadable persisted snapshot"
          );
          None
        }
      },
      Ok(None) => None,
      Err(e) => {
        // Leave the key unmarked so the next refresh retries the read.
        tracing::warn!(key = %key, error = %e, "Failed to read persisted snapshot");
        return false;
      }
    };

    {
      let mut state = self.lock();
      if !self.ctx.session.is_current(generation) {
        return false;
      }
      state.hydrated.insert(key.clone());
      match &loaded {
        Some(snapshot) => {
          state
            .store
            .put(key, Tier::Persisted, Arc::clone(snapshot), to_chrono(self.policy.persisted_ttl));
        }
        None => return false,
      }
    }

    if let Some(snapshot) = loaded {
      self.hub.publish(key, Update::data(snapshot), generation);
    }
    true
  }

  /// Start the provider call on its own task so that callers going away never
  /// leave the key stuck in flight.
  fn spawn_fetch(
    inner: Arc<Self>,
    key: CacheKey,
    generation: u64,
    since: Option<DateTime<Utc>>,
  ) -> Flight<P::Payload> {
    let task = tokio::spawn(Self::run_fetch(Arc::clone(&inner), key.clone(), generation, since));

    async move {
      match task.await {
        Ok(result) => result,
        Err(e) => {
          let error = ProviderError::NetworkUnavailable(format!("fetch task failed: {}", e));
          inner.complete_failure(&key, generation, error)
        }
      }
    }
    .boxed()
    .shared()
  }

  async fn run_fetch(
    inner: Arc<Self>,
    key: CacheKey,
    generation: u64,
    since: Option<DateTime<Utc>>,
  ) -> FlightResult<P::Payload> {
    inner.emit(SyncEvent::FetchStarted { key: key.clone() });

    let params = FetchParams {
      user_id: key.user_id.clone(),
      bucket: key.bucket.clone(),
      since,
      until: inner.ctx.clock.now(),
    };

    let timeout = inner.policy.fetch_timeout;
    let fetched = match tokio::time::timeout(timeout, inner.provider.fetch(&params)).await {
      Ok(result) => result,
      Err(_) => Err(ProviderError::Timeout(timeout)),
    };
    let fetched = fetched.and_then(|payload| {
      payload
        .validate()
        .map(|()| payload)
        .map_err(ProviderError::Malformed)
    });

    match fetched {
      Ok(payload) => inner.complete_success(&key, generation, payload).await,
      Err(error) => inner.complete_failure(&key, generation, error),
    }
  }

  async fn complete_success(&self, key: &CacheKey, generation: u64, payload: P::Payload) -> FlightResult<P::Payload> {
    let snapshot = Arc::new(Snapshot::new(payload, self.ctx.clock.now()));

    let admitted = {
      let mut state = self.lock();
      // Checked under the state lock: invalidate() clears after the
      // generation moves, so a stale result can never land in the store.
      if self.ctx.session.is_current(generation) {
        state
          .store
          .put(key, Tier::Memory, Arc::clone(&snapshot), to_chrono(self.policy.memory_ttl));
        state
          .store
          .put(key, Tier::Persisted, Arc::clone(&snapshot), to_chrono(self.policy.persisted_ttl));
        state.hydrated.insert(key.clone());

        let key_state = state.keys.entry(key.clone()).or_default();
        key_state.fetch = FetchState::Idle;
        key_state.failures = 0;
        true
      } else {
        false
      }
    };

    if !admitted {
      self.emit(SyncEvent::FetchDiscarded { key: key.clone() });
      return FlightResult::Discarded;
    }

    self.persist(key, &snapshot, generation).await;
    self.hub.publish(key, Update::data(Arc::clone(&snapshot)), generation);
    self.emit(SyncEvent::FetchSucceeded { key: key.clone() });
    FlightResult::Fetched(snapshot)
  }

  fn complete_failure(&self, key: &CacheKey, generation: u64, error: ProviderError) -> FlightResult<P::Payload> {
    let now = self.ctx.clock.now();

    let latest = {
      let mut state = self.lock();
      if self.ctx.session.is_current(generation) {
        let latest = state.store.latest(key);
        let key_state = state.keys.entry(key.clone()).or_default();
        if !error.is_retriable() {
          key_state.fetch = FetchState::Idle;
        } else {
          key_state.failures = key_state.failures.saturating_add(1);
          let mut wait = self.policy.backoff(key_state.failures);
          if let Some(retry_after) = error.retry_after() {
            wait = wait.max(retry_after);
          }
          key_state.fetch = FetchState::Cooldown {
            until: now + to_chrono(wait),
            cause: error.clone(),
          };
        }
        Some(latest)
      } else {
        None
      }
    };

    let Some(latest) = latest else {
      self.emit(SyncEvent::FetchDiscarded { key: key.clone() });
      return FlightResult::Discarded;
    };

    self.emit(SyncEvent::FetchFailed {
      key: key.clone(),
      error: error.clone(),
      fallback: latest.is_some(),
    });
    self.hub.publish(key, Update::failed(latest, error.clone()), generation);
    FlightResult::Failed(error)
  }

  async fn persist(&self, key: &CacheKey, snapshot: &Snapshot<P::Payload>, generation: u64) {
    let bytes = match serde_json::to_vec(snapshot) {
      Ok(bytes) => bytes,
      Err(e) => {
        tracing::warn!(key = %key, payload = P::Payload::payload_type(), error = %e, "Failed to serialize snapshot");
        return;
      }
    };

    let namespace = key.namespace();
    let record = key.cache_hash();
    if let Err(e) = self.ctx.persistence.put(&namespace, &record, bytes).await {
      tracing::warn!(key = %key, error = %e, "Failed to persist snapshot");
      return;
    }

    // Sign-out may have purged the namespace while we were writing.
    if !self.ctx.session.is_current(generation) {
      if let Err(e) = self.ctx.persistence.delete(&namespace, &record).await {
        tracing::warn!(key = %key, error = %e, "Failed to remove snapshot written after sign-out");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, MemoryPersistence, PersistenceAdapter};
  use crate::sync::{Clock, ManualClock, RecordingObserver, SessionScope};
  use async_trait::async_trait;
  use chrono::TimeZone;
  use serde::{Deserialize, Serialize};
  use std::collections::VecDeque;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
  struct Steps {
    steps: u32,
  }

  impl Payload for Steps {
    fn payload_type() -> &'static str {
      "steps"
    }

    fn validate(&self) -> Result<(), String> {
      if self.steps == u32::MAX {
        Err("sentinel step count".to_string())
      } else {
        Ok(())
      }
    }
  }

  /// Provider that replays scripted responses and counts calls.
  #[derive(Default)]
  struct ScriptedProvider {
    calls: AtomicUsize,
    script: Mutex<VecDeque<Result<Steps, ProviderError>>>,
    delay: Option<Duration>,
    gate: Option<Arc<Notify>>,
  }

  impl ScriptedProvider {
    fn new(script: Vec<Result<Steps, ProviderError>>) -> Self {
      Self {
        script: Mutex::new(script.into()),
        ..Default::default()
      }
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl ProviderClient for ScriptedProvider {
    type Payload = Steps;

    fn name(&self) -> &'static str {
      "fitness"
    }

    async fn fetch(&self, _params: &FetchParams) -> Result<Steps, ProviderError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(gate) = &self.gate {
        gate.notified().await;
      }
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      self
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(Err(ProviderError::NetworkUnavailable("script exhausted".into())))
    }
  }

  struct Harness {
    provider: Arc<ScriptedProvider>,
    coordinator: FetchCoordinator<ScriptedProvider>,
    clock: ManualClock,
    session: Arc<SessionScope>,
    persistence: Arc<MemoryPersistence>,
    observer: Arc<RecordingObserver>,
    key: CacheKey,
  }

  fn harness(provider: ScriptedProvider, policy: CoordinatorPolicy) -> Harness {
    let provider = Arc::new(provider);
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 10, 15, 8, 0, 0).unwrap());
    let persistence = Arc::new(MemoryPersistence::new());
    let observer = Arc::new(RecordingObserver::new());
    let ctx = SyncContext::new(persistence.clone())
      .with_clock(Arc::new(clock.clone()))
      .with_observer(observer.clone());
    let session = Arc::clone(&ctx.session);
    session.sign_in("alice");

    Harness {
      coordinator: FetchCoordinator::new(Arc::clone(&provider), policy, ctx),
      provider,
      clock,
      session,
      persistence,
      observer,
      key: CacheKey::new("fitness", "alice"),
    }
  }

  fn steps(n: u32) -> Result<Steps, ProviderError> {
    Ok(Steps { steps: n })
  }

  fn offline() -> Result<Steps, ProviderError> {
    Err(ProviderError::NetworkUnavailable("offline".into()))
  }

  #[tokio::test]
  async fn test_concurrent_refreshes_share_one_fetch() {
    let provider = ScriptedProvider {
      delay: Some(Duration::from_millis(50)),
      ..ScriptedProvider::new(vec![steps(1000)])
    };
    let h = harness(provider, CoordinatorPolicy::fitness());

    let results = futures::future::join_all((0..5).map(|_| h.coordinator.refresh(&h.key, false))).await;

    assert_eq!(h.provider.calls(), 1);
    let first = results[0].as_ref().unwrap().snapshot.clone();
    for result in &results {
      let outcome = result.as_ref().unwrap();
      assert_eq!(outcome.source, CacheSource::Network);
      assert!(Arc::ptr_eq(&outcome.snapshot, &first));
    }
    assert_eq!(h.observer.count("fetch_joined"), 4);
  }

  #[tokio::test]
  async fn test_forced_refresh_joins_in_flight_fetch() {
    let provider = ScriptedProvider {
      delay: Some(Duration::from_millis(50)),
      ..ScriptedProvider::new(vec![steps(1), steps(2)])
    };
    let h = harness(provider, CoordinatorPolicy::fitness());

    let (a, b) = tokio::join!(
      h.coordinator.refresh(&h.key, false),
      h.coordinator.force_refresh(&h.key)
    );

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(a.unwrap().snapshot.data.steps, 1);
    assert_eq!(b.unwrap().snapshot.data.steps, 1);
  }

  #[tokio::test]
  async fn test_cache_hit_within_ttl() {
    let h = harness(ScriptedProvider::new(vec![steps(1000)]), CoordinatorPolicy::fitness());

    let first = h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(10));
    let second = h.coordinator.refresh(&h.key, false).await.unwrap();

    assert_eq!(h.provider.calls(), 1);
    assert_eq!(second.source, CacheSource::Memory);
    assert!(Arc::ptr_eq(&first.snapshot, &second.snapshot));
    assert_eq!(
      serde_json::to_vec(&*first.snapshot).unwrap(),
      serde_json::to_vec(&*second.snapshot).unwrap()
    );
  }

  #[tokio::test]
  async fn test_stale_entry_triggers_one_fetch() {
    let h = harness(
      ScriptedProvider::new(vec![steps(1000), steps(1500)]),
      CoordinatorPolicy::fitness(),
    );

    h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(31));
    let outcome = h.coordinator.refresh(&h.key, false).await.unwrap();

    assert_eq!(h.provider.calls(), 2);
    assert_eq!(outcome.source, CacheSource::Network);
    assert_eq!(outcome.snapshot.data.steps, 1500);
  }

  #[tokio::test]
  async fn test_failure_falls_back_to_last_snapshot() {
    let h = harness(ScriptedProvider::new(vec![steps(1000), offline()]), CoordinatorPolicy::fitness());

    let first = h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::minutes(5));
    let outcome = h.coordinator.refresh(&h.key, false).await.unwrap();

    assert!(outcome.is_fallback());
    assert!(Arc::ptr_eq(&outcome.snapshot, &first.snapshot));
    assert!(matches!(outcome.error, Some(ProviderError::NetworkUnavailable(_))));

    let published = h.coordinator.current(&h.key);
    assert_eq!(published.snapshot.unwrap().data.steps, 1000);
    assert!(published.error.is_some());
  }

  #[tokio::test]
  async fn test_first_failure_propagates() {
    let h = harness(ScriptedProvider::new(vec![offline()]), CoordinatorPolicy::fitness());

    let err = h.coordinator.refresh(&h.key, false).await.unwrap_err();
    assert!(matches!(
      err,
      SyncError::Provider(ProviderError::NetworkUnavailable(_))
    ));

    let published = h.coordinator.current(&h.key);
    assert!(published.snapshot.is_none());
    assert!(published.error.is_some());
  }

  #[tokio::test]
  async fn test_cooldown_suppresses_calls_until_backoff_elapses() {
    let h = harness(
      ScriptedProvider::new(vec![steps(1), offline(), steps(2)]),
      CoordinatorPolicy::fitness(),
    );

    h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(31));
    assert!(h.coordinator.refresh(&h.key, false).await.unwrap().is_fallback());
    assert!(matches!(h.coordinator.status(&h.key), FetchStatus::Cooldown { .. }));

    // Within the 5s backoff: no call
    h.clock.advance(chrono::Duration::seconds(2));
    assert!(h.coordinator.refresh(&h.key, false).await.unwrap().is_fallback());
    assert_eq!(h.provider.calls(), 2);

    h.clock.advance(chrono::Duration::seconds(4));
    let outcome = h.coordinator.refresh(&h.key, false).await.unwrap();
    assert_eq!(outcome.snapshot.data.steps, 2);
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(h.coordinator.status(&h.key), FetchStatus::Idle);
  }

  #[tokio::test]
  async fn test_status_returns_to_idle_once_backoff_elapses() {
    let h = harness(ScriptedProvider::new(vec![offline()]), CoordinatorPolicy::fitness());

    h.coordinator.refresh(&h.key, false).await.unwrap_err();
    let FetchStatus::Cooldown { until } = h.coordinator.status(&h.key) else {
      panic!("expected a cooldown after the failure");
    };
    assert_eq!(until, h.clock.now() + chrono::Duration::seconds(5));

    h.clock.advance(chrono::Duration::seconds(5));
    assert_eq!(h.coordinator.status(&h.key), FetchStatus::Idle);
    assert_eq!(h.provider.calls(), 1);
  }

  #[tokio::test]
  async fn test_forced_refresh_honors_rate_limit_cooldown() {
    let limited = Err(ProviderError::RateLimited {
      retry_after: Duration::from_secs(60),
    });
    let h = harness(
      ScriptedProvider::new(vec![steps(1), limited, steps(2)]),
      CoordinatorPolicy::fitness(),
    );

    h.coordinator.refresh(&h.key, false).await.unwrap();
    h.coordinator.force_refresh(&h.key).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(30));

    let outcome = h.coordinator.force_refresh(&h.key).await.unwrap();
    assert!(outcome.is_fallback());
    assert_eq!(h.provider.calls(), 2);

    h.clock.advance(chrono::Duration::seconds(31));
    let outcome = h.coordinator.force_refresh(&h.key).await.unwrap();
    assert_eq!(outcome.snapshot.data.steps, 2);
  }

  #[tokio::test]
  async fn test_unauthorized_surfaces_without_cooldown() {
    let h = harness(
      ScriptedProvider::new(vec![steps(1), Err(ProviderError::Unauthorized), steps(2)]),
      CoordinatorPolicy::fitness(),
    );

    h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(31));

    let err = h.coordinator.refresh(&h.key, false).await.unwrap_err();
    assert!(matches!(err, SyncError::Provider(ProviderError::Unauthorized)));
    assert_eq!(h.coordinator.status(&h.key), FetchStatus::Idle);

    // No backoff: the next refresh goes straight to the provider
    let outcome = h.coordinator.refresh(&h.key, false).await.unwrap();
    assert_eq!(outcome.snapshot.data.steps, 2);
  }

  #[tokio::test]
  async fn test_malformed_payload_is_never_cached() {
    let h = harness(
      ScriptedProvider::new(vec![steps(10), steps(u32::MAX)]),
      CoordinatorPolicy::fitness(),
    );

    h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::seconds(31));
    let outcome = h.coordinator.force_refresh(&h.key).await.unwrap();

    assert!(matches!(outcome.error, Some(ProviderError::Malformed(_))));
    assert_eq!(outcome.snapshot.data.steps, 10);
    assert_eq!(h.coordinator.cached(&h.key, Tier::Memory).unwrap().data.steps, 10);
  }

  #[tokio::test]
  async fn test_propagate_policy_skips_fallback() {
    let policy = CoordinatorPolicy {
      serve_stale_on_error: false,
      ..CoordinatorPolicy::chat()
    };
    let h = harness(ScriptedProvider::new(vec![steps(1), offline()]), policy);

    h.coordinator.refresh(&h.key, false).await.unwrap();
    let err = h.coordinator.force_refresh(&h.key).await.unwrap_err();
    assert!(matches!(err, SyncError::Provider(_)));
  }

  #[tokio::test]
  async fn test_timeout_is_a_transient_failure() {
    let provider = ScriptedProvider {
      delay: Some(Duration::from_millis(200)),
      ..ScriptedProvider::new(vec![steps(1)])
    };
    let policy = CoordinatorPolicy {
      fetch_timeout: Duration::from_millis(20),
      ..CoordinatorPolicy::fitness()
    };
    let h = harness(provider, policy);

    let err = h.coordinator.refresh(&h.key, false).await.unwrap_err();
    assert!(matches!(err, SyncError::Provider(ProviderError::Timeout(_))));
    assert!(matches!(h.coordinator.status(&h.key), FetchStatus::Cooldown { .. }));
  }

  #[tokio::test]
  async fn test_persisted_tier_serves_a_fresh_coordinator() {
    let h = harness(ScriptedProvider::new(vec![steps(800)]), CoordinatorPolicy::chat());
    h.coordinator.refresh(&h.key, false).await.unwrap();

    // Same device store, new process: memory is empty.
    let restarted_provider = Arc::new(ScriptedProvider::new(vec![steps(900)]));
    let ctx = SyncContext {
      persistence: h.persistence.clone(),
      session: Arc::clone(&h.session),
      clock: Arc::new(h.clock.clone()),
      observer: h.observer.clone(),
    };
    let restarted = FetchCoordinator::new(Arc::clone(&restarted_provider), CoordinatorPolicy::chat(), ctx);

    h.clock.advance(chrono::Duration::minutes(10));
    let outcome = restarted.refresh(&h.key, false).await.unwrap();
    assert_eq!(outcome.source, CacheSource::Persisted);
    assert_eq!(outcome.snapshot.data.steps, 800);
    assert_eq!(restarted_provider.calls(), 0);
    assert_eq!(restarted.current(&h.key).snapshot.unwrap().data.steps, 800);
  }

  #[tokio::test]
  async fn test_forced_failure_falls_back_to_persisted_record() {
    let h = harness(ScriptedProvider::new(vec![]), CoordinatorPolicy::fitness());
    let stored = Snapshot::new(Steps { steps: 42 }, h.clock.now());
    h.persistence
      .put(
        &h.key.namespace(),
        &h.key.cache_hash(),
        serde_json::to_vec(&stored).unwrap(),
      )
      .await
      .unwrap();

    let outcome = h.coordinator.force_refresh(&h.key).await.unwrap();
    assert!(outcome.is_fallback());
    assert_eq!(outcome.snapshot.data.steps, 42);
  }

  #[tokio::test]
  async fn test_peek_never_fetches() {
    let h = harness(ScriptedProvider::new(vec![steps(5)]), CoordinatorPolicy::fitness());
    assert!(h.coordinator.peek(&h.key).await.unwrap().is_none());

    h.coordinator.refresh(&h.key, false).await.unwrap();
    h.clock.advance(chrono::Duration::hours(1));
    assert_eq!(h.coordinator.peek(&h.key).await.unwrap().unwrap().data.steps, 5);
    assert_eq!(h.provider.calls(), 1);
  }

  #[tokio::test]
  async fn test_replay_on_subscribe() {
    let h = harness(ScriptedProvider::new(vec![steps(1000)]), CoordinatorPolicy::fitness());
    h.coordinator.refresh(&h.key, false).await.unwrap();

    let sub = h.coordinator.subscribe(&h.key);
    assert_eq!(sub.current().snapshot.unwrap().data.steps, 1000);
    assert_eq!(h.provider.calls(), 1);
  }

  #[tokio::test]
  async fn test_sign_out_discards_in_flight_result() {
    let gate = Arc::new(Notify::new());
    let provider = ScriptedProvider {
      gate: Some(Arc::clone(&gate)),
      ..ScriptedProvider::new(vec![steps(1000)])
    };
    let h = harness(provider, CoordinatorPolicy::fitness());
    let sub = h.coordinator.subscribe(&h.key);

    let coordinator = h.coordinator.clone();
    let key = h.key.clone();
    let pending = tokio::spawn(async move { coordinator.refresh(&key, false).await });

    while h.provider.calls() == 0 {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    h.session.sign_out();
    h.coordinator.invalidate();
    gate.notify_one();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(SyncError::Discarded)));
    assert!(sub.current().is_empty());
    assert!(h.coordinator.cached(&h.key, Tier::Memory).is_none());
    assert_eq!(
      h.persistence
        .get(&h.key.namespace(), &h.key.cache_hash())
        .await
        .unwrap(),
      None
    );
    assert_eq!(h.observer.count("fetch_discarded"), 1);

    h.session.sign_in("bob");
    let err = h.coordinator.refresh(&h.key, false).await.unwrap_err();
    assert!(matches!(err, SyncError::SessionMismatch { .. }));
  }

  #[tokio::test]
  async fn test_ttl_scenario() {
    let h = harness(
      ScriptedProvider::new(vec![steps(1000), steps(1200), steps(1300)]),
      CoordinatorPolicy::fitness(),
    );

    // t=0: first fetch
    h.coordinator.refresh(&h.key, false).await.unwrap();

    // t=1,5,10: three screens subscribe and render immediately
    let mut screens = Vec::new();
    for at in [1, 5, 10] {
      h.clock.set(Utc.with_ymd_and_hms(2026, 10, 15, 8, 0, at).unwrap());
      let sub = h.coordinator.subscribe(&h.key);
      assert_eq!(sub.current().snapshot.unwrap().data.steps, 1000);
      screens.push(sub);
    }
    assert_eq!(h.provider.calls(), 1);

    // t=15: pull-to-refresh bypasses the TTL
    h.clock.set(Utc.with_ymd_and_hms(2026, 10, 15, 8, 0, 15).unwrap());
    let forced = h.coordinator.force_refresh(&h.key).await.unwrap();
    assert_eq!(forced.snapshot.data.steps, 1200);
    assert_eq!(h.provider.calls(), 2);
    for screen in &screens {
      assert_eq!(screen.current().snapshot.unwrap().data.steps, 1200);
    }

    // t=45: background timer, past the TTL
    h.clock.set(Utc.with_ymd_and_hms(2026, 10, 15, 8, 0, 45).unwrap());
    h.coordinator.refresh(&h.key, false).await.unwrap();
    assert_eq!(h.provider.calls(), 3);
  }

  #[test]
  fn test_backoff_doubles_up_to_max() {
    let policy = CoordinatorPolicy::default();
    assert_eq!(policy.backoff(1), Duration::from_secs(5));
    assert_eq!(policy.backoff(2), Duration::from_secs(10));
    assert_eq!(policy.backoff(3), Duration::from_secs(20));
    assert_eq!(policy.backoff(30), Duration::from_secs(300));
  }
}
