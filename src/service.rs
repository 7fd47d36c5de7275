//! The app-facing surface: one coordinator per provider, the background
//! scheduler and chat history pruning, all scoped to the signed-in user.

use chrono::NaiveDate;
use color_eyre::Result;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::cache::{CacheKey, RefreshOutcome};
use crate::provider::{ChatSessions, FitnessDay, ProviderClient, SessionDeleter};
use crate::sync::{
  BackgroundScheduler, CoordinatorPolicy, EvictionPolicy, FetchCoordinator, HistoryPruner, Lifecycle, SessionMeta,
  Subscription, SyncContext, SyncError,
};

/// Tunables for a `SyncService`.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
  pub fitness_policy: CoordinatorPolicy,
  pub chat_policy: CoordinatorPolicy,
  pub fitness_interval: Duration,
  pub chat_interval: Duration,
  pub history: EvictionPolicy,
  /// Remove the user's device-store namespace on sign-out
  pub purge_on_sign_out: bool,
}

impl Default for ServiceSettings {
  fn default() -> Self {
    Self {
      fitness_policy: CoordinatorPolicy::fitness(),
      chat_policy: CoordinatorPolicy::chat(),
      fitness_interval: Duration::from_secs(2 * 60),
      chat_interval: Duration::from_secs(15 * 60),
      history: EvictionPolicy::default(),
      purge_on_sign_out: true,
    }
  }
}

pub struct SyncService<F, C>
where
  F: ProviderClient<Payload = FitnessDay>,
  C: ProviderClient<Payload = ChatSessions>,
{
  ctx: SyncContext,
  settings: ServiceSettings,
  fitness: FetchCoordinator<F>,
  chat: FetchCoordinator<C>,
  scheduler: BackgroundScheduler,
  pruner: HistoryPruner,
  /// Fitness day currently kept fresh in the background
  watched_day: Mutex<Option<CacheKey>>,
}

impl<F, C> SyncService<F, C>
where
  F: ProviderClient<Payload = FitnessDay>,
  C: ProviderClient<Payload = ChatSessions>,
{
  pub fn new(
    fitness: Arc<F>,
    chat: Arc<C>,
    deleter: Arc<dyn SessionDeleter>,
    settings: ServiceSettings,
    ctx: SyncContext,
  ) -> Self {
    let fitness = FetchCoordinator::new(fitness, settings.fitness_policy.clone(), ctx.clone());
    let chat = FetchCoordinator::new(chat, settings.chat_policy.clone(), ctx.clone());

    let scheduler = BackgroundScheduler::new();
    scheduler.register(fitness.provider_name(), Arc::new(fitness.clone()));
    scheduler.register(chat.provider_name(), Arc::new(chat.clone()));

    let pruner = HistoryPruner::new(
      settings.history,
      Arc::clone(&ctx.persistence),
      deleter,
      Arc::clone(&ctx.session),
      Arc::clone(&ctx.observer),
    );

    Self {
      ctx,
      settings,
      fitness,
      chat,
      scheduler,
      pruner,
      watched_day: Mutex::new(None),
    }
  }

  pub fn fitness(&self) -> &FetchCoordinator<F> {
    &self.fitness
  }

  pub fn chat(&self) -> &FetchCoordinator<C> {
    &self.chat
  }

  pub fn scheduler(&self) -> &BackgroundScheduler {
    &self.scheduler
  }

  pub fn current_user(&self) -> Option<String> {
    self.ctx.session.current_user()
  }

  /// Sign `user_id` in and start refreshing the chat session list in the
  /// background. Signing in over another user signs that user out first.
  pub async fn sign_in(&self, user_id: &str) -> Result<()> {
    if let Some(previous) = self.current_user() {
      if previous == user_id {
        return Ok(());
      }
      self.sign_out().await?;
    }

    let generation = self.ctx.session.sign_in(user_id);
    tracing::info!(user = user_id, generation, "Signed in");

    let chat_key = self.chat_key()?;
    self.scheduler.start(&chat_key, self.settings.chat_interval)?;
    Ok(())
  }

  /// Sign out: stop every timer, drop all cached tiers and subscriber state,
  /// and discard results of fetches still in flight.
  pub async fn sign_out(&self) -> Result<()> {
    let Some(user) = self.ctx.session.sign_out() else {
      return Ok(());
    };

    self.scheduler.stop_all();
    *self.watched_day.lock().unwrap_or_else(PoisonError::into_inner) = None;
    self.fitness.invalidate();
    self.chat.invalidate();

    if self.settings.purge_on_sign_out {
      self.pruner.purge(&user).await?;
    }
    tracing::info!(user = %user, "Signed out");
    Ok(())
  }

  pub fn set_lifecycle(&self, lifecycle: Lifecycle) {
    self.scheduler.set_lifecycle(lifecycle);
  }

  pub fn fitness_key(&self, date: NaiveDate) -> Result<CacheKey, SyncError> {
    self
      .fitness
      .key_for_current_user(Some(&date.format("%Y-%m-%d").to_string()))
  }

  pub fn chat_key(&self) -> Result<CacheKey, SyncError> {
    self.chat.key_for_current_user(None)
  }

  pub fn subscribe_fitness(&self, date: NaiveDate) -> Result<Subscription<FitnessDay>, SyncError> {
    Ok(self.fitness.subscribe(&self.fitness_key(date)?))
  }

  pub fn subscribe_chat(&self) -> Result<Subscription<ChatSessions>, SyncError> {
    Ok(self.chat.subscribe(&self.chat_key()?))
  }

  /// Subscribe to `date` and keep it fresh in the background, replacing the
  /// previously watched day.
  pub fn watch_fitness_day(&self, date: NaiveDate) -> Result<Subscription<FitnessDay>, SyncError> {
    let key = self.fitness_key(date)?;
    let previous = self
      .watched_day
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(key.clone());
    if let Some(previous) = previous.filter(|p| *p != key) {
      self.scheduler.stop(&previous);
    }

    self.scheduler.start(&key, self.settings.fitness_interval)?;
    Ok(self.fitness.subscribe(&key))
  }

  pub async fn refresh_fitness(&self, date: NaiveDate, force: bool) -> Result<RefreshOutcome<FitnessDay>, SyncError> {
    let key = self.fitness_key(date)?;
    self.fitness.refresh(&key, force).await
  }

  pub async fn refresh_chat(&self, force: bool) -> Result<RefreshOutcome<ChatSessions>, SyncError> {
    let key = self.chat_key()?;
    self.chat.refresh(&key, force).await
  }

  /// Note a chat session the user just wrote to, pruning history that no
  /// longer fits. Returns the evicted sessions.
  pub async fn record_chat_session(&self, meta: SessionMeta) -> Result<Vec<SessionMeta>> {
    let user = self.current_user().ok_or(SyncError::NotSignedIn)?;
    self.pruner.record(&user, meta).await
  }
}
