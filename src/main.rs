use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use nutrisync::cache::{MemoryPersistence, NoopPersistence, PersistenceAdapter, RefreshOutcome, SqlitePersistence};
use nutrisync::config::{Config, StorageBackend};
use nutrisync::provider::{ChatSessionClient, ChatSessions, FitnessClient, FitnessDay};
use nutrisync::sync::{CoordinatorPolicy, FetchStatus, Lifecycle, SyncContext, TracingObserver, Update};
use nutrisync::{logging, ServiceSettings, SyncService};

type Service = SyncService<FitnessClient, ChatSessionClient>;

#[derive(Parser, Debug)]
#[command(name = "nutrisync")]
#[command(about = "Offline-first sync for fitness and coaching data")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/nutrisync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User to sign in as
  #[arg(short, long)]
  user: String,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Subscribe and print every update until the time runs out
  Watch {
    #[arg(short, long, value_enum, default_value_t = Source::All)]
    provider: Source,
    #[arg(short, long, default_value_t = 300)]
    seconds: u64,
  },
  /// Refresh once and print the outcome
  Refresh {
    #[arg(short, long, value_enum, default_value_t = Source::All)]
    provider: Source,
    /// Bypass the cache TTL
    #[arg(short, long)]
    force: bool,
  },
  /// Show what is cached for the user
  Status,
  /// Sign out and drop the user's cached data
  SignOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
  Fitness,
  Chat,
  All,
}

impl Source {
  fn fitness(self) -> bool {
    matches!(self, Source::Fitness | Source::All)
  }

  fn chat(self) -> bool {
    matches!(self, Source::Chat | Source::All)
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let service = build_service(&config)?;
  // Only `watch` keeps running long enough for background refresh to matter.
  if !matches!(args.command, Command::Watch { .. }) {
    service.set_lifecycle(Lifecycle::Background);
  }
  service.sign_in(&args.user).await?;
  let today = Local::now().date_naive();

  match args.command {
    Command::Watch { provider, seconds } => watch(&service, today, provider, seconds).await?,
    Command::Refresh { provider, force } => {
      if provider.fitness() {
        print_fitness(&service.refresh_fitness(today, force).await?);
      }
      if provider.chat() {
        print_chat(&service.refresh_chat(force).await?);
      }
    }
    Command::Status => status(&service, today).await?,
    Command::SignOut => {
      service.sign_out().await?;
      println!("Signed out {}", args.user);
    }
  }

  Ok(())
}

fn build_service(config: &Config) -> Result<Service> {
  let persistence: Arc<dyn PersistenceAdapter> = match config.storage.backend {
    StorageBackend::Sqlite => match &config.storage.path {
      Some(path) => Arc::new(SqlitePersistence::open_at(path)?),
      None => Arc::new(SqlitePersistence::open()?),
    },
    StorageBackend::Memory => Arc::new(MemoryPersistence::new()),
    StorageBackend::Off => Arc::new(NoopPersistence),
  };
  let ctx = SyncContext::new(persistence).with_observer(Arc::new(TracingObserver::new(config.logging.sync_events)));

  let fitness = Arc::new(FitnessClient::new(
    &config.fitness.http_settings(Config::fitness_token()?),
  )?);
  let chat = Arc::new(ChatSessionClient::new(
    &config.chat.provider.http_settings(Config::chat_token()?),
  )?);

  let defaults = ServiceSettings::default();
  let settings = ServiceSettings {
    fitness_policy: config.fitness.policy(CoordinatorPolicy::fitness()),
    chat_policy: config.chat.provider.policy(CoordinatorPolicy::chat()),
    fitness_interval: config.fitness.interval(defaults.fitness_interval),
    chat_interval: config.chat.provider.interval(defaults.chat_interval),
    history: config.chat.history.policy(),
    purge_on_sign_out: config.storage.purge_on_sign_out,
  };

  Ok(SyncService::new(fitness, Arc::clone(&chat), chat, settings, ctx))
}

async fn watch(service: &Service, today: NaiveDate, source: Source, seconds: u64) -> Result<()> {
  let mut fitness = service.watch_fitness_day(today)?;
  let mut chat = service.subscribe_chat()?;

  if source.fitness() {
    print_fitness_update(&fitness.current());
  }
  if source.chat() {
    print_chat_update(&chat.current());
  }

  let deadline = tokio::time::sleep(Duration::from_secs(seconds));
  tokio::pin!(deadline);

  loop {
    tokio::select! {
      _ = &mut deadline => break,
      update = fitness.changed(), if source.fitness() => match update {
        Some(update) => print_fitness_update(&update),
        None => break,
      },
      update = chat.changed(), if source.chat() => match update {
        Some(update) => print_chat_update(&update),
        None => break,
      },
    }
  }

  Ok(())
}

async fn status(service: &Service, today: NaiveDate) -> Result<()> {
  let fitness_key = service.fitness_key(today)?;
  let chat_key = service.chat_key()?;

  for (key, status) in [
    (&fitness_key, service.fitness().status(&fitness_key)),
    (&chat_key, service.chat().status(&chat_key)),
  ] {
    let status = match status {
      FetchStatus::Idle => "idle".to_string(),
      FetchStatus::InFlight => "fetching".to_string(),
      FetchStatus::Cooldown { until } => format!("cooling down until {}", until.with_timezone(&Local)),
    };
    println!("{}: {}", key, status);
  }

  match service.fitness().peek(&fitness_key).await? {
    Some(snapshot) => print_fitness_update(&Update::data(snapshot)),
    None => println!("[fitness] nothing cached"),
  }
  match service.chat().peek(&chat_key).await? {
    Some(snapshot) => print_chat_update(&Update::data(snapshot)),
    None => println!("[chat] nothing cached"),
  }
  Ok(())
}

fn print_fitness(outcome: &RefreshOutcome<FitnessDay>) {
  let day = &outcome.snapshot.data;
  println!(
    "[fitness {:?}] {}: {} steps, {:.0} kcal, {} workouts ({} min), fetched {}",
    outcome.source,
    day.date,
    day.steps,
    day.calories_burned,
    day.workout_count,
    day.workout_duration_minutes,
    outcome.snapshot.fetched_at.with_timezone(&Local),
  );
  if let Some(error) = &outcome.error {
    println!("  (showing cached data: {})", error);
  }
}

fn print_chat(outcome: &RefreshOutcome<ChatSessions>) {
  println!(
    "[chat {:?}] {} sessions, fetched {}",
    outcome.source,
    outcome.snapshot.data.sessions.len(),
    outcome.snapshot.fetched_at.with_timezone(&Local),
  );
  for session in &outcome.snapshot.data.sessions {
    println!(
      "  {} {} ({} messages, last {})",
      session.id,
      session.title.as_deref().unwrap_or("untitled"),
      session.message_count,
      session.last_message_at.with_timezone(&Local),
    );
  }
  if let Some(error) = &outcome.error {
    println!("  (showing cached data: {})", error);
  }
}

fn print_fitness_update(update: &Update<FitnessDay>) {
  match (&update.snapshot, &update.error) {
    (None, None) => println!("[fitness] no data yet"),
    (None, Some(error)) => println!("[fitness] unavailable: {}", error),
    (Some(snapshot), error) => {
      let day = &snapshot.data;
      println!(
        "[fitness] {}: {} steps, {:.0} kcal{}",
        day.date,
        day.steps,
        day.calories_burned,
        error.as_ref().map(|e| format!(" (stale: {})", e)).unwrap_or_default(),
      );
    }
  }
}

fn print_chat_update(update: &Update<ChatSessions>) {
  match (&update.snapshot, &update.error) {
    (None, None) => println!("[chat] no data yet"),
    (None, Some(error)) => println!("[chat] unavailable: {}", error),
    (Some(snapshot), error) => println!(
      "[chat] {} sessions{}",
      snapshot.data.sessions.len(),
      error.as_ref().map(|e| format!(" (stale: {})", e)).unwrap_or_default(),
    ),
  }
}
