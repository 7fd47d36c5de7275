use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::provider::HttpSettings;
use crate::sync::{CoordinatorPolicy, EventVerbosity, EvictionPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub fitness: ProviderConfig,
  pub chat: ChatConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

/// Connection and freshness settings for one REST provider.
///
/// Durations are whole seconds. Anything left out falls back to the
/// provider's defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
  pub base_url: String,
  pub memory_ttl_secs: Option<u64>,
  pub persisted_ttl_secs: Option<u64>,
  /// Background refresh period
  pub interval_secs: Option<u64>,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  #[serde(default = "default_backoff_base_secs")]
  pub backoff_base_secs: u64,
  #[serde(default = "default_backoff_max_secs")]
  pub backoff_max_secs: u64,
  #[serde(default = "default_true")]
  pub serve_stale_on_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatConfig {
  #[serde(flatten)]
  pub provider: ProviderConfig,
  #[serde(default)]
  pub history: HistoryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
  #[serde(default = "default_max_sessions")]
  pub max_sessions: usize,
  #[serde(default = "default_max_messages")]
  pub max_messages: u64,
}

impl Default for HistoryConfig {
  fn default() -> Self {
    Self {
      max_sessions: default_max_sessions(),
      max_messages: default_max_messages(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite file on disk
  #[default]
  Sqlite,
  /// Nothing survives a restart
  Memory,
  /// Persisted tier disabled
  Off,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
  #[serde(default)]
  pub backend: StorageBackend,
  /// Defaults to $XDG_DATA_HOME/nutrisync/cache.db
  pub path: Option<PathBuf>,
  /// Delete the user's cached records when they sign out
  #[serde(default = "default_true")]
  pub purge_on_sign_out: bool,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      backend: StorageBackend::default(),
      path: None,
      purge_on_sign_out: true,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write to a daily rolling file instead of stderr
  #[serde(default = "default_true")]
  pub file: bool,
  /// Defaults to $XDG_DATA_HOME/nutrisync/logs
  pub directory: Option<PathBuf>,
  #[serde(default)]
  pub sync_events: EventVerbosity,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: true,
      directory: None,
      sync_events: EventVerbosity::default(),
    }
  }
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_backoff_base_secs() -> u64 {
  5
}

fn default_backoff_max_secs() -> u64 {
  300
}

fn default_true() -> bool {
  true
}

fn default_max_sessions() -> usize {
  5
}

fn default_max_messages() -> u64 {
  50
}

fn default_log_level() -> String {
  "info".to_string()
}

impl ProviderConfig {
  /// Coordinator policy, starting from `base` for unset TTLs.
  pub fn policy(&self, base: CoordinatorPolicy) -> CoordinatorPolicy {
    CoordinatorPolicy {
      memory_ttl: self
        .memory_ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(base.memory_ttl),
      persisted_ttl: self
        .persisted_ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(base.persisted_ttl),
      fetch_timeout: Duration::from_secs(self.timeout_secs),
      backoff_base: Duration::from_secs(self.backoff_base_secs),
      backoff_max: Duration::from_secs(self.backoff_max_secs),
      serve_stale_on_error: self.serve_stale_on_error,
    }
  }

  pub fn interval(&self, default: Duration) -> Duration {
    self.interval_secs.map(Duration::from_secs).unwrap_or(default)
  }

  pub fn http_settings(&self, token: String) -> HttpSettings {
    HttpSettings {
      base_url: self.base_url.clone(),
      token,
      timeout: Duration::from_secs(self.timeout_secs),
    }
  }
}

impl HistoryConfig {
  pub fn policy(&self) -> EvictionPolicy {
    EvictionPolicy {
      max_sessions: self.max_sessions,
      max_messages: self.max_messages,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./nutrisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/nutrisync/config.yaml
  /// 4. ~/.config/nutrisync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/nutrisync/config.yaml\n\
                 See config.example.yaml for the format."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("nutrisync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("nutrisync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    serde_yaml::from_str(contents)
  }

  /// Get the fitness provider token from environment variables.
  ///
  /// Checks NUTRISYNC_FITNESS_TOKEN first, then NUTRISYNC_API_TOKEN as fallback.
  pub fn fitness_token() -> Result<String> {
    Self::token("NUTRISYNC_FITNESS_TOKEN")
  }

  /// Get the chat provider token from environment variables.
  ///
  /// Checks NUTRISYNC_CHAT_TOKEN first, then NUTRISYNC_API_TOKEN as fallback.
  pub fn chat_token() -> Result<String> {
    Self::token("NUTRISYNC_CHAT_TOKEN")
  }

  fn token(var: &str) -> Result<String> {
    std::env::var(var)
      .or_else(|_| std::env::var("NUTRISYNC_API_TOKEN"))
      .map_err(|_| eyre!("API token not found. Set {} or NUTRISYNC_API_TOKEN environment variable.", var))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const MINIMAL: &str = r#"
fitness:
  base_url: https://fitness.example.com
chat:
  base_url: https://chat.example.com
"#;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(MINIMAL).unwrap();

    let fitness = config.fitness.policy(CoordinatorPolicy::fitness());
    assert_eq!(fitness.memory_ttl, Duration::from_secs(30));
    assert_eq!(fitness.fetch_timeout, Duration::from_secs(10));
    assert!(fitness.serve_stale_on_error);
    assert_eq!(
      config.fitness.interval(Duration::from_secs(120)),
      Duration::from_secs(120)
    );

    let chat = config.chat.provider.policy(CoordinatorPolicy::chat());
    assert_eq!(chat.persisted_ttl, Duration::from_secs(900));
    assert_eq!(config.chat.history.policy(), EvictionPolicy::default());

    assert_eq!(config.storage.backend, StorageBackend::Sqlite);
    assert!(config.storage.purge_on_sign_out);
    assert_eq!(config.logging.sync_events, EventVerbosity::All);
  }

  #[test]
  fn test_overrides() {
    let config = Config::parse(
      r#"
fitness:
  base_url: https://fitness.example.com
  memory_ttl_secs: 60
  interval_secs: 300
  serve_stale_on_error: false
chat:
  base_url: https://chat.example.com
  history:
    max_sessions: 3
storage:
  backend: memory
logging:
  level: debug
  file: false
  sync_events: failures
"#,
    )
    .unwrap();

    let fitness = config.fitness.policy(CoordinatorPolicy::fitness());
    assert_eq!(fitness.memory_ttl, Duration::from_secs(60));
    assert_eq!(fitness.persisted_ttl, Duration::from_secs(30));
    assert!(!fitness.serve_stale_on_error);
    assert_eq!(
      config.fitness.interval(Duration::from_secs(120)),
      Duration::from_secs(300)
    );
    assert_eq!(config.chat.history.max_sessions, 3);
    assert_eq!(config.chat.history.max_messages, 50);
    assert_eq!(config.storage.backend, StorageBackend::Memory);
    assert!(!config.logging.file);
    assert_eq!(config.logging.sync_events, EventVerbosity::Failures);
  }

  #[test]
  fn test_missing_explicit_path_is_an_error() {
    let err = Config::load(Some(Path::new("/nonexistent/nutrisync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }
}
