//! Offline-first sync core for a nutrition tracker.
//!
//! Many screens read the same fitness and chat data. `SyncService` keeps one
//! cached, single-flight view of each source per signed-in user, replays the
//! latest value to new subscribers and falls back to last-known-good data
//! when a provider is unreachable.

pub mod cache;
pub mod config;
pub mod logging;
pub mod provider;
pub mod service;
pub mod sync;

pub use service::{ServiceSettings, SyncService};
