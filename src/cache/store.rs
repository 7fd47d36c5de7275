//! In-memory, per-tier TTL store. Pure lookups, no I/O.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

use super::key::CacheKey;
use super::traits::{CacheEntry, Snapshot, Tier};

/// Holds the most recent snapshot per key per tier.
///
/// The persisted tier here is the hydrated mirror of what the
/// `PersistenceAdapter` holds; loading and writing it is the coordinator's job.
#[derive(Debug)]
pub struct CacheStore<T> {
  entries: HashMap<(CacheKey, Tier), CacheEntry<T>>,
}

impl<T> Default for CacheStore<T> {
  fn default() -> Self {
    Self {
      entries: HashMap::new(),
    }
  }
}

impl<T> CacheStore<T> {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &CacheKey, tier: Tier) -> Option<&CacheEntry<T>> {
    self.entries.get(&(key.clone(), tier))
  }

  /// Store a snapshot in a tier, expiring `ttl` after it was fetched.
  ///
  /// Returns false (and keeps the existing entry) if the tier already holds a
  /// newer snapshot.
  pub fn put(&mut self, key: &CacheKey, tier: Tier, snapshot: Arc<Snapshot<T>>, ttl: Duration) -> bool {
    let slot = (key.clone(), tier);
    if let Some(existing) = self.entries.get(&slot) {
      if existing.snapshot.fetched_at > snapshot.fetched_at {
        return false;
      }
    }

    let expires_at = snapshot.fetched_at + ttl;
    self.entries.insert(
      slot,
      CacheEntry {
        snapshot,
        tier,
        expires_at,
      },
    );
    true
  }

  /// A missing entry counts as stale.
  pub fn is_stale(&self, key: &CacheKey, tier: Tier, now: DateTime<Utc>) -> bool {
    self
      .get(key, tier)
      .map(|entry| entry.is_stale(now))
      .unwrap_or(true)
  }

  /// Freshest non-stale entry, memory tier first.
  pub fn fresh(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<&CacheEntry<T>> {
    [Tier::Memory, Tier::Persisted]
      .into_iter()
      .filter_map(|tier| self.get(key, tier))
      .find(|entry| !entry.is_stale(now))
  }

  /// Newest snapshot in any tier, stale or not.
  pub fn latest(&self, key: &CacheKey) -> Option<Arc<Snapshot<T>>> {
    [Tier::Memory, Tier::Persisted]
      .into_iter()
      .filter_map(|tier| self.get(key, tier))
      .max_by_key(|entry| entry.snapshot.fetched_at)
      .map(|entry| Arc::clone(&entry.snapshot))
  }

  pub fn contains(&self, key: &CacheKey, tier: Tier) -> bool {
    self.entries.contains_key(&(key.clone(), tier))
  }

  pub fn remove(&mut self, key: &CacheKey) {
    self.entries.remove(&(key.clone(), Tier::Memory));
    self.entries.remove(&(key.clone(), Tier::Persisted));
  }

  pub fn clear(&mut self) {
    self.entries.clear();
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
