//! The signed-in user and the session generation used to discard late results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use super::SyncError;
use crate::cache::CacheKey;

/// Tracks who is signed in. Every sign-in or sign-out bumps the generation;
/// work started under an older generation must not publish or cache.
#[derive(Debug, Default)]
pub struct SessionScope {
  user: RwLock<Option<String>>,
  generation: AtomicU64,
}

impl SessionScope {
  pub fn new() -> Self {
    Self::default()
  }

  /// Sign a user in, returning the new generation.
  pub fn sign_in(&self, user_id: impl Into<String>) -> u64 {
    let mut user = self.user.write().unwrap_or_else(PoisonError::into_inner);
    *user = Some(user_id.into());
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  /// Sign out, returning the user that was signed in.
  pub fn sign_out(&self) -> Option<String> {
    let mut user = self.user.write().unwrap_or_else(PoisonError::into_inner);
    self.generation.fetch_add(1, Ordering::SeqCst);
    user.take()
  }

  pub fn current_user(&self) -> Option<String> {
    self
      .user
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  pub fn is_current(&self, generation: u64) -> bool {
    self.generation() == generation
  }

  /// Check that `key` belongs to the signed-in user and return the generation
  /// the caller is operating under.
  pub fn admit(&self, key: &CacheKey) -> Result<u64, SyncError> {
    self.admit_user(&key.user_id)
  }

  /// Like `admit`, for work scoped to a user rather than a key.
  pub fn admit_user(&self, user_id: &str) -> Result<u64, SyncError> {
    let user = self.user.read().unwrap_or_else(PoisonError::into_inner);
    match user.as_deref() {
      None => Err(SyncError::NotSignedIn),
      Some(current) if current != user_id => Err(SyncError::SessionMismatch {
        key_user: user_id.to_string(),
        current: current.to_string(),
      }),
      Some(_) => Ok(self.generation()),
    }
  }
}
