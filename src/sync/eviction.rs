//! Bounded chat history: which sessions to drop, and dropping them.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::WrapErr, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{SessionScope, SyncError, SyncEvent, SyncObserver};
use crate::cache::{user_namespace, BatchOp, PersistenceAdapter};
use crate::provider::SessionDeleter;

const LEDGER_KEY: &str = "chat:ledger";

fn messages_key(session_id: &str) -> String {
  format!("chat:messages:{}", session_id)
}

/// What the ledger knows about one retained chat session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMeta {
  pub session_id: String,
  pub last_message_at: DateTime<Utc>,
  pub message_count: u32,
}

impl SessionMeta {
  pub fn new(session_id: impl Into<String>, last_message_at: DateTime<Utc>, message_count: u32) -> Self {
    Self {
      session_id: session_id.into(),
      last_message_at,
      message_count,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerEntry {
  meta: SessionMeta,
  /// Insertion order, breaks `last_message_at` ties
  seq: u64,
}

/// Ordered record of the chat sessions kept on this device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionLedger {
  entries: Vec<LedgerEntry>,
  next_seq: u64,
  /// Sessions dropped locally that the backend has not confirmed deleting
  #[serde(default)]
  pending_remote: Vec<String>,
}

impl EvictionLedger {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn total_messages(&self) -> u64 {
    self.entries.iter().map(|e| u64::from(e.meta.message_count)).sum()
  }

  pub fn contains(&self, session_id: &str) -> bool {
    self.entries.iter().any(|e| e.meta.session_id == session_id)
  }

  /// Sessions, oldest first.
  pub fn sessions(&self) -> Vec<SessionMeta> {
    let mut entries: Vec<&LedgerEntry> = self.entries.iter().collect();
    entries.sort_by_key(|e| (e.meta.last_message_at, e.seq));
    entries.into_iter().map(|e| e.meta.clone()).collect()
  }

  fn upsert(&mut self, meta: SessionMeta) {
    match self
      .entries
      .iter_mut()
      .find(|e| e.meta.session_id == meta.session_id)
    {
      Some(existing) => existing.meta = meta,
      None => {
        self.entries.push(LedgerEntry {
          meta,
          seq: self.next_seq,
        });
        self.next_seq += 1;
      }
    }
  }

  /// Remove and return the oldest entry, skipping `keep`.
  fn pop_oldest(&mut self, keep: Option<&str>) -> Option<SessionMeta> {
    let index = self
      .entries
      .iter()
      .enumerate()
      .filter(|(_, e)| Some(e.meta.session_id.as_str()) != keep)
      .min_by_key(|(_, e)| (e.meta.last_message_at, e.seq))
      .map(|(i, _)| i)?;
    Some(self.entries.remove(index).meta)
  }
}

/// Capacity bounds for retained chat history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionPolicy {
  pub max_sessions: usize,
  pub max_messages: u64,
}

impl Default for EvictionPolicy {
  fn default() -> Self {
    Self {
      max_sessions: 5,
      max_messages: 50,
    }
  }
}

impl EvictionPolicy {
  /// Record `entry` (updating it in place if the session is already known)
  /// and return the sessions that must be deleted to get back under the
  /// bounds. The returned sessions are removed from the ledger.
  ///
  /// Sessions go oldest first by `last_message_at`, ties broken by insertion
  /// order. The message bound never evicts `entry` itself.
  pub fn record_insertion(&self, ledger: &mut EvictionLedger, entry: SessionMeta) -> Vec<SessionMeta> {
    let inserted = entry.session_id.clone();
    ledger.upsert(entry);

    let mut evicted = Vec::new();
    while ledger.len() > self.max_sessions {
      match ledger.pop_oldest(None) {
        Some(meta) => evicted.push(meta),
        None => break,
      }
    }
    while ledger.total_messages() > self.max_messages {
      match ledger.pop_oldest(Some(&inserted)) {
        Some(meta) => evicted.push(meta),
        None => break,
      }
    }
    evicted
  }
}

/// Applies the eviction policy against the device store and the backend.
pub struct HistoryPruner {
  policy: EvictionPolicy,
  persistence: Arc<dyn PersistenceAdapter>,
  deleter: Arc<dyn SessionDeleter>,
  session: Arc<SessionScope>,
  observer: Arc<dyn SyncObserver>,
  /// Held across every ledger read-modify-write and namespace purge
  ledger_lock: Mutex<()>,
}

impl HistoryPruner {
  pub fn new(
    policy: EvictionPolicy,
    persistence: Arc<dyn PersistenceAdapter>,
    deleter: Arc<dyn SessionDeleter>,
    session: Arc<SessionScope>,
    observer: Arc<dyn SyncObserver>,
  ) -> Self {
    Self {
      policy,
      persistence,
      deleter,
      session,
      observer,
      ledger_lock: Mutex::new(()),
    }
  }

  pub fn policy(&self) -> EvictionPolicy {
    self.policy
  }

  pub async fn ledger(&self, user_id: &str) -> Result<EvictionLedger> {
    let namespace = user_namespace(user_id);
    match self.persistence.get(&namespace, LEDGER_KEY).await? {
      Some(bytes) => serde_json::from_slice(&bytes).wrap_err("Failed to decode chat history ledger"),
      None => Ok(EvictionLedger::new()),
    }
  }

  /// Record a chat session for `user_id` and drop whatever falls outside the
  /// bounds. Local message records and the ledger are updated in one batch;
  /// the backend is then asked to delete the evicted sessions in one call.
  ///
  /// A backend failure is not an error: the sessions stay queued and are
  /// retried on the next insertion. `user_id` must be signed in, and nothing
  /// is written once they sign out.
  pub async fn record(&self, user_id: &str, entry: SessionMeta) -> Result<Vec<SessionMeta>> {
    let generation = self.session.admit_user(user_id)?;
    let _guard = self.ledger_lock.lock().await;
    if !self.session.is_current(generation) {
      return Err(SyncError::Discarded.into());
    }

    let namespace = user_namespace(user_id);
    let mut ledger = self.ledger(user_id).await?;
    let evicted = self.policy.record_insertion(&mut ledger, entry);

    let mut batch: Vec<BatchOp> = evicted
      .iter()
      .map(|meta| BatchOp::Delete {
        key: messages_key(&meta.session_id),
      })
      .collect();
    ledger
      .pending_remote
      .extend(evicted.iter().map(|meta| meta.session_id.clone()));
    batch.push(BatchOp::Put {
      key: LEDGER_KEY.to_string(),
      data: serde_json::to_vec(&ledger)?,
    });
    self
      .persistence
      .apply(&namespace, batch)
      .await
      .wrap_err("Failed to apply chat history eviction")?;

    if !evicted.is_empty() {
      self.observer.on_event(&SyncEvent::Eviction {
        namespace: namespace.clone(),
        sessions: evicted.iter().map(|m| m.session_id.clone()).collect(),
      });
    }

    if !ledger.pending_remote.is_empty() {
      match self
        .deleter
        .delete_sessions(user_id, &ledger.pending_remote)
        .await
      {
        Ok(()) => {
          ledger.pending_remote.clear();
          self
            .persistence
            .put(&namespace, LEDGER_KEY, serde_json::to_vec(&ledger)?)
            .await?;
        }
        Err(e) => {
          tracing::warn!(
            count = ledger.pending_remote.len(),
            error = %e,
            "Remote chat session deletion failed, will retry"
          );
        }
      }
    }

    Ok(evicted)
  }

  /// Remove everything stored for `user_id`, waiting for any `record` still
  /// writing to finish first.
  pub async fn purge(&self, user_id: &str) -> Result<()> {
    let _guard = self.ledger_lock.lock().await;
    self.persistence.drop_namespace(&user_namespace(user_id)).await
  }
}
