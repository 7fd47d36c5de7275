//! Namespaced key-value persistence: the cache tier beneath memory.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One operation of an atomic batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
  Put { key: String, data: Vec<u8> },
  Delete { key: String },
}

/// Trait for persistence backends.
///
/// Namespaces are scoped per signed-in user so a sign-out can drop all of a
/// user's records in one call.
#[async_trait]
pub trait PersistenceAdapter: Send + Sync {
  async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

  async fn put(&self, namespace: &str, key: &str, data: Vec<u8>) -> Result<()>;

  async fn delete(&self, namespace: &str, key: &str) -> Result<()>;

  /// Apply all operations or none of them.
  async fn apply(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()>;

  /// Delete every record in a namespace.
  async fn drop_namespace(&self, namespace: &str) -> Result<()>;
}

/// Persistence that doesn't store anything.
/// Used when the persisted tier is disabled - all operations are no-ops.
pub struct NoopPersistence;

#[async_trait]
impl PersistenceAdapter for NoopPersistence {
  async fn get(&self, _namespace: &str, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  async fn put(&self, _namespace: &str, _key: &str, _data: Vec<u8>) -> Result<()> {
    Ok(()) // Discard
  }

  async fn delete(&self, _namespace: &str, _key: &str) -> Result<()> {
    Ok(())
  }

  async fn apply(&self, _namespace: &str, _ops: Vec<BatchOp>) -> Result<()> {
    Ok(())
  }

  async fn drop_namespace(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }
}

/// In-process persistence backed by a map.
#[derive(Default)]
pub struct MemoryPersistence {
  namespaces: Mutex<HashMap<String, HashMap<String, Vec<u8>>>>,
}

impl MemoryPersistence {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, HashMap<String, Vec<u8>>>>> {
    self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

#[async_trait]
impl PersistenceAdapter for MemoryPersistence {
  async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let namespaces = self.lock()?;
    Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
  }

  async fn put(&self, namespace: &str, key: &str, data: Vec<u8>) -> Result<()> {
    let mut namespaces = self.lock()?;
    namespaces
      .entry(namespace.to_string())
      .or_default()
      .insert(key.to_string(), data);
    Ok(())
  }

  async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    let mut namespaces = self.lock()?;
    if let Some(ns) = namespaces.get_mut(namespace) {
      ns.remove(key);
    }
    Ok(())
  }

  async fn apply(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()> {
    // A single lock hold makes the batch atomic for other callers.
    let mut namespaces = self.lock()?;
    let ns = namespaces.entry(namespace.to_string()).or_default();
    for op in ops {
      match op {
        BatchOp::Put { key, data } => {
          ns.insert(key, data);
        }
        BatchOp::Delete { key } => {
          ns.remove(&key);
        }
      }
    }
    Ok(())
  }

  async fn drop_namespace(&self, namespace: &str) -> Result<()> {
    let mut namespaces = self.lock()?;
    namespaces.remove(namespace);
    Ok(())
  }
}

/// SQLite-based device-local persistence.
pub struct SqlitePersistence {
  conn: Arc<Mutex<Connection>>,
}

impl SqlitePersistence {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open (or create) the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(PERSISTENCE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("nutrisync").join("cache.db"))
  }

  /// Run a closure against the connection on the blocking pool.
  async fn with_conn<R, F>(&self, f: F) -> Result<R>
  where
    R: Send + 'static,
    F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&mut conn)
    })
    .await
    .map_err(|e| eyre!("Storage task failed: {}", e))?
  }
}

/// Schema for the key-value table.
const PERSISTENCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);
"#;

#[async_trait]
impl PersistenceAdapter for SqlitePersistence {
  async fn get(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let namespace = namespace.to_string();
    let key = key.to_string();
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT data FROM kv_store WHERE namespace = ? AND key = ?",
            params![namespace, key],
            |row| row.get(0),
          )
          .optional()
          .map_err(|e| eyre!("Failed to read {}/{}: {}", namespace, key, e))
      })
      .await
  }

  async fn put(&self, namespace: &str, key: &str, data: Vec<u8>) -> Result<()> {
    self
      .apply(
        namespace,
        vec![BatchOp::Put {
          key: key.to_string(),
          data,
        }],
      )
      .await
  }

  async fn delete(&self, namespace: &str, key: &str) -> Result<()> {
    self
      .apply(
        namespace,
        vec![BatchOp::Delete {
          key: key.to_string(),
        }],
      )
      .await
  }

  async fn apply(&self, namespace: &str, ops: Vec<BatchOp>) -> Result<()> {
    let namespace = namespace.to_string();
    self
      .with_conn(move |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        for op in &ops {
          match op {
            BatchOp::Put { key, data } => {
              tx.execute(
                "INSERT OR REPLACE INTO kv_store (namespace, key, data, updated_at)
                 VALUES (?, ?, ?, datetime('now'))",
                params![namespace, key, data],
              )
              .map_err(|e| eyre!("Failed to store {}/{}: {}", namespace, key, e))?;
            }
            BatchOp::Delete { key } => {
              tx.execute(
                "DELETE FROM kv_store WHERE namespace = ? AND key = ?",
                params![namespace, key],
              )
              .map_err(|e| eyre!("Failed to delete {}/{}: {}", namespace, key, e))?;
            }
          }
        }

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))
      })
      .await
  }

  async fn drop_namespace(&self, namespace: &str) -> Result<()> {
    let namespace = namespace.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute("DELETE FROM kv_store WHERE namespace = ?", params![namespace])
          .map_err(|e| eyre!("Failed to drop namespace {}: {}", namespace, e))?;
        Ok(())
      })
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn exercise(store: &dyn PersistenceAdapter) {
    assert_eq!(store.get("user:a", "k1").await.unwrap(), None);

    store.put("user:a", "k1", b"one".to_vec()).await.unwrap();
    store.put("user:b", "k1", b"other".to_vec()).await.unwrap();
    assert_eq!(store.get("user:a", "k1").await.unwrap(), Some(b"one".to_vec()));

    store.put("user:a", "k1", b"uno".to_vec()).await.unwrap();
    assert_eq!(store.get("user:a", "k1").await.unwrap(), Some(b"uno".to_vec()));

    store
      .apply(
        "user:a",
        vec![
          BatchOp::Put {
            key: "k2".into(),
            data: b"two".to_vec(),
          },
          BatchOp::Delete { key: "k1".into() },
        ],
      )
      .await
      .unwrap();
    assert_eq!(store.get("user:a", "k1").await.unwrap(), None);
    assert_eq!(store.get("user:a", "k2").await.unwrap(), Some(b"two".to_vec()));

    store.delete("user:a", "k2").await.unwrap();
    assert_eq!(store.get("user:a", "k2").await.unwrap(), None);

    store.put("user:a", "k3", b"three".to_vec()).await.unwrap();
    store.drop_namespace("user:a").await.unwrap();
    assert_eq!(store.get("user:a", "k3").await.unwrap(), None);
    assert_eq!(store.get("user:b", "k1").await.unwrap(), Some(b"other".to_vec()));
  }

  #[tokio::test]
  async fn test_memory_persistence() {
    exercise(&MemoryPersistence::new()).await;
  }

  #[tokio::test]
  async fn test_sqlite_persistence_in_memory() {
    exercise(&SqlitePersistence::open_in_memory().unwrap()).await;
  }

  #[tokio::test]
  async fn test_sqlite_persistence_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    {
      let store = SqlitePersistence::open_at(&path).unwrap();
      store.put("user:a", "k1", b"kept".to_vec()).await.unwrap();
    }

    let store = SqlitePersistence::open_at(&path).unwrap();
    assert_eq!(store.get("user:a", "k1").await.unwrap(), Some(b"kept".to_vec()));
  }

  #[tokio::test]
  async fn test_noop_persistence_always_misses() {
    let store = NoopPersistence;
    store.put("user:a", "k1", b"x".to_vec()).await.unwrap();
    assert_eq!(store.get("user:a", "k1").await.unwrap(), None);
  }
}
