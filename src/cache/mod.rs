//! Tiered caching primitives.
//!
//! This module is provider-agnostic. It provides:
//! - Immutable, timestamped snapshots of provider payloads
//! - Cache keys scoped by provider, owning user and date bucket
//! - A per-tier TTL store (memory and persisted mirror)
//! - Namespaced persistence backends (in-process map, SQLite)

mod key;
mod persistence;
mod store;
mod traits;

pub use key::{user_namespace, CacheKey};
pub use persistence::{BatchOp, MemoryPersistence, NoopPersistence, PersistenceAdapter, SqlitePersistence};
pub use store::CacheStore;
pub use traits::{CacheEntry, CacheSource, Payload, RefreshOutcome, Snapshot, Tier};
