//! Shared state store: the only mutable state shared across workers.
//!
//! Any key-value store offering set-if-absent, get, delete and an atomic
//! TTL-bound increment satisfies the contract. [`MemoryStore`] serves a
//! single process and tests; [`PgStore`] shares state across processes.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Key-value store with TTLs and atomic primitives.
///
/// Every mutation must be atomic at the store: several workers race on the
/// same keys. Transport failures surface as [`crate::Error::StoreUnavailable`].
pub trait SharedStateStore: Send + Sync + 'static {
    /// Store `value` under `key` unless a live value exists. Returns whether
    /// this call created it.
    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Read a live value.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Remove a value. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Increment a counter, creating it at 1 with `ttl` when absent or
    /// expired. The TTL is not extended by later increments.
    fn atomic_increment(&self, key: &str, ttl: Duration)
    -> impl Future<Output = Result<i64>> + Send;

    /// Delete `key` only while it still holds `expected`. Returns whether
    /// it did.
    ///
    /// The default reads then deletes, so a writer can slip in between the
    /// two calls. Stores with a conditional delete override it.
    fn delete_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> impl Future<Output = Result<bool>> + Send {
        async move {
            match self.get(key).await? {
                Some(current) if current.as_ref() == expected => {
                    self.delete(key).await?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    /// Cheap reachability check.
    fn health_check(&self) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.get("__health__").await?;
            Ok(())
        }
    }

    /// Physically drop expired entries. Returns how many went. Stores that
    /// expire on their own keep the default.
    fn purge_expired(&self) -> impl Future<Output = Result<u64>> + Send {
        async { Ok(0) }
    }
}

impl<S: SharedStateStore> SharedStateStore for std::sync::Arc<S> {
    fn set_if_absent(
        &self,
        key: &str,
        value: Bytes,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send {
        (**self).set_if_absent(key, value, ttl)
    }

    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>>> + Send {
        (**self).get(key)
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        (**self).delete(key)
    }

    fn atomic_increment(
        &self,
        key: &str,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64>> + Send {
        (**self).atomic_increment(key, ttl)
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &[u8],
    ) -> impl Future<Output = Result<bool>> + Send {
        (**self).delete_if_equals(key, expected)
    }

    fn health_check(&self) -> impl Future<Output = Result<()>> + Send {
        (**self).health_check()
    }

    fn purge_expired(&self) -> impl Future<Output = Result<u64>> + Send {
        (**self).purge_expired()
    }
}

/// Either backend, chosen at startup from configuration.
pub enum AnyStore {
    Memory(MemoryStore),
    Postgres(PgStore),
}

impl SharedStateStore for AnyStore {
    async fn set_if_absent(&self, key: &str, value: Bytes, ttl: Duration) -> Result<bool> {
        match self {
            AnyStore::Memory(s) => s.set_if_absent(key, value, ttl).await,
            AnyStore::Postgres(s) => s.set_if_absent(key, value, ttl).await,
        }
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match self {
            AnyStore::Memory(s) => s.get(key).await,
            AnyStore::Postgres(s) => s.get(key).await,
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self {
            AnyStore::Memory(s) => s.delete(key).await,
            AnyStore::Postgres(s) => s.delete(key).await,
        }
    }

    async fn atomic_increment(&self, key: &str, ttl: Duration) -> Result<i64> {
        match self {
            AnyStore::Memory(s) => s.atomic_increment(key, ttl).await,
            AnyStore::Postgres(s) => s.atomic_increment(key, ttl).await,
        }
    }

    async fn delete_if_equals(&self, key: &str, expected: &[u8]) -> Result<bool> {
        match self {
            AnyStore::Memory(s) => s.delete_if_equals(key, expected).await,
            AnyStore::Postgres(s) => s.delete_if_equals(key, expected).await,
        }
    }

    async fn health_check(&self) -> Result<()> {
        match self {
            AnyStore::Memory(s) => s.health_check().await,
            AnyStore::Postgres(s) => s.health_check().await,
        }
    }

    async fn purge_expired(&self) -> Result<u64> {
        match self {
            AnyStore::Memory(s) => s.purge_expired().await,
            AnyStore::Postgres(s) => s.purge_expired().await,
        }
    }
}

/// Bound one store call by `limit`. A call that does not answer in time
/// fails as [`Error::StoreUnavailable`].
pub async fn bounded<T>(
    limit: Duration,
    operation: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, call).await.map_err(|_| {
        Error::StoreUnavailable(format!(
            "{operation} timed out after {}ms",
            limit.as_millis()
        ))
    })?
}
