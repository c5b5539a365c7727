use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use sqlx::postgres::PgPool;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyPresent,
}

#[derive(Error, Debug)]
pub enum DedupStoreError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
    #[error("{command} query failed with: {error}")]
    QueryError {
        command: String,
        #[source]
        error: sqlx::Error,
    },
}

/// Keyed store remembering admitted events for a bounded time.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically record `key` unless it is already present and unexpired.
    ///
    /// Under concurrent calls with the same key exactly one caller sees `Inserted`.
    async fn insert_if_absent(&self, key: &str, ttl: Duration)
        -> Result<InsertOutcome, DedupStoreError>;
}

struct PerEntryTtl;

impl Expiry<String, Duration> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, ttl: &Duration, _created_at: Instant) -> Option<Duration> {
        Some(*ttl)
    }
}

/// In-process dedup store backed by a bounded `moka` cache.
///
/// Entries expire after the ttl they were inserted with. When the cache is full the
/// least useful entries are evicted early, which only weakens duplicate detection.
pub struct MemoryDedupStore {
    entries: Cache<String, Duration>,
}

impl MemoryDedupStore {
    pub fn new(max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(max_capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new(1_000_000)
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn insert_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<InsertOutcome, DedupStoreError> {
        let entry = self.entries.entry(key.to_owned()).or_insert(ttl).await;
        if entry.is_fresh() {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::AlreadyPresent)
        }
    }
}

/// Dedup store shared by every worker, backed by the `event_dedup` table.
///
/// Expired rows are overwritten in place by the insert, so correctness never depends
/// on [`PgDedupStore::purge_expired`] having run.
pub struct PgDedupStore {
    pool: PgPool,
}

impl PgDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete expired keys, returning how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, DedupStoreError> {
        let result = sqlx::query("DELETE FROM event_dedup WHERE expires_at < NOW()")
            .execute(&self.pool)
            .await
            .map_err(|error| DedupStoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn insert_if_absent(
        &self,
        key: &str,
        ttl: Duration,
    ) -> Result<InsertOutcome, DedupStoreError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let result = sqlx::query(
            r#"
INSERT INTO event_dedup (key, expires_at)
VALUES ($1, NOW() + $2 * INTERVAL '1 millisecond')
ON CONFLICT (key) DO UPDATE
    SET expires_at = EXCLUDED.expires_at
    WHERE event_dedup.expires_at < NOW()
            "#,
        )
        .bind(key)
        .bind(ttl_ms)
        .execute(&self.pool)
        .await
        .map_err(|error| match error {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                DedupStoreError::Unavailable(error.to_string())
            }
            error => DedupStoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            },
        })?;

        if result.rows_affected() == 0 {
            Ok(InsertOutcome::AlreadyPresent)
        } else {
            Ok(InsertOutcome::Inserted)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_second_insert_sees_existing_key() {
        let store = MemoryDedupStore::default();
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(
            store.insert_if_absent("other", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_admit_exactly_one() {
        let store = Arc::new(MemoryDedupStore::default());

        let handles: Vec<_> = (0..32)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .insert_if_absent("contended", Duration::from_secs(60))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut inserted = 0;
        for handle in handles {
            if handle.await.unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }

        assert_eq!(inserted, 1);
    }

    #[tokio::test]
    async fn test_expired_key_can_be_inserted_again() {
        let store = MemoryDedupStore::default();
        let ttl = Duration::from_millis(20);

        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_pg_second_insert_sees_existing_key(db: PgPool) {
        let store = PgDedupStore::new(db);
        let ttl = Duration::from_secs(60);

        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::AlreadyPresent
        );
        assert_eq!(
            store.insert_if_absent("other", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    #[sqlx::test(migrations = "./migrations")]
    async fn test_pg_expired_key_is_reinserted_and_purged(db: PgPool) {
        let store = PgDedupStore::new(db);
        let ttl = Duration::from_millis(1);

        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(
            store.insert_if_absent("k", ttl).await.unwrap(),
            InsertOutcome::Inserted
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
    }
}
