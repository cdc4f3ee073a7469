use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::r#trait::{KeyValueStore, KvError};

/// SQLite-backed key-value store.
///
/// This struct is cheap to clone and is safe to share across tasks.
#[derive(Debug, Clone)]
pub struct SqliteKvStore {
    pool: SqlitePool,
}

impl SqliteKvStore {
    /// Open (creating if missing) the database file at `path`.
    pub async fn open(path: &Path) -> Result<Self, KvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KvError::storage(format!(
                    "failed to create database directory at {:?}: {e}",
                    parent
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| {
                KvError::storage(format!("failed to open SQLite store at {:?}: {e}", path))
            })?;

        Self::with_pool(pool).await
    }

    /// Open a private in-memory database (tests/dev).
    ///
    /// Uses a single connection: every SQLite in-memory connection is its own
    /// database.
    pub async fn in_memory() -> Result<Self, KvError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self, KvError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| KvError::storage(format!("failed to create kv_store table: {e}")))?;

        tracing::debug!("kv_store table ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl KeyValueStore for SqliteKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let row = sqlx::query(
            r#"
            SELECT value
            FROM kv_store
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let result = sqlx::query(
            r#"
            DELETE FROM kv_store
            WHERE key = ?1
            "#,
        )
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let rows = sqlx::query(
            r#"
            SELECT key
            FROM kv_store
            WHERE substr(key, 1, length(?1)) = ?1
            ORDER BY key ASC
            "#,
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(KvError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_overwrites_value() {
        let store = SqliteKvStore::in_memory().await.unwrap();
        store.set("queue:v1", "[]").await.unwrap();
        store.set("queue:v1", "[1]").await.unwrap();
        assert_eq!(store.get("queue:v1").await.unwrap().as_deref(), Some("[1]"));
    }

    #[tokio::test]
    async fn prefix_query_matches_literally() {
        let store = SqliteKvStore::in_memory().await.unwrap();
        store.set("cache:%a", "1").await.unwrap();
        store.set("cache:_b", "2").await.unwrap();
        store.set("cachez", "3").await.unwrap();

        let keys = store.keys_with_prefix("cache:").await.unwrap();
        assert_eq!(keys, vec!["cache:%a".to_string(), "cache:_b".to_string()]);
        assert!(store.keys_with_prefix("cache:%").await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("civicsync.db");

        {
            let store = SqliteKvStore::open(&path).await.unwrap();
            store.set("entities:v1", "{}").await.unwrap();
        }

        let store = SqliteKvStore::open(&path).await.unwrap();
        assert_eq!(store.get("entities:v1").await.unwrap().as_deref(), Some("{}"));
        assert!(store.delete("entities:v1").await.unwrap());
    }
}
