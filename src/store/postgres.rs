//! Postgres-backed store
//!
//! One table holds every namespace. Vectors are stored as `REAL[]` and
//! ranked in-process; the engine only ever asks for top-1/top-k over a
//! single namespace prefix.

use super::{KeyValueStore, VectorMatch};
use crate::embedding::cosine_similarity;
use crate::error::EngineError;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::debug;

pub struct PostgresStore {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresStore {
    /// Lazily connecting pool; the schema is created on first use
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)
            .map_err(|e| EngineError::Database(format!("Invalid database URL: {}", e)))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        }
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS engine_cache (
                      key TEXT PRIMARY KEY,
                      value TEXT NOT NULL,
                      embedding REAL[],
                      expires_at TIMESTAMPTZ,
                      updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_engine_cache_expires
                    ON engine_cache (expires_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                EngineError::Database(format!("Failed to initialize cache schema: {}", e))
            })?;

        Ok(())
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok())
            .map(|ttl| Utc::now() + ttl)
    }

    async fn upsert(
        &self,
        key: &str,
        value: &Value,
        embedding: Option<Vec<f32>>,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO engine_cache (key, value, embedding, expires_at, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (key) DO UPDATE
              SET value = EXCLUDED.value,
                  embedding = EXCLUDED.embedding,
                  expires_at = EXCLUDED.expires_at,
                  updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .bind(embedding)
        .bind(Self::expiry(ttl))
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to write key {}: {}", key, e)))?;

        Ok(())
    }
}

/// Translate a glob into a LIKE pattern (escape char `\`)
fn glob_to_like(pattern: &str) -> String {
    let mut like = String::with_capacity(pattern.len() + 4);
    for c in pattern.chars() {
        match c {
            '*' => like.push('%'),
            '?' => like.push('_'),
            '%' | '_' | '\\' => {
                like.push('\\');
                like.push(c);
            }
            other => like.push(other),
        }
    }
    like
}

#[async_trait::async_trait]
impl KeyValueStore for PostgresStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        self.ensure_schema().await?;

        let row = sqlx::query(
            r#"
            SELECT value FROM engine_cache
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to read key {}: {}", key, e)))?;

        match row {
            Some(row) => {
                let raw: String = row.try_get("value")?;
                Ok(Some(serde_json::from_str(&raw)?))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<()> {
        self.upsert(key, &value, None, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.ensure_schema().await?;

        let result = sqlx::query("DELETE FROM engine_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to delete key {}: {}", key, e)))?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT key FROM engine_cache
            WHERE key LIKE $1 ESCAPE '\'
              AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY key ASC
            "#,
        )
        .bind(glob_to_like(pattern))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to list keys: {}", e)))?;

        rows.into_iter()
            .map(|row| row.try_get::<String, _>("key").map_err(EngineError::from))
            .collect()
    }

    async fn delete_pattern(&self, pattern: &str) -> Result<usize> {
        self.ensure_schema().await?;

        let result = sqlx::query(r#"DELETE FROM engine_cache WHERE key LIKE $1 ESCAPE '\'"#)
            .bind(glob_to_like(pattern))
            .execute(&self.pool)
            .await
            .map_err(|e| EngineError::Database(format!("Failed to delete by pattern: {}", e)))?;

        debug!(pattern, removed = result.rows_affected(), "Pattern invalidation");
        Ok(result.rows_affected() as usize)
    }

    async fn upsert_vector(
        &self,
        key: &str,
        embedding: Vec<f32>,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.upsert(key, &value, Some(embedding), ttl).await
    }

    async fn nearest(
        &self,
        prefix: &str,
        embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorMatch>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT key, value, embedding FROM engine_cache
            WHERE key LIKE $1 ESCAPE '\'
              AND embedding IS NOT NULL
              AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(format!("{}%", glob_to_like(prefix)))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EngineError::Database(format!("Failed to scan vectors: {}", e)))?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in rows {
            let stored: Vec<f32> = row.try_get("embedding")?;
            let raw: String = row.try_get("value")?;
            matches.push(VectorMatch {
                key: row.try_get("key")?,
                distance: 1.0 - cosine_similarity(embedding, &stored),
                value: serde_json::from_str(&raw)?,
            });
        }

        matches.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        matches.truncate(top_k);

        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_to_like() {
        assert_eq!(glob_to_like("tool:*"), "tool:%");
        assert_eq!(glob_to_like("tool:price_snapshot:*"), "tool:price\\_snapshot:%");
        assert_eq!(glob_to_like("route:?"), "route:_");
    }
}
