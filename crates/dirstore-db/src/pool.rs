//! Database connection pool.

use std::time::Duration;

use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::info;

use crate::error::DbError;

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 5,
        }
    }
}

/// Shared handle on the PostgreSQL connection pool.
///
/// Cloning is cheap; all clones share the same connections.
#[derive(Debug, Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Connect with default [`PoolSettings`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConnectionFailed` if no connection can be opened.
    pub async fn connect(database_url: &str) -> Result<Self, DbError> {
        Self::connect_with(database_url, &PoolSettings::default()).await
    }

    pub async fn connect_with(database_url: &str, settings: &PoolSettings) -> Result<Self, DbError> {
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(Duration::from_secs(settings.acquire_timeout_secs))
            .connect(database_url)
            .await
            .map_err(DbError::ConnectionFailed)?;

        info!(
            max_connections = settings.max_connections,
            "Database connection pool established"
        );

        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Start a transaction on a pooled connection.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, DbError> {
        self.pool.begin().await.map_err(DbError::ConnectionFailed)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults_fill_missing_fields() {
        let settings: PoolSettings =
            serde_json::from_str(r#"{ "max_connections": 3 }"#).unwrap();
        assert_eq!(settings.max_connections, 3);
        assert_eq!(settings.acquire_timeout_secs, 5);
    }

    #[tokio::test]
    async fn test_from_pool_shares_connections() {
        let lazy = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/dirstore")
            .unwrap();
        let pool = DbPool::from_pool(lazy);
        let clone = pool.clone();
        assert_eq!(clone.inner().size(), pool.inner().size());
    }
}
