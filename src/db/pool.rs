//! MySQL connection pool: lifetime/idle retirement plus a background
//! health-ping monitor.

use std::time::Duration;

use sqlx::mysql::MySqlPoolOptions;
use sqlx::{MySql, MySqlPool, Transaction};
use tracing::{debug, error, info};

use crate::errors::PersistenceError;

/// Thin wrapper over `sqlx::MySqlPool`. sqlx's own pool already performs
/// lifetime/idle retirement and tops back up to `max_connections`; the
/// monitor task here only adds the periodic health ping the original
/// design's monitor thread describes.
#[derive(Clone)]
pub struct DbPool {
    pool: MySqlPool,
}

impl DbPool {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        connection_lifetime: Duration,
        connection_idle: Duration,
    ) -> Result<Self, PersistenceError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(max_connections)
            .max_lifetime(connection_lifetime)
            .idle_timeout(connection_idle)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn raw(&self) -> &MySqlPool {
        &self.pool
    }

    /// Runs every file under `migrations/` in lexicographic order,
    /// statement by statement. Idempotent: migration files are expected to
    /// use `CREATE TABLE IF NOT EXISTS`.
    pub async fn migrate(&self) -> Result<(), PersistenceError> {
        for sql in [include_str!("../../migrations/001_init.sql")] {
            for stmt in sql.split(';') {
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(&self.pool).await?;
            }
        }
        info!("database migrations applied");
        Ok(())
    }

    /// Spawns the periodic `SELECT 1` health-ping monitor. Runs until the
    /// pool itself is dropped.
    pub fn spawn_monitor(&self, interval: Duration) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match sqlx::query("SELECT 1").execute(&pool).await {
                    Ok(_) => debug!("database health ping ok"),
                    Err(e) => error!(err = %e, "database health ping failed"),
                }
            }
        });
    }

    /// Scoped acquisition: runs `f` with a checked-out connection,
    /// guaranteeing release on every exit path.
    pub async fn execute_with_connection<F, Fut, T>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(sqlx::pool::PoolConnection<MySql>) -> Fut,
        Fut: std::future::Future<Output = Result<T, PersistenceError>>,
    {
        let conn = self.pool.acquire().await?;
        f(conn).await
    }

    /// Scoped transaction: commits on `Ok`, rolls back on `Err`.
    pub async fn execute_transaction<F, Fut, T>(&self, f: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(Transaction<'_, MySql>) -> Fut,
        Fut: std::future::Future<Output = Result<(Transaction<'_, MySql>, T), PersistenceError>>,
    {
        let tx = self.pool.begin().await?;
        match f(tx).await {
            Ok((tx, value)) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }
}
