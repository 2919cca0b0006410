mod aggregates;
mod backends;
mod connections;
mod error;
mod schema;
pub mod rows;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::geoip::GeoProvider;
use crate::model::DAY_MS;

pub use backends::{Backend, BackendPatch, NewBackend};
pub use error::{StoreError, StoreResult};

/// Sole owner of persistent state: backends, aggregates, connection
/// logs, retention configuration. All writes funnel through batched
/// transactions; readers run concurrently against the pool.
#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
    path: Option<PathBuf>,
    geo: Arc<dyn GeoProvider>,
}

impl Store {
    /// Opens (creating if needed) the single-file database and applies
    /// migrations.
    pub async fn open(path: &str, geo: Arc<dyn GeoProvider>) -> StoreResult<Self> {
        // Shared cache plus WAL keeps readers unblocked while the flusher
        // writes; the serialized writer lives inside SQLite.
        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    // Per-connection pragmas; WAL itself persists at the
                    // database level and is set during migration.
                    sqlx::query("PRAGMA synchronous = NORMAL")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA temp_store = MEMORY")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite:{path}?mode=rwc&cache=shared"))
            .await?;

        let store = Self {
            pool,
            path: Some(PathBuf::from(path)),
            geo,
        };
        store.migrate().await?;

        info!(path = %path, "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(geo: Arc<dyn GeoProvider>) -> StoreResult<Self> {
        // A single persistent connection: the in-memory database lives
        // and dies with it.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let store = Self {
            pool,
            path: None,
            geo,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(crate) fn geo(&self) -> &dyn GeoProvider {
        self.geo.as_ref()
    }

    /// Idempotent schema migration, run once at startup.
    async fn migrate(&self) -> StoreResult<()> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await?;

        for statement in schema::ALL_STATEMENTS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // Seed the singleton retention row with defaults.
        sqlx::query(
            "INSERT INTO retention_config (id, connection_logs_days, hourly_stats_days, auto_cleanup) \
             VALUES (1, ?, ?, 1) ON CONFLICT(id) DO NOTHING",
        )
        .bind(RetentionConfig::DEFAULT_CONNECTION_LOGS_DAYS)
        .bind(RetentionConfig::DEFAULT_HOURLY_STATS_DAYS)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Reclaims free pages.
    pub async fn vacuum(&self) -> StoreResult<()> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Row counts per table plus the database file size.
    pub async fn db_stats(&self) -> StoreResult<DbStats> {
        let mut tables = BTreeMap::new();
        let mut all: Vec<&str> = schema::AGGREGATE_TABLES.to_vec();
        all.push("backends");
        all.push("connection_logs");

        for table in all {
            let (count,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
                .fetch_one(&self.pool)
                .await?;
            tables.insert(table.to_string(), count.max(0) as u64);
        }

        let file_size_bytes = match &self.path {
            Some(path) => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
            None => 0,
        };

        Ok(DbStats {
            file_size_bytes,
            tables,
        })
    }

    pub async fn retention(&self) -> StoreResult<RetentionConfig> {
        let (connection_logs_days, hourly_stats_days, auto_cleanup): (i64, i64, i64) =
            sqlx::query_as(
                "SELECT connection_logs_days, hourly_stats_days, auto_cleanup \
                 FROM retention_config WHERE id = 1",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(RetentionConfig {
            connection_logs_days: connection_logs_days as u32,
            hourly_stats_days: hourly_stats_days as u32,
            auto_cleanup: auto_cleanup != 0,
        })
    }

    pub async fn set_retention(&self, cfg: &RetentionConfig) -> StoreResult<()> {
        sqlx::query(
            "UPDATE retention_config SET connection_logs_days = ?, hourly_stats_days = ?, \
             auto_cleanup = ? WHERE id = 1",
        )
        .bind(cfg.connection_logs_days as i64)
        .bind(cfg.hourly_stats_days as i64)
        .bind(cfg.auto_cleanup as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes connection records older than `days`. `days = 0` instead
    /// wipes every aggregate row of the target backend (or all backends
    /// when `backend_id` is absent). Returns per-table deletion counts.
    pub async fn cleanup_old_data(
        &self,
        backend_id: Option<i64>,
        days: u32,
        now_ms: i64,
    ) -> StoreResult<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        let mut tx = self.pool.begin().await?;

        if days == 0 {
            for table in schema::AGGREGATE_TABLES {
                let deleted = match backend_id {
                    Some(id) => {
                        sqlx::query(&format!("DELETE FROM {table} WHERE backend_id = ?"))
                            .bind(id)
                            .execute(&mut *tx)
                            .await?
                    }
                    None => sqlx::query(&format!("DELETE FROM {table}")).execute(&mut *tx).await?,
                };
                counts.insert(table.to_string(), deleted.rows_affected());
            }
            let deleted = match backend_id {
                Some(id) => {
                    sqlx::query("DELETE FROM connection_logs WHERE backend_id = ?")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?
                }
                None => sqlx::query("DELETE FROM connection_logs").execute(&mut *tx).await?,
            };
            counts.insert("connection_logs".to_string(), deleted.rows_affected());
        } else {
            let cutoff = now_ms - i64::from(days) * DAY_MS;
            let deleted = match backend_id {
                Some(id) => {
                    sqlx::query("DELETE FROM connection_logs WHERE backend_id = ? AND closed_at < ?")
                        .bind(id)
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?
                }
                None => {
                    sqlx::query("DELETE FROM connection_logs WHERE closed_at < ?")
                        .bind(cutoff)
                        .execute(&mut *tx)
                        .await?
                }
            };
            counts.insert("connection_logs".to_string(), deleted.rows_affected());
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Retention sweep for the auto-cleanup task: prunes connection logs
    /// and aggregate rows past their configured horizons.
    pub async fn apply_retention(&self, now_ms: i64) -> StoreResult<BTreeMap<String, u64>> {
        let cfg = self.retention().await?;
        let mut counts = self
            .cleanup_old_data(None, cfg.connection_logs_days, now_ms)
            .await?;

        let bucket_cutoff = now_ms - i64::from(cfg.hourly_stats_days) * DAY_MS;
        let mut tx = self.pool.begin().await?;
        for table in schema::AGGREGATE_TABLES {
            let deleted = sqlx::query(&format!("DELETE FROM {table} WHERE ts_bucket < ?"))
                .bind(bucket_cutoff)
                .execute(&mut *tx)
                .await?;
            counts.insert(table.to_string(), deleted.rows_affected());
        }
        tx.commit().await?;

        Ok(counts)
    }
}

/// Singleton retention policy row.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(rename = "connectionLogsDays")]
    pub connection_logs_days: u32,
    #[serde(rename = "hourlyStatsDays")]
    pub hourly_stats_days: u32,
    #[serde(rename = "autoCleanup")]
    pub auto_cleanup: bool,
}

impl RetentionConfig {
    pub const DEFAULT_CONNECTION_LOGS_DAYS: u32 = 7;
    pub const DEFAULT_HOURLY_STATS_DAYS: u32 = 30;

    /// Bounds from the data model: logs 1–90 days, hourly stats 7–365.
    pub fn validate(&self) -> Result<(), String> {
        if !(1..=90).contains(&self.connection_logs_days) {
            return Err("connectionLogsDays must be between 1 and 90".to_string());
        }
        if !(7..=365).contains(&self.hourly_stats_days) {
            return Err("hourlyStatsDays must be between 7 and 365".to_string());
        }
        Ok(())
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            connection_logs_days: Self::DEFAULT_CONNECTION_LOGS_DAYS,
            hourly_stats_days: Self::DEFAULT_HOURLY_STATS_DAYS,
            auto_cleanup: true,
        }
    }
}

/// Database size and per-table row counts.
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    #[serde(rename = "fileSizeBytes")]
    pub file_size_bytes: u64,
    pub tables: BTreeMap<String, u64>,
}
