//! SQLite-backed gateway store.
//!
//! Split into focused submodules:
//! - `auth` — per-session credential blobs
//! - `instances` — session status rows (QR, connection, sync progress, profile)
//! - `contacts` — contact upserts with name-quality rules, presence, photos
//! - `leads` — one lead per (tenant, phone)
//! - `messages` — idempotent message upserts, receipts, reactions, poll votes
//! - `identity` — alias (LID) to phone mappings
//! - `reminders` — scheduled appointment reminders
//! - `webhooks` — per-tenant webhook targets

mod auth;
mod contacts;
mod identity;
mod instances;
mod leads;
mod messages;
mod reminders;
mod webhooks;

pub use auth::{AuthRow, CREDS_TYPE};
pub use contacts::{Contact, ContactPatch, NameSource};
pub use instances::{
    Instance, STATUS_CONNECTED, STATUS_CONNECTING, STATUS_DISCONNECTED, STATUS_LOGGED_OUT,
    STATUS_QR_READY,
};
pub use leads::Lead;
pub use messages::StoredMessage;
pub use reminders::Reminder;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use tracing::info;
use wagate_core::{config::StoreConfig, error::GatewayError, shellexpand};

/// Persistent gateway store backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (or create) the database file and run pending migrations.
    pub async fn new(config: &StoreConfig) -> Result<Self, GatewayError> {
        let db_path = shellexpand(&config.db_path);

        if let Some(parent) = std::path::Path::new(&db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GatewayError::Store(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| GatewayError::Store(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::Store(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("gateway store initialized at {db_path}");

        Ok(Self { pool })
    }

    /// A throwaway in-memory store with the full schema. Single connection,
    /// since every new `:memory:` connection is a fresh database.
    pub async fn in_memory() -> Result<Self, GatewayError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| GatewayError::Store(format!("invalid db url: {e}")))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| GatewayError::Store(format!("failed to open in-memory sqlite: {e}")))?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run SQL migrations, tracking which have already been applied.
    async fn run_migrations(pool: &SqlitePool) -> Result<(), GatewayError> {
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS _migrations (
                name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .execute(pool)
        .await
        .map_err(|e| GatewayError::Store(format!("failed to create migrations table: {e}")))?;

        let migrations: &[(&str, &str)] = &[
            ("001_init", include_str!("../../migrations/001_init.sql")),
            (
                "002_reminders_webhooks",
                include_str!("../../migrations/002_reminders_webhooks.sql"),
            ),
        ];

        for (name, sql) in migrations {
            let applied: Option<(String,)> =
                sqlx::query_as("SELECT name FROM _migrations WHERE name = ?")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| {
                        GatewayError::Store(format!("failed to check migration {name}: {e}"))
                    })?;

            if applied.is_some() {
                continue;
            }

            sqlx::raw_sql(sql)
                .execute(pool)
                .await
                .map_err(|e| GatewayError::Store(format!("migration {name} failed: {e}")))?;

            sqlx::query("INSERT INTO _migrations (name) VALUES (?)")
                .bind(name)
                .execute(pool)
                .await
                .map_err(|e| {
                    GatewayError::Store(format!("failed to record migration {name}: {e}"))
                })?;
        }
        Ok(())
    }
}

/// Current unix time in seconds.
pub(crate) fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
