//! Secondary stores
//!
//! The audit store (`change_log`) and the recovery store (`query_log`) are
//! ordinary transactional databases, independent of the primary store. Each
//! write opens its own transaction on the secondary pool and commits it before
//! returning.

mod audit;
mod recovery;

pub use audit::{AuditStore, DEFAULT_CHANGE_LOG_TABLE};
pub use recovery::{RecoveryStore, DEFAULT_QUERY_LOG_TABLE};

use std::str::FromStr;
use std::time::Duration;

use resql_core::{ResqlError, ResqlResult};
use resql_sql::{parse_store_url, SqlDialect};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::debug;

use crate::config::DEFAULT_MAX_CONNECTIONS;

const ACQUIRE_TIMEOUT_SECS: u64 = 10;

/// Connection pool of a secondary store, chosen by DSN scheme.
#[derive(Debug, Clone)]
pub enum SecondaryPool {
    Sqlite(SqlitePool),
    Postgres(PgPool),
}

impl SecondaryPool {
    pub async fn connect(url: &str) -> ResqlResult<Self> {
        Self::connect_with(url, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn connect_with(url: &str, max_connections: u32) -> ResqlResult<Self> {
        let parsed = parse_store_url(url).map_err(|e| ResqlError::config(e.to_string()))?;
        let max_connections = max_connections.max(1);

        let pool = match parsed.driver {
            SqlDialect::Sqlite => {
                let mut opts = SqliteConnectOptions::from_str(url)
                    .map_err(|e| ResqlError::config(e.to_string()))?
                    .create_if_missing(true)
                    .busy_timeout(Duration::from_secs(30));
                let max_connections = if parsed.is_in_memory() {
                    1
                } else {
                    opts = opts.journal_mode(SqliteJournalMode::Wal);
                    max_connections
                };

                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
                    .connect_with(opts)
                    .await
                    .map_err(|e| ResqlError::connection_failed(e.to_string()))?;
                SecondaryPool::Sqlite(pool)
            }
            SqlDialect::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(max_connections)
                    .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
                    .connect(url)
                    .await
                    .map_err(|e| ResqlError::connection_failed(e.to_string()))?;
                SecondaryPool::Postgres(pool)
            }
        };

        debug!(url = %parsed.redacted, "Secondary store pool ready");
        Ok(pool)
    }

    pub fn dialect(&self) -> SqlDialect {
        match self {
            SecondaryPool::Sqlite(_) => SqlDialect::Sqlite,
            SecondaryPool::Postgres(_) => SqlDialect::Postgres,
        }
    }

    pub async fn close(&self) {
        match self {
            SecondaryPool::Sqlite(pool) => pool.close().await,
            SecondaryPool::Postgres(pool) => pool.close().await,
        }
    }
}

impl From<SqlitePool> for SecondaryPool {
    fn from(pool: SqlitePool) -> Self {
        SecondaryPool::Sqlite(pool)
    }
}

impl From<PgPool> for SecondaryPool {
    fn from(pool: PgPool) -> Self {
        SecondaryPool::Postgres(pool)
    }
}

/// Placeholder for a JSON value in slot `index`.
fn json_placeholder(dialect: SqlDialect, index: usize) -> String {
    match dialect {
        SqlDialect::Sqlite => dialect.placeholder(index),
        SqlDialect::Postgres => format!("{}::jsonb", dialect.placeholder(index)),
    }
}

/// Select-list entry reading a JSON column back as text.
fn json_column(dialect: SqlDialect, column: &str) -> String {
    match dialect {
        SqlDialect::Sqlite => column.to_string(),
        SqlDialect::Postgres => format!("{column}::text AS {column}"),
    }
}

fn json_type(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Sqlite => "TEXT",
        SqlDialect::Postgres => "JSONB",
    }
}

fn id_column(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Sqlite => "INTEGER PRIMARY KEY AUTOINCREMENT",
        SqlDialect::Postgres => "BIGSERIAL PRIMARY KEY",
    }
}

fn timestamp_type(dialect: SqlDialect) -> &'static str {
    match dialect {
        SqlDialect::Sqlite => "TEXT",
        SqlDialect::Postgres => "TIMESTAMPTZ",
    }
}
