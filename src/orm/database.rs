// SPDX-License-Identifier: Apache-2.0

//! Primary store handle

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use resql_core::{ResqlError, ResqlResult};
use resql_sql::{parse_store_url, SqlDialect, StatementClassifier, StoreUrl};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, instrument};

use super::connection::Connection;
use super::listener::{StatementListener, StatementScope};
use super::session::SessionFactory;
use crate::config::{Settings, DEFAULT_MAX_CONNECTIONS};

/// Dialect/driver identity reported with every statement
pub const DIALECT_DESCRIPTION: &str = "sqlite+sqlx";

const ACQUIRE_TIMEOUT_SECS: u64 = 30;

struct DatabaseInner {
    pool: SqlitePool,
    url: StoreUrl,
    listeners: RwLock<Vec<Arc<dyn StatementListener>>>,
    classifier: StatementClassifier,
}

/// Pooled handle to the primary store. Clones share the pool and the
/// pool-scope listeners.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub async fn connect(url: &str) -> ResqlResult<Self> {
        Self::connect_with(url, DEFAULT_MAX_CONNECTIONS).await
    }

    pub async fn from_settings(settings: &Settings) -> ResqlResult<Self> {
        Self::connect_with(settings.primary_url.expose(), settings.max_connections).await
    }

    #[instrument(skip(url))]
    pub async fn connect_with(url: &str, max_connections: u32) -> ResqlResult<Self> {
        let parsed = parse_store_url(url).map_err(|e| ResqlError::config(e.to_string()))?;
        if parsed.driver != SqlDialect::Sqlite {
            return Err(ResqlError::not_supported(
                "the primary store must be SQLite",
            ));
        }

        let mut opts = SqliteConnectOptions::from_str(url)
            .map_err(|e| ResqlError::config(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(30));

        // Every pooled connection to :memory: is its own database
        let max_connections = if parsed.is_in_memory() {
            1
        } else {
            opts = opts.journal_mode(SqliteJournalMode::Wal);
            max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(ACQUIRE_TIMEOUT_SECS))
            .connect_with(opts)
            .await
            .map_err(|e| ResqlError::connection_failed(e.to_string()))?;

        debug!(url = %parsed.redacted, "Primary store pool ready");

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                pool,
                url: parsed,
                listeners: RwLock::new(Vec::new()),
                classifier: StatementClassifier::new(SqlDialect::Sqlite),
            }),
        })
    }

    /// Checks a connection out of the pool.
    pub async fn connection(&self) -> ResqlResult<Connection> {
        let conn = self.inner.pool.acquire().await.map_err(|e| {
            ResqlError::connection_failed(format!("Failed to acquire connection: {}", e))
        })?;
        Ok(Connection::new(self.clone(), conn))
    }

    pub fn session_factory(&self) -> SessionFactory {
        SessionFactory::new(self.clone())
    }

    pub fn dialect(&self) -> SqlDialect {
        SqlDialect::Sqlite
    }

    pub fn dialect_description(&self) -> &'static str {
        DIALECT_DESCRIPTION
    }

    pub fn url(&self) -> &StoreUrl {
        &self.inner.url
    }

    pub fn classifier(&self) -> &StatementClassifier {
        &self.inner.classifier
    }

    pub fn add_listener(&self, listener: Arc<dyn StatementListener>) {
        self.inner.listeners.write().push(listener);
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn StatementListener>> {
        self.inner.listeners.read().clone()
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.inner.pool
    }

    pub async fn close(&self) {
        self.inner.pool.close().await;
    }
}

impl StatementScope for Database {
    fn attach_statement_listener(&mut self, listener: Arc<dyn StatementListener>) {
        self.add_listener(listener);
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("url", &self.inner.url.redacted)
            .field("listeners", &self.inner.listeners.read().len())
            .finish()
    }
}
