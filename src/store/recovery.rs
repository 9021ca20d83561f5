//! Recovery store
//!
//! Append-only `query_log` table. Each write commits independently.

use std::time::Instant;

use resql_core::{Extra, ParamSet, QueryRecord, ResqlError, ResqlResult, StatementKind};
use resql_sql::SqlDialect;
use sqlx::Row;
use tracing::{debug, error, instrument};

use super::{id_column, json_column, json_placeholder, json_type, timestamp_type, SecondaryPool};
use crate::metrics;

pub const DEFAULT_QUERY_LOG_TABLE: &str = "query_log";

#[derive(Debug, Clone)]
pub struct RecoveryStore {
    pool: SecondaryPool,
    table: String,
}

fn write_failed(e: sqlx::Error) -> ResqlError {
    ResqlError::recovery_write_failed(e.to_string())
}

fn read_failed(e: sqlx::Error) -> ResqlError {
    ResqlError::execution_error(format!("Failed to read recovery store: {}", e))
}

macro_rules! insert_one {
    ($pool:expr, $sql:expr, $record:expr, $parameters:expr, $extra:expr) => {{
        let mut tx = $pool.begin().await.map_err(write_failed)?;
        let id: i64 = sqlx::query_scalar($sql)
            .bind($record.dialect_description.as_str())
            .bind($record.executed_at)
            .bind($extra)
            .bind($parameters)
            .bind($record.statement.as_str())
            .bind($record.op_type.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(write_failed)?;
        tx.commit().await.map_err(write_failed)?;
        id
    }};
}

macro_rules! read_all {
    ($pool:expr, $sql:expr) => {{
        let rows = sqlx::query($sql)
            .fetch_all($pool)
            .await
            .map_err(read_failed)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let parameters: String = row.try_get("parameters").map_err(read_failed)?;
            let extra: Option<String> = row.try_get("extra").map_err(read_failed)?;
            let op_type: String = row.try_get("type").map_err(read_failed)?;
            records.push(QueryRecord {
                id: Some(row.try_get("id").map_err(read_failed)?),
                dialect_description: row.try_get("dialect_description").map_err(read_failed)?,
                statement: row.try_get("statement").map_err(read_failed)?,
                parameters: serde_json::from_str::<Vec<ParamSet>>(&parameters)
                    .map_err(|e| ResqlError::mapping(e.to_string()))?,
                op_type: StatementKind::parse(&op_type),
                extra: extra
                    .as_deref()
                    .map(serde_json::from_str::<Extra>)
                    .transpose()
                    .map_err(|e| ResqlError::mapping(e.to_string()))?,
                executed_at: row.try_get("executed_at").map_err(read_failed)?,
            });
        }
        records
    }};
}

impl RecoveryStore {
    pub fn new(pool: impl Into<SecondaryPool>) -> Self {
        Self {
            pool: pool.into(),
            table: DEFAULT_QUERY_LOG_TABLE.to_string(),
        }
    }

    pub async fn connect(url: &str) -> ResqlResult<Self> {
        Ok(Self::new(SecondaryPool::connect(url).await?))
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pool(&self) -> &SecondaryPool {
        &self.pool
    }

    fn dialect(&self) -> SqlDialect {
        self.pool.dialect()
    }

    pub async fn ensure_schema(&self) -> ResqlResult<()> {
        let d = self.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id {}, \
                dialect_description VARCHAR(64) NOT NULL, \
                executed_at {} NOT NULL, \
                extra {}, \
                parameters {} NOT NULL, \
                statement TEXT NOT NULL, \
                type VARCHAR(32) NOT NULL)",
            d.quote_ident(&self.table),
            id_column(d),
            timestamp_type(d),
            json_type(d),
            json_type(d),
        );

        let result = match &self.pool {
            SecondaryPool::Sqlite(pool) => sqlx::query(&sql).execute(pool).await.map(|_| ()),
            SecondaryPool::Postgres(pool) => sqlx::query(&sql).execute(pool).await.map(|_| ()),
        };
        result.map_err(|e| {
            ResqlError::recovery_write_failed(format!("Failed to create {}: {}", self.table, e))
        })
    }

    /// Appends one statement record and returns its id.
    #[instrument(skip(self, record), fields(table = %self.table, kind = %record.op_type))]
    pub async fn write_query(&self, record: &QueryRecord) -> ResqlResult<i64> {
        let parameters = serde_json::to_string(&record.parameters)
            .map_err(|e| ResqlError::recovery_write_failed(e.to_string()))?;
        let extra = record
            .extra
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| ResqlError::recovery_write_failed(e.to_string()))?;

        let d = self.dialect();
        let sql = format!(
            "INSERT INTO {} (dialect_description, executed_at, extra, parameters, statement, type) \
             VALUES ({}, {}, {}, {}, {}, {}) RETURNING id",
            d.quote_ident(&self.table),
            d.placeholder(1),
            d.placeholder(2),
            json_placeholder(d, 3),
            json_placeholder(d, 4),
            d.placeholder(5),
            d.placeholder(6),
        );

        let started = Instant::now();
        let result: ResqlResult<i64> = async {
            Ok(match &self.pool {
                SecondaryPool::Sqlite(pool) => {
                    insert_one!(pool, &sql, record, parameters.as_str(), extra.as_deref())
                }
                SecondaryPool::Postgres(pool) => {
                    insert_one!(pool, &sql, record, parameters.as_str(), extra.as_deref())
                }
            })
        }
        .await;

        metrics::record_query_write(started.elapsed(), result.is_ok());
        match &result {
            Ok(id) => debug!(id, "Statement record committed"),
            Err(e) => error!(error = %e, "Failed to write statement record"),
        }
        result
    }

    /// Every record, oldest first.
    pub async fn records(&self) -> ResqlResult<Vec<QueryRecord>> {
        let d = self.dialect();
        let sql = format!(
            "SELECT id, dialect_description, executed_at, {}, {}, statement, type FROM {} ORDER BY id",
            json_column(d, "extra"),
            json_column(d, "parameters"),
            d.quote_ident(&self.table),
        );

        Ok(match &self.pool {
            SecondaryPool::Sqlite(pool) => read_all!(pool, &sql),
            SecondaryPool::Postgres(pool) => read_all!(pool, &sql),
        })
    }
}
