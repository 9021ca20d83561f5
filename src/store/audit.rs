// SPDX-License-Identifier: Apache-2.0

//! Audit store
//!
//! Append-only `change_log` table. All records of one materialization event
//! are committed in one transaction.

use std::time::Instant;

use chrono::{DateTime, Utc};
use resql_core::{ChangeRecord, Extra, ModelDiff, OpType, ResqlError, ResqlResult};
use resql_sql::SqlDialect;
use sqlx::Row;
use tracing::{debug, error, instrument};

use super::{id_column, json_column, json_placeholder, json_type, timestamp_type, SecondaryPool};
use crate::metrics;

pub const DEFAULT_CHANGE_LOG_TABLE: &str = "change_log";

#[derive(Debug, Clone)]
pub struct AuditStore {
    pool: SecondaryPool,
    table: String,
}

fn write_failed(e: sqlx::Error) -> ResqlError {
    ResqlError::audit_write_failed(e.to_string())
}

fn read_failed(e: sqlx::Error) -> ResqlError {
    ResqlError::execution_error(format!("Failed to read audit store: {}", e))
}

fn encode(record: &ChangeRecord) -> ResqlResult<(String, Option<String>)> {
    let diff = serde_json::to_string(&record.diff)
        .map_err(|e| ResqlError::audit_write_failed(e.to_string()))?;
    let extra = record
        .extra
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| ResqlError::audit_write_failed(e.to_string()))?;
    Ok((diff, extra))
}

#[allow(clippy::too_many_arguments)]
fn decode(
    id: i64,
    diff: &str,
    executed_at: DateTime<Utc>,
    extra: Option<&str>,
    record_id: i64,
    table_name: String,
    op_type: &str,
) -> ResqlResult<ChangeRecord> {
    let diff: ModelDiff =
        serde_json::from_str(diff).map_err(|e| ResqlError::mapping(e.to_string()))?;
    let extra: Option<Extra> = extra
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| ResqlError::mapping(e.to_string()))?;
    let op_type = OpType::parse(op_type)
        .ok_or_else(|| ResqlError::mapping(format!("Unknown change type '{op_type}'")))?;

    Ok(ChangeRecord {
        id: Some(id),
        table_name,
        record_id,
        op_type,
        diff,
        extra,
        executed_at,
    })
}

macro_rules! insert_all {
    ($pool:expr, $sql:expr, $records:expr) => {{
        let mut tx = $pool.begin().await.map_err(write_failed)?;
        let mut ids = Vec::with_capacity($records.len());
        for record in $records {
            let (diff, extra) = encode(record)?;
            let id: i64 = sqlx::query_scalar($sql)
                .bind(diff)
                .bind(record.executed_at)
                .bind(extra)
                .bind(record.record_id)
                .bind(record.table_name.as_str())
                .bind(record.op_type.as_str())
                .fetch_one(&mut *tx)
                .await
                .map_err(write_failed)?;
            ids.push(id);
        }
        tx.commit().await.map_err(write_failed)?;
        ids
    }};
}

macro_rules! read_all {
    ($pool:expr, $sql:expr) => {{
        let rows = sqlx::query($sql)
            .fetch_all($pool)
            .await
            .map_err(read_failed)?;
        rows.iter()
            .map(|row| {
                decode(
                    row.try_get("id").map_err(read_failed)?,
                    row.try_get::<String, _>("diff").map_err(read_failed)?.as_str(),
                    row.try_get("executed_at").map_err(read_failed)?,
                    row.try_get::<Option<String>, _>("extra")
                        .map_err(read_failed)?
                        .as_deref(),
                    row.try_get("record_id").map_err(read_failed)?,
                    row.try_get("table_name").map_err(read_failed)?,
                    row.try_get::<String, _>("type").map_err(read_failed)?.as_str(),
                )
            })
            .collect::<ResqlResult<Vec<_>>>()?
    }};
}

impl AuditStore {
    pub fn new(pool: impl Into<SecondaryPool>) -> Self {
        Self {
            pool: pool.into(),
            table: DEFAULT_CHANGE_LOG_TABLE.to_string(),
        }
    }

    pub async fn connect(url: &str) -> ResqlResult<Self> {
        Ok(Self::new(SecondaryPool::connect(url).await?))
    }

    /// Writes to `table` instead of `change_log`.
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

    /// Creates the change log table if it does not exist yet.
    pub async fn ensure_schema(&self) -> ResqlResult<()> {
        let d = self.dialect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
                id {}, \
                diff {} NOT NULL, \
                executed_at {} NOT NULL, \
                extra {}, \
                record_id BIGINT NOT NULL, \
                table_name VARCHAR(128) NOT NULL, \
                type VARCHAR(32) NOT NULL)",
            d.quote_ident(&self.table),
            id_column(d),
            json_type(d),
            timestamp_type(d),
            json_type(d),
        );

        let result = match &self.pool {
            SecondaryPool::Sqlite(pool) => sqlx::query(&sql).execute(pool).await.map(|_| ()),
            SecondaryPool::Postgres(pool) => sqlx::query(&sql).execute(pool).await.map(|_| ()),
        };
        result.map_err(|e| {
            ResqlError::audit_write_failed(format!("Failed to create {}: {}", self.table, e))
        })
    }

    /// Appends `records` in one transaction and returns their ids.
    #[instrument(skip(self, records), fields(table = %self.table, count = records.len()))]
    pub async fn write_changes(&self, records: &[ChangeRecord]) -> ResqlResult<Vec<i64>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let d = self.dialect();
        let sql = format!(
            "INSERT INTO {} (diff, executed_at, extra, record_id, table_name, type) \
             VALUES ({}, {}, {}, {}, {}, {}) RETURNING id",
            d.quote_ident(&self.table),
            json_placeholder(d, 1),
            d.placeholder(2),
            json_placeholder(d, 3),
            d.placeholder(4),
            d.placeholder(5),
            d.placeholder(6),
        );

        let started = Instant::now();
        let result: ResqlResult<Vec<i64>> = async {
            Ok(match &self.pool {
                SecondaryPool::Sqlite(pool) => insert_all!(pool, &sql, records),
                SecondaryPool::Postgres(pool) => insert_all!(pool, &sql, records),
            })
        }
        .await;

        metrics::record_change_batch(records.len(), started.elapsed(), result.is_ok());
        match &result {
            Ok(ids) => debug!(ids = ?ids, "Change records committed"),
            Err(e) => error!(error = %e, "Failed to write change records"),
        }
        result
    }

    /// Every record, oldest first.
    pub async fn records(&self) -> ResqlResult<Vec<ChangeRecord>> {
        let d = self.dialect();
        let sql = format!(
            "SELECT id, {}, executed_at, {}, record_id, table_name, type FROM {} ORDER BY id",
            json_column(d, "diff"),
            json_column(d, "extra"),
            d.quote_ident(&self.table),
        );

        Ok(match &self.pool {
            SecondaryPool::Sqlite(pool) => read_all!(pool, &sql),
            SecondaryPool::Postgres(pool) => read_all!(pool, &sql),
        })
    }
}
