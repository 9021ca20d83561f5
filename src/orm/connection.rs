//! Pooled connection with statement reporting
//!
//! ## Transaction handling
//!
//! A transaction is begun implicitly by the first statement and stays open
//! until `commit` or `rollback`. `BEGIN`/`COMMIT`/`ROLLBACK` are issued as raw
//! statements on the dedicated pooled connection and are not reported to
//! listeners. A connection dropped inside a transaction is detached from the
//! pool and closed, which rolls the transaction back.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use async_trait::async_trait;
use resql_core::{FieldDef, ParamSet, ResqlError, ResqlResult, StatementKind, TableDef};
use resql_sql::{generate, SqlDialect, Statement};
use serde_json::Value;
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteRow};
use sqlx::{Column, Row as _};
use tracing::{instrument, trace, warn};

use super::database::{Database, DIALECT_DESCRIPTION};
use super::listener::{FieldLoader, StatementEvent, StatementListener, StatementScope};
use super::ConnectionId;

/// Result row keyed by column name
pub type Row = serde_json::Map<String, Value>;

pub struct Connection {
    id: ConnectionId,
    db: Database,
    conn: Option<PoolConnection<Sqlite>>,
    in_transaction: bool,
    listeners: Vec<Arc<dyn StatementListener>>,
    tx_listeners: Vec<Arc<dyn StatementListener>>,
}

impl Connection {
    pub(crate) fn new(db: Database, conn: PoolConnection<Sqlite>) -> Self {
        Self {
            id: ConnectionId::new(),
            db,
            conn: Some(conn),
            in_transaction: false,
            listeners: Vec::new(),
            tx_listeners: Vec::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Connection-scope listener; applies until the connection is dropped.
    pub fn add_listener(&mut self, listener: Arc<dyn StatementListener>) {
        self.listeners.push(listener);
    }

    /// Begins a transaction (if none is active) and returns a handle to it.
    pub async fn begin(&mut self) -> ResqlResult<TransactionScope<'_>> {
        self.autobegin().await?;
        Ok(TransactionScope { conn: self })
    }

    /// Executes `statement` once per parameter set and reports a single event.
    ///
    /// Returns the total number of affected rows.
    pub async fn execute(
        &mut self,
        statement: impl Into<Statement>,
        params: &[ParamSet],
    ) -> ResqlResult<u64> {
        let statement = statement.into();
        let (rows_affected, _) = self.run(&statement, params, false).await?;
        Ok(rows_affected)
    }

    /// Executes `statement` and returns its rows.
    pub async fn fetch_all(
        &mut self,
        statement: impl Into<Statement>,
        params: &ParamSet,
    ) -> ResqlResult<Vec<Row>> {
        let statement = statement.into();
        let (_, rows) = self
            .run(&statement, std::slice::from_ref(params), true)
            .await?;
        Ok(rows)
    }

    #[instrument(skip(self), fields(connection_id = %self.id))]
    pub async fn commit(&mut self) -> ResqlResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.finish("COMMIT").await
    }

    #[instrument(skip(self), fields(connection_id = %self.id))]
    pub async fn rollback(&mut self) -> ResqlResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.finish("ROLLBACK").await
    }

    /// Rolls back any open transaction and returns the connection to the pool.
    pub async fn close(mut self) -> ResqlResult<()> {
        self.rollback().await?;
        self.conn.take();
        Ok(())
    }

    async fn finish(&mut self, verb: &'static str) -> ResqlResult<()> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ResqlError::connection_failed("Connection already closed"))?;

        sqlx::query(verb).execute(&mut **conn).await.map_err(|e| {
            ResqlError::transaction_error(format!("Failed to {} transaction: {}", verb.to_lowercase(), e))
        })?;

        self.in_transaction = false;
        self.tx_listeners.clear();
        Ok(())
    }

    async fn autobegin(&mut self) -> ResqlResult<()> {
        if self.in_transaction {
            return Ok(());
        }
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ResqlError::connection_failed("Connection already closed"))?;

        sqlx::query("BEGIN").execute(&mut **conn).await.map_err(|e| {
            ResqlError::transaction_error(format!("Failed to begin transaction: {}", e))
        })?;

        self.in_transaction = true;
        Ok(())
    }

    async fn run(
        &mut self,
        statement: &Statement,
        params: &[ParamSet],
        fetch: bool,
    ) -> ResqlResult<(u64, Vec<Row>)> {
        let compiled = statement.compile(SqlDialect::Sqlite);
        let kind = compiled
            .kind
            .unwrap_or_else(|| self.db.classifier().classify(&compiled.sql));

        self.autobegin().await?;

        let no_params = [ParamSet::new()];
        let sets: &[ParamSet] = if params.is_empty() { &no_params } else { params };

        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| ResqlError::connection_failed("Connection already closed"))?;

        trace!(connection_id = %self.id, statement = %compiled.sql, sets = sets.len(), "Executing statement");

        let mut rows_affected = 0u64;
        let mut rows = Vec::new();
        for set in sets {
            let mut query = sqlx::query(&compiled.sql);
            for value in compiled.bind_order(set)? {
                query = bind_param(query, value);
            }

            if fetch {
                let fetched = query
                    .fetch_all(&mut **conn)
                    .await
                    .map_err(|e| ResqlError::execution_error(e.to_string()))?;
                rows_affected += fetched.len() as u64;
                rows.extend(fetched.iter().map(convert_row));
            } else {
                let result = query
                    .execute(&mut **conn)
                    .await
                    .map_err(|e| ResqlError::execution_error(e.to_string()))?;
                rows_affected += result.rows_affected();
            }
        }

        self.notify(&compiled.sql, kind, sets, rows_affected).await?;
        Ok((rows_affected, rows))
    }

    /// Pool listeners first, then connection-scope, then transaction-scope.
    async fn notify(
        &self,
        sql: &str,
        kind: StatementKind,
        sets: &[ParamSet],
        rows_affected: u64,
    ) -> ResqlResult<()> {
        let event = StatementEvent {
            connection_id: self.id,
            dialect_description: DIALECT_DESCRIPTION,
            statement: sql,
            kind,
            parameters: sets,
            rows_affected,
        };

        let pool_listeners = self.db.listeners();
        for listener in pool_listeners
            .iter()
            .chain(self.listeners.iter())
            .chain(self.tx_listeners.iter())
        {
            listener.after_execute(&event).await?;
        }
        Ok(())
    }
}

impl StatementScope for Connection {
    fn attach_statement_listener(&mut self, listener: Arc<dyn StatementListener>) {
        self.add_listener(listener);
    }
}

#[async_trait]
impl FieldLoader for Connection {
    async fn load_fields(
        &mut self,
        table: &'static TableDef,
        identity: i64,
        fields: &[&'static FieldDef],
    ) -> ResqlResult<BTreeMap<&'static str, Value>> {
        if fields.is_empty() {
            return Ok(BTreeMap::new());
        }
        let statement = generate::select_by_identity(SqlDialect::Sqlite, table, fields);
        let params = ParamSet::new().with(generate::IDENTITY_PARAM, identity);

        let row = self
            .fetch_all(statement, &params)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                ResqlError::mapping(format!("{} {} no longer exists", table.name, identity))
            })?;

        Ok(fields
            .iter()
            .map(|f| {
                let raw = row.get(f.column).cloned().unwrap_or(Value::Null);
                (f.name, f.decode(raw))
            })
            .collect())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.in_transaction {
            if let Some(conn) = self.conn.take() {
                warn!(connection_id = %self.id, "Connection dropped inside a transaction; discarding it");
                drop(conn.detach());
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// The connection's current transaction. Listeners attached here are dropped
/// when the transaction ends.
pub struct TransactionScope<'c> {
    conn: &'c mut Connection,
}

impl TransactionScope<'_> {
    pub fn add_listener(&mut self, listener: Arc<dyn StatementListener>) {
        self.conn.tx_listeners.push(listener);
    }

    pub async fn commit(self) -> ResqlResult<()> {
        self.conn.commit().await
    }

    pub async fn rollback(self) -> ResqlResult<()> {
        self.conn.rollback().await
    }
}

impl StatementScope for TransactionScope<'_> {
    fn attach_statement_listener(&mut self, listener: Arc<dyn StatementListener>) {
        self.add_listener(listener);
    }
}

impl Deref for TransactionScope<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
    }
}

impl DerefMut for TransactionScope<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn
    }
}

fn bind_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => query.bind(s.as_str()),
        other => query.bind(other.to_string()),
    }
}

fn convert_row(row: &SqliteRow) -> Row {
    row.columns()
        .iter()
        .map(|col| (col.name().to_string(), extract_value(row, col.ordinal())))
        .collect()
}

/// SQLite is dynamically typed, so try the likely types in order.
fn extract_value(row: &SqliteRow, idx: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return v
            .map(|bytes| Value::from(bytes.into_iter().map(Value::from).collect::<Vec<_>>()))
            .unwrap_or(Value::Null);
    }
    Value::Null
}
