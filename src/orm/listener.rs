//! Listener seams
//!
//! Interceptors are plain objects handed to a scope as `Arc<dyn ...>`. A scope
//! keeps every listener attached to it (no single-subscriber slot) and there is
//! no process-wide registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use resql_core::{FieldDef, ParamSet, ResqlResult, StatementKind, TableDef};
use serde_json::Value;

use super::entity::TrackedEntity;
use super::{ConnectionId, SessionId};

/// One executed statement, as reported after it ran.
#[derive(Debug)]
pub struct StatementEvent<'a> {
    pub connection_id: ConnectionId,
    pub dialect_description: &'a str,
    /// Rendered SQL, as sent to the driver
    pub statement: &'a str,
    pub kind: StatementKind,
    /// One set per execution; batched calls carry every row's set
    pub parameters: &'a [ParamSet],
    pub rows_affected: u64,
}

#[async_trait]
pub trait StatementListener: Send + Sync {
    /// Runs before control returns to the caller of the statement. An error
    /// fails that call.
    async fn after_execute(&self, event: &StatementEvent<'_>) -> ResqlResult<()>;
}

/// Batched field loading by identity.
#[async_trait]
pub trait FieldLoader: Send {
    async fn load_fields(
        &mut self,
        table: &'static TableDef,
        identity: i64,
        fields: &[&'static FieldDef],
    ) -> ResqlResult<BTreeMap<&'static str, Value>>;
}

/// State of a unit of work at its materialization point.
///
/// Statements have been issued, identities are assigned and field history is
/// still intact; the surrounding transaction has not committed.
pub struct FlushContext<'a> {
    pub session_id: SessionId,
    pub new: Vec<&'a TrackedEntity>,
    pub dirty: Vec<&'a TrackedEntity>,
    pub deleted: Vec<&'a TrackedEntity>,
    /// Reads through the flushing session's own connection and transaction
    pub loader: &'a mut dyn FieldLoader,
}

impl FlushContext<'_> {
    pub fn is_empty(&self) -> bool {
        self.new.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }
}

#[async_trait]
pub trait FlushListener: Send + Sync {
    async fn after_flush(&self, ctx: &mut FlushContext<'_>) -> ResqlResult<()>;
}

/// Something flush listeners can be attached to.
pub trait ChangeScope {
    fn attach_flush_listener(&mut self, listener: Arc<dyn FlushListener>);
}

/// Something statement listeners can be attached to.
pub trait StatementScope {
    fn attach_statement_listener(&mut self, listener: Arc<dyn StatementListener>);
}
