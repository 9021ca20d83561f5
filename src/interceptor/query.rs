//! Statement logger
//!
//! Every write statement executed in the bound scope becomes one
//! [`QueryRecord`], committed to the recovery store before the statement's
//! caller regains control. Batched executions produce a single record holding
//! every parameter set.

use async_trait::async_trait;
use chrono::Utc;
use resql_core::{QueryRecord, ResqlResult};
use tracing::trace;

use super::LogContext;
use crate::metrics;
use crate::orm::{StatementEvent, StatementListener};
use crate::store::RecoveryStore;

#[derive(Debug)]
pub struct QueryLogger {
    store: RecoveryStore,
    context: LogContext,
}

impl QueryLogger {
    pub fn new(store: RecoveryStore, context: LogContext) -> Self {
        Self { store, context }
    }

    pub fn store(&self) -> &RecoveryStore {
        &self.store
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }
}

#[async_trait]
impl StatementListener for QueryLogger {
    async fn after_execute(&self, event: &StatementEvent<'_>) -> ResqlResult<()> {
        if event.kind.is_read_only() {
            trace!(connection_id = %event.connection_id, "Skipping read-only statement");
            metrics::record_skipped_read();
            return Ok(());
        }

        let record = QueryRecord {
            id: None,
            dialect_description: event.dialect_description.to_string(),
            statement: event.statement.to_string(),
            parameters: event.parameters.to_vec(),
            op_type: event.kind,
            extra: self.context.extra().cloned(),
            executed_at: Utc::now(),
        };
        self.store.write_query(&record).await?;
        Ok(())
    }
}
