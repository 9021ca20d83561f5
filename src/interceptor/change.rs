// SPDX-License-Identifier: Apache-2.0

//! Change logger
//!
//! Runs at the flush point of a session, after the flush statements were
//! issued and before the primary transaction commits. Records are built
//! deleted first, then dirty, then new, and written in one audit
//! transaction. A record already committed to the audit store stays there
//! even if the primary transaction is rolled back later.

use async_trait::async_trait;
use chrono::Utc;
use resql_core::{ChangeRecord, ModelDiff, OpType, ResqlError, ResqlResult};
use tracing::{debug, instrument};

use super::LogContext;
use crate::diff::compute_diff;
use crate::orm::{FlushContext, FlushListener, TrackedEntity};
use crate::store::AuditStore;

#[derive(Debug)]
pub struct ChangeLogger {
    store: AuditStore,
    context: LogContext,
}

impl ChangeLogger {
    pub fn new(store: AuditStore, context: LogContext) -> Self {
        Self { store, context }
    }

    pub fn store(&self) -> &AuditStore {
        &self.store
    }

    pub fn context(&self) -> &LogContext {
        &self.context
    }

    fn record(
        &self,
        entity: &TrackedEntity,
        op_type: OpType,
        diff: ModelDiff,
    ) -> ResqlResult<ChangeRecord> {
        let table = entity.table();
        let record_id = entity.identity().ok_or_else(|| {
            ResqlError::internal(format!(
                "{} entity reached the audit log without an identity",
                table.name
            ))
        })?;

        Ok(ChangeRecord {
            id: None,
            table_name: table.name.to_string(),
            record_id,
            op_type,
            diff,
            extra: self.context.extra().cloned(),
            executed_at: Utc::now(),
        })
    }
}

#[async_trait]
impl FlushListener for ChangeLogger {
    #[instrument(skip_all, fields(session_id = %ctx.session_id))]
    async fn after_flush(&self, ctx: &mut FlushContext<'_>) -> ResqlResult<()> {
        if ctx.is_empty() {
            return Ok(());
        }

        let mut records = Vec::with_capacity(ctx.deleted.len() + ctx.dirty.len() + ctx.new.len());

        // Deletes carry only the identity.
        for entity in &ctx.deleted {
            records.push(self.record(entity, OpType::Delete, ModelDiff::new())?);
        }
        for entity in &ctx.dirty {
            let diff = compute_diff(entity, &mut *ctx.loader).await?;
            records.push(self.record(entity, OpType::Update, diff)?);
        }
        for entity in &ctx.new {
            let diff = compute_diff(entity, &mut *ctx.loader).await?;
            records.push(self.record(entity, OpType::Insert, diff)?);
        }

        debug!(count = records.len(), "Writing change records");
        self.store.write_changes(&records).await?;
        Ok(())
    }
}
