use std::sync::Arc;

use resql_core::Extra;

use super::{ChangeLogger, QueryLogger};
use crate::orm::{ChangeScope, StatementScope};
use crate::store::{AuditStore, RecoveryStore};

/// Metadata stamped on every record a logger produces.
///
/// Captured once when the logger is built. Loggers never share a context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogContext {
    extra: Option<Extra>,
}

impl LogContext {
    pub fn new(extra: Option<Extra>) -> Self {
        Self { extra }
    }

    pub fn extra(&self) -> Option<&Extra> {
        self.extra.as_ref()
    }
}

impl From<Extra> for LogContext {
    fn from(extra: Extra) -> Self {
        Self::new(Some(extra))
    }
}

impl From<Option<Extra>> for LogContext {
    fn from(extra: Option<Extra>) -> Self {
        Self::new(extra)
    }
}

/// Audits every flush of `of` into `to`.
///
/// `of` is a session or a session factory. Binding more than one logger to
/// the same scope is additive.
pub fn log_changes(
    of: &mut impl ChangeScope,
    to: AuditStore,
    extra: impl Into<LogContext>,
) -> Arc<ChangeLogger> {
    let logger = Arc::new(ChangeLogger::new(to, extra.into()));
    of.attach_flush_listener(logger.clone());
    logger
}

/// Records every write statement executed through `of` into `to`.
///
/// `of` is a database (pool scope), a connection, a transaction or a session.
pub fn log_queries(
    of: &mut impl StatementScope,
    to: RecoveryStore,
    extra: impl Into<LogContext>,
) -> Arc<QueryLogger> {
    let logger = Arc::new(QueryLogger::new(to, extra.into()));
    of.attach_statement_listener(logger.clone());
    logger
}
