// SPDX-License-Identifier: Apache-2.0

//! resql - transactional change capture and statement recovery logging
//!
//! Two independent loggers attach to a primary SQLite store:
//! - [`interceptor::ChangeLogger`] writes one field-level diff per entity
//!   touched by a session flush into the audit store (`change_log`).
//! - [`interceptor::QueryLogger`] writes every executed write statement with
//!   its bound parameters into the recovery store (`query_log`).
//!
//! ```no_run
//! use resql::interceptor::{log_changes, log_queries, LogContext};
//! use resql::orm::Database;
//! use resql::store::{AuditStore, RecoveryStore};
//!
//! # async fn demo() -> resql::ResqlResult<()> {
//! let db = Database::connect("sqlite:production.sqlite3").await?;
//! let audit = AuditStore::connect("sqlite:audit.sqlite3").await?;
//! let recovery = RecoveryStore::connect("sqlite:recovery.sqlite3").await?;
//!
//! let mut session = db.session_factory().session().await?;
//! log_changes(&mut session, audit, LogContext::default());
//! log_queries(&mut session, recovery, LogContext::default());
//! session.commit().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod diff;
pub mod interceptor;
pub mod metrics;
pub mod observability;
pub mod orm;
pub mod store;

pub use resql_core::{
    ChangeRecord, Diff, Extra, FieldDef, FieldKind, Model, ModelDiff, OpType, ParamSet,
    QueryRecord, ResqlError, ResqlResult, StatementKind, TableDef, ValueKind,
};
pub use resql_sql::{SqlDialect, Statement};
