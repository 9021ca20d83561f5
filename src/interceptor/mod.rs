//! Change and statement interceptors
//!
//! - **Change logging**: one audit record per entity touched by a flush
//! - **Statement logging**: one recovery record per executed write statement
//!
//! Each logger is an explicit object bound to a scope through
//! [`log_changes`] or [`log_queries`]. It carries its own `extra` payload and
//! is dropped with the scope it was attached to.

mod change;
mod context;
mod query;

pub use change::ChangeLogger;
pub use context::{log_changes, log_queries, LogContext};
pub use query::QueryLogger;
