// SPDX-License-Identifier: Apache-2.0

//! SQL tooling for resql
//!
//! - `dialect`: quoting and placeholder styles
//! - `classify`: read-only vs write detection for the recovery log
//! - `statement`: `:name` placeholder compilation
//! - `generate`: INSERT/UPDATE/DELETE/SELECT for tracked entities
//! - `connection_url`: store DSN validation

pub mod classify;
pub mod connection_url;
pub mod dialect;
pub mod generate;
pub mod statement;

pub use classify::{classify, StatementClassifier};
pub use connection_url::{parse_store_url, ParseError, ParseErrorCode, StoreUrl};
pub use dialect::SqlDialect;
pub use statement::{CompiledStatement, Statement};
