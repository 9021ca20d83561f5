// SPDX-License-Identifier: Apache-2.0

//! Normalized error types for resql
//!
//! Driver errors (primary store, audit store, recovery store) are mapped to
//! these variants so callers of the primary operation see one error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all resql operations
#[derive(Debug, Error, Serialize, Deserialize)]
pub enum ResqlError {
    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Statement execution error: {message}")]
    ExecutionError { message: String },

    #[error("Transaction error: {message}")]
    TransactionError { message: String },

    #[error("Cannot diff {table}.{field}: {message}")]
    DiffError {
        table: String,
        field: String,
        message: String,
    },

    #[error("Mapping error: {message}")]
    MappingError { message: String },

    #[error("Audit store write failed: {message}")]
    AuditWriteFailed { message: String },

    #[error("Recovery store write failed: {message}")]
    RecoveryWriteFailed { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Feature not supported: {message}")]
    NotSupported { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ResqlError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed { message: msg.into() }
    }

    pub fn execution_error(msg: impl Into<String>) -> Self {
        Self::ExecutionError { message: msg.into() }
    }

    pub fn transaction_error(msg: impl Into<String>) -> Self {
        Self::TransactionError { message: msg.into() }
    }

    pub fn diff_error(
        table: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::DiffError {
            table: table.into(),
            field: field.into(),
            message: msg.into(),
        }
    }

    pub fn mapping(msg: impl Into<String>) -> Self {
        Self::MappingError { message: msg.into() }
    }

    pub fn audit_write_failed(msg: impl Into<String>) -> Self {
        Self::AuditWriteFailed { message: msg.into() }
    }

    pub fn recovery_write_failed(msg: impl Into<String>) -> Self {
        Self::RecoveryWriteFailed { message: msg.into() }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigError { message: msg.into() }
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Self::NotSupported { message: msg.into() }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal { message: msg.into() }
    }

    /// True for failures of the audit or recovery store.
    pub fn is_secondary_write(&self) -> bool {
        matches!(
            self,
            Self::AuditWriteFailed { .. } | Self::RecoveryWriteFailed { .. }
        )
    }
}

/// Result type alias for resql operations
pub type ResqlResult<T> = Result<T, ResqlError>;
