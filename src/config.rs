// SPDX-License-Identifier: Apache-2.0

//! Store configuration
//!
//! Three DSNs, read once at process start: the primary store, the audit store
//! and the recovery store.

use resql_core::{ResqlError, ResqlResult};
use resql_sql::connection_url::{parse_store_url, StoreUrl};
use serde::{Deserialize, Serialize};

use crate::observability::SecretUrl;

pub const PRIMARY_URL_VAR: &str = "RESQL_PRIMARY_URL";
pub const AUDIT_URL_VAR: &str = "RESQL_AUDIT_URL";
pub const RECOVERY_URL_VAR: &str = "RESQL_RECOVERY_URL";
pub const MAX_CONNECTIONS_VAR: &str = "RESQL_MAX_CONNECTIONS";

pub const DEFAULT_PRIMARY_URL: &str = "sqlite:production.sqlite3";
pub const DEFAULT_AUDIT_URL: &str = "sqlite:audit.sqlite3";
pub const DEFAULT_RECOVERY_URL: &str = "sqlite:recovery.sqlite3";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub primary_url: SecretUrl,
    pub audit_url: SecretUrl,
    pub recovery_url: SecretUrl,
    pub max_connections: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            primary_url: SecretUrl::new(DEFAULT_PRIMARY_URL),
            audit_url: SecretUrl::new(DEFAULT_AUDIT_URL),
            recovery_url: SecretUrl::new(DEFAULT_RECOVERY_URL),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl Settings {
    /// Loads `.env` (if any), then reads the `RESQL_*` variables.
    pub fn from_env() -> ResqlResult<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(ResqlError::config(format!("Failed to load .env: {e}")));
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ResqlResult<Self> {
        let read = |key: &str, default: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let max_connections = match lookup(MAX_CONNECTIONS_VAR) {
            Some(raw) if !raw.trim().is_empty() => raw.trim().parse::<u32>().map_err(|_| {
                ResqlError::config(format!("{MAX_CONNECTIONS_VAR} must be a positive integer"))
            })?,
            _ => DEFAULT_MAX_CONNECTIONS,
        };
        if max_connections == 0 {
            return Err(ResqlError::config(format!(
                "{MAX_CONNECTIONS_VAR} must be a positive integer"
            )));
        }

        let settings = Self {
            primary_url: SecretUrl::new(read(PRIMARY_URL_VAR, DEFAULT_PRIMARY_URL)),
            audit_url: SecretUrl::new(read(AUDIT_URL_VAR, DEFAULT_AUDIT_URL)),
            recovery_url: SecretUrl::new(read(RECOVERY_URL_VAR, DEFAULT_RECOVERY_URL)),
            max_connections,
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Checks every DSN; the primary store must be SQLite.
    pub fn validate(&self) -> ResqlResult<()> {
        let primary = validate_url(PRIMARY_URL_VAR, self.primary_url.expose())?;
        if primary.driver != resql_sql::SqlDialect::Sqlite {
            return Err(ResqlError::config(format!(
                "{PRIMARY_URL_VAR} must be a sqlite: URL"
            )));
        }
        validate_url(AUDIT_URL_VAR, self.audit_url.expose())?;
        validate_url(RECOVERY_URL_VAR, self.recovery_url.expose())?;
        Ok(())
    }
}

fn validate_url(var: &str, dsn: &str) -> ResqlResult<StoreUrl> {
    parse_store_url(dsn).map_err(|e| ResqlError::config(format!("{var}: {e}")))
}
