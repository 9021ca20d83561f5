//! SQL dialects understood by resql

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{Dialect, PostgreSqlDialect, SQLiteDialect};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl SqlDialect {
    pub fn from_driver_id(driver_id: &str) -> Option<Self> {
        match driver_id.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(SqlDialect::Sqlite),
            "postgres" | "postgresql" => Some(SqlDialect::Postgres),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Postgres => "postgres",
        }
    }

    /// Quote an identifier according to the dialect
    pub fn quote_ident(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// Positional placeholder for the 1-based bind slot `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Sqlite => "?".to_string(),
            SqlDialect::Postgres => format!("${index}"),
        }
    }

    /// True when a placeholder may be referenced more than once by number.
    pub fn numbered_placeholders(&self) -> bool {
        matches!(self, SqlDialect::Postgres)
    }

    pub fn parser_dialect(&self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Sqlite => Box::new(SQLiteDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
        }
    }
}
