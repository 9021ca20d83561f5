//! Statements with named parameters
//!
//! Application code writes `:name` placeholders; the drivers only understand
//! positional ones. [`Statement::compile`] rewrites the text for a dialect and
//! remembers which name feeds which slot.

use resql_core::{ParamSet, ResqlError, ResqlResult, StatementKind};
use serde_json::Value;

use crate::dialect::SqlDialect;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    source: String,
    kind: Option<StatementKind>,
}

impl Statement {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            kind: None,
        }
    }

    /// Statement whose kind is already known (generated SQL).
    pub fn with_kind(source: impl Into<String>, kind: StatementKind) -> Self {
        Self {
            source: source.into(),
            kind: Some(kind),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn kind(&self) -> Option<StatementKind> {
        self.kind
    }

    pub fn compile(&self, dialect: SqlDialect) -> CompiledStatement {
        let (sql, names) = rewrite_placeholders(&self.source, dialect);
        CompiledStatement {
            sql,
            names,
            kind: self.kind,
        }
    }
}

impl From<&str> for Statement {
    fn from(value: &str) -> Self {
        Statement::new(value)
    }
}

impl From<String> for Statement {
    fn from(value: String) -> Self {
        Statement::new(value)
    }
}

/// Dialect-specific SQL plus the parameter name bound to each slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledStatement {
    pub sql: String,
    /// One entry per positional slot (`$n` slots are deduplicated).
    pub names: Vec<String>,
    pub kind: Option<StatementKind>,
}

impl CompiledStatement {
    /// Values of `params` in slot order.
    ///
    /// Without named placeholders every value of the set is bound in insertion
    /// order.
    pub fn bind_order<'a>(&self, params: &'a ParamSet) -> ResqlResult<Vec<&'a Value>> {
        if self.names.is_empty() {
            return Ok(params.values().collect());
        }
        self.names
            .iter()
            .map(|name| {
                params.get(name).ok_or_else(|| {
                    ResqlError::execution_error(format!(
                        "Missing value for parameter :{name}"
                    ))
                })
            })
            .collect()
    }
}

fn rewrite_placeholders(source: &str, dialect: SqlDialect) -> (String, Vec<String>) {
    let mut sql = String::with_capacity(source.len());
    let mut names: Vec<String> = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' => {
                let end = find_closing(&chars, i + 1, c);
                sql.extend(&chars[i..end]);
                i = end;
            }
            '-' if chars.get(i + 1) == Some(&'-') => {
                let end = chars[i..]
                    .iter()
                    .position(|&ch| ch == '\n')
                    .map(|p| i + p)
                    .unwrap_or(chars.len());
                sql.extend(&chars[i..end]);
                i = end;
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                let mut end = i + 2;
                while end + 1 < chars.len() && !(chars[end] == '*' && chars[end + 1] == '/') {
                    end += 1;
                }
                let end = (end + 2).min(chars.len());
                sql.extend(&chars[i..end]);
                i = end;
            }
            ':' if chars.get(i + 1) == Some(&':') => {
                sql.push_str("::");
                i += 2;
            }
            ':' if chars
                .get(i + 1)
                .is_some_and(|ch| ch.is_alphabetic() || *ch == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();

                if dialect.numbered_placeholders() {
                    let slot = match names.iter().position(|n| *n == name) {
                        Some(pos) => pos + 1,
                        None => {
                            names.push(name);
                            names.len()
                        }
                    };
                    sql.push_str(&dialect.placeholder(slot));
                } else {
                    names.push(name);
                    sql.push_str(&dialect.placeholder(names.len()));
                }
                i = end;
            }
            _ => {
                sql.push(c);
                i += 1;
            }
        }
    }

    (sql, names)
}

/// Index one past the closing `quote`, honouring doubled-quote escapes.
fn find_closing(chars: &[char], mut i: usize, quote: char) -> usize {
    while i < chars.len() {
        if chars[i] == quote {
            if chars.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    chars.len()
}
