// SPDX-License-Identifier: Apache-2.0

//! Statement classification
//!
//! `sqlparser` decides the statement kind when it can parse the text; the
//! first significant keyword decides it otherwise. The recovery log only cares
//! about one distinction (read-only or not), so a misparse never hides a write:
//! anything that is not positively a SELECT is treated as a write.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use resql_core::StatementKind;
use sqlparser::ast::{SetExpr, Statement};
use sqlparser::parser::Parser;

use crate::dialect::SqlDialect;

const DEFAULT_CACHE_SIZE: usize = 256;

/// Classifies `sql`. Multi-statement text is read-only only if every
/// statement in it is.
pub fn classify(sql: &str, dialect: SqlDialect) -> StatementKind {
    let parser_dialect = dialect.parser_dialect();
    match Parser::parse_sql(parser_dialect.as_ref(), sql) {
        Ok(statements) if !statements.is_empty() => {
            combine(statements.iter().map(classify_statement))
        }
        _ => combine(split_statements(sql).into_iter().map(classify_keyword)),
    }
}

fn combine(kinds: impl Iterator<Item = StatementKind>) -> StatementKind {
    let mut seen_any = false;
    for kind in kinds {
        seen_any = true;
        if !kind.is_read_only() {
            return kind;
        }
    }
    if seen_any {
        StatementKind::Select
    } else {
        StatementKind::Other
    }
}

fn classify_statement(statement: &Statement) -> StatementKind {
    match statement {
        Statement::Query(query) => classify_body(&query.body),
        Statement::Insert { .. } => StatementKind::Insert,
        Statement::Update { .. } => StatementKind::Update,
        Statement::Delete { .. } => StatementKind::Delete,
        Statement::Explain { .. } | Statement::ExplainTable { .. } => StatementKind::Select,
        other => classify_keyword(&other.to_string()),
    }
}

fn classify_body(body: &SetExpr) -> StatementKind {
    match body {
        SetExpr::Insert(inner) | SetExpr::Update(inner) => classify_statement(inner),
        SetExpr::Select(_)
        | SetExpr::Query(_)
        | SetExpr::SetOperation { .. }
        | SetExpr::Values(_)
        | SetExpr::Table(_) => StatementKind::Select,
        other => classify_keyword(&other.to_string()),
    }
}

/// First-keyword classification. A leading `WITH` clause is skipped: the
/// first statement keyword outside parentheses after it decides.
pub fn classify_keyword(sql: &str) -> StatementKind {
    let words = top_level_words(sql);
    let mut iter = words.iter().map(String::as_str);

    match iter.next() {
        Some("WITH") => iter
            .find_map(|word| match word {
                "SELECT" | "VALUES" => Some(StatementKind::Select),
                "INSERT" | "REPLACE" => Some(StatementKind::Insert),
                "UPDATE" => Some(StatementKind::Update),
                "DELETE" => Some(StatementKind::Delete),
                _ => None,
            })
            .unwrap_or(StatementKind::Other),
        Some(first) => keyword_kind(first),
        None => StatementKind::Other,
    }
}

fn keyword_kind(word: &str) -> StatementKind {
    match word {
        "SELECT" | "VALUES" | "EXPLAIN" | "TABLE" => StatementKind::Select,
        "INSERT" | "REPLACE" => StatementKind::Insert,
        "UPDATE" => StatementKind::Update,
        "DELETE" => StatementKind::Delete,
        "CREATE" => StatementKind::Create,
        "ALTER" => StatementKind::Alter,
        "DROP" => StatementKind::Drop,
        _ => StatementKind::Other,
    }
}

/// Upper-cased words at parenthesis depth 0, skipping literals and comments.
fn top_level_words(sql: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut chars = sql.chars().peekable();

    let flush = |current: &mut String, words: &mut Vec<String>, depth: usize| {
        if !current.is_empty() {
            if depth == 0 {
                words.push(current.to_uppercase());
            }
            current.clear();
        }
    };

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '`' => {
                flush(&mut current, &mut words, depth);
                for next in chars.by_ref() {
                    if next == c {
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                flush(&mut current, &mut words, depth);
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                flush(&mut current, &mut words, depth);
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            '(' => {
                flush(&mut current, &mut words, depth);
                depth += 1;
            }
            ')' => {
                flush(&mut current, &mut words, depth);
                depth = depth.saturating_sub(1);
            }
            c if c.is_alphanumeric() || c == '_' => current.push(c),
            _ => flush(&mut current, &mut words, depth),
        }
    }
    flush(&mut current, &mut words, depth);
    words
}

/// Splits on `;` outside string literals and quoted identifiers.
fn split_statements(sql: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quote: Option<char> = None;

    for (idx, c) in sql.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(c),
            (None, ';') => {
                parts.push(&sql[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&sql[start..]);
    parts.into_iter().filter(|p| !p.trim().is_empty()).collect()
}

/// Memoizing classifier shared by everything that reports statements.
pub struct StatementClassifier {
    dialect: SqlDialect,
    cache: Mutex<LruCache<String, StatementKind>>,
}

impl StatementClassifier {
    pub fn new(dialect: SqlDialect) -> Self {
        Self::with_capacity(dialect, DEFAULT_CACHE_SIZE)
    }

    pub fn with_capacity(dialect: SqlDialect, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            dialect,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn classify(&self, sql: &str) -> StatementKind {
        if let Some(kind) = self.cache.lock().get(sql) {
            return *kind;
        }
        let kind = classify(sql, self.dialect);
        self.cache.lock().put(sql.to_string(), kind);
        kind
    }

    pub fn cached_len(&self) -> usize {
        self.cache.lock().len()
    }
}

impl std::fmt::Debug for StatementClassifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatementClassifier")
            .field("dialect", &self.dialect)
            .field("cached", &self.cached_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite(sql: &str) -> StatementKind {
        classify(sql, SqlDialect::Sqlite)
    }

    #[test]
    fn basic_statements() {
        assert_eq!(sqlite("SELECT * FROM person"), StatementKind::Select);
        assert_eq!(
            sqlite("INSERT INTO person (name) VALUES (?)"),
            StatementKind::Insert
        );
        assert_eq!(sqlite("UPDATE person SET age = ? WHERE id = ?"), StatementKind::Update);
        assert_eq!(sqlite("DELETE FROM person WHERE id = ?"), StatementKind::Delete);
        assert_eq!(sqlite("CREATE TABLE t (id INTEGER)"), StatementKind::Create);
        assert_eq!(sqlite("DROP TABLE t"), StatementKind::Drop);
    }

    #[test]
    fn returning_insert_is_a_write() {
        assert_eq!(
            sqlite("INSERT INTO person (name) VALUES (?) RETURNING id"),
            StatementKind::Insert
        );
    }

    #[test]
    fn cte_bodies() {
        assert_eq!(
            classify(
                "WITH stale AS (SELECT id FROM person WHERE age > 90) DELETE FROM person WHERE id IN (SELECT id FROM stale)",
                SqlDialect::Postgres
            ),
            StatementKind::Delete
        );
        assert_eq!(
            sqlite("WITH t AS (SELECT 1 AS x) SELECT x FROM t"),
            StatementKind::Select
        );
    }

    #[test]
    fn explain_is_read_only() {
        assert!(sqlite("EXPLAIN SELECT 1").is_read_only());
    }

    #[test]
    fn multi_statement_requires_all_reads() {
        assert!(sqlite("SELECT 1; SELECT 2").is_read_only());
        assert_eq!(sqlite("SELECT 1; DELETE FROM person"), StatementKind::Delete);
    }

    #[test]
    fn keyword_fallback() {
        assert_eq!(classify_keyword("  -- note\n insert into x values (1)"), StatementKind::Insert);
        assert_eq!(classify_keyword("/* c */ SELECT 1"), StatementKind::Select);
        assert_eq!(classify_keyword(""), StatementKind::Other);
        assert_eq!(
            classify_keyword("WITH x AS (SELECT 'DELETE') UPDATE y SET a = 1"),
            StatementKind::Update
        );
    }

    #[test]
    fn unparsable_write_is_not_read_only() {
        assert!(!sqlite("UPSERT INTO nowhere ???").is_read_only());
    }

    #[test]
    fn classifier_memoizes() {
        let classifier = StatementClassifier::with_capacity(SqlDialect::Sqlite, 2);
        assert_eq!(classifier.classify("SELECT 1"), StatementKind::Select);
        assert_eq!(classifier.classify("SELECT 1"), StatementKind::Select);
        assert_eq!(classifier.cached_len(), 1);
        classifier.classify("DELETE FROM a");
        classifier.classify("DELETE FROM b");
        assert_eq!(classifier.cached_len(), 2);
    }
}
