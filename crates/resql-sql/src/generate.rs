//! SQL generation for the unit of work
//!
//! Everything produced here uses `:name` placeholders. Value placeholders are
//! named after the column; the identity in WHERE clauses is bound as
//! [`IDENTITY_PARAM`].

use resql_core::{FieldDef, StatementKind, TableDef};

use crate::dialect::SqlDialect;
use crate::statement::Statement;

pub fn identity_column(table: &TableDef) -> &'static str {
    table
        .identity_field()
        .map(|f| f.column)
        .unwrap_or(table.identity)
}

/// Parameter carrying the identity in WHERE clauses. Column names starting
/// with `__resql` are reserved.
pub const IDENTITY_PARAM: &str = "__resql_identity";

fn column_list(dialect: SqlDialect, fields: &[&FieldDef]) -> String {
    fields
        .iter()
        .map(|f| dialect.quote_ident(f.column))
        .collect::<Vec<_>>()
        .join(", ")
}

/// INSERT of `fields`, returning the store-assigned identity.
pub fn insert(dialect: SqlDialect, table: &TableDef, fields: &[&FieldDef]) -> Statement {
    let table_name = dialect.quote_ident(table.name);
    let returning = dialect.quote_ident(identity_column(table));

    let sql = if fields.is_empty() {
        format!("INSERT INTO {table_name} DEFAULT VALUES RETURNING {returning}")
    } else {
        let values = fields
            .iter()
            .map(|f| format!(":{}", f.column))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {table_name} ({}) VALUES ({values}) RETURNING {returning}",
            column_list(dialect, fields)
        )
    };
    Statement::with_kind(sql, StatementKind::Insert)
}

pub fn update(dialect: SqlDialect, table: &TableDef, fields: &[&FieldDef]) -> Statement {
    let assignments = fields
        .iter()
        .map(|f| format!("{} = :{}", dialect.quote_ident(f.column), f.column))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {assignments} WHERE {} = :{}",
        dialect.quote_ident(table.name),
        dialect.quote_ident(identity_column(table)),
        IDENTITY_PARAM
    );
    Statement::with_kind(sql, StatementKind::Update)
}

pub fn delete(dialect: SqlDialect, table: &TableDef) -> Statement {
    let sql = format!(
        "DELETE FROM {} WHERE {} = :{}",
        dialect.quote_ident(table.name),
        dialect.quote_ident(identity_column(table)),
        IDENTITY_PARAM
    );
    Statement::with_kind(sql, StatementKind::Delete)
}

/// SELECT of `fields` for one identity.
pub fn select_by_identity(dialect: SqlDialect, table: &TableDef, fields: &[&FieldDef]) -> Statement {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = :{}",
        column_list(dialect, fields),
        dialect.quote_ident(table.name),
        dialect.quote_ident(identity_column(table)),
        IDENTITY_PARAM
    );
    Statement::with_kind(sql, StatementKind::Select)
}

pub fn select_all(dialect: SqlDialect, table: &TableDef, fields: &[&FieldDef]) -> Statement {
    let sql = format!(
        "SELECT {} FROM {} ORDER BY {}",
        column_list(dialect, fields),
        dialect.quote_ident(table.name),
        dialect.quote_ident(identity_column(table))
    );
    Statement::with_kind(sql, StatementKind::Select)
}

#[cfg(test)]
mod tests {
    use super::*;

    static PERSON: TableDef = TableDef::new(
        "person",
        "id",
        &[
            FieldDef::stored("id"),
            FieldDef::stored("name").column("full_name"),
            FieldDef::stored("age"),
        ],
    );

    fn fields(names: &[&str]) -> Vec<&'static FieldDef> {
        names.iter().filter_map(|n| PERSON.field(n)).collect()
    }

    #[test]
    fn insert_returns_identity() {
        let stmt = insert(SqlDialect::Sqlite, &PERSON, &fields(&["name", "age"]));
        assert_eq!(
            stmt.source(),
            "INSERT INTO \"person\" (\"full_name\", \"age\") VALUES (:full_name, :age) RETURNING \"id\""
        );
        assert_eq!(stmt.kind(), Some(StatementKind::Insert));
    }

    #[test]
    fn insert_without_values() {
        let stmt = insert(SqlDialect::Sqlite, &PERSON, &[]);
        assert_eq!(
            stmt.source(),
            "INSERT INTO \"person\" DEFAULT VALUES RETURNING \"id\""
        );
    }

    #[test]
    fn update_and_delete_by_identity() {
        let stmt = update(SqlDialect::Sqlite, &PERSON, &fields(&["age"]));
        assert_eq!(
            stmt.source(),
            "UPDATE \"person\" SET \"age\" = :age WHERE \"id\" = :__resql_identity"
        );
        let stmt = delete(SqlDialect::Sqlite, &PERSON);
        assert_eq!(stmt.source(), "DELETE FROM \"person\" WHERE \"id\" = :__resql_identity");
    }

    #[test]
    fn selects() {
        let stmt = select_by_identity(SqlDialect::Sqlite, &PERSON, &fields(&["age"]));
        assert_eq!(
            stmt.source(),
            "SELECT \"age\" FROM \"person\" WHERE \"id\" = :__resql_identity"
        );
        let stmt = select_all(SqlDialect::Postgres, &PERSON, &fields(&["id", "name"]));
        assert_eq!(
            stmt.source(),
            "SELECT \"id\", \"full_name\" FROM \"person\" ORDER BY \"id\""
        );
    }

    #[test]
    fn identity_parameter_is_distinct_from_columns() {
        static MEMBER: TableDef = TableDef::new(
            "member",
            "id",
            &[FieldDef::stored("id"), FieldDef::stored("member_id")],
        );
        let stmt = update(SqlDialect::Sqlite, &MEMBER, &[&MEMBER.fields[1]]);
        assert_eq!(
            stmt.source(),
            "UPDATE \"member\" SET \"member_id\" = :member_id WHERE \"id\" = :__resql_identity"
        );
        assert!(MEMBER.fields.iter().all(|f| f.column != IDENTITY_PARAM));
    }
}
