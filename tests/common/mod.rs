#![allow(dead_code)]

use resql::orm::Database;
use resql::store::{AuditStore, RecoveryStore};
use resql::{Extra, FieldDef, Model, TableDef};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

const PRIMARY_SCHEMA: &[&str] = &[
    "CREATE TABLE person (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        age INTEGER
    )",
    "CREATE TABLE number (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        value INTEGER NOT NULL,
        doubled INTEGER GENERATED ALWAYS AS (value * 2) VIRTUAL
    )",
    "CREATE TABLE account (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_address TEXT NOT NULL
    )",
    "CREATE TABLE animal (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        wingspan REAL,
        bio TEXT
    )",
    "CREATE TABLE flag (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        enabled INTEGER NOT NULL,
        settings TEXT
    )",
    "CREATE TABLE membership (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        membership_id INTEGER NOT NULL
    )",
];

pub static PERSON: TableDef = TableDef::new(
    "person",
    "id",
    &[
        FieldDef::stored("id"),
        FieldDef::stored("name"),
        FieldDef::stored("age"),
    ],
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: Option<i64>,
    pub name: String,
    pub age: Option<i64>,
}

impl Person {
    pub fn new(name: &str, age: Option<i64>) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            age,
        }
    }
}

impl Model for Person {
    fn table() -> &'static TableDef {
        &PERSON
    }
}

pub static NUMBER: TableDef = TableDef::new(
    "number",
    "id",
    &[
        FieldDef::stored("id"),
        FieldDef::stored("value"),
        FieldDef::derived("doubled"),
    ],
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Number {
    pub id: Option<i64>,
    pub value: i64,
    pub doubled: Option<i64>,
}

impl Model for Number {
    fn table() -> &'static TableDef {
        &NUMBER
    }
}

/// Field key differs from the column name.
pub static ACCOUNT: TableDef = TableDef::new(
    "account",
    "id",
    &[
        FieldDef::stored("id"),
        FieldDef::stored("email").column("email_address"),
    ],
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Option<i64>,
    pub email: String,
}

impl Model for Account {
    fn table() -> &'static TableDef {
        &ACCOUNT
    }
}

pub static ANIMAL: TableDef = TableDef::new(
    "animal",
    "id",
    &[
        FieldDef::stored("id"),
        FieldDef::stored("kind"),
        FieldDef::stored("name"),
        FieldDef::stored("wingspan").only_for(&["bird"]),
        FieldDef::stored("bio").deferred(),
    ],
)
.with_discriminator("kind");

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Animal {
    pub id: Option<i64>,
    pub kind: String,
    pub name: String,
    pub wingspan: Option<f64>,
    pub bio: Option<String>,
}

impl Model for Animal {
    fn table() -> &'static TableDef {
        &ANIMAL
    }
}

/// Values the primary store keeps as INTEGER and TEXT.
pub static FLAG: TableDef = TableDef::new(
    "flag",
    "id",
    &[
        FieldDef::stored("id"),
        FieldDef::stored("enabled").boolean(),
        FieldDef::stored("settings").json(),
    ],
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub id: Option<i64>,
    pub enabled: bool,
    pub settings: Option<serde_json::Value>,
}

impl Model for Flag {
    fn table() -> &'static TableDef {
        &FLAG
    }
}

/// Has a column named `{table}_id` next to the identity.
pub static MEMBERSHIP: TableDef = TableDef::new(
    "membership",
    "id",
    &[FieldDef::stored("id"), FieldDef::stored("membership_id")],
);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub id: Option<i64>,
    pub membership_id: i64,
}

impl Model for Membership {
    fn table() -> &'static TableDef {
        &MEMBERSHIP
    }
}

/// Primary, audit and recovery stores in one temporary directory.
pub struct Fixture {
    pub dir: TempDir,
    pub db: Database,
    pub audit: AuditStore,
    pub recovery: RecoveryStore,
}

impl Fixture {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::connect(&sqlite_url(&dir, "production.sqlite3"))
            .await
            .unwrap();

        let mut conn = db.connection().await.unwrap();
        for ddl in PRIMARY_SCHEMA {
            conn.execute(*ddl, &[]).await.unwrap();
        }
        conn.commit().await.unwrap();
        conn.close().await.unwrap();

        let audit = AuditStore::connect(&sqlite_url(&dir, "audit.sqlite3"))
            .await
            .unwrap();
        audit.ensure_schema().await.unwrap();
        let recovery = RecoveryStore::connect(&sqlite_url(&dir, "recovery.sqlite3"))
            .await
            .unwrap();
        recovery.ensure_schema().await.unwrap();

        Self {
            dir,
            db,
            audit,
            recovery,
        }
    }

    /// Audit store in the same directory whose table was never created.
    pub async fn broken_audit(&self) -> AuditStore {
        AuditStore::connect(&sqlite_url(&self.dir, "broken-audit.sqlite3"))
            .await
            .unwrap()
    }

    pub async fn broken_recovery(&self) -> RecoveryStore {
        RecoveryStore::connect(&sqlite_url(&self.dir, "broken-recovery.sqlite3"))
            .await
            .unwrap()
    }

    pub async fn count(&self, table: &str) -> i64 {
        let row: (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.db.pool())
            .await
            .unwrap();
        row.0
    }
}

pub fn sqlite_url(dir: &TempDir, file: &str) -> String {
    format!("sqlite://{}", dir.path().join(file).display())
}

pub fn extra(value: serde_json::Value) -> Extra {
    value.as_object().cloned().unwrap()
}

pub fn user(name: &str) -> Extra {
    extra(json!({ "user": name }))
}
