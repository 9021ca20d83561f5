//! Inserts, renames and lists a person through an audited session.
//!
//! Store locations come from `RESQL_PRIMARY_URL`, `RESQL_AUDIT_URL` and
//! `RESQL_RECOVERY_URL` (or `.env`).

use resql::config::Settings;
use resql::interceptor::{log_changes, log_queries, LogContext};
use resql::observability;
use resql::orm::Database;
use resql::store::{AuditStore, RecoveryStore};
use resql::{FieldDef, Model, ParamSet, ResqlResult, TableDef};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

static PERSON: TableDef = TableDef::new(
    "person",
    "id",
    &[FieldDef::stored("id"), FieldDef::stored("name")],
);

#[derive(Debug, Serialize, Deserialize)]
struct Person {
    id: Option<i64>,
    name: String,
}

impl Model for Person {
    fn table() -> &'static TableDef {
        &PERSON
    }
}

#[tokio::main]
async fn main() {
    observability::init_tracing();

    if let Err(e) = run().await {
        error!(error = %e, "Demo failed");
        std::process::exit(1);
    }
}

async fn run() -> ResqlResult<()> {
    let settings = Settings::from_env()?;
    info!(
        primary = %settings.primary_url,
        audit = %settings.audit_url,
        recovery = %settings.recovery_url,
        "Starting demo"
    );

    let db = Database::from_settings(&settings).await?;
    let audit = AuditStore::connect(settings.audit_url.expose()).await?;
    audit.ensure_schema().await?;
    let recovery = RecoveryStore::connect(settings.recovery_url.expose()).await?;
    recovery.ensure_schema().await?;

    let mut conn = db.connection().await?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS person (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
        &[],
    )
    .await?;
    conn.commit().await?;
    conn.close().await?;

    let extra = LogContext::from(json!({"source": "resql-demo"}).as_object().cloned());
    let mut factory = db.session_factory();
    log_changes(&mut factory, audit.clone(), extra.clone());

    let mut session = factory.session().await?;
    log_queries(&mut session, recovery.clone(), extra.clone());
    let person = session.add(&Person {
        id: None,
        name: "Gabriel".into(),
    })?;
    session.commit().await?;
    let id = session.entity(person)?.identity();
    session.close().await?;
    info!(id = ?id, "Inserted person");

    if let Some(id) = id {
        let mut session = factory.session().await?;
        log_queries(&mut session, recovery.clone(), extra.clone());
        if let Some(person) = session.find::<Person>(id).await? {
            session.set(person, "name", "Gabriel Galli")?;
        }
        session.commit().await?;
        session.close().await?;
    }

    let mut session = factory.session().await?;
    log_queries(&mut session, recovery.clone(), extra);
    let rows = session
        .fetch_all("SELECT * FROM person", &ParamSet::new())
        .await?;
    session.close().await?;
    for row in rows {
        info!(row = %serde_json::Value::Object(row), "person");
    }

    info!(
        change_records = audit.records().await?.len(),
        query_records = recovery.records().await?.len(),
        "Done"
    );
    Ok(())
}
