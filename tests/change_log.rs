mod common;

use common::{user, Account, Animal, Fixture, Flag, Membership, Number, Person};
use resql::interceptor::{log_changes, log_queries, LogContext};
use resql::{OpType, ParamSet, ResqlError};
use serde_json::json;

#[tokio::test]
async fn test_insert_records_every_set_field() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), user("alice"));

    let person = session.add(&Person::new("A", Some(1))).unwrap();
    session.commit().await.unwrap();
    let id = session.entity(person).unwrap().identity().unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.op_type, OpType::Insert);
    assert_eq!(record.table_name, "person");
    assert_eq!(record.record_id, id);
    assert_eq!(record.extra, Some(user("alice")));
    assert_eq!(
        serde_json::to_value(&record.diff).unwrap(),
        json!({
            "name": {"old": null, "new": "A"},
            "age": {"old": null, "new": 1},
        })
    );
}

#[tokio::test]
async fn test_update_records_only_changed_fields() {
    let fx = Fixture::new().await;
    let factory = {
        let mut factory = fx.db.session_factory();
        log_changes(&mut factory, fx.audit.clone(), LogContext::default());
        factory
    };

    let mut session = factory.session().await.unwrap();
    session.add(&Person::new("A", Some(1))).unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let mut session = factory.session().await.unwrap();
    let person = session.find::<Person>(1).await.unwrap().unwrap();
    session.set(person, "age", 2).unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].op_type, OpType::Update);
    assert_eq!(records[1].record_id, 1);
    assert_eq!(
        serde_json::to_value(&records[1].diff).unwrap(),
        json!({"age": {"old": 1, "new": 2}})
    );
    assert!(records[1].extra.is_none());
}

#[tokio::test]
async fn test_update_after_commit_reloads_prior_values() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let person = session.add(&Person::new("A", Some(1))).unwrap();
    session.commit().await.unwrap();

    // Expired by the commit; the prior value must come from the store
    session.set(person, "name", "B").unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].diff["name"].old, json!("A"));
    assert_eq!(records[1].diff["name"].new, json!("B"));
    assert!(!records[1].diff.contains_key("age"));
}

#[tokio::test]
async fn test_removed_value_records_null() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let person = session.add(&Person::new("A", Some(30))).unwrap();
    session.commit().await.unwrap();
    session.unset(person, "age").unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(
        serde_json::to_value(&records[1].diff).unwrap(),
        json!({"age": {"old": 30, "new": null}})
    );
    let reloaded: Person = session.get(person).await.unwrap();
    assert_eq!(reloaded.age, None);
}

#[tokio::test]
async fn test_assigning_the_same_value_is_not_an_update() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let person = session.add(&Person::new("A", Some(1))).unwrap();
    session.commit().await.unwrap();
    session.set(person, "name", "A").unwrap();
    session.commit().await.unwrap();

    assert_eq!(fx.audit.records().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_boolean_and_json_fields_survive_a_reload() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let flag = session
        .add(&Flag {
            id: None,
            enabled: true,
            settings: Some(json!({"tags": ["a", "b"], "limit": 3})),
        })
        .unwrap();
    session.commit().await.unwrap();

    session.set(flag, "enabled", true).unwrap();
    session
        .set(flag, "settings", json!({"tags": ["a", "b"], "limit": 3}))
        .unwrap();
    session.commit().await.unwrap();
    assert_eq!(fx.audit.records().await.unwrap().len(), 1);

    let loaded: Flag = session.get(flag).await.unwrap();
    assert!(loaded.enabled);
    assert_eq!(loaded.settings, Some(json!({"tags": ["a", "b"], "limit": 3})));

    session.set(flag, "enabled", false).unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(
        serde_json::to_value(&records[1].diff).unwrap(),
        json!({"enabled": {"old": true, "new": false}})
    );
}

#[tokio::test]
async fn test_column_named_like_the_identity_parameter_is_updated() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let membership = session
        .add(&Membership {
            id: None,
            membership_id: 500,
        })
        .unwrap();
    session.commit().await.unwrap();
    session.set(membership, "membership_id", 501).unwrap();
    session.commit().await.unwrap();

    let loaded: Membership = session.get(membership).await.unwrap();
    assert_eq!(loaded.membership_id, 501);
    assert_eq!(loaded.id, Some(1));

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records[1].op_type, OpType::Update);
    assert_eq!(records[1].diff["membership_id"].old, json!(500));
    assert_eq!(records[1].diff["membership_id"].new, json!(501));
}

#[tokio::test]
async fn test_delete_records_identity_only() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let person = session.add(&Person::new("A", Some(1))).unwrap();
    session.commit().await.unwrap();
    let id = session.entity(person).unwrap().identity().unwrap();
    session.delete(person).unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].op_type, OpType::Delete);
    assert_eq!(records[1].record_id, id);
    assert!(records[1].diff.is_empty());
    assert_eq!(fx.count("person").await, 0);
}

#[tokio::test]
async fn test_one_flush_orders_deletes_updates_inserts() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();

    let doomed = session.add(&Person::new("doomed", None)).unwrap();
    let renamed = session.add(&Person::new("old", None)).unwrap();
    session.commit().await.unwrap();

    log_changes(&mut session, fx.audit.clone(), LogContext::default());
    session.delete(doomed).unwrap();
    session.set(renamed, "name", "new").unwrap();
    session.add(&Person::new("fresh", None)).unwrap();
    session.commit().await.unwrap();

    let ops: Vec<OpType> = fx
        .audit
        .records()
        .await
        .unwrap()
        .iter()
        .map(|r| r.op_type)
        .collect();
    assert_eq!(ops, vec![OpType::Delete, OpType::Update, OpType::Insert]);
}

#[tokio::test]
async fn test_rollback_before_flush_writes_nothing() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());
    log_queries(&mut session, fx.recovery.clone(), LogContext::default());

    session.add(&Person::new("A", Some(1))).unwrap();
    session.rollback().await.unwrap();
    session.commit().await.unwrap();

    assert!(fx.audit.records().await.unwrap().is_empty());
    assert!(fx.recovery.records().await.unwrap().is_empty());
    assert_eq!(fx.count("person").await, 0);
}

#[tokio::test]
async fn test_flushed_then_rolled_back_write_stays_audited() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    session.add(&Person::new("A", Some(1))).unwrap();
    session.flush().await.unwrap();
    session.rollback().await.unwrap();

    assert_eq!(fx.count("person").await, 0);
    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].op_type, OpType::Insert);
}

#[tokio::test]
async fn test_computed_column_never_diffed() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let number = session
        .add(&Number {
            id: None,
            value: 3,
            doubled: None,
        })
        .unwrap();
    session.commit().await.unwrap();
    assert!(session.set(number, "doubled", 10).is_err());
    session.set(number, "value", 4).unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert!(!record.diff.contains_key("doubled"));
        assert!(record.diff.contains_key("value"));
    }
    assert_eq!(records[1].diff["value"].old, json!(3));

    let reloaded: Number = session.get(number).await.unwrap();
    assert_eq!(reloaded.doubled, Some(8));
}

#[tokio::test]
async fn test_imperative_mapping_uses_field_key() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    let account = session
        .add(&Account {
            id: None,
            email: "a@example.com".into(),
        })
        .unwrap();
    session.commit().await.unwrap();
    session.set(account, "email", "b@example.com").unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records[0].diff["email"].new, json!("a@example.com"));
    assert_eq!(records[1].diff["email"].old, json!("a@example.com"));
    assert_eq!(records[1].diff["email"].new, json!("b@example.com"));
    assert!(!records[1].diff.contains_key("email_address"));
}

#[tokio::test]
async fn test_variant_fields_and_deferred_fields() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());

    session
        .add(&Animal {
            id: None,
            kind: "dog".into(),
            name: "Rex".into(),
            wingspan: Some(1.5),
            bio: Some("good boy".into()),
        })
        .unwrap();
    session
        .add(&Animal {
            id: None,
            kind: "bird".into(),
            name: "Tweety".into(),
            wingspan: Some(0.3),
            bio: None,
        })
        .unwrap();
    session.commit().await.unwrap();
    session.close().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(!records[0].diff.contains_key("wingspan"));
    assert_eq!(records[0].diff["bio"].new, json!("good boy"));
    assert_eq!(records[1].diff["wingspan"].new, json!(0.3));

    // `bio` is not loaded by `find`; it is read before diffing
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), LogContext::default());
    let dog = session.find::<Animal>(records[0].record_id).await.unwrap().unwrap();
    assert!(!session.entity(dog).unwrap().is_loaded("bio"));
    session.set(dog, "name", "Max").unwrap();
    session.commit().await.unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(
        serde_json::to_value(&records[2].diff).unwrap(),
        json!({"name": {"old": "Rex", "new": "Max"}})
    );
}

#[tokio::test]
async fn test_bulk_statements_are_not_change_logged() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    session.add(&Person::new("A", Some(1))).unwrap();
    session.add(&Person::new("B", Some(2))).unwrap();
    session.commit().await.unwrap();

    log_changes(&mut session, fx.audit.clone(), LogContext::default());
    let recovery = log_queries(&mut session, fx.recovery.clone(), LogContext::default());
    session
        .execute(
            "UPDATE person SET age = :age",
            &[ParamSet::new().with("age", 10)],
        )
        .await
        .unwrap();
    session
        .execute("DELETE FROM person WHERE name = :name", &[ParamSet::new().with("name", "B")])
        .await
        .unwrap();
    session.commit().await.unwrap();

    assert!(fx.audit.records().await.unwrap().is_empty());
    let queries = recovery.store().records().await.unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(fx.count("person").await, 1);
}

#[tokio::test]
async fn test_loggers_on_one_session_are_additive() {
    let fx = Fixture::new().await;
    let second = resql::store::AuditStore::new(fx.audit.pool().clone()).with_table("change_log_copy");
    second.ensure_schema().await.unwrap();

    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), user("first"));
    log_changes(&mut session, second.clone(), user("second"));
    session.add(&Person::new("A", None)).unwrap();
    session.commit().await.unwrap();

    let first = fx.audit.records().await.unwrap();
    let copy = second.records().await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(copy.len(), 1);
    assert_eq!(first[0].extra, Some(user("first")));
    assert_eq!(copy[0].extra, Some(user("second")));
}

#[tokio::test]
async fn test_extra_is_reused_across_commits() {
    let fx = Fixture::new().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, fx.audit.clone(), user("batch"));

    for name in ["A", "B", "C"] {
        session.add(&Person::new(name, None)).unwrap();
        session.commit().await.unwrap();
    }

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.extra == Some(user("batch"))));
}

#[tokio::test]
async fn test_audit_failure_surfaces_and_keeps_transaction_open() {
    let fx = Fixture::new().await;
    let broken = fx.broken_audit().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, broken, LogContext::default());

    session.add(&Person::new("A", None)).unwrap();
    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, ResqlError::AuditWriteFailed { .. }));
    assert!(session.connection().in_transaction());

    session.rollback().await.unwrap();
    assert_eq!(fx.count("person").await, 0);
}

#[tokio::test]
async fn test_failed_flush_refuses_retry_until_rollback() {
    let fx = Fixture::new().await;
    let broken = fx.broken_audit().await;
    let mut session = fx.db.session_factory().session().await.unwrap();
    log_changes(&mut session, broken.clone(), LogContext::default());

    session.add(&Person::new("A", None)).unwrap();
    assert!(session.commit().await.is_err());
    assert!(session.needs_rollback());

    // Store repaired, but the row from the failed flush is still pending
    broken.ensure_schema().await.unwrap();
    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, ResqlError::TransactionError { .. }));
    assert!(matches!(
        session.flush().await.unwrap_err(),
        ResqlError::TransactionError { .. }
    ));

    session.rollback().await.unwrap();
    assert!(!session.needs_rollback());
    assert_eq!(fx.count("person").await, 0);
    assert!(broken.records().await.unwrap().is_empty());

    session.add(&Person::new("A", None)).unwrap();
    session.commit().await.unwrap();
    assert_eq!(fx.count("person").await, 1);
    assert_eq!(broken.records().await.unwrap().len(), 1);
}
