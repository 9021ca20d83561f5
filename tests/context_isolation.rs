mod common;

use std::collections::BTreeMap;

use common::{user, Fixture, Person};
use resql::interceptor::log_changes;
use resql::interceptor::log_queries;
use resql::ParamSet;
use serde_json::json;

#[tokio::test]
async fn test_overlapping_sessions_keep_their_own_extra() {
    let fx = Fixture::new().await;
    let factory = fx.db.session_factory();

    let mut alice = factory.session().await.unwrap();
    let mut bob = factory.session().await.unwrap();
    log_changes(&mut alice, fx.audit.clone(), user("alice"));
    log_changes(&mut bob, fx.audit.clone(), user("bob"));

    // Both units of work are open at once; each writes only at its commit
    let a = alice.add(&Person::new("from-alice", None)).unwrap();
    let b = bob.add(&Person::new("from-bob", None)).unwrap();
    bob.commit().await.unwrap();
    alice.commit().await.unwrap();

    let alice_id = alice.entity(a).unwrap().identity().unwrap();
    let bob_id = bob.entity(b).unwrap().identity().unwrap();

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        if record.record_id == alice_id {
            assert_eq!(record.extra, Some(user("alice")));
            assert_eq!(record.diff["name"].new, json!("from-alice"));
        } else {
            assert_eq!(record.record_id, bob_id);
            assert_eq!(record.extra, Some(user("bob")));
            assert_eq!(record.diff["name"].new, json!("from-bob"));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connections_keep_their_own_extra() {
    let fx = Fixture::new().await;
    let workers = ["w0", "w1", "w2", "w3"];

    let mut handles = Vec::new();
    for worker in workers {
        let db = fx.db.clone();
        let recovery = fx.recovery.clone();
        handles.push(tokio::spawn(async move {
            let mut conn = db.connection().await.unwrap();
            log_queries(&mut conn, recovery, user(worker));
            for i in 0..5 {
                conn.execute(
                    "INSERT INTO person (name, age) VALUES (:name, :age)",
                    &[ParamSet::new().with("name", worker).with("age", i)],
                )
                .await
                .unwrap();
                conn.commit().await.unwrap();
            }
            conn.close().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let records = fx.recovery.records().await.unwrap();
    assert_eq!(records.len(), 20);

    let mut per_worker: BTreeMap<String, usize> = BTreeMap::new();
    for record in &records {
        let name = record.parameters[0]
            .get("name")
            .and_then(|v| v.as_str())
            .unwrap()
            .to_string();
        assert_eq!(record.extra, Some(user(&name)));
        *per_worker.entry(name).or_default() += 1;
    }
    assert!(per_worker.values().all(|&n| n == 5));
    assert_eq!(fx.count("person").await, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_sessions_keep_their_own_extra() {
    let fx = Fixture::new().await;

    let mut handles = Vec::new();
    for worker in ["s0", "s1"] {
        let factory = fx.db.session_factory();
        let audit = fx.audit.clone();
        handles.push(tokio::spawn(async move {
            let mut session = factory.session().await.unwrap();
            log_changes(&mut session, audit, user(worker));
            for _ in 0..3 {
                session.add(&Person::new(worker, None)).unwrap();
                session.commit().await.unwrap();
            }
            session.close().await.unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let records = fx.audit.records().await.unwrap();
    assert_eq!(records.len(), 6);
    for record in &records {
        let name = record.diff["name"].new.as_str().unwrap().to_string();
        assert_eq!(record.extra, Some(user(&name)));
    }
}
