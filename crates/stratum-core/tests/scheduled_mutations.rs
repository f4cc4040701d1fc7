use std::sync::Arc;

use serde_json::{json, Value};

use stratum_core::{
    eq, table, text, CascadeMode, ColumnReference, Database, ExecutionMode, FindArgs, Orm,
    OrmError, RefAction, Relations, RequestContext, Schema, SchemaDefaults,
    ScheduledFunctionRegistry,
};
use stratum_store::{
    Document, DocumentWriter, MemoryScheduler, MemoryStore, ScheduledJob, Scheduler, StoreError,
};

fn doc(pairs: &[(&str, Value)]) -> Document {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct Harness {
    db: Database,
    store: Arc<MemoryStore>,
    scheduler: Arc<MemoryScheduler>,
    registry: ScheduledFunctionRegistry,
}

fn harness(defaults: SchemaDefaults) -> Harness {
    let schema = Schema::builder()
        .table(table("users", vec![text("slug").not_null()]).soft_deletes())
        .table(
            table(
                "memberships",
                vec![text("userId").not_null().references(
                    ColumnReference::to("users", "id").on_delete(RefAction::Cascade),
                )],
            )
            .index("by_user", &["userId"]),
        )
        .defaults(defaults)
        .build()
        .unwrap();
    let orm = Orm::new(schema, Relations::builder().build()).unwrap();
    let store = Arc::new(MemoryStore::new());
    let scheduler = Arc::new(MemoryScheduler::new());
    let db = orm.database(
        Arc::clone(&store) as Arc<dyn DocumentWriter>,
        Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        RequestContext::public(),
    );
    let registry = ScheduledFunctionRegistry::new(orm);
    Harness {
        db,
        store,
        scheduler,
        registry,
    }
}

async fn seed(db: &Database, memberships: usize) -> String {
    let user = db
        .insert("users")
        .values(doc(&[("slug", json!("ada"))]))
        .execute()
        .await
        .unwrap()
        .ids
        .remove(0)
        .to_string();
    for _ in 0..memberships {
        db.insert("memberships")
            .values(doc(&[("userId", json!(user.clone()))]))
            .execute()
            .await
            .unwrap();
    }
    user
}

async fn count(db: &Database, table: &str) -> usize {
    db.query(table).find_many(FindArgs::new()).await.unwrap().len()
}

// ---- bounded fan-out ----

#[tokio::test]
async fn async_cascade_over_the_cap_drains_in_ceil_n_over_k_batches() {
    let h = harness(SchemaDefaults {
        mutation_max_rows: 2,
        execution_mode: ExecutionMode::Async,
        ..SchemaDefaults::default()
    });
    let user = seed(&h.db, 3).await;

    let outcome = h
        .db
        .delete("users")
        .filter(eq("id", user))
        .execute()
        .await
        .unwrap();
    assert!(outcome.deferred);
    // Nothing is lost while the chain is pending.
    assert_eq!(count(&h.db, "users").await, 1);
    assert_eq!(count(&h.db, "memberships").await, 3);

    let ran = h
        .registry
        .drain(Arc::clone(&h.store) as Arc<dyn DocumentWriter>, &h.scheduler)
        .await
        .unwrap();
    // ceil(3 / 2) = 2 continuations, each respecting the cap.
    assert_eq!(ran, 2);
    assert_eq!(count(&h.db, "users").await, 0);
    assert_eq!(count(&h.db, "memberships").await, 0);
}

#[tokio::test]
async fn async_cascade_within_the_cap_stays_synchronous() {
    let h = harness(SchemaDefaults {
        mutation_max_rows: 10,
        execution_mode: ExecutionMode::Async,
        ..SchemaDefaults::default()
    });
    let user = seed(&h.db, 3).await;

    let outcome = h
        .db
        .delete("users")
        .filter(eq("id", user))
        .execute()
        .await
        .unwrap();
    assert!(!outcome.deferred);
    assert_eq!(h.scheduler.pending(), 0);
    assert_eq!(count(&h.db, "users").await, 0);
    assert_eq!(count(&h.db, "memberships").await, 0);
}

#[tokio::test]
async fn sync_cascade_over_the_cap_is_a_hard_error() {
    let h = harness(SchemaDefaults {
        mutation_max_rows: 2,
        execution_mode: ExecutionMode::Sync,
        ..SchemaDefaults::default()
    });
    let user = seed(&h.db, 3).await;

    let err = h
        .db
        .delete("users")
        .filter(eq("id", user))
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::MaxRowsExceeded { max: 2 }));
    assert_eq!(h.scheduler.pending(), 0);
}

#[tokio::test]
async fn batch_continuations_are_idempotent_over_visited_rows() {
    let h = harness(SchemaDefaults {
        mutation_max_rows: 2,
        execution_mode: ExecutionMode::Async,
        ..SchemaDefaults::default()
    });
    let user = seed(&h.db, 5).await;

    h.db.delete("users")
        .filter(eq("id", user))
        .execute()
        .await
        .unwrap();
    let ran = h
        .registry
        .drain(Arc::clone(&h.store) as Arc<dyn DocumentWriter>, &h.scheduler)
        .await
        .unwrap();
    assert_eq!(ran, 3, "ceil(5 / 2) continuations");
    assert_eq!(count(&h.db, "memberships").await, 0);
    assert_eq!(count(&h.db, "users").await, 0);
}

// ---- scheduled delete ----

#[tokio::test]
async fn scheduled_delete_soft_deletes_now_and_hard_deletes_on_drain() {
    let h = harness(SchemaDefaults::default());
    let user = seed(&h.db, 2).await;

    let outcome = h
        .db
        .delete("users")
        .filter(eq("id", user.clone()))
        .scheduled(60_000.0)
        .cascade(CascadeMode::Hard)
        .execute()
        .await
        .unwrap();
    assert_eq!(outcome.ids.len(), 1);

    // Soft-deleted immediately; the hard delete waits in the queue.
    let row = h
        .db
        .query("users")
        .find_first(FindArgs::new().filter(eq("id", user)))
        .await
        .unwrap()
        .unwrap();
    assert!(row.get("deletionTime").unwrap().is_number());
    assert_eq!(h.scheduler.pending(), 1);
    assert_eq!(count(&h.db, "memberships").await, 2);

    h.registry
        .drain(Arc::clone(&h.store) as Arc<dyn DocumentWriter>, &h.scheduler)
        .await
        .unwrap();
    assert_eq!(count(&h.db, "users").await, 0);
    assert_eq!(count(&h.db, "memberships").await, 0);
}

#[tokio::test]
async fn scheduled_delete_of_an_already_removed_row_is_a_no_op() {
    let h = harness(SchemaDefaults::default());
    let user = seed(&h.db, 0).await;

    h.db.delete("users")
        .filter(eq("id", user.clone()))
        .scheduled(1_000.0)
        .execute()
        .await
        .unwrap();
    // Hard-delete the row before the job fires.
    h.db.delete("users")
        .filter(eq("id", user))
        .execute()
        .await
        .unwrap();

    let ran = h
        .registry
        .drain(Arc::clone(&h.store) as Arc<dyn DocumentWriter>, &h.scheduler)
        .await
        .unwrap();
    assert_eq!(ran, 1);
}

// ---- scheduling errors ----

#[tokio::test]
async fn negative_delay_surfaces_the_driver_error() {
    let h = harness(SchemaDefaults::default());
    let user = seed(&h.db, 0).await;

    let err = h
        .db
        .delete("users")
        .filter(eq("id", user))
        .scheduled(-1.0)
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrmError::Store(StoreError::InvalidDelay { .. })
    ));
}

#[tokio::test]
async fn jobs_for_unknown_tables_or_functions_are_rejected() {
    let h = harness(SchemaDefaults::default());

    let unknown_table = ScheduledJob::new(
        stratum_core::SCHEDULED_DELETE,
        json!({"table": "nowhere", "id": "nowhere:1", "cascade_mode": "hard"}),
    );
    let err = h
        .registry
        .run(
            Arc::clone(&h.store) as Arc<dyn DocumentWriter>,
            Arc::clone(&h.scheduler) as Arc<dyn Scheduler>,
            &unknown_table,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UnknownTable { .. }));

    let unknown_function = ScheduledJob::new("definitelyNotRegistered", json!({}));
    let err = h
        .registry
        .run(
            Arc::clone(&h.store) as Arc<dyn DocumentWriter>,
            Arc::clone(&h.scheduler) as Arc<dyn Scheduler>,
            &unknown_function,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidScheduledPayload { .. }));

    let malformed = ScheduledJob::new(stratum_core::SCHEDULED_DELETE, json!({"table": 7}));
    let err = h
        .registry
        .run(
            Arc::clone(&h.store) as Arc<dyn DocumentWriter>,
            Arc::clone(&h.scheduler) as Arc<dyn Scheduler>,
            &malformed,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::InvalidScheduledPayload { .. }));
}
