use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use stratum_core::{
    eq, table, text, Database, FindArgs, Orm, Relations, RequestContext, Schema, TriggerOp,
};
use stratum_store::{Document, DocumentWriter, MemoryScheduler, MemoryStore, Scheduler};

fn doc(pairs: &[(&str, Value)]) -> Document {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn database(schema: Schema) -> Database {
    let orm = Orm::new(schema, Relations::builder().build()).unwrap();
    let store: Arc<dyn DocumentWriter> = Arc::new(MemoryStore::new());
    let scheduler: Arc<dyn Scheduler> = Arc::new(MemoryScheduler::new());
    orm.database(store, scheduler, RequestContext::public())
}

type Log = Arc<Mutex<Vec<String>>>;

fn logging_schema(log: &Log) -> Schema {
    let on_insert = {
        let log = Arc::clone(log);
        move |_ctx, change: stratum_core::ChangeRecord| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("insert:{}", change.id));
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };
    let first_change = {
        let log = Arc::clone(log);
        move |_ctx, change: stratum_core::ChangeRecord| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("change-1:{:?}", change.operation));
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };
    let second_change = {
        let log = Arc::clone(log);
        move |_ctx, change: stratum_core::ChangeRecord| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().unwrap().push(format!("change-2:{:?}", change.operation));
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };
    Schema::builder()
        .table(
            table("users", vec![text("name").not_null()])
                .on_change(first_change)
                .on_insert(on_insert)
                .on_change(second_change),
        )
        .build()
        .unwrap()
}

// ---- dispatch order ----

#[tokio::test]
async fn operation_handlers_fire_before_change_handlers_in_registration_order() {
    let log: Log = Arc::new(Mutex::new(Vec::new()));
    let db = database(logging_schema(&log));

    let created = db
        .insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap();

    let entries = log.lock().unwrap().clone();
    assert_eq!(
        entries,
        vec![
            format!("insert:{}", created.ids[0]),
            "change-1:Insert".to_string(),
            "change-2:Insert".to_string(),
        ]
    );
}

#[tokio::test]
async fn updates_and_deletes_carry_old_and_new_documents() {
    let seen: Arc<Mutex<Vec<(Option<Value>, Option<Value>)>>> = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let seen = Arc::clone(&seen);
        move |_ctx, change: stratum_core::ChangeRecord| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().unwrap().push((
                    change.old_doc.as_ref().and_then(|d| d.get("name").cloned()),
                    change.new_doc.as_ref().and_then(|d| d.get("name").cloned()),
                ));
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };
    let schema = Schema::builder()
        .table(table("users", vec![text("name").not_null()]).on_change(handler))
        .build()
        .unwrap();
    let db = database(schema);

    db.insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap();
    db.update("users")
        .set(doc(&[("name", json!("Ada Lovelace"))]))
        .filter(eq("name", "Ada"))
        .execute()
        .await
        .unwrap();
    db.delete("users")
        .filter(eq("name", "Ada Lovelace"))
        .execute()
        .await
        .unwrap();

    let entries = seen.lock().unwrap().clone();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0], (None, Some(json!("Ada"))));
    assert_eq!(
        entries[1],
        (Some(json!("Ada")), Some(json!("Ada Lovelace")))
    );
    assert_eq!(entries[2], (Some(json!("Ada Lovelace")), None));
}

// ---- recursion ----

#[tokio::test]
async fn handler_writes_through_ctx_db_re_enter_the_pipeline() {
    let audit_events: Log = Arc::new(Mutex::new(Vec::new()));

    let users_handler = move |ctx: stratum_core::TriggerContext,
                              change: stratum_core::ChangeRecord| {
        Box::pin(async move {
            let mut entry = Document::new();
            entry.insert("subject".to_string(), json!(change.id.to_string()));
            // Writing through the wrapped writer dispatches the audit
            // table's own triggers.
            ctx.db.insert("audit", entry).await?;
            Ok(())
        }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
    };
    let audit_handler = {
        let audit_events = Arc::clone(&audit_events);
        move |_ctx, change: stratum_core::ChangeRecord| {
            let audit_events = Arc::clone(&audit_events);
            Box::pin(async move {
                audit_events
                    .lock()
                    .unwrap()
                    .push(format!("audited:{:?}", change.operation));
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };

    let schema = Schema::builder()
        .table(table("users", vec![text("name").not_null()]).on_insert(users_handler))
        .table(table("audit", vec![text("subject")]).on_insert(audit_handler))
        .build()
        .unwrap();
    let db = database(schema);

    db.insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap();

    assert_eq!(
        audit_events.lock().unwrap().clone(),
        vec!["audited:Insert".to_string()]
    );
    let audit_rows = db.query("audit").find_many(FindArgs::new()).await.unwrap();
    assert_eq!(audit_rows.len(), 1);
}

#[tokio::test]
async fn inner_db_writes_do_not_re_enter() {
    let calls: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
    let handler = {
        let calls = Arc::clone(&calls);
        move |ctx: stratum_core::TriggerContext, change: stratum_core::ChangeRecord| {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                *calls.lock().unwrap() += 1;
                if change.operation == TriggerOp::Insert {
                    // Self-mutation through inner_db stays outside the
                    // pipeline; using ctx.db here would recurse forever.
                    let mut patch = Document::new();
                    patch.insert("stamped".to_string(), json!(true));
                    ctx.inner_db
                        .patch(&change.table, &change.id, patch)
                        .await?;
                }
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };
    let schema = Schema::builder()
        .table(
            table(
                "users",
                vec![text("name").not_null(), stratum_core::boolean("stamped")],
            )
            .on_change(handler),
        )
        .build()
        .unwrap();
    let db = database(schema);

    db.insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap();

    assert_eq!(*calls.lock().unwrap(), 1, "inner_db write must not dispatch");
    let row = db
        .query("users")
        .find_first(FindArgs::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("stamped"), Some(&json!(true)));
}

// ---- error propagation ----

#[tokio::test]
async fn handler_errors_abort_the_mutation() {
    let handler = move |_ctx, _change| {
        Box::pin(async move { anyhow::bail!("audit quota exhausted") })
            as futures::future::BoxFuture<'static, anyhow::Result<()>>
    };
    let schema = Schema::builder()
        .table(table("users", vec![text("name").not_null()]).on_insert(handler))
        .build()
        .unwrap();
    let db = database(schema);

    let err = db
        .insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("audit quota exhausted"));
}

#[tokio::test]
async fn triggers_on_untouched_tables_never_fire() {
    let fired: Log = Arc::new(Mutex::new(Vec::new()));
    let handler = {
        let fired = Arc::clone(&fired);
        move |_ctx, _change| {
            let fired = Arc::clone(&fired);
            Box::pin(async move {
                fired.lock().unwrap().push("fired".to_string());
                Ok(())
            }) as futures::future::BoxFuture<'static, anyhow::Result<()>>
        }
    };
    let schema = Schema::builder()
        .table(table("users", vec![text("name").not_null()]))
        .table(table("teams", vec![text("label")]).on_change(handler))
        .build()
        .unwrap();
    let db = database(schema);

    db.insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap();
    assert!(fired.lock().unwrap().is_empty());
}
