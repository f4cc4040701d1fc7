use std::sync::Arc;

use serde_json::{json, Value};

use stratum_core::{
    eq, table, text, timestamp, unique_index, Database, FindArgs, Orm, OrmError, Relations,
    RequestContext, Schema, SchemaDefaults, TimestampMode,
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

fn users_schema() -> Schema {
    Schema::builder()
        .table(table(
            "users",
            vec![
                text("name").not_null(),
                text("role").default_value("member"),
                text("nickname").default_value("anon"),
            ],
        ))
        .build()
        .unwrap()
}

// ---- defaults ----

#[tokio::test]
async fn insert_applies_literal_defaults() {
    let db = database(users_schema());
    db.insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .execute()
        .await
        .unwrap();

    let row = db
        .query("users")
        .find_first(FindArgs::new().filter(eq("name", "Ada")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("role"), Some(&json!("member")));
    assert_eq!(row.get("nickname"), Some(&json!("anon")));
}

#[tokio::test]
async fn explicit_null_is_not_overridden_by_the_default() {
    let db = database(users_schema());
    db.insert("users")
        .values(doc(&[("name", json!("Bea")), ("nickname", Value::Null)]))
        .execute()
        .await
        .unwrap();

    let row = db
        .query("users")
        .find_first(FindArgs::new().filter(eq("name", "Bea")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("nickname"), Some(&Value::Null));
    assert_eq!(row.get("role"), Some(&json!("member")));
}

#[tokio::test]
async fn default_fn_is_called_per_insert() {
    let schema = Schema::builder()
        .table(table(
            "events",
            vec![
                text("kind").not_null(),
                text("token").default_fn(|| json!("generated")),
            ],
        ))
        .build()
        .unwrap();
    let db = database(schema);
    db.insert("events")
        .values(doc(&[("kind", json!("signup"))]))
        .execute()
        .await
        .unwrap();
    let row = db
        .query("events")
        .find_first(FindArgs::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("token"), Some(&json!("generated")));
}

// ---- round-trip and hydration ----

#[tokio::test]
async fn rows_hydrate_with_public_identity_columns() {
    let db = database(users_schema());
    let created = db
        .insert("users")
        .values(doc(&[("name", json!("Ada"))]))
        .returning()
        .execute()
        .await
        .unwrap();

    let rows = created.rows.unwrap();
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get("id"), Some(&json!(created.ids[0].to_string())));
    assert!(row.get("createdAt").unwrap().is_number());
    assert!(row.get("_id").is_none());
    assert!(row.get("_creationTime").is_none());
}

#[tokio::test]
async fn timestamp_modes_round_trip_per_declared_mode() {
    let schema = Schema::builder()
        .table(table(
            "posts",
            vec![
                text("title").not_null(),
                timestamp("publishedAt", TimestampMode::Rfc3339),
                timestamp("editedAt", TimestampMode::Millis),
            ],
        ))
        .build()
        .unwrap();
    let db = database(schema);
    db.insert("posts")
        .values(doc(&[
            ("title", json!("hello")),
            ("publishedAt", json!("2024-03-01T12:00:00+00:00")),
            ("editedAt", json!("2024-03-01T12:00:00+00:00")),
        ]))
        .execute()
        .await
        .unwrap();

    let row = db
        .query("posts")
        .find_first(FindArgs::new())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("publishedAt"), Some(&json!("2024-03-01T12:00:00+00:00")));
    assert_eq!(row.get("editedAt"), Some(&json!(1_709_294_400_000.0)));
}

#[tokio::test]
async fn writing_system_fields_is_rejected() {
    let db = database(users_schema());
    for field in ["_id", "_creationTime", "id", "createdAt"] {
        let err = db
            .insert("users")
            .values(doc(&[("name", json!("Ada")), (field, json!("forged"))]))
            .execute()
            .await
            .unwrap_err();
        assert!(matches!(err, OrmError::SystemFieldWrite { .. }), "{field}");
    }
}

// ---- unique indexes ----

fn unique_email_schema(nulls_not_distinct: bool) -> Schema {
    let mut unique = unique_index("users_email_unique").on(&["email"]);
    if nulls_not_distinct {
        unique = unique.nulls_not_distinct();
    }
    Schema::builder()
        .table(table("users", vec![text("name").not_null(), text("email")]).unique(unique))
        .build()
        .unwrap()
}

#[tokio::test]
async fn duplicate_unique_key_is_rejected_with_index_name() {
    let db = database(unique_email_schema(false));
    db.insert("users")
        .values(doc(&[("name", json!("A")), ("email", json!("a@x"))]))
        .execute()
        .await
        .unwrap();
    let err = db
        .insert("users")
        .values(doc(&[("name", json!("B")), ("email", json!("a@x"))]))
        .execute()
        .await
        .unwrap_err();
    let text = err.to_string();
    assert!(text.contains("users_email_unique"));
    assert!(text.contains("users"));
}

#[tokio::test]
async fn distinct_nulls_coexist_on_a_unique_key() {
    let db = database(unique_email_schema(false));
    for name in ["A", "B"] {
        db.insert("users")
            .values(doc(&[("name", json!(name)), ("email", Value::Null)]))
            .execute()
            .await
            .unwrap();
    }
    assert_eq!(
        db.query("users").find_many(FindArgs::new()).await.unwrap().len(),
        2
    );
}

#[tokio::test]
async fn nulls_not_distinct_makes_the_second_null_fail() {
    let db = database(unique_email_schema(true));
    db.insert("users")
        .values(doc(&[("name", json!("A")), ("email", Value::Null)]))
        .execute()
        .await
        .unwrap();
    let err = db
        .insert("users")
        .values(doc(&[("name", json!("B")), ("email", Value::Null)]))
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UniqueViolation { .. }));
}

#[tokio::test]
async fn update_does_not_conflict_with_the_row_itself() {
    let db = database(unique_email_schema(false));
    db.insert("users")
        .values(doc(&[("name", json!("A")), ("email", json!("a@x"))]))
        .execute()
        .await
        .unwrap();
    // Re-asserting the same key on the same row is not a violation.
    let updated = db
        .update("users")
        .set(doc(&[("email", json!("a@x")), ("name", json!("A2"))]))
        .filter(eq("email", "a@x"))
        .execute()
        .await
        .unwrap();
    assert_eq!(updated.ids.len(), 1);
}

// ---- upsert ----

#[tokio::test]
async fn on_conflict_do_update_merges_and_returns_the_single_row() {
    let schema = Schema::builder()
        .table(table(
            "users",
            vec![
                text("name").not_null(),
                text("email").unique(),
                text("touched").on_update_fn(|| json!("by-upsert")),
            ],
        ))
        .build()
        .unwrap();
    let db = database(schema);

    db.insert("users")
        .values(doc(&[("email", json!("a@x")), ("name", json!("A"))]))
        .execute()
        .await
        .unwrap();

    let upserted = db
        .insert("users")
        .values(doc(&[("email", json!("a@x")), ("name", json!("A2"))]))
        .on_conflict_do_update(Some("email"), doc(&[("name", json!("Updated"))]))
        .returning()
        .execute()
        .await
        .unwrap();

    let rows = upserted.rows.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("name"), Some(&json!("Updated")));
    assert_eq!(rows[0].get("email"), Some(&json!("a@x")));
    // on_update_fn columns absent from `set` still evaluate.
    assert_eq!(rows[0].get("touched"), Some(&json!("by-upsert")));

    let all = db.query("users").find_many(FindArgs::new()).await.unwrap();
    assert_eq!(all.len(), 1, "upsert must not create a second row");
}

#[tokio::test]
async fn on_conflict_do_nothing_skips_the_row() {
    let db = database(unique_email_schema(false));
    db.insert("users")
        .values(doc(&[("name", json!("A")), ("email", json!("a@x"))]))
        .execute()
        .await
        .unwrap();
    let outcome = db
        .insert("users")
        .values(doc(&[("name", json!("B")), ("email", json!("a@x"))]))
        .on_conflict_do_nothing(None)
        .execute()
        .await
        .unwrap();
    assert!(outcome.ids.is_empty());

    let all = db.query("users").find_many(FindArgs::new()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].get("name"), Some(&json!("A")));
}

// ---- update ----

#[tokio::test]
async fn update_patches_matching_rows_and_runs_on_update_fns() {
    let schema = Schema::builder()
        .table(table(
            "users",
            vec![
                text("name").not_null(),
                text("role").default_value("member"),
                text("touched").on_update_fn(|| json!("yes")),
            ],
        ))
        .build()
        .unwrap();
    let db = database(schema);
    for name in ["Ada", "Bea"] {
        db.insert("users")
            .values(doc(&[("name", json!(name))]))
            .execute()
            .await
            .unwrap();
    }

    let updated = db
        .update("users")
        .set(doc(&[("role", json!("admin"))]))
        .filter(eq("name", "Ada"))
        .returning()
        .execute()
        .await
        .unwrap();
    assert_eq!(updated.ids.len(), 1);
    let row = &updated.rows.unwrap()[0];
    assert_eq!(row.get("role"), Some(&json!("admin")));
    assert_eq!(row.get("touched"), Some(&json!("yes")));

    let untouched = db
        .query("users")
        .find_first(FindArgs::new().filter(eq("name", "Bea")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(untouched.get("role"), Some(&json!("member")));
    assert_eq!(untouched.get("touched"), None);
}

// ---- strictness ----

#[tokio::test]
async fn update_and_delete_without_filter_error_in_strict_mode() {
    let db = database(users_schema());
    let err = db
        .update("users")
        .set(doc(&[("role", json!("x"))]))
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::RequiresWhere { .. }));
    assert!(err.to_string().contains("update"));

    let err = db.delete("users").execute().await.unwrap_err();
    assert!(err.to_string().contains("delete"));
}

#[tokio::test]
async fn non_strict_mode_downgrades_missing_filter_to_a_full_scan() {
    let schema = Schema::builder()
        .table(table("users", vec![text("name").not_null()]))
        .defaults(SchemaDefaults {
            strict: false,
            ..SchemaDefaults::default()
        })
        .build()
        .unwrap();
    let db = database(schema);
    for name in ["Ada", "Bea"] {
        db.insert("users")
            .values(doc(&[("name", json!(name))]))
            .execute()
            .await
            .unwrap();
    }
    let deleted = db.delete("users").execute().await.unwrap();
    assert_eq!(deleted.ids.len(), 2);
    assert!(db
        .query("users")
        .find_many(FindArgs::new())
        .await
        .unwrap()
        .is_empty());
}

// ---- checks ----

#[tokio::test]
async fn check_constraints_are_tri_state() {
    use stratum_core::{gt, integer};
    let schema = Schema::builder()
        .table(
            table(
                "accounts",
                vec![text("owner").not_null(), integer("balance")],
            )
            .check("balance_positive", gt("balance", 0)),
        )
        .build()
        .unwrap();
    let db = database(schema);

    // false rejects, with the check name in the message
    let err = db
        .insert("accounts")
        .values(doc(&[("owner", json!("Ada")), ("balance", json!(-5))]))
        .execute()
        .await
        .unwrap_err();
    assert!(err.to_string().contains("balance_positive"));

    // unknown (null operand) allows
    db.insert("accounts")
        .values(doc(&[("owner", json!("Bea")), ("balance", Value::Null)]))
        .execute()
        .await
        .unwrap();
}

// ---- capacity ----

#[tokio::test]
async fn sync_mutation_over_max_rows_fails_fast() {
    let schema = Schema::builder()
        .table(table("users", vec![text("name").not_null()]))
        .defaults(SchemaDefaults {
            mutation_max_rows: 2,
            ..SchemaDefaults::default()
        })
        .build()
        .unwrap();
    let db = database(schema);
    for i in 0..3 {
        db.insert("users")
            .values(doc(&[("name", json!(format!("u{i}")))]))
            .execute()
            .await
            .unwrap();
    }
    let err = db
        .update("users")
        .set(doc(&[("name", json!("renamed"))]))
        .filter(stratum_core::starts_with("name", "u"))
        .execute()
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::MaxRowsExceeded { max: 2 }));
    assert!(err.to_string().contains("mutationMaxRows"));
}
