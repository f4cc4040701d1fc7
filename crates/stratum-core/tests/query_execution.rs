use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};

use stratum_core::{
    and, eq, gt, ilike, integer, like, or, table, text, ColumnSelection, Database, Direction,
    FindArgs, Orm, OrmError, Relations, RequestContext, Schema,
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

fn posts_schema() -> Schema {
    Schema::builder()
        .table(
            table(
                "posts",
                vec![
                    text("title").not_null(),
                    text("team"),
                    integer("publishedAt"),
                    integer("score"),
                ],
            )
            .index("by_team", &["team"])
            .index("by_published", &["publishedAt"]),
        )
        .build()
        .unwrap()
}

async fn seed_posts(db: &Database) {
    for (title, team, published, score) in [
        ("one", "red", 1000, 5),
        ("two", "blue", 2000, 15),
        ("three", "red", 3000, 25),
        ("four", "blue", 4000, 35),
    ] {
        db.insert("posts")
            .values(doc(&[
                ("title", json!(title)),
                ("team", json!(team)),
                ("publishedAt", json!(published)),
                ("score", json!(score)),
            ]))
            .execute()
            .await
            .unwrap();
    }
}

fn titles(rows: &[Document]) -> Vec<&str> {
    rows.iter()
        .map(|r| r.get("title").unwrap().as_str().unwrap())
        .collect()
}

// ---- ordering, offset, limit ----

#[tokio::test]
async fn order_by_with_limit_and_offset() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let rows = db
        .query("posts")
        .find_many(
            FindArgs::new()
                .order_by("publishedAt", Direction::Asc)
                .limit(2)
                .offset(2),
        )
        .await
        .unwrap();
    assert_eq!(titles(&rows), vec!["three", "four"]);
}

#[tokio::test]
async fn descending_order_and_multiple_keys() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let rows = db
        .query("posts")
        .find_many(
            FindArgs::new()
                .order_by("team", Direction::Asc)
                .order_by("publishedAt", Direction::Desc),
        )
        .await
        .unwrap();
    assert_eq!(titles(&rows), vec!["four", "two", "three", "one"]);
}

#[tokio::test]
async fn default_order_is_creation_time() {
    let db = database(posts_schema());
    seed_posts(&db).await;
    let rows = db.query("posts").find_many(FindArgs::new()).await.unwrap();
    assert_eq!(titles(&rows), vec!["one", "two", "three", "four"]);
}

// ---- pushdown soundness ----

#[tokio::test]
async fn indexed_and_unindexed_filters_return_the_same_rows() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    // team is indexed (eq pushes down), score is not (post-filter),
    // like has no native form (conservative true + post-filter).
    let filters = [
        and(vec![eq("team", "red"), gt("score", 10)]),
        or(vec![eq("team", "red"), gt("score", 30)]),
        and(vec![like("title", "t%"), eq("team", "blue")]),
        stratum_core::not(ilike("title", "O%")),
    ];
    for filter in filters {
        let rows = db
            .query("posts")
            .find_many(FindArgs::new().filter(filter.clone()))
            .await
            .unwrap();
        let all = db.query("posts").find_many(FindArgs::new()).await.unwrap();
        let expected: Vec<&str> = all
            .iter()
            .filter(|r| {
                // Hydrated rows evaluate the same predicate directly.
                filter.matches(r)
            })
            .map(|r| r.get("title").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(titles(&rows), expected, "filter: {filter:?}");
    }
}

// ---- find_first ----

#[tokio::test]
async fn find_first_returns_none_on_no_match() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let hit = db
        .query("posts")
        .find_first(FindArgs::new().filter(eq("team", "red")))
        .await
        .unwrap();
    assert!(hit.is_some());

    let miss = db
        .query("posts")
        .find_first(FindArgs::new().filter(eq("team", "green")))
        .await
        .unwrap();
    assert!(miss.is_none());
}

#[tokio::test]
async fn find_by_id_uses_the_point_read_path() {
    let db = database(posts_schema());
    let created = db
        .insert("posts")
        .values(doc(&[("title", json!("pinned"))]))
        .execute()
        .await
        .unwrap();
    let id = created.ids[0].to_string();

    let row = db
        .query("posts")
        .find_first(FindArgs::new().filter(eq("id", id.clone())))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.get("id"), Some(&json!(id)));
}

// ---- projection and extras ----

#[tokio::test]
async fn column_selection_keeps_identity_columns() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let rows = db
        .query("posts")
        .find_many(
            FindArgs::new()
                .filter(eq("title", "one"))
                .columns(ColumnSelection::Include(vec!["title".to_string()])),
        )
        .await
        .unwrap();
    let row = &rows[0];
    assert!(row.get("title").is_some());
    assert!(row.get("team").is_none());
    assert!(row.get("id").is_some());
    assert!(row.get("createdAt").is_some());

    let rows = db
        .query("posts")
        .find_many(
            FindArgs::new()
                .filter(eq("title", "one"))
                .columns(ColumnSelection::Exclude(vec!["score".to_string()])),
        )
        .await
        .unwrap();
    assert!(rows[0].get("score").is_none());
    assert!(rows[0].get("team").is_some());
}

#[tokio::test]
async fn extras_compute_from_the_hydrated_row() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let rows = db
        .query("posts")
        .find_many(FindArgs::new().filter(eq("title", "two")).extra(
            "shout",
            |row| {
                json!(row
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_uppercase())
            },
        ))
        .await
        .unwrap();
    assert_eq!(rows[0].get("shout"), Some(&json!("TWO")));
}

// ---- pagination ----

#[tokio::test]
async fn paginate_walks_pages_in_creation_order() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let first = db
        .query("posts")
        .paginate(FindArgs::new(), None, 3)
        .await
        .unwrap();
    assert_eq!(titles(&first.page), vec!["one", "two", "three"]);
    assert!(!first.is_done);

    let second = db
        .query("posts")
        .paginate(FindArgs::new(), first.continue_cursor, 3)
        .await
        .unwrap();
    assert_eq!(titles(&second.page), vec!["four"]);
    assert!(second.is_done);
}

#[tokio::test]
async fn paginate_rejects_explicit_order_by() {
    let db = database(posts_schema());
    let err = db
        .query("posts")
        .paginate(
            FindArgs::new().order_by("publishedAt", Direction::Asc),
            None,
            2,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UnsupportedOrder { .. }));
}

#[tokio::test]
async fn stream_yields_every_row_in_scan_order() {
    let db = database(posts_schema());
    seed_posts(&db).await;

    let rows: Vec<_> = db
        .query("posts")
        .stream(FindArgs::new())
        .collect::<Vec<_>>()
        .await;
    let rows: Vec<Document> = rows.into_iter().map(|r| r.unwrap()).collect();
    assert_eq!(titles(&rows), vec!["one", "two", "three", "four"]);
}
