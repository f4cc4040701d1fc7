//! Relational query executor
//!
//! Runs compiled scans against the driver, re-evaluates the predicate
//! in memory, applies row-level security and ordering, hydrates rows
//! (system-field renames and temporal modes), and loads nested
//! relations with bounded concurrency.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use stratum_store::{
    scan_order, Document, Order, ScanRequest, CREATION_TIME_FIELD, ID_FIELD,
};

use crate::compile::compile_where;
use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::expr::{and, eq, in_array, BinaryOp, Expr};
use crate::relations::{Cardinality, Edge};
use crate::rls::{self, PolicyFor, PolicyPhase};
use crate::schema::{ColumnKind, Table, TimestampMode};
use crate::temporal;

// ---------------------------------------------------------------------------
// Query configuration
// ---------------------------------------------------------------------------

/// Post-fetch computed column.
pub type ExtraFn = Arc<dyn Fn(&Document) -> Value + Send + Sync>;

/// Column whitelist or blacklist for the projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSelection {
    Include(Vec<String>),
    Exclude(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Configuration for `find_many` / `find_first`.
#[derive(Clone, Default)]
pub struct FindArgs {
    pub columns: Option<ColumnSelection>,
    pub with: BTreeMap<String, FindArgs>,
    pub filter: Option<Expr>,
    pub order_by: Vec<(String, Direction)>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub extras: BTreeMap<String, ExtraFn>,
}

impl fmt::Debug for FindArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindArgs")
            .field("columns", &self.columns)
            .field("with", &self.with.keys().collect::<Vec<_>>())
            .field("filter", &self.filter)
            .field("order_by", &self.order_by)
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .field("extras", &self.extras.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FindArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by.push((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with(mut self, relation: &str, nested: FindArgs) -> Self {
        self.with.insert(relation.to_string(), nested);
        self
    }

    pub fn columns(mut self, selection: ColumnSelection) -> Self {
        self.columns = Some(selection);
        self
    }

    pub fn extra(
        mut self,
        name: &str,
        compute: impl Fn(&Document) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.extras.insert(name.to_string(), Arc::new(compute));
        self
    }
}

/// One page of a cursor-paginated query.
#[derive(Debug, Clone)]
pub struct PaginatedResult {
    pub page: Vec<Document>,
    pub continue_cursor: Option<String>,
    pub is_done: bool,
}

// ---------------------------------------------------------------------------
// Query entry points
// ---------------------------------------------------------------------------

/// Query surface for one table of a request's database facade.
#[derive(Clone)]
pub struct QueryBuilder {
    pub(crate) db: Arc<DatabaseInner>,
    pub(crate) table: String,
}

impl QueryBuilder {
    pub async fn find_many(&self, args: FindArgs) -> OrmResult<Vec<Document>> {
        find_many(Arc::clone(&self.db), self.table.clone(), args).await
    }

    /// `find_many` with `limit: 1`, returning the first row or `None`.
    pub async fn find_first(&self, args: FindArgs) -> OrmResult<Option<Document>> {
        let args = FindArgs {
            limit: Some(1),
            ..args
        };
        let mut rows = find_many(Arc::clone(&self.db), self.table.clone(), args).await?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.swap_remove(0))
        })
    }

    /// Cursor pagination. Ordering is delegated to the selected index
    /// scan (`_creationTime` for unindexed scans); combining a cursor
    /// with an explicit `order_by` is unsupported.
    pub async fn paginate(
        &self,
        args: FindArgs,
        cursor: Option<String>,
        limit: usize,
    ) -> OrmResult<PaginatedResult> {
        if !args.order_by.is_empty() {
            return Err(OrmError::UnsupportedOrder {
                table: self.table.clone(),
            });
        }
        let table = self.db.schema.table(&self.table)?.clone();
        let compiled = compile_where(args.filter.as_ref(), &table);

        let page = self
            .db
            .writer
            .scan(
                &self.table,
                ScanRequest {
                    index: compiled.index,
                    filter: compiled.driver_filter,
                    order: Order::Asc,
                    cursor,
                    limit: Some(limit),
                },
            )
            .await?;

        let mut rows = Vec::with_capacity(page.documents.len());
        for doc in page.documents {
            if let Some(predicate) = &compiled.predicate {
                if !predicate.matches(&doc) {
                    continue;
                }
            }
            if !rls::allows(
                &table,
                PolicyFor::Select,
                PolicyPhase::Using,
                &doc,
                &self.db.request,
            ) {
                continue;
            }
            rows.push(doc);
        }

        let hydrated: Vec<Document> = rows
            .into_iter()
            .map(|doc| hydrate_document(&table, doc))
            .collect();
        let hydrated = attach_relations(Arc::clone(&self.db), &self.table, hydrated, &args).await?;
        let projected = hydrated
            .into_iter()
            .map(|doc| project_document(&table, doc, &args))
            .collect();

        Ok(PaginatedResult {
            page: projected,
            continue_cursor: page.continue_cursor,
            is_done: page.is_done,
        })
    }

    /// The paginated scan exposed as a stream of hydrated rows.
    pub fn stream(&self, args: FindArgs) -> impl Stream<Item = OrmResult<Document>> {
        let builder = self.clone();
        let page_size = self.db.schema.defaults().mutation_batch_size;
        // State: `Some(cursor)` fetches the next page, `None` ends.
        stream::unfold(
            (Some(None::<String>), args),
            move |(state, args)| {
                let builder = builder.clone();
                async move {
                    let cursor = state?;
                    match builder.paginate(args.clone(), cursor, page_size).await {
                        Ok(result) => {
                            let next = if result.is_done {
                                None
                            } else {
                                Some(result.continue_cursor)
                            };
                            let items: Vec<OrmResult<Document>> =
                                result.page.into_iter().map(Ok).collect();
                            Some((stream::iter(items), (next, args)))
                        }
                        Err(err) => Some((stream::iter(vec![Err(err)]), (None, args))),
                    }
                }
            },
        )
        .flatten()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Boxed for recursion through nested relation loads.
fn find_many(
    db: Arc<DatabaseInner>,
    table_name: String,
    args: FindArgs,
) -> BoxFuture<'static, OrmResult<Vec<Document>>> {
    Box::pin(async move {
        let table = db.schema.table(&table_name)?.clone();
        let mut rows = collect_matching(&db, &table, args.filter.as_ref()).await?;

        rows.retain(|doc| {
            rls::allows(
                &table,
                PolicyFor::Select,
                PolicyPhase::Using,
                doc,
                &db.request,
            )
        });

        if !args.order_by.is_empty() {
            sort_rows(&mut rows, &args.order_by);
        }

        let offset = args.offset.unwrap_or(0);
        let rows: Vec<Document> = rows
            .into_iter()
            .skip(offset)
            .take(args.limit.unwrap_or(usize::MAX))
            .collect();

        let hydrated: Vec<Document> = rows
            .into_iter()
            .map(|doc| hydrate_document(&table, doc))
            .collect();

        let rows = attach_relations(Arc::clone(&db), &table_name, hydrated, &args).await?;
        Ok(rows
            .into_iter()
            .map(|doc| project_document(&table, doc, &args))
            .collect())
    })
}

/// Collect every stored document of `table` matching `predicate`.
///
/// A predicate that conjunctively pins the document id becomes a point
/// read; everything else compiles to an indexed or full scan, paged by
/// the schema's batch size, with the predicate re-evaluated in memory.
pub(crate) async fn collect_matching(
    db: &DatabaseInner,
    table: &Table,
    predicate: Option<&Expr>,
) -> OrmResult<Vec<Document>> {
    if let Some(id_value) = predicate.and_then(pinned_id) {
        let Some(id) = db
            .writer
            .normalize_id(table.name(), &id_value)
            .await?
        else {
            return Ok(Vec::new());
        };
        let Some(doc) = db.writer.get(table.name(), &id).await? else {
            return Ok(Vec::new());
        };
        let matches = predicate.map(|p| p.matches(&doc)).unwrap_or(true);
        return Ok(if matches { vec![doc] } else { Vec::new() });
    }

    let compiled = compile_where(predicate, table);
    debug!(
        table = table.name(),
        index = compiled.index.as_ref().map(|i| i.name.as_str()),
        "collecting rows"
    );

    let mut rows = Vec::new();
    let mut cursor = None;
    loop {
        let page = db
            .writer
            .scan(
                table.name(),
                ScanRequest {
                    index: compiled.index.clone(),
                    filter: compiled.driver_filter.clone(),
                    order: Order::Asc,
                    cursor,
                    limit: Some(db.schema.defaults().mutation_batch_size),
                },
            )
            .await?;
        for doc in page.documents {
            if compiled
                .predicate
                .as_ref()
                .map(|p| p.matches(&doc))
                .unwrap_or(true)
            {
                rows.push(doc);
            }
        }
        if page.is_done {
            break;
        }
        cursor = page.continue_cursor;
    }
    Ok(rows)
}

/// A conjunctively-pinned `eq` on the id column, when present.
fn pinned_id(predicate: &Expr) -> Option<String> {
    match predicate {
        Expr::Binary {
            op: BinaryOp::Eq,
            field,
            value,
        } if field.storage_field() == ID_FIELD => value.as_str().map(str::to_string),
        Expr::And { operands } => operands.iter().find_map(pinned_id),
        _ => None,
    }
}

/// Stable in-memory sort over stored documents; nulls order first
/// ascending, system aliases resolve to their stored fields.
fn sort_rows(rows: &mut [Document], order_by: &[(String, Direction)]) {
    let storage_name = |field: &str| match field {
        "id" => ID_FIELD.to_string(),
        "createdAt" => CREATION_TIME_FIELD.to_string(),
        other => other.to_string(),
    };
    let keys: Vec<(String, Direction)> = order_by
        .iter()
        .map(|(f, d)| (storage_name(f), *d))
        .collect();
    rows.sort_by(|a, b| {
        for (field, direction) in &keys {
            let av = a.get(field).cloned().unwrap_or(Value::Null);
            let bv = b.get(field).cloned().unwrap_or(Value::Null);
            let ord = scan_order(&av, &bv);
            if ord != std::cmp::Ordering::Equal {
                return match direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
            }
        }
        std::cmp::Ordering::Equal
    });
}

// ---------------------------------------------------------------------------
// Hydration
// ---------------------------------------------------------------------------

/// Rename system fields (`_id` → `id`, `_creationTime` → `createdAt`)
/// and convert temporal columns to their declared mode.
pub(crate) fn hydrate_document(table: &Table, doc: Document) -> Document {
    let mut out = Document::new();
    let mut id = Value::Null;
    let mut created_at = Value::Null;

    for (field, value) in doc {
        match field.as_str() {
            ID_FIELD => id = value,
            CREATION_TIME_FIELD => {
                created_at = match table.creation_time_mode {
                    Some(TimestampMode::Rfc3339) => temporal::hydrate(
                        &ColumnKind::Timestamp(TimestampMode::Rfc3339),
                        value,
                    ),
                    _ => value,
                };
            }
            _ => {
                let hydrated = match table.column(&field) {
                    Some(column) => temporal::hydrate(&column.kind, value),
                    None => value,
                };
                out.insert(field, hydrated);
            }
        }
    }

    out.insert("id".to_string(), id);
    out.insert("createdAt".to_string(), created_at);
    out
}

/// Apply the column selection (over the table's own columns only, so
/// attached relations survive) and compute extras.
fn project_document(table: &Table, mut doc: Document, args: &FindArgs) -> Document {
    if let Some(selection) = &args.columns {
        match selection {
            ColumnSelection::Include(keep) => {
                doc.retain(|field, _| {
                    table.column(field).is_none() || keep.contains(field)
                });
            }
            ColumnSelection::Exclude(drop) => {
                doc.retain(|field, _| {
                    table.column(field).is_none() || !drop.contains(field)
                });
            }
        }
    }

    if !args.extras.is_empty() {
        let snapshot = doc.clone();
        for (name, compute) in &args.extras {
            doc.insert(name.clone(), compute(&snapshot));
        }
    }
    doc
}

// ---------------------------------------------------------------------------
// Relation loading
// ---------------------------------------------------------------------------

/// Load every requested relation for every row, bounded by the schema's
/// relation concurrency, and attach the results under the edge names.
async fn attach_relations(
    db: Arc<DatabaseInner>,
    table_name: &str,
    mut rows: Vec<Document>,
    args: &FindArgs,
) -> OrmResult<Vec<Document>> {
    if args.with.is_empty() || rows.is_empty() {
        return Ok(rows);
    }

    let mut loads = Vec::new();
    for (relation, nested) in &args.with {
        let edge = db
            .edges
            .iter()
            .find(|e| e.source_table == table_name && e.edge_name == *relation)
            .ok_or_else(|| OrmError::UnknownRelation {
                table: table_name.to_string(),
                relation: relation.clone(),
            })?
            .clone();
        for (row_index, row) in rows.iter().enumerate() {
            loads.push((row_index, edge.clone(), nested.clone(), row.clone()));
        }
    }

    let concurrency = db.schema.defaults().relation_concurrency.max(1);
    let results: Vec<(usize, String, OrmResult<Value>)> = stream::iter(loads)
        .map(|(row_index, edge, nested, row)| {
            let db = Arc::clone(&db);
            async move {
                let name = edge.edge_name.clone();
                let value = load_relation(db, edge, row, nested).await;
                (row_index, name, value)
            }
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (row_index, name, value) in results {
        rows[row_index].insert(name, value?);
    }
    Ok(rows)
}

/// Resolve one edge for one (hydrated) source row.
async fn load_relation(
    db: Arc<DatabaseInner>,
    edge: Edge,
    row: Document,
    nested: FindArgs,
) -> OrmResult<Value> {
    match edge.cardinality {
        Cardinality::One => {
            let mut joins = Vec::new();
            for (source_field, target_field) in
                edge.source_fields.iter().zip(edge.target_fields.iter())
            {
                let value = row.get(source_field).cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    return Ok(Value::Null);
                }
                joins.push(eq(target_field.as_str(), value));
            }
            let filter = merge_filters(joins, nested.filter.clone());
            let args = FindArgs {
                filter: Some(filter),
                limit: Some(1),
                ..nested
            };
            let mut related = find_many(db, edge.target_table, args).await?;
            Ok(if related.is_empty() {
                Value::Null
            } else {
                Value::Object(related.swap_remove(0))
            })
        }
        Cardinality::Many => {
            if let Some(through) = &edge.through {
                let source_id = row.get("id").cloned().unwrap_or(Value::Null);
                if source_id.is_null() {
                    return Ok(Value::Array(Vec::new()));
                }
                let junction_args = FindArgs {
                    filter: Some(eq(through.source_field.as_str(), source_id)),
                    ..FindArgs::default()
                };
                let junction_rows =
                    find_many(Arc::clone(&db), through.table.clone(), junction_args).await?;
                let target_ids: Vec<Value> = junction_rows
                    .iter()
                    .filter_map(|j| j.get(&through.target_field).cloned())
                    .filter(|v| !v.is_null())
                    .collect();
                if target_ids.is_empty() {
                    return Ok(Value::Array(Vec::new()));
                }
                let filter = merge_filters(vec![in_array("id", target_ids)], nested.filter.clone());
                let args = FindArgs {
                    filter: Some(filter),
                    ..nested
                };
                let related = find_many(db, edge.target_table, args).await?;
                return Ok(Value::Array(related.into_iter().map(Value::Object).collect()));
            }

            let mut joins = Vec::new();
            for (source_field, target_field) in
                edge.source_fields.iter().zip(edge.target_fields.iter())
            {
                let value = row.get(source_field).cloned().unwrap_or(Value::Null);
                if value.is_null() {
                    return Ok(Value::Array(Vec::new()));
                }
                joins.push(eq(target_field.as_str(), value));
            }
            let filter = merge_filters(joins, nested.filter.clone());
            let args = FindArgs {
                filter: Some(filter),
                ..nested
            };
            let related = find_many(db, edge.target_table, args).await?;
            Ok(Value::Array(related.into_iter().map(Value::Object).collect()))
        }
    }
}

fn merge_filters(mut joins: Vec<Expr>, nested: Option<Expr>) -> Expr {
    if let Some(extra) = nested {
        joins.push(extra);
    }
    if joins.len() == 1 {
        joins.swap_remove(0)
    } else {
        and(joins)
    }
}
