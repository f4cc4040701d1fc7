//! Mutation pipeline
//!
//! Lazy builders for insert/update/delete (nothing happens until
//! `execute()`), plus the shared enforcement steps every write runs:
//! defaults, temporal normalization, storage validation, check
//! constraints, foreign-key presence, and unique indexes. Constraint
//! checks always happen before the driver write.

mod delete;
mod insert;
mod update;

pub use delete::DeleteBuilder;
pub use insert::{InsertBuilder, OnConflict};
pub use update::UpdateBuilder;

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use stratum_store::{Document, DocumentId, ScheduledJob, CREATION_TIME_FIELD, ID_FIELD};

use crate::batch::{MutationBatchArgs, SCHEDULED_MUTATION_BATCH};
use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::expr::{and, eq, is_null, Expr};
use crate::query::collect_matching;
use crate::schema::{ExecutionMode, Table, UniqueIndex, CREATED_AT_COLUMN};
use crate::temporal;

/// Result of an executed mutation.
#[derive(Debug, Clone, Default)]
pub struct Mutated {
    /// Ids of the rows written (or deleted) synchronously.
    pub ids: Vec<DocumentId>,
    /// Hydrated rows when `returning()` was requested.
    pub rows: Option<Vec<Document>>,
    /// True when part of the work was handed to the scheduler.
    pub deferred: bool,
}

/// Budget and bookkeeping for one mutation, cascades included.
pub(crate) struct MutationCtx {
    pub db: Arc<DatabaseInner>,
    used: usize,
    pub visited: HashSet<String>,
    pub deferred: bool,
}

impl MutationCtx {
    pub fn new(db: Arc<DatabaseInner>) -> Self {
        MutationCtx {
            db,
            used: 0,
            visited: HashSet::new(),
            deferred: false,
        }
    }

    pub fn is_async(&self) -> bool {
        self.db.schema.defaults().execution_mode == ExecutionMode::Async
    }

    pub fn max_rows(&self) -> usize {
        self.db.schema.defaults().mutation_max_rows
    }

    pub fn remaining(&self) -> usize {
        self.max_rows().saturating_sub(self.used)
    }

    /// Take one row of budget; false when the budget is spent.
    pub fn try_consume(&mut self) -> bool {
        if self.used < self.max_rows() {
            self.used += 1;
            true
        } else {
            false
        }
    }

    /// The error for a spent budget in sync mode.
    pub fn exceeded(&self) -> OrmError {
        OrmError::MaxRowsExceeded {
            max: self.max_rows(),
        }
    }

    /// Hand a batch of pending work to the driver scheduler.
    pub async fn enqueue_batch(&mut self, args: MutationBatchArgs) -> OrmResult<()> {
        let job = ScheduledJob::new(SCHEDULED_MUTATION_BATCH, serde_json::to_value(&args)?);
        self.db.scheduler.run_after(0.0, job).await?;
        self.deferred = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared enforcement steps
// ---------------------------------------------------------------------------

/// Writes may not target the driver's system fields, nor the
/// `createdAt` alias when it stands for the system creation time.
pub(crate) fn reject_system_fields(table: &Table, doc: &Document) -> OrmResult<()> {
    for field in doc.keys() {
        let reserved = field == ID_FIELD
            || field == CREATION_TIME_FIELD
            || field == "id"
            || (field == CREATED_AT_COLUMN && table.column(CREATED_AT_COLUMN).is_none());
        if reserved {
            return Err(OrmError::SystemFieldWrite {
                table: table.name().to_string(),
                field: field.clone(),
            });
        }
    }
    Ok(())
}

/// Fill defaults for absent columns. An explicit `null` is preserved
/// and never overridden.
pub(crate) fn apply_defaults(table: &Table, doc: &mut Document) {
    for column in table.columns() {
        if doc.contains_key(column.name()) {
            continue;
        }
        if let Some(default) = &column.default {
            doc.insert(column.name().to_string(), default.produce());
        }
    }
}

/// Add `on_update_fn` values for columns the patch does not set.
pub(crate) fn apply_on_update_defaults(table: &Table, patch: &mut Document) {
    for column in table.columns() {
        if patch.contains_key(column.name()) {
            continue;
        }
        if let Some(factory) = &column.on_update {
            patch.insert(column.name().to_string(), factory());
        }
    }
}

/// Convert temporal inputs to their stored representation.
pub(crate) fn normalize_temporals(table: &Table, doc: &mut Document) -> OrmResult<()> {
    for (field, value) in doc.iter_mut() {
        let Some(column) = table.column(field) else {
            continue;
        };
        let normalized = temporal::normalize(&column.kind, value).map_err(|reason| {
            OrmError::InvalidValue {
                table: table.name().to_string(),
                column: field.clone(),
                reason,
            }
        })?;
        *value = normalized;
    }
    Ok(())
}

/// Tri-state check constraints: `false` rejects, `unknown` allows.
pub(crate) fn enforce_checks(table: &Table, doc: &Document) -> OrmResult<()> {
    for check in table.checks() {
        if check.expr.evaluate(doc) == crate::expr::TriState::False {
            return Err(OrmError::CheckViolation {
                table: table.name().to_string(),
                name: check.name.clone(),
            });
        }
    }
    Ok(())
}

/// Foreign-key presence: for every FK whose source columns are all
/// non-null (and touched, when `changed` is given), the target row must
/// exist: by direct id lookup when the FK references `id`, otherwise
/// by indexed scan on the named target columns.
pub(crate) async fn enforce_foreign_keys(
    db: &DatabaseInner,
    table: &Table,
    doc: &Document,
    changed: Option<&[String]>,
) -> OrmResult<()> {
    for fk in table.foreign_keys() {
        if let Some(changed) = changed {
            if !fk.columns.iter().any(|c| changed.contains(c)) {
                continue;
            }
        }
        let values: Vec<Value> = fk
            .columns
            .iter()
            .map(|c| doc.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if values.iter().any(Value::is_null) {
            continue;
        }

        let target = db.schema.table(&fk.foreign_table)?;
        let exists = if fk.foreign_columns == ["id"] {
            let candidate = values[0].as_str().unwrap_or_default();
            match db.writer.normalize_id(target.name(), candidate).await? {
                Some(id) => db.writer.get(target.name(), &id).await?.is_some(),
                None => false,
            }
        } else {
            let predicate = and(
                fk.foreign_columns
                    .iter()
                    .zip(values.iter())
                    .map(|(column, value)| eq(column.as_str(), value.clone()))
                    .collect(),
            );
            !collect_matching(db, target, Some(&predicate)).await?.is_empty()
        };

        if !exists {
            return Err(OrmError::ForeignKeyViolation {
                table: table.name().to_string(),
                target: fk.foreign_table.clone(),
            });
        }
    }
    Ok(())
}

/// Predicate matching documents that share `doc`'s key for `unique`.
/// `None` when the null-distinct rule skips the check entirely.
fn unique_key_predicate(unique: &UniqueIndex, doc: &Document) -> Option<Expr> {
    let mut clauses = Vec::with_capacity(unique.fields.len());
    for field in &unique.fields {
        let value = doc.get(field).cloned().unwrap_or(Value::Null);
        if value.is_null() {
            if !unique.nulls_not_distinct {
                return None;
            }
            clauses.push(is_null(field.as_str()));
        } else {
            clauses.push(eq(field.as_str(), value));
        }
    }
    Some(if clauses.len() == 1 {
        clauses.swap_remove(0)
    } else {
        and(clauses)
    })
}

/// Unique-index enforcement. `current_id` exempts the row being
/// updated; `changed` scopes the scan to indexes a patch touched.
pub(crate) async fn enforce_unique(
    db: &DatabaseInner,
    table: &Table,
    doc: &Document,
    current_id: Option<&str>,
    changed: Option<&[String]>,
) -> OrmResult<()> {
    for unique in table.unique_indexes() {
        if let Some(changed) = changed {
            if !unique.fields.iter().any(|f| changed.contains(f)) {
                continue;
            }
        }
        let Some(predicate) = unique_key_predicate(unique, doc) else {
            continue;
        };
        let existing = collect_matching(db, table, Some(&predicate)).await?;
        let conflict = existing.iter().any(|row| {
            row.get(ID_FIELD).and_then(Value::as_str) != current_id
        });
        if conflict {
            return Err(OrmError::UniqueViolation {
                table: table.name().to_string(),
                index: unique.name.clone(),
            });
        }
    }
    Ok(())
}

/// First stored row conflicting with `doc` on a unique index. `target`
/// narrows the probe to one index, matched by name or by single field.
pub(crate) async fn find_conflict(
    db: &DatabaseInner,
    table: &Table,
    doc: &Document,
    target: Option<&str>,
) -> OrmResult<Option<(UniqueIndex, Document)>> {
    for unique in table.unique_indexes() {
        if let Some(target) = target {
            let named = unique.name == target || unique.fields == [target.to_string()];
            if !named {
                continue;
            }
        }
        let Some(predicate) = unique_key_predicate(unique, doc) else {
            continue;
        };
        let mut existing = collect_matching(db, table, Some(&predicate)).await?;
        if !existing.is_empty() {
            return Ok(Some((unique.clone(), existing.swap_remove(0))));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Document helpers
// ---------------------------------------------------------------------------

pub(crate) fn merged(old: &Document, patch: &Document) -> Document {
    let mut out = old.clone();
    for (field, value) in patch {
        out.insert(field.clone(), value.clone());
    }
    out
}

/// Fields whose value the patch actually changes.
pub(crate) fn changed_fields(old: &Document, patch: &Document) -> Vec<String> {
    patch
        .iter()
        .filter(|(field, value)| old.get(*field) != Some(value))
        .map(|(field, _)| field.clone())
        .collect()
}

pub(crate) fn stored_id(doc: &Document) -> String {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// The patch a soft delete applies. Errors when the table has no
/// `deletionTime` column.
pub(crate) fn soft_delete_patch(table: &Table) -> OrmResult<Document> {
    let column = table
        .column(crate::schema::DELETION_TIME_COLUMN)
        .ok_or_else(|| OrmError::InvalidValue {
            table: table.name().to_string(),
            column: crate::schema::DELETION_TIME_COLUMN.to_string(),
            reason: "soft delete requires a deletionTime column".to_string(),
        })?;
    let mut patch = Document::new();
    patch.insert(
        crate::schema::DELETION_TIME_COLUMN.to_string(),
        temporal::now_value(&column.kind),
    );
    Ok(patch)
}
