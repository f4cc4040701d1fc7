//! Foreign-key action engine
//!
//! Runs the incoming-FK actions when a referenced row is deleted or its
//! referenced columns change: cascade, restrict/no action, set null,
//! set default. Cascades recurse with a visited set keyed by document
//! id; the cascade mode propagates, so a soft cascade never
//! hard-deletes descendants. When the row budget runs out in async
//! mode, the remaining fan-out is handed to the scheduler.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use futures::future::BoxFuture;

use stratum_store::{Document, DocumentId, ID_FIELD};

use crate::batch::{BatchOperation, FinallyTarget, MutationBatchArgs};
use crate::error::{OrmError, OrmResult};
use crate::expr::{and, eq, Expr};
use crate::mutation::{soft_delete_patch, stored_id, MutationCtx};
use crate::query::collect_matching;
use crate::schema::{ForeignKey, RefAction, Table};

/// Whether cascading writes hard-delete descendants or soft-delete them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeMode {
    Hard,
    Soft,
}

/// Values of `doc` for the FK's referenced columns; `None` when any is
/// null (nothing can reference a null key).
fn referenced_values(fk: &ForeignKey, doc: &Document) -> Option<Vec<Value>> {
    let mut values = Vec::with_capacity(fk.foreign_columns.len());
    for column in &fk.foreign_columns {
        let value = if column == "id" {
            doc.get(ID_FIELD).cloned().unwrap_or(Value::Null)
        } else {
            doc.get(column).cloned().unwrap_or(Value::Null)
        };
        if value.is_null() {
            return None;
        }
        values.push(value);
    }
    Some(values)
}

fn referencing_predicate(fk: &ForeignKey, values: &[Value]) -> Expr {
    let mut clauses: Vec<Expr> = fk
        .columns
        .iter()
        .zip(values.iter())
        .map(|(column, value)| eq(column.as_str(), value.clone()))
        .collect();
    if clauses.len() == 1 {
        clauses.swap_remove(0)
    } else {
        and(clauses)
    }
}

/// Locate rows referencing `doc` through `fk`. Raises the dedicated
/// requires-index error when rows exist but the referencing table has
/// no index over the FK columns.
async fn referencing_rows(
    ctx: &MutationCtx,
    target: &Table,
    referencing: &Table,
    fk: &ForeignKey,
    doc: &Document,
) -> OrmResult<Vec<Document>> {
    let Some(values) = referenced_values(fk, doc) else {
        return Ok(Vec::new());
    };
    let predicate = referencing_predicate(fk, &values);
    let rows = collect_matching(&ctx.db, referencing, Some(&predicate)).await?;
    if !rows.is_empty() && referencing.index_covering(&fk.columns).is_none() {
        return Err(OrmError::FkActionRequiresIndex {
            table: target.name().to_string(),
            referencing: referencing.name().to_string(),
            columns: fk.columns.join(", "),
        });
    }
    Ok(rows)
}

/// Run on-delete actions for `doc`. `parent_soft` is how the row itself
/// will be deleted (it rides along so a deferred chain's `finally`
/// target deletes it the same way). Returns true when the row's own
/// deletion was deferred behind an enqueued cascade chain.
pub(crate) fn on_delete<'a>(
    ctx: &'a mut MutationCtx,
    table: &'a Table,
    doc: &'a Document,
    mode: CascadeMode,
    parent_soft: bool,
) -> BoxFuture<'a, OrmResult<bool>> {
    Box::pin(async move {
        let mut parent_deferred = false;
        let incoming = ctx.db.schema.incoming_foreign_keys(table.name());
        for (referencing, fk) in incoming {
            let rows = referencing_rows(ctx, table, &referencing, &fk, doc).await?;
            if rows.is_empty() {
                continue;
            }
            debug!(
                parent = table.name(),
                referencing = referencing.name(),
                action = ?fk.on_delete,
                rows = rows.len(),
                "running on-delete action"
            );
            match fk.on_delete {
                RefAction::Restrict | RefAction::NoAction => {
                    return Err(OrmError::RestrictViolation {
                        table: table.name().to_string(),
                        referencing: referencing.name().to_string(),
                    });
                }
                RefAction::SetNull => {
                    let patch: Document = fk
                        .columns
                        .iter()
                        .map(|c| (c.clone(), Value::Null))
                        .collect();
                    patch_rows(ctx, &referencing, rows, patch).await?;
                }
                RefAction::SetDefault => {
                    let patch = default_patch(&referencing, &fk)?;
                    patch_rows(ctx, &referencing, rows, patch).await?;
                }
                RefAction::Cascade => {
                    let deferred =
                        cascade_delete(ctx, table, doc, &referencing, rows, mode, parent_soft)
                            .await?;
                    parent_deferred |= deferred;
                }
            }
        }
        Ok(parent_deferred)
    })
}

/// Cascade-delete `rows` of `referencing`, recursing into their own
/// incoming FKs first. Overflow in async mode enqueues the remainder
/// with the parent as the chain's final target.
async fn cascade_delete(
    ctx: &mut MutationCtx,
    parent_table: &Table,
    parent_doc: &Document,
    referencing: &Table,
    rows: Vec<Document>,
    mode: CascadeMode,
    parent_soft: bool,
) -> OrmResult<bool> {
    let parent_finally = FinallyTarget {
        table: parent_table.name().to_string(),
        id: stored_id(parent_doc),
        soft: parent_soft,
        cascade_mode: mode,
    };

    let pending: Vec<Document> = rows
        .into_iter()
        .filter(|row| !ctx.visited.contains(&stored_id(row)))
        .collect();

    if ctx.is_async() && pending.len() > ctx.remaining() {
        ctx.enqueue_batch(MutationBatchArgs {
            table: referencing.name().to_string(),
            operation: BatchOperation::Delete {
                soft: mode == CascadeMode::Soft,
                cascade_mode: mode,
            },
            ids: pending.iter().map(stored_id).collect(),
            visited: ctx.visited.iter().cloned().collect(),
            finally: vec![parent_finally],
        })
        .await?;
        return Ok(true);
    }

    for (position, row) in pending.iter().enumerate() {
        let key = stored_id(row);
        if !ctx.visited.insert(key.clone()) {
            continue;
        }
        if !ctx.try_consume() {
            if !ctx.is_async() {
                return Err(ctx.exceeded());
            }
            ctx.enqueue_batch(MutationBatchArgs {
                table: referencing.name().to_string(),
                operation: BatchOperation::Delete {
                    soft: mode == CascadeMode::Soft,
                    cascade_mode: mode,
                },
                ids: pending[position..].iter().map(stored_id).collect(),
                visited: ctx.visited.iter().cloned().collect(),
                finally: vec![parent_finally],
            })
            .await?;
            return Ok(true);
        }

        let child_deferred =
            on_delete(ctx, referencing, row, mode, mode == CascadeMode::Soft).await?;
        if child_deferred {
            continue;
        }
        delete_document(ctx, referencing, row, mode == CascadeMode::Soft).await?;
    }
    Ok(false)
}

/// Apply the cascade/soft/hard write for one row, triggers included.
pub(crate) async fn delete_document(
    ctx: &MutationCtx,
    table: &Table,
    doc: &Document,
    soft: bool,
) -> OrmResult<()> {
    let id = DocumentId::try_from(stored_id(doc).as_str())?;
    if soft {
        let patch = soft_delete_patch(table)?;
        ctx.db.writer.patch(table.name(), &id, patch).await?;
    } else {
        ctx.db.writer.delete(table.name(), &id).await?;
    }
    Ok(())
}

/// Run on-update actions when referenced columns of `doc` change.
/// `changes` pairs each changed referenced column with its new value.
pub(crate) async fn on_update(
    ctx: &mut MutationCtx,
    table: &Table,
    doc: &Document,
    changes: &[(String, Value)],
) -> OrmResult<()> {
    let incoming = ctx.db.schema.incoming_foreign_keys(table.name());
    for (referencing, fk) in incoming {
        let touched: Vec<&(String, Value)> = changes
            .iter()
            .filter(|(column, _)| fk.foreign_columns.contains(column))
            .collect();
        if touched.is_empty() {
            continue;
        }
        // Referencing rows are located by the old values.
        let rows = referencing_rows(ctx, table, &referencing, &fk, doc).await?;
        if rows.is_empty() {
            continue;
        }
        match fk.on_update {
            RefAction::Restrict | RefAction::NoAction => {
                return Err(OrmError::RestrictViolation {
                    table: table.name().to_string(),
                    referencing: referencing.name().to_string(),
                });
            }
            RefAction::SetNull => {
                let patch: Document = fk
                    .columns
                    .iter()
                    .map(|c| (c.clone(), Value::Null))
                    .collect();
                patch_rows(ctx, &referencing, rows, patch).await?;
            }
            RefAction::SetDefault => {
                let patch = default_patch(&referencing, &fk)?;
                patch_rows(ctx, &referencing, rows, patch).await?;
            }
            RefAction::Cascade => {
                let mut patch = Document::new();
                for (source, target) in fk.columns.iter().zip(fk.foreign_columns.iter()) {
                    let Some((_, new_value)) =
                        touched.iter().find(|(column, _)| column == target)
                    else {
                        continue;
                    };
                    let column = referencing.column(source).ok_or_else(|| {
                        OrmError::UnknownColumn {
                            table: referencing.name().to_string(),
                            column: source.clone(),
                        }
                    })?;
                    if new_value.is_null() && !column.is_nullable() {
                        return Err(OrmError::InvalidValue {
                            table: referencing.name().to_string(),
                            column: source.clone(),
                            reason: "cascaded update would violate notNull".to_string(),
                        });
                    }
                    patch.insert(source.clone(), new_value.clone());
                }
                patch_rows(ctx, &referencing, rows, patch).await?;
            }
        }
    }
    Ok(())
}

/// Patch a set of referencing rows under the budget; async overflow
/// defers the remainder to the scheduler.
async fn patch_rows(
    ctx: &mut MutationCtx,
    table: &Table,
    rows: Vec<Document>,
    patch: Document,
) -> OrmResult<()> {
    for (position, row) in rows.iter().enumerate() {
        if !ctx.try_consume() {
            if !ctx.is_async() {
                return Err(ctx.exceeded());
            }
            ctx.enqueue_batch(MutationBatchArgs {
                table: table.name().to_string(),
                operation: BatchOperation::Patch {
                    patch: patch.clone(),
                },
                ids: rows[position..].iter().map(stored_id).collect(),
                visited: ctx.visited.iter().cloned().collect(),
                finally: Vec::new(),
            })
            .await?;
            return Ok(());
        }
        let id = DocumentId::try_from(stored_id(row).as_str())?;
        ctx.db.writer.patch(table.name(), &id, patch.clone()).await?;
    }
    Ok(())
}

/// The set-default patch: every FK source column reset to its declared
/// default.
fn default_patch(referencing: &Table, fk: &ForeignKey) -> OrmResult<Document> {
    let mut patch = Document::new();
    for column_name in &fk.columns {
        let column = referencing
            .column(column_name)
            .ok_or_else(|| OrmError::UnknownColumn {
                table: referencing.name().to_string(),
                column: column_name.clone(),
            })?;
        let default = column.default.as_ref().ok_or_else(|| OrmError::InvalidValue {
            table: referencing.name().to_string(),
            column: column_name.clone(),
            reason: "setDefault requires a column default".to_string(),
        })?;
        patch.insert(column_name.clone(), default.produce());
    }
    Ok(patch)
}
