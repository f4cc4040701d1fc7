//! Update builder and the shared per-row update pipeline.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use stratum_store::{Document, DocumentId};

use crate::actions;
use crate::batch::{BatchOperation, MutationBatchArgs};
use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::expr::Expr;
use crate::mutation::{
    apply_on_update_defaults, changed_fields, enforce_checks, enforce_foreign_keys,
    enforce_unique, merged, normalize_temporals, reject_system_fields, stored_id, Mutated,
    MutationCtx,
};
use crate::query::{collect_matching, hydrate_document};
use crate::rls;
use crate::schema::Table;

/// Outcome of the per-row pipeline.
pub(crate) enum RowUpdate {
    Applied(DocumentId),
    /// The row failed the RLS `using` policy and was silently skipped.
    SkippedByRls,
}

/// The full per-row update pipeline, shared with the upsert path:
/// RLS decision split, checks, outgoing FK enforcement on changed
/// fields, incoming FK on-update actions, unique enforcement scoped to
/// changed fields with the row itself exempted, then the driver patch.
pub(crate) async fn update_row(
    ctx: &mut MutationCtx,
    table: &Table,
    old: &Document,
    patch: &Document,
) -> OrmResult<RowUpdate> {
    let new_doc = merged(old, patch);

    let decision = rls::update_decision(table, old, &new_doc, &ctx.db.request);
    if !decision.using_allowed {
        return Ok(RowUpdate::SkippedByRls);
    }
    if !decision.with_check_allowed {
        return Err(OrmError::RlsViolation {
            table: table.name().to_string(),
        });
    }

    enforce_checks(table, &new_doc)?;

    let changed = changed_fields(old, patch);
    enforce_foreign_keys(&ctx.db, table, &new_doc, Some(&changed)).await?;

    // Incoming FK actions run before the patch itself is written.
    let changes: Vec<(String, Value)> = changed
        .iter()
        .map(|field| {
            (
                field.clone(),
                new_doc.get(field).cloned().unwrap_or(Value::Null),
            )
        })
        .collect();
    actions::on_update(ctx, table, old, &changes).await?;

    let current_id = stored_id(old);
    enforce_unique(&ctx.db, table, &new_doc, Some(&current_id), Some(&changed)).await?;

    let id = DocumentId::try_from(current_id.as_str())?;
    ctx.db.writer.patch(table.name(), &id, patch.clone()).await?;
    Ok(RowUpdate::Applied(id))
}

/// Lazy update builder; nothing is written until `execute()`.
pub struct UpdateBuilder {
    db: Arc<DatabaseInner>,
    table: String,
    patch: Document,
    filter: Option<Expr>,
    returning: bool,
}

impl UpdateBuilder {
    pub(crate) fn new(db: Arc<DatabaseInner>, table: &str) -> Self {
        UpdateBuilder {
            db,
            table: table.to_string(),
            patch: Document::new(),
            filter: None,
            returning: false,
        }
    }

    pub fn set(mut self, patch: Document) -> Self {
        self.patch = patch;
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }

    pub async fn execute(self) -> OrmResult<Mutated> {
        let table = self.db.schema.table(&self.table)?.clone();
        if self.filter.is_none() {
            if self.db.schema.defaults().strict {
                return Err(OrmError::RequiresWhere {
                    operation: "update".to_string(),
                });
            }
            warn!(table = table.name(), "update without a filter: full scan");
        }

        reject_system_fields(&table, &self.patch)?;
        let mut patch = self.patch;
        apply_on_update_defaults(&table, &mut patch);
        normalize_temporals(&table, &mut patch)?;
        table.validate_patch(&patch)?;

        let candidates = collect_matching(&self.db, &table, self.filter.as_ref()).await?;
        let mut ctx = MutationCtx::new(Arc::clone(&self.db));
        let mut ids = Vec::new();
        let mut returned = Vec::new();

        for (position, row) in candidates.iter().enumerate() {
            if !ctx.try_consume() {
                if !ctx.is_async() {
                    return Err(ctx.exceeded());
                }
                ctx.enqueue_batch(MutationBatchArgs {
                    table: table.name().to_string(),
                    operation: BatchOperation::Patch {
                        patch: patch.clone(),
                    },
                    ids: candidates[position..].iter().map(stored_id).collect(),
                    visited: Vec::new(),
                    finally: Vec::new(),
                })
                .await?;
                break;
            }
            match update_row(&mut ctx, &table, row, &patch).await? {
                RowUpdate::Applied(id) => {
                    if self.returning {
                        if let Some(updated) = self.db.writer.get(table.name(), &id).await? {
                            returned.push(hydrate_document(&table, updated));
                        }
                    }
                    ids.push(id);
                }
                RowUpdate::SkippedByRls => {}
            }
        }

        Ok(Mutated {
            ids,
            rows: self.returning.then_some(returned),
            deferred: ctx.deferred,
        })
    }
}
