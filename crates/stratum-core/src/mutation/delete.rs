//! Delete builder: hard, soft, and scheduled deletes.

use std::sync::Arc;

use tracing::warn;

use stratum_store::ScheduledJob;

use crate::actions::{self, CascadeMode};
use crate::batch::{BatchOperation, MutationBatchArgs, ScheduledDeleteArgs, SCHEDULED_DELETE};
use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::expr::Expr;
use crate::mutation::{soft_delete_patch, stored_id, Mutated, MutationCtx};
use crate::query::{collect_matching, hydrate_document};
use crate::rls::{self, PolicyFor, PolicyPhase};

/// Lazy delete builder; nothing is written until `execute()`.
pub struct DeleteBuilder {
    db: Arc<DatabaseInner>,
    table: String,
    filter: Option<Expr>,
    soft: bool,
    scheduled_delay_ms: Option<f64>,
    cascade_mode: Option<CascadeMode>,
    returning: bool,
}

impl DeleteBuilder {
    pub(crate) fn new(db: Arc<DatabaseInner>, table: &str) -> Self {
        DeleteBuilder {
            db,
            table: table.to_string(),
            filter: None,
            soft: false,
            scheduled_delay_ms: None,
            cascade_mode: None,
            returning: false,
        }
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(expr);
        self
    }

    /// Stamp `deletionTime` instead of removing rows.
    pub fn soft(mut self) -> Self {
        self.soft = true;
        self
    }

    /// Soft-delete now and hard-delete through the scheduler after
    /// `delay_ms`.
    pub fn scheduled(mut self, delay_ms: f64) -> Self {
        self.scheduled_delay_ms = Some(delay_ms);
        self
    }

    /// Override how cascading descendants are deleted. Defaults to soft
    /// for soft/scheduled deletes and hard otherwise.
    pub fn cascade(mut self, mode: CascadeMode) -> Self {
        self.cascade_mode = Some(mode);
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
                    operation: "delete".to_string(),
                });
            }
            warn!(table = table.name(), "delete without a filter: full scan");
        }

        let mode = self.cascade_mode.unwrap_or(
            if self.soft || self.scheduled_delay_ms.is_some() {
                CascadeMode::Soft
            } else {
                CascadeMode::Hard
            },
        );

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
                    operation: BatchOperation::Delete {
                        soft: self.soft,
                        cascade_mode: mode,
                    },
                    ids: candidates[position..].iter().map(stored_id).collect(),
                    visited: ctx.visited.iter().cloned().collect(),
                    finally: Vec::new(),
                })
                .await?;
                break;
            }

            // Denied rows are skipped silently, never an error.
            if !rls::allows(
                &table,
                PolicyFor::Delete,
                PolicyPhase::Using,
                row,
                &self.db.request,
            ) {
                continue;
            }

            let id_string = stored_id(row);
            let id = stratum_store::DocumentId::try_from(id_string.as_str())?;

            if let Some(delay_ms) = self.scheduled_delay_ms {
                // Soft-delete now; the scheduled handler hard-deletes
                // later and runs the FK actions then.
                let patch = soft_delete_patch(&table)?;
                self.db.writer.patch(table.name(), &id, patch).await?;
                let args = ScheduledDeleteArgs {
                    table: table.name().to_string(),
                    id: id_string,
                    cascade_mode: mode,
                };
                self.db
                    .scheduler
                    .run_after(
                        delay_ms,
                        ScheduledJob::new(SCHEDULED_DELETE, serde_json::to_value(&args)?),
                    )
                    .await?;
                if self.returning {
                    if let Some(updated) = self.db.writer.get(table.name(), &id).await? {
                        returned.push(hydrate_document(&table, updated));
                    }
                }
                ids.push(id);
                continue;
            }

            ctx.visited.insert(id_string);
            let deferred = actions::on_delete(&mut ctx, &table, row, mode, self.soft).await?;
            if deferred {
                // The enqueued cascade chain deletes this row as its
                // final target.
                continue;
            }

            if self.soft {
                actions::delete_document(&ctx, &table, row, true).await?;
                if self.returning {
                    if let Some(updated) = self.db.writer.get(table.name(), &id).await? {
                        returned.push(hydrate_document(&table, updated));
                    }
                }
            } else {
                if self.returning {
                    returned.push(hydrate_document(&table, row.clone()));
                }
                actions::delete_document(&ctx, &table, row, false).await?;
            }
            ids.push(id);
        }

        Ok(Mutated {
            ids,
            rows: self.returning.then_some(returned),
            deferred: ctx.deferred,
        })
    }
}
