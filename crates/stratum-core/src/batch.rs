//! Scheduled mutation batcher
//!
//! Cascading writes that exceed the row budget are resumed through the
//! driver scheduler: `scheduledMutationBatch` jobs carry the pending
//! ids, the visited set, and the chain's final targets, and re-enqueue
//! themselves until drained. `scheduledDelete` performs the deferred
//! hard delete behind `.scheduled()` deletes. Both handlers are
//! idempotent with respect to already-applied rows.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use stratum_store::{
    Document, DocumentWriter, MemoryScheduler, PendingJob, ScheduledJob, Scheduler,
};

use crate::actions::{self, CascadeMode};
use crate::error::{OrmError, OrmResult};
use crate::mutation::MutationCtx;
use crate::orm::Orm;
use crate::rls::RequestContext;

/// Function name for deferred hard deletes.
pub const SCHEDULED_DELETE: &str = "scheduledDelete";

/// Function name for bounded-fan-out continuations.
pub const SCHEDULED_MUTATION_BATCH: &str = "scheduledMutationBatch";

/// Arguments of a `scheduledDelete` job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledDeleteArgs {
    pub table: String,
    pub id: String,
    pub cascade_mode: CascadeMode,
}

/// A row deleted after the batch chain that deferred it drains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinallyTarget {
    pub table: String,
    pub id: String,
    pub soft: bool,
    pub cascade_mode: CascadeMode,
}

/// What a batch continuation does to each pending row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOperation {
    Delete { soft: bool, cascade_mode: CascadeMode },
    Patch { patch: Document },
}

/// Arguments of a `scheduledMutationBatch` job. `ids` is the resume
/// cursor; `visited` keys rows already applied by earlier continuations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationBatchArgs {
    pub table: String,
    pub operation: BatchOperation,
    pub ids: Vec<String>,
    pub visited: Vec<String>,
    pub finally: Vec<FinallyTarget>,
}

/// Dispatches the engine's deferred functions by their registered
/// names. A pure function of the ORM's immutable state; handlers run
/// with row-level security skipped and a fresh row budget.
#[derive(Clone)]
pub struct ScheduledFunctionRegistry {
    orm: Orm,
}

impl ScheduledFunctionRegistry {
    pub fn new(orm: Orm) -> Self {
        ScheduledFunctionRegistry { orm }
    }

    /// Run one job against a driver context.
    pub async fn run(
        &self,
        writer: Arc<dyn DocumentWriter>,
        scheduler: Arc<dyn Scheduler>,
        job: &ScheduledJob,
    ) -> OrmResult<()> {
        match job.function.as_str() {
            SCHEDULED_DELETE => {
                let args: ScheduledDeleteArgs =
                    serde_json::from_value(job.args.clone()).map_err(|err| {
                        OrmError::InvalidScheduledPayload {
                            reason: err.to_string(),
                        }
                    })?;
                self.scheduled_delete(writer, scheduler, args).await
            }
            SCHEDULED_MUTATION_BATCH => {
                let args: MutationBatchArgs =
                    serde_json::from_value(job.args.clone()).map_err(|err| {
                        OrmError::InvalidScheduledPayload {
                            reason: err.to_string(),
                        }
                    })?;
                self.mutation_batch(writer, scheduler, args).await
            }
            other => Err(OrmError::InvalidScheduledPayload {
                reason: format!("unknown scheduled function '{other}'"),
            }),
        }
    }

    /// Drain a memory scheduler until no jobs remain; returns how many
    /// ran. Test harness for the continuation chain.
    pub async fn drain(
        &self,
        writer: Arc<dyn DocumentWriter>,
        scheduler: &Arc<MemoryScheduler>,
    ) -> OrmResult<usize> {
        let mut ran = 0;
        while let Some(PendingJob { job, .. }) = scheduler.take_next() {
            let as_dyn: Arc<dyn Scheduler> = Arc::clone(scheduler) as Arc<dyn Scheduler>;
            self.run(Arc::clone(&writer), as_dyn, &job).await?;
            ran += 1;
        }
        Ok(ran)
    }

    #[instrument(skip(self, writer, scheduler), fields(table = %args.table))]
    async fn scheduled_delete(
        &self,
        writer: Arc<dyn DocumentWriter>,
        scheduler: Arc<dyn Scheduler>,
        args: ScheduledDeleteArgs,
    ) -> OrmResult<()> {
        let table = self.orm.schema().table(&args.table)?.clone();
        let db = self
            .orm
            .database(writer, scheduler, RequestContext::public().skip_rules());

        let Some(id) = db
            .inner
            .writer
            .normalize_id(table.name(), &args.id)
            .await?
        else {
            return Ok(());
        };
        // Already gone: the job is a no-op, not an error.
        let Some(doc) = db.inner.writer.get(table.name(), &id).await? else {
            return Ok(());
        };

        let mut ctx = MutationCtx::new(Arc::clone(&db.inner));
        ctx.visited.insert(args.id.clone());
        let deferred =
            actions::on_delete(&mut ctx, &table, &doc, args.cascade_mode, false).await?;
        if !deferred {
            debug!(id = %id, "scheduled hard delete");
            db.inner.writer.delete(table.name(), &id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, writer, scheduler), fields(table = %args.table, pending = args.ids.len()))]
    async fn mutation_batch(
        &self,
        writer: Arc<dyn DocumentWriter>,
        scheduler: Arc<dyn Scheduler>,
        args: MutationBatchArgs,
    ) -> OrmResult<()> {
        let table = self.orm.schema().table(&args.table)?.clone();
        let db = self
            .orm
            .database(writer, scheduler, RequestContext::public().skip_rules());

        let mut ctx = MutationCtx::new(Arc::clone(&db.inner));
        ctx.visited = args.visited.iter().cloned().collect::<HashSet<String>>();

        for (position, id_string) in args.ids.iter().enumerate() {
            if ctx.visited.contains(id_string) {
                continue;
            }
            let Some(id) = db
                .inner
                .writer
                .normalize_id(table.name(), id_string)
                .await?
            else {
                continue;
            };
            let Some(doc) = db.inner.writer.get(table.name(), &id).await? else {
                continue;
            };

            if !ctx.try_consume() {
                // Budget spent: re-enqueue the remainder and keep the
                // finally targets with the tail of the chain.
                ctx.enqueue_batch(MutationBatchArgs {
                    table: args.table.clone(),
                    operation: args.operation.clone(),
                    ids: args.ids[position..].to_vec(),
                    visited: ctx.visited.iter().cloned().collect(),
                    finally: args.finally.clone(),
                })
                .await?;
                return Ok(());
            }

            match &args.operation {
                BatchOperation::Delete { soft, cascade_mode } => {
                    ctx.visited.insert(id_string.clone());
                    let deferred =
                        actions::on_delete(&mut ctx, &table, &doc, *cascade_mode, *soft).await?;
                    if !deferred {
                        actions::delete_document(&ctx, &table, &doc, *soft).await?;
                    }
                }
                BatchOperation::Patch { patch } => {
                    db.inner.writer.patch(table.name(), &id, patch.clone()).await?;
                }
            }
        }

        // Chain drained: delete the rows whose cascades deferred them.
        for (position, target) in args.finally.iter().enumerate() {
            let target_table = self.orm.schema().table(&target.table)?.clone();
            let Some(id) = db
                .inner
                .writer
                .normalize_id(target_table.name(), &target.id)
                .await?
            else {
                continue;
            };
            let Some(doc) = db.inner.writer.get(target_table.name(), &id).await? else {
                continue;
            };
            if !ctx.try_consume() {
                ctx.enqueue_batch(MutationBatchArgs {
                    table: args.table.clone(),
                    operation: args.operation.clone(),
                    ids: Vec::new(),
                    visited: ctx.visited.iter().cloned().collect(),
                    finally: args.finally[position..].to_vec(),
                })
                .await?;
                return Ok(());
            }
            let deferred = actions::on_delete(
                &mut ctx,
                &target_table,
                &doc,
                target.cascade_mode,
                target.soft,
            )
            .await?;
            if !deferred {
                actions::delete_document(&ctx, &target_table, &doc, target.soft).await?;
            }
        }
        Ok(())
    }
}
