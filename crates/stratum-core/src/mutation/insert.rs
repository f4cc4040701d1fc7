//! Insert builder, including upsert semantics.

use std::sync::Arc;

use tracing::debug;

use stratum_store::Document;

use crate::database::DatabaseInner;
use crate::error::{OrmError, OrmResult};
use crate::mutation::update::{update_row, RowUpdate};
use crate::mutation::{
    apply_defaults, apply_on_update_defaults, enforce_checks, enforce_foreign_keys,
    enforce_unique, find_conflict, normalize_temporals, reject_system_fields, Mutated,
    MutationCtx,
};
use crate::query::hydrate_document;
use crate::rls::{self, PolicyFor, PolicyPhase};

/// Conflict handling for `insert`.
#[derive(Debug, Clone)]
pub enum OnConflict {
    /// Skip rows whose unique key already exists.
    DoNothing { target: Option<String> },
    /// Update the conflicting row with `set` (plus `on_update_fn`
    /// columns not present in `set`).
    DoUpdate {
        target: Option<String>,
        set: Document,
    },
}

impl OnConflict {
    fn target(&self) -> Option<&str> {
        match self {
            OnConflict::DoNothing { target } | OnConflict::DoUpdate { target, .. } => {
                target.as_deref()
            }
        }
    }
}

/// Lazy insert builder; nothing is written until `execute()`.
pub struct InsertBuilder {
    db: Arc<DatabaseInner>,
    table: String,
    rows: Vec<Document>,
    on_conflict: Option<OnConflict>,
    returning: bool,
}

impl InsertBuilder {
    pub(crate) fn new(db: Arc<DatabaseInner>, table: &str) -> Self {
        InsertBuilder {
            db,
            table: table.to_string(),
            rows: Vec::new(),
            on_conflict: None,
            returning: false,
        }
    }

    pub fn values(mut self, row: Document) -> Self {
        self.rows.push(row);
        self
    }

    pub fn values_many(mut self, rows: impl IntoIterator<Item = Document>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn on_conflict_do_nothing(mut self, target: Option<&str>) -> Self {
        self.on_conflict = Some(OnConflict::DoNothing {
            target: target.map(str::to_string),
        });
        self
    }

    pub fn on_conflict_do_update(mut self, target: Option<&str>, set: Document) -> Self {
        self.on_conflict = Some(OnConflict::DoUpdate {
            target: target.map(str::to_string),
            set,
        });
        self
    }

    pub fn returning(mut self) -> Self {
        self.returning = true;
        self
    }

    pub async fn execute(self) -> OrmResult<Mutated> {
        let table = self.db.schema.table(&self.table)?.clone();
        let mut ctx = MutationCtx::new(Arc::clone(&self.db));
        let mut ids = Vec::new();
        let mut returned = Vec::new();

        for row in self.rows {
            reject_system_fields(&table, &row)?;
            let mut doc = row;
            apply_defaults(&table, &mut doc);
            normalize_temporals(&table, &mut doc)?;
            table.validate_insert(&doc)?;
            enforce_checks(&table, &doc)?;
            enforce_foreign_keys(&self.db, &table, &doc, None).await?;

            if let Some(on_conflict) = &self.on_conflict {
                if let Some((index, existing)) =
                    find_conflict(&self.db, &table, &doc, on_conflict.target()).await?
                {
                    debug!(
                        table = table.name(),
                        index = index.name.as_str(),
                        "insert hit conflict"
                    );
                    match on_conflict {
                        OnConflict::DoNothing { .. } => continue,
                        OnConflict::DoUpdate { set, .. } => {
                            reject_system_fields(&table, set)?;
                            let mut patch = set.clone();
                            apply_on_update_defaults(&table, &mut patch);
                            normalize_temporals(&table, &mut patch)?;
                            table.validate_patch(&patch)?;
                            if !ctx.try_consume() {
                                return Err(ctx.exceeded());
                            }
                            match update_row(&mut ctx, &table, &existing, &patch).await? {
                                RowUpdate::Applied(id) => {
                                    if self.returning {
                                        if let Some(updated) =
                                            self.db.writer.get(table.name(), &id).await?
                                        {
                                            returned.push(hydrate_document(&table, updated));
                                        }
                                    }
                                    ids.push(id);
                                }
                                RowUpdate::SkippedByRls => {}
                            }
                            continue;
                        }
                    }
                }
            }

            enforce_unique(&self.db, &table, &doc, None, None).await?;

            if !rls::allows(
                &table,
                PolicyFor::Insert,
                PolicyPhase::WithCheck,
                &doc,
                &self.db.request,
            ) {
                return Err(OrmError::RlsViolation {
                    table: table.name().to_string(),
                });
            }

            // Inserted values live in memory, not in the store, so the
            // row cap cannot defer a tail; it is a hard limit here.
            if !ctx.try_consume() {
                return Err(ctx.exceeded());
            }

            let id = self.db.writer.insert(table.name(), doc).await?;
            if self.returning {
                if let Some(stored) = self.db.writer.get(table.name(), &id).await? {
                    returned.push(hydrate_document(&table, stored));
                }
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
