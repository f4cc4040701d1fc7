//! Lifecycle trigger pipeline
//!
//! Wraps a driver writer so that every write dispatches a change record
//! to the handlers registered on the written table, atomically with the
//! write. Handlers receive the wrapped writer, so their own writes
//! re-enter the pipeline; `inner_db` escapes it for handlers that must
//! not recurse (e.g. self-mutation).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use stratum_store::{
    Document, DocumentId, DocumentReader, DocumentWriter, ScanPage, ScanRequest, StoreError,
    StoreResult,
};

use crate::schema::Schema;

/// Lifecycle operation a handler subscribes to. `Change` fires after the
/// operation-specific handlers for the same write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerOp {
    Insert,
    Update,
    Delete,
    Change,
}

/// What a handler observes about a single committed write.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub table: String,
    pub id: DocumentId,
    pub operation: TriggerOp,
    pub old_doc: Option<Document>,
    pub new_doc: Option<Document>,
}

/// Context handed to a trigger handler.
#[derive(Clone)]
pub struct TriggerContext {
    /// The wrapped writer: writes through it fire triggers again.
    pub db: Arc<dyn DocumentWriter>,
    /// The raw driver writer, for handlers that must avoid re-entry.
    pub inner_db: Arc<dyn DocumentWriter>,
}

impl fmt::Debug for TriggerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerContext").finish_non_exhaustive()
    }
}

/// A lifecycle handler. Errors abort the enclosing write.
pub type TriggerHandler =
    Arc<dyn Fn(TriggerContext, ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Writer proxy that dispatches change records around every write.
pub struct TriggerWriter {
    inner: Arc<dyn DocumentWriter>,
    handlers: Arc<HashMap<String, Vec<(TriggerOp, TriggerHandler)>>>,
    self_ref: Weak<TriggerWriter>,
}

impl TriggerWriter {
    /// Wrap `inner` with the trigger bindings declared on the schema.
    /// Returns `inner` unchanged when no table declares a handler.
    pub fn wrap(inner: Arc<dyn DocumentWriter>, schema: &Schema) -> Arc<dyn DocumentWriter> {
        let mut handlers: HashMap<String, Vec<(TriggerOp, TriggerHandler)>> = HashMap::new();
        for table in schema.tables() {
            if !table.trigger_bindings().is_empty() {
                handlers.insert(table.name().to_string(), table.trigger_bindings().to_vec());
            }
        }
        if handlers.is_empty() {
            return inner;
        }
        let wrapper = Arc::new_cyclic(|self_ref| TriggerWriter {
            inner,
            handlers: Arc::new(handlers),
            self_ref: self_ref.clone(),
        });
        wrapper
    }

    fn context(&self) -> TriggerContext {
        let db = self
            .self_ref
            .upgrade()
            .expect("trigger writer outlives its own dispatch");
        TriggerContext {
            db,
            inner_db: Arc::clone(&self.inner),
        }
    }

    /// Run operation-specific handlers, then `Change` handlers, in
    /// registration order. A handler error aborts the write.
    async fn dispatch(&self, record: ChangeRecord) -> StoreResult<()> {
        let Some(bindings) = self.handlers.get(&record.table) else {
            return Ok(());
        };
        debug!(table = %record.table, op = ?record.operation, "dispatching triggers");
        for pass_op in [record.operation, TriggerOp::Change] {
            for (op, handler) in bindings {
                if *op != pass_op {
                    continue;
                }
                handler(self.context(), record.clone())
                    .await
                    .map_err(|err| {
                        StoreError::Backend(format!("trigger handler aborted write: {err:#}"))
                    })?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentReader for TriggerWriter {
    async fn get(&self, table: &str, id: &DocumentId) -> StoreResult<Option<Document>> {
        self.inner.get(table, id).await
    }

    async fn scan(&self, table: &str, request: ScanRequest) -> StoreResult<ScanPage> {
        self.inner.scan(table, request).await
    }

    async fn normalize_id(&self, table: &str, candidate: &str) -> StoreResult<Option<DocumentId>> {
        self.inner.normalize_id(table, candidate).await
    }
}

#[async_trait]
impl DocumentWriter for TriggerWriter {
    async fn insert(&self, table: &str, document: Document) -> StoreResult<DocumentId> {
        let id = self.inner.insert(table, document).await?;
        let new_doc = self.inner.get(table, &id).await?;
        self.dispatch(ChangeRecord {
            table: table.to_string(),
            id: id.clone(),
            operation: TriggerOp::Insert,
            old_doc: None,
            new_doc,
        })
        .await?;
        Ok(id)
    }

    async fn patch(&self, table: &str, id: &DocumentId, patch: Document) -> StoreResult<()> {
        let old_doc = self.inner.get(table, id).await?;
        self.inner.patch(table, id, patch).await?;
        let new_doc = self.inner.get(table, id).await?;
        self.dispatch(ChangeRecord {
            table: table.to_string(),
            id: id.clone(),
            operation: TriggerOp::Update,
            old_doc,
            new_doc,
        })
        .await
    }

    async fn replace(&self, table: &str, id: &DocumentId, document: Document) -> StoreResult<()> {
        let old_doc = self.inner.get(table, id).await?;
        self.inner.replace(table, id, document).await?;
        let new_doc = self.inner.get(table, id).await?;
        self.dispatch(ChangeRecord {
            table: table.to_string(),
            id: id.clone(),
            operation: TriggerOp::Update,
            old_doc,
            new_doc,
        })
        .await
    }

    async fn delete(&self, table: &str, id: &DocumentId) -> StoreResult<()> {
        let old_doc = self.inner.get(table, id).await?;
        self.inner.delete(table, id).await?;
        self.dispatch(ChangeRecord {
            table: table.to_string(),
            id: id.clone(),
            operation: TriggerOp::Delete,
            old_doc,
            new_doc: None,
        })
        .await
    }
}
