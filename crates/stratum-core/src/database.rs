//! Per-request database facade
//!
//! Wraps a driver writer and scheduler for the lifetime of one request.
//! Query methods compile filters into driver scans; mutation builders
//! enforce constraints before writing through the (trigger-wrapped)
//! writer. No state crosses requests except the immutable schema and
//! edge metadata.

use std::sync::Arc;

use stratum_store::{DocumentWriter, Scheduler};

use crate::mutation::{DeleteBuilder, InsertBuilder, UpdateBuilder};
use crate::query::QueryBuilder;
use crate::relations::Edge;
use crate::rls::RequestContext;
use crate::schema::Schema;

/// Shared request state behind every builder.
pub(crate) struct DatabaseInner {
    pub schema: Schema,
    pub edges: Arc<Vec<Edge>>,
    /// Trigger-wrapped writer; all engine reads and writes go through it.
    pub writer: Arc<dyn DocumentWriter>,
    /// The raw driver writer (`inner_db` for trigger handlers).
    pub raw_writer: Arc<dyn DocumentWriter>,
    pub scheduler: Arc<dyn Scheduler>,
    pub request: RequestContext,
}

/// The ORM facade handed to request code.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DatabaseInner>,
}

impl Database {
    pub(crate) fn new(inner: DatabaseInner) -> Self {
        Database {
            inner: Arc::new(inner),
        }
    }

    /// Read surface for `table`: `find_many`, `find_first`, `paginate`,
    /// `stream`.
    pub fn query(&self, table: &str) -> QueryBuilder {
        QueryBuilder {
            db: Arc::clone(&self.inner),
            table: table.to_string(),
        }
    }

    pub fn insert(&self, table: &str) -> InsertBuilder {
        InsertBuilder::new(Arc::clone(&self.inner), table)
    }

    pub fn update(&self, table: &str) -> UpdateBuilder {
        UpdateBuilder::new(Arc::clone(&self.inner), table)
    }

    pub fn delete(&self, table: &str) -> DeleteBuilder {
        DeleteBuilder::new(Arc::clone(&self.inner), table)
    }

    /// The same facade with row-level security bypassed.
    pub fn skip_rules(&self) -> Database {
        Database::new(DatabaseInner {
            schema: self.inner.schema.clone(),
            edges: Arc::clone(&self.inner.edges),
            writer: Arc::clone(&self.inner.writer),
            raw_writer: Arc::clone(&self.inner.raw_writer),
            scheduler: Arc::clone(&self.inner.scheduler),
            request: self.inner.request.clone().skip_rules(),
        })
    }
}
