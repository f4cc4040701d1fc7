//! ORM construction
//!
//! Builds the immutable engine state (schema plus extracted edge
//! metadata) once and mints per-request facades around a driver context.

use std::sync::Arc;

use tracing::debug;

use stratum_store::{DocumentWriter, Scheduler};

use crate::database::{Database, DatabaseInner};
use crate::error::OrmResult;
use crate::relations::{extract_edges, Edge, Relations};
use crate::rls::RequestContext;
use crate::schema::Schema;
use crate::triggers::TriggerWriter;

/// The engine: immutable schema and relation metadata, shared by every
/// request.
#[derive(Clone)]
pub struct Orm {
    schema: Schema,
    edges: Arc<Vec<Edge>>,
}

impl Orm {
    /// Validate the relation configuration against the schema and
    /// extract edge metadata. Runs once at startup.
    pub fn new(schema: Schema, relations: Relations) -> OrmResult<Orm> {
        let edges = extract_edges(&schema, &relations)?;
        debug!(edges = edges.len(), "relation graph extracted");
        Ok(Orm {
            schema,
            edges: Arc::new(edges),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Wrap a driver context into a request-scoped facade. The writer
    /// is wrapped for trigger dispatch when any table declares handlers.
    pub fn database(
        &self,
        writer: Arc<dyn DocumentWriter>,
        scheduler: Arc<dyn Scheduler>,
        request: RequestContext,
    ) -> Database {
        let wrapped = TriggerWriter::wrap(Arc::clone(&writer), &self.schema);
        Database::new(DatabaseInner {
            schema: self.schema.clone(),
            edges: Arc::clone(&self.edges),
            writer: wrapped,
            raw_writer: writer,
            scheduler,
            request,
        })
    }
}
