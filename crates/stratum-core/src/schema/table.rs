//! Table builder
//!
//! A table is a named set of columns plus its indexes, constraints,
//! policies and lifecycle handlers. Builders are infallible; the schema
//! build performs all validation.

use std::fmt;

use futures::future::BoxFuture;

use crate::expr::Expr;
use crate::rls::Policy;
use crate::schema::column::{timestamp, Column, TimestampMode};
use crate::schema::constraint::{
    Check, ForeignKey, ForeignKeyBuilder, TableIndex, UniqueIndex, UniqueIndexBuilder,
};
use crate::triggers::{ChangeRecord, TriggerContext, TriggerHandler, TriggerOp};

/// Name of the column a soft delete stamps.
pub const DELETION_TIME_COLUMN: &str = "deletionTime";

/// A table definition. Constructed once, shared immutably afterwards.
#[derive(Clone)]
pub struct Table {
    pub(crate) name: String,
    pub(crate) columns: Vec<Column>,
    pub(crate) indexes: Vec<TableIndex>,
    pub(crate) uniques: Vec<UniqueIndex>,
    pub(crate) foreign_keys: Vec<ForeignKey>,
    pub(crate) checks: Vec<Check>,
    pub(crate) rls_enabled: bool,
    pub(crate) policies: Vec<Policy>,
    pub(crate) triggers: Vec<(TriggerOp, TriggerHandler)>,
    /// Set when a `createdAt` column aliases the system creation time.
    pub(crate) creation_time_mode: Option<TimestampMode>,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("indexes", &self.indexes)
            .field("uniques", &self.uniques)
            .field("foreign_keys", &self.foreign_keys)
            .finish_non_exhaustive()
    }
}

/// Define a table from its columns.
pub fn table(name: &str, columns: Vec<Column>) -> Table {
    Table {
        name: name.to_string(),
        columns,
        indexes: Vec::new(),
        uniques: Vec::new(),
        foreign_keys: Vec::new(),
        checks: Vec::new(),
        rls_enabled: false,
        policies: Vec::new(),
        triggers: Vec::new(),
        creation_time_mode: None,
    }
}

impl Table {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn indexes(&self) -> &[TableIndex] {
        &self.indexes
    }

    pub fn unique_indexes(&self) -> &[UniqueIndex] {
        &self.uniques
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn checks(&self) -> &[Check] {
        &self.checks
    }

    pub fn rls_enabled(&self) -> bool {
        self.rls_enabled
    }

    pub fn policies(&self) -> &[Policy] {
        &self.policies
    }

    pub(crate) fn trigger_bindings(&self) -> &[(TriggerOp, TriggerHandler)] {
        &self.triggers
    }

    /// Find an index whose field list starts with exactly `fields`.
    pub fn index_covering(&self, fields: &[String]) -> Option<&TableIndex> {
        self.indexes
            .iter()
            .find(|idx| idx.fields.len() >= fields.len() && idx.fields[..fields.len()] == *fields)
    }

    // -- builder methods ----------------------------------------------------

    pub fn index(mut self, name: &str, fields: &[&str]) -> Self {
        self.indexes.push(TableIndex {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        });
        self
    }

    pub fn unique(mut self, builder: UniqueIndexBuilder) -> Self {
        self.uniques.push(builder.build());
        self
    }

    pub fn foreign_key(mut self, builder: ForeignKeyBuilder) -> Self {
        self.foreign_keys.push(builder.build());
        self
    }

    pub fn check(mut self, name: &str, expr: Expr) -> Self {
        self.checks.push(Check {
            name: name.to_string(),
            expr,
        });
        self
    }

    pub fn enable_rls(mut self) -> Self {
        self.rls_enabled = true;
        self
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Add the nullable `deletionTime` column soft deletes stamp.
    pub fn soft_deletes(mut self) -> Self {
        self.columns
            .push(timestamp(DELETION_TIME_COLUMN, TimestampMode::Millis));
        self
    }

    pub fn trigger(
        mut self,
        op: TriggerOp,
        handler: impl Fn(TriggerContext, ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.triggers.push((op, std::sync::Arc::new(handler)));
        self
    }

    pub fn on_insert(
        self,
        handler: impl Fn(TriggerContext, ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.trigger(TriggerOp::Insert, handler)
    }

    pub fn on_update(
        self,
        handler: impl Fn(TriggerContext, ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.trigger(TriggerOp::Update, handler)
    }

    pub fn on_delete(
        self,
        handler: impl Fn(TriggerContext, ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.trigger(TriggerOp::Delete, handler)
    }

    pub fn on_change(
        self,
        handler: impl Fn(TriggerContext, ChangeRecord) -> BoxFuture<'static, anyhow::Result<()>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.trigger(TriggerOp::Change, handler)
    }
}
