//! Stratum Core - Relational ORM Engine
//!
//! A relational layer over a document store that exposes only indexed
//! scans, filter predicates, cursor pagination, and single-document
//! writes. The engine adds typed table builders, a relation graph,
//! where/orderBy/limit composition with index selection, nested
//! relation loading, constraint enforcement (unique, foreign-key,
//! check), row-level security, mutation builders with
//! returning/upsert semantics, lifecycle triggers, and a
//! bounded-fan-out scheduled mutation batcher.

pub mod actions;
pub mod batch;
pub mod compile;
pub mod database;
pub mod error;
pub mod expr;
pub mod mutation;
pub mod orm;
pub mod query;
pub mod relations;
pub mod rls;
pub mod schema;
pub mod temporal;
pub mod triggers;

pub use actions::CascadeMode;

pub use batch::{
    BatchOperation, MutationBatchArgs, ScheduledDeleteArgs, ScheduledFunctionRegistry,
    SCHEDULED_DELETE, SCHEDULED_MUTATION_BATCH,
};

pub use compile::{compile_where, CompiledWhere, MatchKind, SelectedIndex};

pub use database::Database;

pub use error::{OrmError, OrmResult};

pub use expr::{
    and, array_contained, array_contains, array_overlaps, contains, ends_with, eq, gt, gte,
    ilike, in_array, is_not_null, is_null, like, lt, lte, ne, not, not_ilike, not_in_array,
    not_like, or, starts_with, BinaryOp, Expr, ExprVisitor, FieldRef, IntoFieldRef, TriState,
};

pub use mutation::{DeleteBuilder, InsertBuilder, Mutated, OnConflict, UpdateBuilder};

pub use orm::Orm;

pub use query::{
    ColumnSelection, Direction, ExtraFn, FindArgs, PaginatedResult, QueryBuilder,
};

pub use relations::{
    extract_edges, many, one, Cardinality, Edge, ManyBuilder, OneBuilder, Relations,
    RelationsBuilder, Through,
};

pub use rls::{Policy, PolicyFor, PolicyKind, RequestContext, RlsMode};

pub use schema::{
    boolean, date, float, foreign_key, integer, json, opaque, table, text, timestamp,
    unique_index, Column, ColumnKind, ColumnReference, DateMode, ExecutionMode, RefAction,
    Schema, SchemaDefaults, Table, TimestampMode, DELETION_TIME_COLUMN,
};

pub use triggers::{ChangeRecord, TriggerContext, TriggerHandler, TriggerOp, TriggerWriter};
