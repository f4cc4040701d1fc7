//! Engine-level error taxonomy.

use thiserror::Error;

/// Result type for engine operations.
pub type OrmResult<T> = std::result::Result<T, OrmError>;

/// Stratum engine errors.
#[derive(Error, Debug)]
pub enum OrmError {
    /// Reserved or invalid table/column name at schema build time
    #[error("invalid schema for table '{table}': {reason}")]
    InvalidSchema { table: String, reason: String },

    /// Storage validator rejected a written value
    #[error("invalid value for column '{column}' of table '{table}': {reason}")]
    InvalidValue {
        table: String,
        column: String,
        reason: String,
    },

    /// Write targeted a system-owned field
    #[error("cannot write system field '{field}' of table '{table}'")]
    SystemFieldWrite { table: String, field: String },

    /// Unique-index violation
    #[error("unique constraint '{index}' violated on table '{table}'")]
    UniqueViolation { table: String, index: String },

    /// Foreign-key violation: referenced row is missing
    #[error("foreign key violation: '{table}' references missing row in '{target}'")]
    ForeignKeyViolation { table: String, target: String },

    /// Check-constraint violation
    #[error("check constraint '{name}' violated on table '{table}'")]
    CheckViolation { table: String, name: String },

    /// Restrict action: referencing rows exist
    #[error("restrict violation: rows in '{referencing}' still reference '{table}'")]
    RestrictViolation { table: String, referencing: String },

    /// Cascading foreign-key action found rows but no usable index
    #[error(
        "foreign key action on '{table}' requires an index on ({columns}) of '{referencing}'"
    )]
    FkActionRequiresIndex {
        table: String,
        referencing: String,
        columns: String,
    },

    /// Row-level security rejected the new row of an update
    #[error("row-level security policy violated on table '{table}'")]
    RlsViolation { table: String },

    /// A synchronous mutation would touch more rows than allowed
    #[error("mutation exceeded mutationMaxRows ({max})")]
    MaxRowsExceeded { max: usize },

    /// update()/delete() without a predicate in strict mode
    #[error("{operation}() requires a filter in strict mode")]
    RequiresWhere { operation: String },

    /// Table not declared in the schema
    #[error("unknown table: {table}")]
    UnknownTable { table: String },

    /// Column not declared on the table
    #[error("unknown column '{column}' on table '{table}'")]
    UnknownColumn { table: String, column: String },

    /// Relation name not declared for the table
    #[error("unknown relation '{relation}' on table '{table}'")]
    UnknownRelation { table: String, relation: String },

    /// Inverse pairing matched more than one candidate
    #[error("ambiguous relation '{relation}' on table '{table}': use an alias")]
    AmbiguousRelation { table: String, relation: String },

    /// Cycle composed exclusively of required one-relations
    #[error("required relation cycle: {path}")]
    RequiredCycle { path: String },

    /// Cursor pagination combined with an in-memory order
    #[error("paginate() cannot be combined with an explicit orderBy on table '{table}'")]
    UnsupportedOrder { table: String },

    /// Scheduled mutation payload did not deserialize
    #[error("invalid scheduled mutation payload: {reason}")]
    InvalidScheduledPayload { reason: String },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Driver error, surfaced unchanged
    #[error("store error: {0}")]
    Store(#[from] stratum_store::StoreError),
}
