//! Schema model
//!
//! Tables, columns, constraints and schema-wide defaults. A schema is
//! built once from table builders, validated as a whole, and shared
//! immutably for the life of the process.

pub mod column;
pub mod constraint;
pub mod table;
mod validate;

use std::collections::BTreeMap;
use std::sync::Arc;

pub use column::{
    boolean, date, float, integer, json, opaque, text, timestamp, Column, ColumnDefault,
    ColumnKind, ColumnReference, DateMode, OpaqueValidator, RefAction, TimestampMode, ValueFactory,
};
pub use constraint::{
    foreign_key, unique_index, Check, ForeignKey, ForeignKeyBuilder, TableIndex, UniqueIndex,
    UniqueIndexBuilder,
};
pub use table::{table, Table, DELETION_TIME_COLUMN};

use crate::error::{OrmError, OrmResult};

/// Column names owned by the system and not definable by users.
const RESERVED_COLUMNS: &[&str] = &["id", "_id", "_creationTime"];

/// Alias column name for the system creation time.
pub const CREATED_AT_COLUMN: &str = "createdAt";

// ---------------------------------------------------------------------------
// Schema defaults
// ---------------------------------------------------------------------------

/// How a mutation behaves when its row budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Exceeding `mutation_max_rows` is a hard error.
    #[default]
    Sync,
    /// The tail of the work is enqueued on the driver scheduler.
    Async,
}

/// Schema-wide behavior knobs.
#[derive(Debug, Clone, Copy)]
pub struct SchemaDefaults {
    /// update()/delete() without a filter error out when strict.
    pub strict: bool,
    /// Page size for driver scans issued by the engine.
    pub mutation_batch_size: usize,
    /// Row budget for one synchronous mutation, cascades included.
    pub mutation_max_rows: usize,
    pub execution_mode: ExecutionMode,
    /// Bounded concurrency for nested relation loading.
    pub relation_concurrency: usize,
}

impl Default for SchemaDefaults {
    fn default() -> Self {
        SchemaDefaults {
            strict: true,
            mutation_batch_size: 100,
            mutation_max_rows: 4096,
            execution_mode: ExecutionMode::Sync,
            relation_concurrency: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A validated set of tables plus defaults.
#[derive(Debug, Clone)]
pub struct Schema {
    tables: BTreeMap<String, Arc<Table>>,
    defaults: SchemaDefaults,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder {
            tables: Vec::new(),
            defaults: SchemaDefaults::default(),
        }
    }

    pub fn table(&self, name: &str) -> OrmResult<&Arc<Table>> {
        self.tables.get(name).ok_or_else(|| OrmError::UnknownTable {
            table: name.to_string(),
        })
    }

    pub fn tables(&self) -> impl Iterator<Item = &Arc<Table>> {
        self.tables.values()
    }

    pub fn defaults(&self) -> &SchemaDefaults {
        &self.defaults
    }

    /// Foreign keys across the whole schema that point at `target`.
    pub fn incoming_foreign_keys(&self, target: &str) -> Vec<(Arc<Table>, ForeignKey)> {
        let mut incoming = Vec::new();
        for table in self.tables.values() {
            for fk in table.foreign_keys() {
                if fk.foreign_table == target {
                    incoming.push((Arc::clone(table), fk.clone()));
                }
            }
        }
        incoming
    }
}

/// Builder collecting tables before whole-schema validation.
pub struct SchemaBuilder {
    tables: Vec<Table>,
    defaults: SchemaDefaults,
}

impl SchemaBuilder {
    pub fn table(mut self, table: Table) -> Self {
        self.tables.push(table);
        self
    }

    pub fn defaults(mut self, defaults: SchemaDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    /// Validate and freeze the schema.
    pub fn build(self) -> OrmResult<Schema> {
        let mut tables = BTreeMap::new();
        let mut prepared = Vec::new();
        for table in self.tables {
            let table = prepare_table(table)?;
            let name = table.name().to_string();
            if tables.contains_key(&name) {
                return Err(OrmError::InvalidSchema {
                    table: name,
                    reason: "duplicate table name".to_string(),
                });
            }
            tables.insert(name, Arc::new(table));
        }
        for table in tables.values() {
            prepared.push(Arc::clone(table));
        }

        let schema = Schema {
            tables,
            defaults: self.defaults,
        };
        for table in &prepared {
            validate_foreign_keys(&schema, table)?;
        }
        Ok(schema)
    }
}

/// Per-table normalization and validation: reserved names, the
/// `createdAt` alias, column-level sugar, index descriptors for unique
/// indexes, and check-expression field references.
fn prepare_table(mut t: Table) -> OrmResult<Table> {
    let table_name = t.name.clone();
    let invalid = move |reason: &str| OrmError::InvalidSchema {
        table: table_name.clone(),
        reason: reason.to_string(),
    };

    if t.name.is_empty() || t.name.starts_with('_') {
        return Err(invalid("table names may not be empty or start with '_'"));
    }

    // The createdAt alias: timestamp().not_null().default_now() named
    // `createdAt` stands in for the system creation time and is removed
    // from the stored column set.
    if let Some(pos) = t.columns.iter().position(|c| c.name == CREATED_AT_COLUMN) {
        let col = &t.columns[pos];
        match col.kind {
            ColumnKind::Timestamp(mode) if col.not_null && col.is_default_now => {
                t.creation_time_mode = Some(mode);
                t.columns.remove(pos);
            }
            _ => {
                return Err(invalid(
                    "'createdAt' is reserved for the creation-time alias \
                     (timestamp, notNull, defaultNow)",
                ))
            }
        }
    }

    let mut seen = Vec::new();
    for column in &t.columns {
        if RESERVED_COLUMNS.contains(&column.name.as_str()) {
            return Err(invalid(&format!("column name '{}' is reserved", column.name)));
        }
        if seen.contains(&column.name) {
            return Err(invalid(&format!("duplicate column '{}'", column.name)));
        }
        if column.invalid_default_now {
            return Err(invalid(&format!(
                "defaultNow() on non-temporal column '{}'",
                column.name
            )));
        }
        seen.push(column.name.clone());
    }

    // Lower column-level sugar into table-level constraints.
    let sugar: Vec<(String, Option<ColumnReference>, bool)> = t
        .columns
        .iter()
        .map(|c| (c.name.clone(), c.reference.clone(), c.unique))
        .collect();
    for (name, reference, unique) in sugar {
        if unique {
            t.uniques.push(UniqueIndex {
                name: format!("{}_{}_unique", t.name, name),
                fields: vec![name.clone()],
                nulls_not_distinct: false,
            });
        }
        if let Some(r) = reference {
            t.foreign_keys.push(ForeignKey {
                columns: vec![name],
                foreign_table: r.table,
                foreign_columns: vec![r.column],
                on_delete: r.on_delete,
                on_update: r.on_update,
            });
        }
    }

    // Every unique index gets a matching scan-index descriptor.
    for unique in t.uniques.clone() {
        for field in &unique.fields {
            if t.column(field).is_none() {
                return Err(invalid(&format!(
                    "unique index '{}' references unknown column '{}'",
                    unique.name, field
                )));
            }
        }
        if t.index_covering(&unique.fields).is_none() {
            t.indexes.push(TableIndex {
                name: unique.name.clone(),
                fields: unique.fields.clone(),
            });
        }
    }

    for index in &t.indexes {
        for field in &index.fields {
            if t.column(field).is_none() {
                return Err(invalid(&format!(
                    "index '{}' references unknown column '{}'",
                    index.name, field
                )));
            }
        }
    }

    for check in &t.checks {
        for field in check.expr.referenced_fields() {
            if field != stratum_store::ID_FIELD
                && field != stratum_store::CREATION_TIME_FIELD
                && t.column(&field).is_none()
            {
                return Err(invalid(&format!(
                    "check '{}' references unknown column '{}'",
                    check.name, field
                )));
            }
        }
    }

    Ok(t)
}

/// Cross-table validation of foreign keys: targets must exist, setNull
/// needs nullable sources, setDefault needs defaults.
fn validate_foreign_keys(schema: &Schema, table: &Table) -> OrmResult<()> {
    let invalid = |reason: String| OrmError::InvalidSchema {
        table: table.name().to_string(),
        reason,
    };

    for fk in table.foreign_keys() {
        if fk.foreign_table.is_empty() || fk.foreign_columns.is_empty() {
            return Err(invalid("foreign key is missing its references()".into()));
        }
        if fk.columns.len() != fk.foreign_columns.len() {
            return Err(invalid(format!(
                "foreign key column count mismatch ({} vs {})",
                fk.columns.len(),
                fk.foreign_columns.len()
            )));
        }
        let target = schema.table(&fk.foreign_table).map_err(|_| {
            invalid(format!(
                "foreign key references unknown table '{}'",
                fk.foreign_table
            ))
        })?;
        for column in &fk.foreign_columns {
            if column != "id" && target.column(column).is_none() {
                return Err(invalid(format!(
                    "foreign key references unknown column '{}.{}'",
                    fk.foreign_table, column
                )));
            }
        }
        for column in &fk.columns {
            let source = table.column(column).ok_or_else(|| {
                invalid(format!("foreign key uses unknown column '{column}'"))
            })?;
            if fk.on_delete == RefAction::SetNull || fk.on_update == RefAction::SetNull {
                if source.not_null {
                    return Err(invalid(format!(
                        "setNull action requires nullable column '{column}'"
                    )));
                }
            }
            if fk.on_delete == RefAction::SetDefault || fk.on_update == RefAction::SetDefault {
                if source.default.is_none() {
                    return Err(invalid(format!(
                        "setDefault action requires a default on column '{column}'"
                    )));
                }
            }
        }
    }
    Ok(())
}
