//! Table-level constraints and index descriptors.

use serde::{Deserialize, Serialize};

use crate::expr::Expr;
use crate::schema::column::RefAction;

/// A plain (scan) index descriptor on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableIndex {
    pub name: String,
    pub fields: Vec<String>,
}

/// A unique index. `nulls_not_distinct` makes nulls collide; otherwise
/// rows with a null key coexist and the check is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueIndex {
    pub name: String,
    pub fields: Vec<String>,
    pub nulls_not_distinct: bool,
}

/// Builder: `unique_index("users_email_unique").on(&["email"])`.
#[derive(Debug, Clone)]
pub struct UniqueIndexBuilder {
    name: String,
    fields: Vec<String>,
    nulls_not_distinct: bool,
}

pub fn unique_index(name: &str) -> UniqueIndexBuilder {
    UniqueIndexBuilder {
        name: name.to_string(),
        fields: Vec::new(),
        nulls_not_distinct: false,
    }
}

impl UniqueIndexBuilder {
    pub fn on(mut self, fields: &[&str]) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn nulls_not_distinct(mut self) -> Self {
        self.nulls_not_distinct = true;
        self
    }

    pub(crate) fn build(self) -> UniqueIndex {
        UniqueIndex {
            name: self.name,
            fields: self.fields,
            nulls_not_distinct: self.nulls_not_distinct,
        }
    }
}

/// A foreign-key constraint from `columns` to `foreign_table.foreign_columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub foreign_table: String,
    pub foreign_columns: Vec<String>,
    pub on_delete: RefAction,
    pub on_update: RefAction,
}

/// Builder: `foreign_key(&["userId"]).references("users", &["id"])`.
#[derive(Debug, Clone)]
pub struct ForeignKeyBuilder {
    columns: Vec<String>,
    foreign_table: String,
    foreign_columns: Vec<String>,
    on_delete: RefAction,
    on_update: RefAction,
}

pub fn foreign_key(columns: &[&str]) -> ForeignKeyBuilder {
    ForeignKeyBuilder {
        columns: columns.iter().map(|c| c.to_string()).collect(),
        foreign_table: String::new(),
        foreign_columns: Vec::new(),
        on_delete: RefAction::NoAction,
        on_update: RefAction::NoAction,
    }
}

impl ForeignKeyBuilder {
    pub fn references(mut self, table: &str, columns: &[&str]) -> Self {
        self.foreign_table = table.to_string();
        self.foreign_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn on_delete(mut self, action: RefAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: RefAction) -> Self {
        self.on_update = action;
        self
    }

    pub(crate) fn build(self) -> ForeignKey {
        ForeignKey {
            columns: self.columns,
            foreign_table: self.foreign_table,
            foreign_columns: self.foreign_columns,
            on_delete: self.on_delete,
            on_update: self.on_update,
        }
    }
}

/// A named check constraint evaluated tri-state against written rows:
/// false rejects, unknown allows.
#[derive(Debug, Clone)]
pub struct Check {
    pub name: String,
    pub expr: Expr,
}
