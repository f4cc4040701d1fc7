//! Storage validator
//!
//! Runtime type checking of written documents against a table's column
//! definitions. Runs after defaults and temporal normalization, so
//! temporal values are checked in their stored representation.

use serde_json::Value;

use stratum_store::Document;

use crate::error::{OrmError, OrmResult};
use crate::schema::column::{ColumnKind, DateMode};
use crate::schema::table::Table;

impl Table {
    /// Validate a full row about to be inserted. Every notNull column
    /// must be present and non-null; every present value must match its
    /// column type; unknown fields are rejected.
    pub fn validate_insert(&self, doc: &Document) -> OrmResult<()> {
        for (field, value) in doc {
            let column = self.column(field).ok_or_else(|| OrmError::UnknownColumn {
                table: self.name().to_string(),
                column: field.clone(),
            })?;
            self.validate_column(column.name(), &column.kind, column.not_null, value)?;
        }
        for column in self.columns() {
            if column.not_null && doc.get(column.name()).map_or(true, Value::is_null) {
                return Err(OrmError::InvalidValue {
                    table: self.name().to_string(),
                    column: column.name().to_string(),
                    reason: "value is required".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Validate a partial patch: only the provided fields are checked.
    pub fn validate_patch(&self, patch: &Document) -> OrmResult<()> {
        for (field, value) in patch {
            let column = self.column(field).ok_or_else(|| OrmError::UnknownColumn {
                table: self.name().to_string(),
                column: field.clone(),
            })?;
            self.validate_column(column.name(), &column.kind, column.not_null, value)?;
        }
        Ok(())
    }

    fn validate_column(
        &self,
        name: &str,
        kind: &ColumnKind,
        not_null: bool,
        value: &Value,
    ) -> OrmResult<()> {
        if value.is_null() {
            if not_null {
                return Err(OrmError::InvalidValue {
                    table: self.name().to_string(),
                    column: name.to_string(),
                    reason: "column is notNull".to_string(),
                });
            }
            return Ok(());
        }
        check_kind(kind, value).map_err(|reason| OrmError::InvalidValue {
            table: self.name().to_string(),
            column: name.to_string(),
            reason,
        })
    }
}

fn check_kind(kind: &ColumnKind, value: &Value) -> Result<(), String> {
    match kind {
        ColumnKind::Text => value
            .is_string()
            .then_some(())
            .ok_or_else(|| format!("expected text, got {value}")),
        ColumnKind::Integer => match value {
            Value::Number(n)
                if n.as_i64().is_some()
                    || n.as_u64().is_some()
                    || n.as_f64().map(|f| f.fract() == 0.0).unwrap_or(false) =>
            {
                Ok(())
            }
            other => Err(format!("expected integer, got {other}")),
        },
        ColumnKind::Float => value
            .is_number()
            .then_some(())
            .ok_or_else(|| format!("expected float, got {value}")),
        ColumnKind::Boolean => value
            .is_boolean()
            .then_some(())
            .ok_or_else(|| format!("expected boolean, got {value}")),
        ColumnKind::Json => Ok(()),
        ColumnKind::Timestamp(_) => value
            .is_number()
            .then_some(())
            .ok_or_else(|| format!("expected stored timestamp millis, got {value}")),
        ColumnKind::Date(DateMode::Iso) => value
            .is_string()
            .then_some(())
            .ok_or_else(|| format!("expected stored YYYY-MM-DD date, got {value}")),
        ColumnKind::Date(DateMode::Millis) => value
            .is_number()
            .then_some(())
            .ok_or_else(|| format!("expected stored date millis, got {value}")),
        ColumnKind::Opaque(validator) => validator(value)
            .then_some(())
            .ok_or_else(|| "opaque validator rejected value".to_string()),
    }
}
