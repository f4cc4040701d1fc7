//! Document value model shared by drivers and the engine
//!
//! A document is a flat JSON object. The driver owns two system fields:
//! `_id` (the document's identifier rendered as a string) and
//! `_creationTime` (epoch milliseconds, monotonic per table).

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// A stored row: a flat JSON object keyed by field name.
pub type Document = serde_json::Map<String, Value>;

/// Field holding the document identifier inside a stored document.
pub const ID_FIELD: &str = "_id";

/// Field holding the creation timestamp inside a stored document.
pub const CREATION_TIME_FIELD: &str = "_creationTime";

/// Opaque, stable document identifier scoped to a table.
///
/// The inner parts are private so an id can only be produced by a driver
/// (`DocumentWriter::insert`) or by validated parsing. The canonical
/// string form is `table:key`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
    table: String,
    key: String,
}

impl DocumentId {
    /// Construct an id from its parts. Drivers call this when minting ids.
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        DocumentId {
            table: table.into(),
            key: key.into(),
        }
    }

    /// The table this id belongs to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// The per-table key component.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl TryFrom<&str> for DocumentId {
    type Error = StoreError;

    fn try_from(s: &str) -> std::result::Result<Self, Self::Error> {
        match s.split_once(':') {
            Some((table, key)) if !table.is_empty() && !key.is_empty() => {
                Ok(DocumentId::new(table, key))
            }
            _ => Err(StoreError::InvalidId {
                candidate: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.table, self.key)
    }
}

/// Read the id out of a stored document.
pub fn document_id(doc: &Document) -> Option<DocumentId> {
    doc.get(ID_FIELD)
        .and_then(Value::as_str)
        .and_then(|s| DocumentId::try_from(s).ok())
}

/// Total order over JSON values used for index scans.
///
/// Values rank by type first (null < bool < number < string < array <
/// object), then within a type. This is the store's scan order, not the
/// engine's comparison semantics (which treat cross-type comparisons as
/// unknown).
pub fn scan_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (xa, ya) in x.iter().zip(y.iter()) {
                let ord = scan_order(xa, ya);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Equality used by driver filters: numbers compare numerically, so an
/// integer-written `1` matches a float-written `1.0`.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}
