//! Column builders
//!
//! A column carries its data type, nullability, defaults, update
//! factories, and an optional reference to another table's column.
//! Builders are plain values; all validation happens when the schema is
//! built.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::temporal;

/// Hydration mode for `timestamp` columns. Storage is always epoch
/// milliseconds; the mode decides what reads return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    /// Reads return an RFC 3339 string.
    Rfc3339,
    /// Reads return the stored epoch-millisecond number.
    Millis,
}

/// Mode for `date` columns: decides both the stored representation and
/// what reads return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DateMode {
    /// Stored and read as a `YYYY-MM-DD` string.
    Iso,
    /// Stored and read as epoch milliseconds at UTC midnight.
    Millis,
}

/// Validator for an opaque column: the escape hatch for storing values
/// the engine does not interpret.
pub type OpaqueValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Factory producing a value at write time (`default_fn` / `on_update_fn`).
pub type ValueFactory = Arc<dyn Fn() -> Value + Send + Sync>;

/// Column data types.
#[derive(Clone)]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
    Boolean,
    Json,
    Date(DateMode),
    Timestamp(TimestampMode),
    Opaque(OpaqueValidator),
}

impl fmt::Debug for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnKind::Text => write!(f, "Text"),
            ColumnKind::Integer => write!(f, "Integer"),
            ColumnKind::Float => write!(f, "Float"),
            ColumnKind::Boolean => write!(f, "Boolean"),
            ColumnKind::Json => write!(f, "Json"),
            ColumnKind::Date(mode) => write!(f, "Date({mode:?})"),
            ColumnKind::Timestamp(mode) => write!(f, "Timestamp({mode:?})"),
            ColumnKind::Opaque(_) => write!(f, "Opaque"),
        }
    }
}

/// Referential action for a foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefAction {
    Cascade,
    Restrict,
    NoAction,
    SetNull,
    SetDefault,
}

/// Column-level reference to another table's column. Targets are named,
/// so self references and forward references to later-defined tables
/// work; unknown names fail the schema build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnReference {
    pub table: String,
    pub column: String,
    pub on_delete: RefAction,
    pub on_update: RefAction,
}

impl ColumnReference {
    pub fn to(table: impl Into<String>, column: impl Into<String>) -> Self {
        ColumnReference {
            table: table.into(),
            column: column.into(),
            on_delete: RefAction::NoAction,
            on_update: RefAction::NoAction,
        }
    }

    pub fn on_delete(mut self, action: RefAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: RefAction) -> Self {
        self.on_update = action;
        self
    }
}

/// A column default: a literal or a factory called per write.
#[derive(Clone)]
pub enum ColumnDefault {
    Literal(Value),
    Factory(ValueFactory),
}

impl ColumnDefault {
    pub fn produce(&self) -> Value {
        match self {
            ColumnDefault::Literal(value) => value.clone(),
            ColumnDefault::Factory(factory) => factory(),
        }
    }
}

impl fmt::Debug for ColumnDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnDefault::Literal(value) => write!(f, "Literal({value})"),
            ColumnDefault::Factory(_) => write!(f, "Factory"),
        }
    }
}

/// A column definition.
#[derive(Clone)]
pub struct Column {
    pub(crate) name: String,
    pub(crate) kind: ColumnKind,
    pub(crate) not_null: bool,
    pub(crate) unique: bool,
    pub(crate) default: Option<ColumnDefault>,
    pub(crate) on_update: Option<ValueFactory>,
    pub(crate) reference: Option<ColumnReference>,
    pub(crate) is_default_now: bool,
    /// `default_now()` on a non-temporal column; rejected at build.
    pub(crate) invalid_default_now: bool,
}

impl fmt::Debug for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Column")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("not_null", &self.not_null)
            .field("unique", &self.unique)
            .field("reference", &self.reference)
            .finish_non_exhaustive()
    }
}

fn column(name: &str, kind: ColumnKind) -> Column {
    Column {
        name: name.to_string(),
        kind,
        not_null: false,
        unique: false,
        default: None,
        on_update: None,
        reference: None,
        is_default_now: false,
        invalid_default_now: false,
    }
}

pub fn text(name: &str) -> Column {
    column(name, ColumnKind::Text)
}

pub fn integer(name: &str) -> Column {
    column(name, ColumnKind::Integer)
}

pub fn float(name: &str) -> Column {
    column(name, ColumnKind::Float)
}

pub fn boolean(name: &str) -> Column {
    column(name, ColumnKind::Boolean)
}

pub fn json(name: &str) -> Column {
    column(name, ColumnKind::Json)
}

pub fn date(name: &str, mode: DateMode) -> Column {
    column(name, ColumnKind::Date(mode))
}

pub fn timestamp(name: &str, mode: TimestampMode) -> Column {
    column(name, ColumnKind::Timestamp(mode))
}

/// Opaque column: writes are checked by `validator`, reads pass the
/// stored value through unchanged.
pub fn opaque(name: &str, validator: impl Fn(&Value) -> bool + Send + Sync + 'static) -> Column {
    column(name, ColumnKind::Opaque(Arc::new(validator)))
}

impl Column {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ColumnKind {
        &self.kind
    }

    pub fn is_nullable(&self) -> bool {
        !self.not_null
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Literal(value.into()));
        self
    }

    pub fn default_fn(mut self, factory: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(ColumnDefault::Factory(Arc::new(factory)));
        self
    }

    /// Current time as the default, in the column's stored temporal
    /// representation. Only meaningful on `date`/`timestamp` columns.
    pub fn default_now(mut self) -> Self {
        match self.kind.clone() {
            kind @ (ColumnKind::Date(_) | ColumnKind::Timestamp(_)) => {
                self.default = Some(ColumnDefault::Factory(Arc::new(move || {
                    temporal::now_value(&kind)
                })));
                self.is_default_now = true;
            }
            _ => self.invalid_default_now = true,
        }
        self
    }

    /// Factory run on every update for this column when the patch does
    /// not set it explicitly.
    pub fn on_update_fn(mut self, factory: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(factory));
        self
    }

    pub fn references(mut self, reference: ColumnReference) -> Self {
        self.reference = Some(reference);
        self
    }
}
