//! Driver trait definitions for Stratum
//!
//! These traits define the full capability set the engine relies on:
//! - `DocumentReader`: point reads, indexed scans, id normalization
//! - `DocumentWriter`: single-document insert/patch/replace/delete
//! - `Scheduler`: deferred function execution (`run_after` / `run_at`)
//!
//! All traits are async and backend-agnostic. An in-memory reference
//! driver is provided for testing via the `memory` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreResult;
use crate::value::{values_equal, Document, DocumentId};

// ---------------------------------------------------------------------------
// Scan requests
// ---------------------------------------------------------------------------

/// Scan direction over the effective sort key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

/// An index binding for a scan: the index name, its full field list, and
/// an equality prefix over those fields.
///
/// The field list must match the index as registered with the backend;
/// the equality pairs must bind a prefix of it, in order, starting at
/// position 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexBounds {
    pub name: String,
    pub fields: Vec<String>,
    pub eq: Vec<(String, Value)>,
}

/// A filter program evaluated by the driver during a scan.
///
/// This is the complete op set the store can evaluate natively. A missing
/// field compares equal to `null`; incomparable values compare false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FilterNode {
    Eq { field: String, value: Value },
    Neq { field: String, value: Value },
    Gt { field: String, value: Value },
    Gte { field: String, value: Value },
    Lt { field: String, value: Value },
    Lte { field: String, value: Value },
    And { nodes: Vec<FilterNode> },
    Or { nodes: Vec<FilterNode> },
    Not { node: Box<FilterNode> },
    /// Constant verdict. Used by callers for clauses the store cannot
    /// evaluate natively, so the scan is not over-restricted.
    Literal { value: bool },
}

impl FilterNode {
    /// Evaluate the program against a document.
    pub fn matches(&self, doc: &Document) -> bool {
        let field_of = |name: &str| doc.get(name).cloned().unwrap_or(Value::Null);
        match self {
            FilterNode::Eq { field, value } => values_equal(&field_of(field), value),
            FilterNode::Neq { field, value } => !values_equal(&field_of(field), value),
            FilterNode::Gt { field, value } => compare(&field_of(field), value)
                .map(|o| o == std::cmp::Ordering::Greater)
                .unwrap_or(false),
            FilterNode::Gte { field, value } => compare(&field_of(field), value)
                .map(|o| o != std::cmp::Ordering::Less)
                .unwrap_or(false),
            FilterNode::Lt { field, value } => compare(&field_of(field), value)
                .map(|o| o == std::cmp::Ordering::Less)
                .unwrap_or(false),
            FilterNode::Lte { field, value } => compare(&field_of(field), value)
                .map(|o| o != std::cmp::Ordering::Greater)
                .unwrap_or(false),
            FilterNode::And { nodes } => nodes.iter().all(|n| n.matches(doc)),
            FilterNode::Or { nodes } => nodes.iter().any(|n| n.matches(doc)),
            FilterNode::Not { node } => !node.matches(doc),
            FilterNode::Literal { value } => *value,
        }
    }
}

/// Comparable-type comparison for driver filters: numbers, strings and
/// bools compare within their type; everything else is incomparable.
fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            Some(x.as_f64()?.total_cmp(&y.as_f64()?))
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// A single scan over one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanRequest {
    /// Index binding. `None` scans in `_creationTime` order.
    pub index: Option<IndexBounds>,
    /// Driver-evaluated filter program.
    pub filter: Option<FilterNode>,
    /// Direction over the effective sort key.
    pub order: Order,
    /// Resume cursor from a previous `ScanPage`.
    pub cursor: Option<String>,
    /// Page size. `None` collects the remainder of the scan.
    pub limit: Option<usize>,
}

/// One page of scan results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPage {
    pub documents: Vec<Document>,
    /// Cursor for the next page; only meaningful when `is_done` is false.
    pub continue_cursor: Option<String>,
    pub is_done: bool,
}

// ---------------------------------------------------------------------------
// DocumentReader / DocumentWriter
// ---------------------------------------------------------------------------

/// Read access to a document store.
///
/// Guarantees:
/// - `scan` returns documents in a stable order: index-key order when an
///   index is bound, `_creationTime` order otherwise, with the document
///   id as final tiebreak.
/// - Cursors remain valid across pages of the same logical scan.
/// - `_creationTime` is monotonic per table.
#[async_trait]
pub trait DocumentReader: Send + Sync {
    /// Point read by id. `None` if absent.
    async fn get(&self, table: &str, id: &DocumentId) -> StoreResult<Option<Document>>;

    /// Indexed or full scan over one table.
    async fn scan(&self, table: &str, request: ScanRequest) -> StoreResult<ScanPage>;

    /// Resolve a candidate string to a canonical id for `table`, or
    /// `None` when the candidate belongs to another table or does not
    /// parse.
    async fn normalize_id(&self, table: &str, candidate: &str) -> StoreResult<Option<DocumentId>>;
}

/// Write access to a document store.
///
/// Guarantees:
/// - `insert` mints the id and stamps `_creationTime`; caller-supplied
///   system fields are ignored.
/// - `patch` merges fields into the existing document; an explicit
///   `null` value is stored, not treated as a removal.
/// - `replace` keeps the system fields and swaps everything else.
/// - All four operations are atomic per document.
#[async_trait]
pub trait DocumentWriter: DocumentReader {
    async fn insert(&self, table: &str, document: Document) -> StoreResult<DocumentId>;

    async fn patch(&self, table: &str, id: &DocumentId, patch: Document) -> StoreResult<()>;

    async fn replace(&self, table: &str, id: &DocumentId, document: Document) -> StoreResult<()>;

    async fn delete(&self, table: &str, id: &DocumentId) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Identifier of an enqueued scheduled job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A deferred function call: the registered function name plus its
/// serialized arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub function: String,
    pub args: Value,
}

impl ScheduledJob {
    pub fn new(function: impl Into<String>, args: Value) -> Self {
        ScheduledJob {
            function: function.into(),
            args,
        }
    }
}

/// Deferred-function scheduler.
///
/// Jobs run after the enclosing mutation commits; the store makes no
/// visibility promises for in-flight writes across the scheduling
/// boundary.
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Enqueue `job` to run `delay_ms` from now. Rejects negative or
    /// non-finite delays.
    async fn run_after(&self, delay_ms: f64, job: ScheduledJob) -> StoreResult<JobId>;

    /// Enqueue `job` to run at an absolute epoch-ms timestamp.
    async fn run_at(&self, timestamp_ms: f64, job: ScheduledJob) -> StoreResult<JobId>;

    /// Cancel a pending job. Fails if the job is unknown or already ran.
    async fn cancel(&self, job_id: &JobId) -> StoreResult<()>;
}
