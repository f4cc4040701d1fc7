//! Stratum Store - Document-Store Driver Layer
//!
//! Defines the capability set a document database must provide for the
//! Stratum engine to run on top of it: point reads, indexed scans with
//! filter predicates and cursor pagination, single-document writes, and
//! a deferred-function scheduler. Ships an in-memory reference driver
//! used by the engine's test suite.

pub mod error;
pub mod memory;
pub mod traits;
pub mod value;

pub use error::{StoreError, StoreResult};
pub use memory::{MemoryScheduler, MemoryStore, PendingJob};
pub use traits::{
    DocumentReader, DocumentWriter, FilterNode, IndexBounds, JobId, Order, ScanPage, ScanRequest,
    ScheduledJob, Scheduler,
};
pub use value::{
    document_id, scan_order, values_equal, Document, DocumentId, CREATION_TIME_FIELD, ID_FIELD,
};
