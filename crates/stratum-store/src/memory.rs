//! In-memory reference driver
//!
//! `MemoryStore` and `MemoryScheduler` satisfy the driver trait
//! contracts without any external backend. They are the substrate for
//! the engine's test suite and double as executable documentation of
//! the contracts in `traits`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    DocumentReader, DocumentWriter, IndexBounds, JobId, Order, ScanPage, ScanRequest, ScheduledJob,
    Scheduler,
};
use crate::value::{
    scan_order, values_equal, Document, DocumentId, CREATION_TIME_FIELD, ID_FIELD,
};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TableData {
    documents: BTreeMap<String, Document>,
}

#[derive(Debug, Default)]
struct StoreInner {
    tables: HashMap<String, TableData>,
    /// Last `_creationTime` handed out, to keep the stamp monotonic even
    /// when the wall clock does not advance between inserts.
    last_creation_ms: f64,
}

/// In-memory document store backed by per-table `BTreeMap`s.
///
/// Tables are created lazily on first insert. Index scans sort by the
/// bound index's field list; unindexed scans sort by `_creationTime`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

/// Sort-position cursor: the effective sort key of the last returned
/// document plus its id as tiebreak. Survives concurrent deletes because
/// resumption compares positions instead of looking the document up.
#[derive(Debug, Serialize, Deserialize)]
struct Cursor {
    key: Vec<Value>,
    id: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sort_key(doc: &Document, index: Option<&IndexBounds>) -> Vec<Value> {
        let mut key = Vec::new();
        if let Some(bounds) = index {
            for field in &bounds.fields {
                key.push(doc.get(field).cloned().unwrap_or(Value::Null));
            }
        }
        key.push(doc.get(CREATION_TIME_FIELD).cloned().unwrap_or(Value::Null));
        key
    }

    fn compare_positions(a: &(Vec<Value>, String), b: &(Vec<Value>, String)) -> std::cmp::Ordering {
        for (x, y) in a.0.iter().zip(b.0.iter()) {
            let ord = scan_order(x, y);
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        a.1.cmp(&b.1)
    }

    fn next_creation_ms(inner: &mut StoreInner) -> f64 {
        let now = chrono::Utc::now().timestamp_millis() as f64;
        let stamp = if now > inner.last_creation_ms {
            now
        } else {
            inner.last_creation_ms + 1.0
        };
        inner.last_creation_ms = stamp;
        stamp
    }
}

#[async_trait]
impl DocumentReader for MemoryStore {
    async fn get(&self, table: &str, id: &DocumentId) -> StoreResult<Option<Document>> {
        if id.table() != table {
            return Ok(None);
        }
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .tables
            .get(table)
            .and_then(|t| t.documents.get(id.key()))
            .cloned())
    }

    async fn scan(&self, table: &str, request: ScanRequest) -> StoreResult<ScanPage> {
        let inner = self.inner.lock().unwrap();
        let docs = inner
            .tables
            .get(table)
            .map(|t| t.documents.values().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        drop(inner);

        // Equality prefix of the bound index, then the filter program.
        let matching: Vec<Document> = docs
            .into_iter()
            .filter(|doc| {
                if let Some(bounds) = &request.index {
                    for (field, value) in &bounds.eq {
                        let field_value = doc.get(field).cloned().unwrap_or(Value::Null);
                        if !values_equal(&field_value, value) {
                            return false;
                        }
                    }
                }
                request.filter.as_ref().map(|f| f.matches(doc)).unwrap_or(true)
            })
            .collect();

        let positions: Vec<(Vec<Value>, String)> = matching
            .iter()
            .map(|doc| {
                let id = doc
                    .get(ID_FIELD)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (Self::sort_key(doc, request.index.as_ref()), id)
            })
            .collect();

        let mut order: Vec<usize> = (0..matching.len()).collect();
        order.sort_by(|&a, &b| {
            let ord = Self::compare_positions(&positions[a], &positions[b]);
            match request.order {
                Order::Asc => ord,
                Order::Desc => ord.reverse(),
            }
        });

        let start = match &request.cursor {
            None => 0,
            Some(cursor) => {
                let parsed: Cursor =
                    serde_json::from_str(cursor).map_err(|_| StoreError::InvalidCursor {
                        cursor: cursor.clone(),
                    })?;
                let at = (parsed.key, parsed.id);
                // First position strictly past the cursor in scan direction.
                order
                    .iter()
                    .position(|&i| {
                        let ord = Self::compare_positions(&positions[i], &at);
                        match request.order {
                            Order::Asc => ord == std::cmp::Ordering::Greater,
                            Order::Desc => ord == std::cmp::Ordering::Less,
                        }
                    })
                    .unwrap_or(order.len())
            }
        };

        let end = match request.limit {
            Some(limit) => (start + limit).min(order.len()),
            None => order.len(),
        };
        let is_done = end >= order.len();
        let continue_cursor = if is_done || end == start {
            None
        } else {
            let (key, id) = positions[order[end - 1]].clone();
            Some(serde_json::to_string(&Cursor { key, id })?)
        };

        let documents: Vec<Document> = order[start..end]
            .iter()
            .map(|&i| matching[i].clone())
            .collect();

        Ok(ScanPage {
            documents,
            continue_cursor,
            is_done,
        })
    }

    async fn normalize_id(&self, table: &str, candidate: &str) -> StoreResult<Option<DocumentId>> {
        match DocumentId::try_from(candidate) {
            Ok(id) if id.table() == table => Ok(Some(id)),
            Ok(_) => Ok(None),
            // A bare key is accepted and scoped to the requested table.
            Err(_) if !candidate.is_empty() && !candidate.contains(':') => {
                Ok(Some(DocumentId::new(table, candidate)))
            }
            Err(_) => Ok(None),
        }
    }
}

#[async_trait]
impl DocumentWriter for MemoryStore {
    async fn insert(&self, table: &str, mut document: Document) -> StoreResult<DocumentId> {
        let mut inner = self.inner.lock().unwrap();
        let stamp = Self::next_creation_ms(&mut inner);
        let id = DocumentId::new(table, uuid::Uuid::new_v4().simple().to_string());
        document.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
        document.insert(CREATION_TIME_FIELD.to_string(), stamp.into());
        inner
            .tables
            .entry(table.to_string())
            .or_default()
            .documents
            .insert(id.key().to_string(), document);
        debug!(table, id = %id, "inserted document");
        Ok(id)
    }

    async fn patch(&self, table: &str, id: &DocumentId, patch: Document) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let doc = inner
            .tables
            .get_mut(table)
            .and_then(|t| t.documents.get_mut(id.key()))
            .ok_or_else(|| StoreError::DocumentNotFound { id: id.to_string() })?;
        for (field, value) in patch {
            if field == ID_FIELD || field == CREATION_TIME_FIELD {
                continue;
            }
            doc.insert(field, value);
        }
        Ok(())
    }

    async fn replace(&self, table: &str, id: &DocumentId, document: Document) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .tables
            .get_mut(table)
            .and_then(|t| t.documents.get_mut(id.key()))
            .ok_or_else(|| StoreError::DocumentNotFound { id: id.to_string() })?;
        let mut next = document;
        next.insert(
            ID_FIELD.to_string(),
            slot.get(ID_FIELD).cloned().unwrap_or(Value::Null),
        );
        next.insert(
            CREATION_TIME_FIELD.to_string(),
            slot.get(CREATION_TIME_FIELD).cloned().unwrap_or(Value::Null),
        );
        *slot = next;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &DocumentId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tables
            .get_mut(table)
            .and_then(|t| t.documents.remove(id.key()))
            .ok_or_else(|| StoreError::DocumentNotFound { id: id.to_string() })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryScheduler
// ---------------------------------------------------------------------------

/// A job waiting in the scheduler queue.
#[derive(Debug, Clone)]
pub struct PendingJob {
    pub id: JobId,
    pub run_at_ms: f64,
    pub job: ScheduledJob,
}

#[derive(Debug, Default)]
struct SchedulerInner {
    jobs: Vec<PendingJob>,
    next_id: u64,
}

/// In-memory scheduler queue.
///
/// Tests drive it explicitly: `take_next` pops the earliest pending job
/// so a drain loop can execute handlers deterministically.
#[derive(Debug, Default)]
pub struct MemoryScheduler {
    inner: Mutex<SchedulerInner>,
}

impl MemoryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the earliest pending job (by run time, then enqueue order).
    pub fn take_next(&self) -> Option<PendingJob> {
        let mut inner = self.inner.lock().unwrap();
        if inner.jobs.is_empty() {
            return None;
        }
        let mut best = 0;
        for (i, job) in inner.jobs.iter().enumerate().skip(1) {
            if job.run_at_ms < inner.jobs[best].run_at_ms {
                best = i;
            }
        }
        Some(inner.jobs.remove(best))
    }

    /// Number of jobs currently queued.
    pub fn pending(&self) -> usize {
        self.inner.lock().unwrap().jobs.len()
    }

    fn enqueue(&self, run_at_ms: f64, job: ScheduledJob) -> JobId {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = JobId(format!("job-{}", inner.next_id));
        inner.jobs.push(PendingJob {
            id: id.clone(),
            run_at_ms,
            job,
        });
        id
    }
}

#[async_trait]
impl Scheduler for MemoryScheduler {
    async fn run_after(&self, delay_ms: f64, job: ScheduledJob) -> StoreResult<JobId> {
        if !delay_ms.is_finite() || delay_ms < 0.0 {
            return Err(StoreError::InvalidDelay { delay_ms });
        }
        let now = chrono::Utc::now().timestamp_millis() as f64;
        Ok(self.enqueue(now + delay_ms, job))
    }

    async fn run_at(&self, timestamp_ms: f64, job: ScheduledJob) -> StoreResult<JobId> {
        if !timestamp_ms.is_finite() {
            return Err(StoreError::InvalidDelay {
                delay_ms: timestamp_ms,
            });
        }
        Ok(self.enqueue(timestamp_ms, job))
    }

    async fn cancel(&self, job_id: &JobId) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.jobs.len();
        inner.jobs.retain(|j| &j.id != job_id);
        if inner.jobs.len() == before {
            return Err(StoreError::JobNotFound {
                job_id: job_id.to_string(),
            });
        }
        Ok(())
    }
}
