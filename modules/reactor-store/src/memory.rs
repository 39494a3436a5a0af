//! In-memory stores for tests and embedded use. No database required.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::keyframe::{Keyframe, KeyframeStore};
use crate::store::{check_cancel, Mutation, OperationStore, OperationTxn};
use crate::types::{
    Operation, OperationContext, OperationWithContext, PagedResults, Paging, Revisions, StreamKey,
};

// ---------------------------------------------------------------------------
// MemoryOperationStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemoryLog {
    rows: Vec<OperationWithContext>,
    op_ids: HashSet<String>,
    next_ordinal: i64,
}

impl MemoryLog {
    fn stream(&self, stream: &StreamKey) -> impl Iterator<Item = &OperationWithContext> {
        let stream = stream.clone();
        self.rows.iter().filter(move |row| row.stream() == stream)
    }
}

/// Thread-safe operation store backed by a `Vec`. Every `apply` holds one
/// lock for its whole duration, which gives the same atomicity as a
/// database transaction.
#[derive(Default)]
pub struct MemoryOperationStore {
    log: Mutex<MemoryLog>,
}

impl MemoryOperationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every row in commit order (for test assertions).
    pub fn read_all(&self) -> Vec<OperationWithContext> {
        self.lock().rows.clone()
    }
}

fn sorted_stream(log: &MemoryLog, stream: &StreamKey) -> Vec<Operation> {
    let mut ops: Vec<Operation> = log.stream(stream).map(|r| r.operation.clone()).collect();
    ops.sort_by_key(|op| op.index);
    ops
}

#[async_trait]
impl OperationStore for MemoryOperationStore {
    async fn apply(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        mutate: Mutation<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        check_cancel(cancel)?;
        let mut log = self.lock();

        let latest = log
            .stream(stream)
            .max_by_key(|row| row.operation.index)
            .map(|row| (row.operation.index, row.operation.op_id.clone()));
        let actual = latest.as_ref().map(|(index, _)| index + 1).unwrap_or(0);
        if actual != expected_revision {
            return Err(StoreError::RevisionMismatch {
                expected: expected_revision,
                actual,
            });
        }

        let mut txn = OperationTxn::default();
        mutate(&mut txn)?;
        let operations = txn.seal(expected_revision, latest.map(|(_, op_id)| op_id))?;

        let mut seen = HashSet::new();
        for op in &operations {
            if log.op_ids.contains(&op.op_id) || !seen.insert(op.op_id.as_str()) {
                return Err(StoreError::DuplicateOperation {
                    op_id: op.op_id.clone(),
                });
            }
        }

        let mut committed = Vec::with_capacity(operations.len());
        for operation in operations {
            log.next_ordinal += 1;
            let row = OperationWithContext {
                context: OperationContext {
                    document_id: stream.document_id.clone(),
                    document_type: document_type.to_string(),
                    scope: stream.scope.clone(),
                    branch: stream.branch.clone(),
                    ordinal: log.next_ordinal,
                },
                operation,
            };
            log.op_ids.insert(row.operation.op_id.clone());
            log.rows.push(row.clone());
            committed.push(row);
        }
        Ok(committed)
    }

    async fn get(&self, stream: &StreamKey, index: u64) -> Result<Operation> {
        self.lock()
            .stream(stream)
            .find(|row| row.operation.index == index)
            .map(|row| row.operation.clone())
            .ok_or_else(|| StoreError::OperationNotFound(format!("{stream}@{index}")))
    }

    async fn get_since(
        &self,
        stream: &StreamKey,
        revision: u64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>> {
        let ops: Vec<Operation> = sorted_stream(&self.lock(), stream)
            .into_iter()
            .filter(|op| op.index >= revision)
            .collect();
        Ok(PagedResults::paginate(ops, paging))
    }

    async fn get_since_timestamp(
        &self,
        stream: &StreamKey,
        timestamp: DateTime<Utc>,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>> {
        let ops: Vec<Operation> = sorted_stream(&self.lock(), stream)
            .into_iter()
            .filter(|op| op.timestamp_utc > timestamp)
            .collect();
        Ok(PagedResults::paginate(ops, paging))
    }

    async fn get_since_id(
        &self,
        ordinal: i64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<OperationWithContext>> {
        let rows: Vec<OperationWithContext> = self
            .lock()
            .rows
            .iter()
            .filter(|row| row.context.ordinal > ordinal)
            .cloned()
            .collect();
        Ok(PagedResults::paginate(rows, paging))
    }

    async fn get_revisions(&self, document_id: &str, branch: &str) -> Result<Revisions> {
        let log = self.lock();
        let mut revisions = Revisions::default();
        for row in log
            .rows
            .iter()
            .filter(|r| r.context.document_id == document_id && r.context.branch == branch)
        {
            let next = row.operation.index + 1;
            let entry = revisions
                .revision
                .entry(row.context.scope.clone())
                .or_insert(0);
            *entry = (*entry).max(next);
            let ts = row.operation.timestamp_utc;
            revisions.latest_timestamp = Some(revisions.latest_timestamp.map_or(ts, |t| t.max(ts)));
        }
        Ok(revisions)
    }
}

// ---------------------------------------------------------------------------
// MemoryKeyframeStore
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryKeyframeStore {
    keyframes: Mutex<BTreeMap<(StreamKey, u64), serde_json::Value>>,
    view_states: Mutex<BTreeMap<String, i64>>,
}

impl MemoryKeyframeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keyframes.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KeyframeStore for MemoryKeyframeStore {
    async fn put_keyframe(
        &self,
        stream: &StreamKey,
        revision: u64,
        document: &serde_json::Value,
    ) -> Result<()> {
        self.keyframes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((stream.clone(), revision), document.clone());
        Ok(())
    }

    async fn find_nearest_keyframe(
        &self,
        stream: &StreamKey,
        target_revision: u64,
    ) -> Result<Option<Keyframe>> {
        let keyframes = self.keyframes.lock().unwrap_or_else(|e| e.into_inner());
        let found = keyframes
            .range((stream.clone(), 0)..=(stream.clone(), target_revision))
            .next_back()
            .map(|((_, revision), document)| Keyframe {
                revision: *revision,
                document: document.clone(),
            });
        Ok(found)
    }

    async fn delete_keyframes(
        &self,
        document_id: &str,
        scope: Option<&str>,
        branch: Option<&str>,
    ) -> Result<u64> {
        let mut keyframes = self.keyframes.lock().unwrap_or_else(|e| e.into_inner());
        let before = keyframes.len();
        keyframes.retain(|(key, _), _| {
            let matches = key.document_id == document_id
                && scope.map_or(true, |s| key.scope == s)
                && branch.map_or(true, |b| key.branch == b);
            !matches
        });
        Ok((before - keyframes.len()) as u64)
    }

    async fn get_view_state(&self, read_model: &str) -> Result<Option<i64>> {
        let view_states = self.view_states.lock().unwrap_or_else(|e| e.into_inner());
        Ok(view_states.get(read_model).copied())
    }

    async fn put_view_state(&self, read_model: &str, ordinal: i64) -> Result<()> {
        let mut view_states = self.view_states.lock().unwrap_or_else(|e| e.into_inner());
        let entry = view_states.entry(read_model.to_string()).or_insert(ordinal);
        *entry = (*entry).max(ordinal);
        Ok(())
    }
}
