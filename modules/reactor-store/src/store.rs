//! OperationStore: the only component that touches durable storage.
//!
//! Writes are optimistic: `apply` names the revision it expects the stream to
//! be at, and fails with `RevisionMismatch` if someone else got there first.
//! No caching happens at this layer.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::header::{replay_header, DocumentHeader};
use crate::types::{
    Operation, OperationWithContext, PagedResults, Paging, Revisions, StreamKey, HEADER_SCOPE,
};

// ---------------------------------------------------------------------------
// Transaction handle
// ---------------------------------------------------------------------------

/// Accumulates the operations one `apply` call will commit.
#[derive(Debug, Default)]
pub struct OperationTxn {
    operations: Vec<Operation>,
}

impl OperationTxn {
    pub fn add_operation(&mut self, operation: Operation) {
        self.operations.push(operation);
    }

    pub fn add_operations(&mut self, operations: impl IntoIterator<Item = Operation>) {
        self.operations.extend(operations);
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Check indices continue from `expected_revision` and link the hash chain.
    pub(crate) fn seal(
        self,
        expected_revision: u64,
        mut prev_op_id: Option<String>,
    ) -> Result<Vec<Operation>> {
        let mut sealed = Vec::with_capacity(self.operations.len());
        for (i, mut op) in self.operations.into_iter().enumerate() {
            let expected_index = expected_revision + i as u64;
            if op.index != expected_index {
                return Err(StoreError::InvalidOperation(format!(
                    "operation {} has index {}, expected {}",
                    op.op_id, op.index, expected_index
                )));
            }
            op.prev_op_id = prev_op_id.take();
            prev_op_id = Some(op.op_id.clone());
            sealed.push(op);
        }
        Ok(sealed)
    }
}

/// Mutation callback handed to [`OperationStore::apply`].
pub type Mutation<'a> = Box<dyn FnOnce(&mut OperationTxn) -> Result<()> + Send + 'a>;

/// Shorthand for a mutation that just appends `operations`.
pub fn append(operations: Vec<Operation>) -> Mutation<'static> {
    Box::new(move |txn| {
        txn.add_operations(operations);
        Ok(())
    })
}

pub(crate) fn check_cancel(cancel: Option<&AtomicBool>) -> Result<()> {
    match cancel {
        Some(flag) if flag.load(Ordering::SeqCst) => Err(StoreError::Aborted),
        _ => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// OperationStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait OperationStore: Send + Sync {
    /// Atomically append to one stream.
    ///
    /// Succeeds only when the stream's next index equals `expected_revision`.
    /// `cancel` is checked once, before the transaction opens.
    async fn apply(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        mutate: Mutation<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>>;

    /// The operation at `index`.
    async fn get(&self, stream: &StreamKey, index: u64) -> Result<Operation>;

    /// Operations with `index >= revision`, in index order.
    async fn get_since(
        &self,
        stream: &StreamKey,
        revision: u64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>>;

    /// Operations stamped strictly after `timestamp`, in index order.
    async fn get_since_timestamp(
        &self,
        stream: &StreamKey,
        timestamp: DateTime<Utc>,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>>;

    /// Every committed operation with an ordinal greater than `ordinal`,
    /// across all documents, in commit order.
    async fn get_since_id(
        &self,
        ordinal: i64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<OperationWithContext>>;

    /// Per-scope revisions for one document branch.
    async fn get_revisions(&self, document_id: &str, branch: &str) -> Result<Revisions>;

    /// Whole stream, index ordered.
    async fn get_stream(&self, stream: &StreamKey) -> Result<Vec<Operation>> {
        Ok(self.get_since(stream, 0, None).await?.results)
    }

    /// Rebuild the header from the header-scope slice, then fill in the
    /// revision of every scope.
    async fn get_header(&self, document_id: &str, branch: &str) -> Result<DocumentHeader> {
        let header_ops = self
            .get_stream(&StreamKey::new(document_id, HEADER_SCOPE, branch))
            .await?;
        if header_ops.is_empty() {
            return Err(StoreError::DocumentNotFound(document_id.to_string()));
        }
        let mut header = replay_header(&header_ops)?.header;

        let revisions = self.get_revisions(document_id, branch).await?;
        header.revision.extend(revisions.revision);
        if let Some(latest) = revisions.latest_timestamp {
            header.last_modified_at_utc = header.last_modified_at_utc.max(latest);
        }
        Ok(header)
    }
}

#[async_trait]
impl<S: OperationStore + ?Sized> OperationStore for std::sync::Arc<S> {
    async fn apply(
        &self,
        stream: &StreamKey,
        document_type: &str,
        expected_revision: u64,
        mutate: Mutation<'_>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        (**self)
            .apply(stream, document_type, expected_revision, mutate, cancel)
            .await
    }

    async fn get(&self, stream: &StreamKey, index: u64) -> Result<Operation> {
        (**self).get(stream, index).await
    }

    async fn get_since(
        &self,
        stream: &StreamKey,
        revision: u64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>> {
        (**self).get_since(stream, revision, paging).await
    }

    async fn get_since_timestamp(
        &self,
        stream: &StreamKey,
        timestamp: DateTime<Utc>,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<Operation>> {
        (**self).get_since_timestamp(stream, timestamp, paging).await
    }

    async fn get_since_id(
        &self,
        ordinal: i64,
        paging: Option<&Paging>,
    ) -> Result<PagedResults<OperationWithContext>> {
        (**self).get_since_id(ordinal, paging).await
    }

    async fn get_revisions(&self, document_id: &str, branch: &str) -> Result<Revisions> {
        (**self).get_revisions(document_id, branch).await
    }
}
