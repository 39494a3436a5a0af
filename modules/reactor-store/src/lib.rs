//! Durable, append-only operation log for versioned documents.
//!
//! One log per (document, scope, branch). Rows are never updated or deleted;
//! superseded history is hidden by `skip`, not removed. Knows nothing about
//! document models or reducers.

pub mod audit;
pub mod error;
pub mod header;
pub mod keyframe;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use audit::{audit_operations, visible_operations, IntegrityIssue};
pub use error::{Result, StoreError};
pub use header::{
    is_header_action, replay_header, CreateDocumentInput, DeleteDocumentInput, DocumentHeader,
    HeaderReplay, Signing, UpgradeDocumentInput, CREATE_DOCUMENT, DELETE_DOCUMENT,
    UPGRADE_DOCUMENT,
};
pub use keyframe::{Keyframe, KeyframeStore};
pub use memory::{MemoryKeyframeStore, MemoryOperationStore};
pub use postgres::{migrate, PgKeyframeStore, PgOperationStore};
pub use store::{append, Mutation, OperationStore, OperationTxn};
pub use types::{
    derive_operation_id, hash_state, Action, Operation, OperationContext, OperationWithContext,
    PagedResults, Paging, Revisions, StreamKey, DEFAULT_BRANCH, HEADER_SCOPE,
};
