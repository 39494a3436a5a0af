/// Result type alias for operation store calls.
pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream moved since the caller read it. Retry with a fresh revision.
    #[error("Revision mismatch: expected {expected}, actual {actual}")]
    RevisionMismatch { expected: u64, actual: u64 },

    /// An operation with this id is already stored. Resubmission, treat as success.
    #[error("Duplicate operation: {op_id}")]
    DuplicateOperation { op_id: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Aborted before transaction start")]
    Aborted,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateOperation { .. })
    }
}
