use reactor_store::StoreError;

/// Result type alias for reactor operations.
pub type Result<T> = std::result::Result<T, ReactorError>;

#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Operation at index {index} has no hash")]
    HashRequired { index: u64 },

    #[error("Batch spans multiple scopes: {}", scopes.join(", "))]
    ScopeMismatch { scopes: Vec<String> },

    #[error("Reducer failed on {action_type} for {document_id}: {message}")]
    ReducerFailure {
        action_type: String,
        document_id: String,
        message: String,
    },

    #[error("Processor factory {factory_id} failed: {message}")]
    FactoryFailure { factory_id: String, message: String },

    #[error("No document model registered for type: {0}")]
    ModelNotFound(String),

    #[error("Document is deleted: {0}")]
    DocumentDeleted(String),

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Empty batch")]
    EmptyBatch,

    #[error("Index gap: expected {expected}, found {found}")]
    IndexGap { expected: u64, found: u64 },

    #[error("Reshuffle skip {skip} exceeds threshold {threshold}")]
    ExcessiveReshuffle { skip: u64, threshold: u64 },

    #[error("Queue is blocked")]
    QueueBlocked,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Reactor is shut down")]
    Shutdown,

    #[error("Event bus error: {0}")]
    EventBus(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReactorError {
    /// Malformed input that will never succeed, no matter how often it is resubmitted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ReactorError::HashRequired { .. }
                | ReactorError::ScopeMismatch { .. }
                | ReactorError::EmptyBatch
        )
    }
}

impl From<serde_json::Error> for ReactorError {
    fn from(e: serde_json::Error) -> Self {
        ReactorError::Store(StoreError::Serialization(e))
    }
}
