//! Documents and jobs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use reactor_store::{Action, DocumentHeader, Operation, Signing, StreamKey};
use serde::{Deserialize, Serialize};

/// A materialized document: its header plus the state of each scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub header: DocumentHeader,
    pub state: BTreeMap<String, serde_json::Value>,
}

impl Document {
    pub fn scope_state(&self, scope: &str) -> Option<&serde_json::Value> {
        self.state.get(scope)
    }

    pub fn revision(&self, scope: &str) -> u64 {
        self.header.revision.get(scope).copied().unwrap_or(0)
    }
}

/// What a caller supplies to `Reactor::create`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDocument {
    pub id: String,
    pub document_type: String,
    pub slug: Option<String>,
    pub version: u32,
    pub signing: Signing,
    /// Overrides the model's initial state, per scope.
    pub initial_state: Option<BTreeMap<String, serde_json::Value>>,
}

impl NewDocument {
    pub fn new(id: impl Into<String>, document_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            document_type: document_type.into(),
            slug: None,
            version: 1,
            signing: Signing::default(),
            initial_state: None,
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_signing(mut self, signing: Signing) -> Self {
        self.signing = signing;
        self
    }

    pub fn with_initial_state(mut self, scope: impl Into<String>, state: serde_json::Value) -> Self {
        self.initial_state
            .get_or_insert_with(BTreeMap::new)
            .insert(scope.into(), state);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobKind {
    /// New actions to reduce and append.
    Execute { actions: Vec<Action> },
    /// Foreign operations to merge.
    Load { operations: Vec<Operation> },
}

impl JobKind {
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Execute { .. } => "execute",
            JobKind::Load { .. } => "load",
        }
    }
}

/// A unit of async work against one stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub stream: StreamKey,
    pub kind: JobKind,
    /// Job ids that must finish before this one is dispatched.
    pub queue_hint: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(stream: StreamKey, kind: JobKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            stream,
            kind,
            queue_hint: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_queue_hint(mut self, after: impl IntoIterator<Item = String>) -> Self {
        self.queue_hint.extend(after);
        self
    }

    pub fn document_id(&self) -> &str {
        &self.stream.document_id
    }
}

/// Narrows `Reactor::get_operations`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationFilter {
    pub branch: Option<String>,
    /// Only these scopes. `None` means every scope the document has.
    pub scopes: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownStatus {
    pub is_shutdown: bool,
    /// Jobs still queued when the workers stopped.
    pub pending_jobs: usize,
}
