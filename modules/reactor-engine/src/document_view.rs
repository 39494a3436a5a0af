//! Document view: one snapshot row per stream, answering existence and
//! batch lookups without touching the operation log.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reactor_store::{
    CreateDocumentInput, OperationWithContext, StreamKey, CREATE_DOCUMENT, DELETE_DOCUMENT,
    HEADER_SCOPE,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::read_model::ReadModel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
    pub slug: Option<String>,
    pub last_operation_index: u64,
    pub last_operation_hash: String,
    /// Bumped once per indexed operation.
    pub snapshot_version: u64,
    pub last_updated_at: DateTime<Utc>,
    pub is_deleted: bool,
}

#[derive(Default)]
struct ViewState {
    snapshots: BTreeMap<StreamKey, DocumentSnapshot>,
    /// (branch, slug) -> document id
    slugs: HashMap<(String, String), String>,
}

impl ViewState {
    fn header(&self, document_id: &str, branch: &str) -> Option<&DocumentSnapshot> {
        self.snapshots
            .get(&StreamKey::new(document_id, HEADER_SCOPE, branch))
    }

    fn apply(&mut self, row: &OperationWithContext) {
        let key = row.stream();
        let op = &row.operation;

        match self.snapshots.get_mut(&key) {
            // Redelivery of something already indexed.
            Some(existing) if op.index <= existing.last_operation_index => return,
            Some(existing) => {
                existing.last_operation_index = op.index;
                existing.last_operation_hash = op.hash.clone();
                existing.snapshot_version += 1;
                existing.last_updated_at = op.timestamp_utc;
            }
            None => {
                let header = self.header(&key.document_id, &key.branch);
                let snapshot = DocumentSnapshot {
                    document_id: key.document_id.clone(),
                    document_type: row.context.document_type.clone(),
                    scope: key.scope.clone(),
                    branch: key.branch.clone(),
                    slug: header.and_then(|h| h.slug.clone()),
                    last_operation_index: op.index,
                    last_operation_hash: op.hash.clone(),
                    snapshot_version: 1,
                    last_updated_at: op.timestamp_utc,
                    is_deleted: header.is_some_and(|h| h.is_deleted),
                };
                self.snapshots.insert(key.clone(), snapshot);
            }
        }

        if key.scope != HEADER_SCOPE {
            return;
        }
        match op.action.action_type.as_str() {
            CREATE_DOCUMENT => {
                let Ok(input) = serde_json::from_value::<CreateDocumentInput>(op.action.input.clone())
                else {
                    return;
                };
                if let Some(slug) = input.slug {
                    self.slugs
                        .insert((key.branch.clone(), slug.clone()), key.document_id.clone());
                    if let Some(snapshot) = self.snapshots.get_mut(&key) {
                        snapshot.slug = Some(slug);
                    }
                }
            }
            DELETE_DOCUMENT => {
                debug!(document_id = %key.document_id, branch = %key.branch, "Marking document deleted");
                for snapshot in self.snapshots.values_mut().filter(|s| {
                    s.document_id == key.document_id && s.branch == key.branch
                }) {
                    snapshot.is_deleted = true;
                }
                let document_id = &key.document_id;
                self.slugs
                    .retain(|(branch, _), id| !(id == document_id && *branch == key.branch));
            }
            _ => {}
        }
    }
}

/// In-memory document view. Rebuilt from the log on startup.
#[derive(Default)]
pub struct DocumentView {
    state: Mutex<ViewState>,
}

impl DocumentView {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ViewState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Live (not deleted) snapshot of one stream.
    pub fn get(&self, document_id: &str, scope: &str, branch: &str) -> Option<DocumentSnapshot> {
        self.state()
            .snapshots
            .get(&StreamKey::new(document_id, scope, branch))
            .filter(|s| !s.is_deleted)
            .cloned()
    }

    /// One entry per requested id, in order; `None` for missing or deleted.
    pub fn get_many(
        &self,
        document_ids: &[String],
        scope: &str,
        branch: &str,
    ) -> Vec<Option<DocumentSnapshot>> {
        document_ids
            .iter()
            .map(|id| self.get(id, scope, branch))
            .collect()
    }

    /// Whether each id has a live snapshot on any branch.
    pub fn exists(&self, document_ids: &[String]) -> Vec<bool> {
        let state = self.state();
        document_ids
            .iter()
            .map(|id| {
                state
                    .snapshots
                    .values()
                    .any(|s| &s.document_id == id && !s.is_deleted)
            })
            .collect()
    }

    pub fn resolve_slug(&self, slug: &str, branch: &str) -> Option<String> {
        self.state()
            .slugs
            .get(&(branch.to_string(), slug.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.state().snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ReadModel for DocumentView {
    fn name(&self) -> &str {
        "document-view"
    }

    async fn index_operations(&self, operations: &[OperationWithContext]) -> anyhow::Result<()> {
        let mut state = self.state();
        for row in operations {
            state.apply(row);
        }
        Ok(())
    }
}
