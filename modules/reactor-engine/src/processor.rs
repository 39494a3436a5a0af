//! Processor manager: per-drive processors created by registered factories.
//!
//! Two indices are kept in step: drive -> processor records, and
//! factory -> drives it has processors on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reactor_store::{
    replay_header, CreateDocumentInput, DocumentHeader, OperationWithContext, CREATE_DOCUMENT,
    DELETE_DOCUMENT, HEADER_SCOPE,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ReactorError;
use crate::read_model::ReadModel;

const ANY: &str = "*";

// ---------------------------------------------------------------------------
// Processor traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Processor: Send + Sync {
    async fn on_operations(&self, operations: &[OperationWithContext]) -> anyhow::Result<()>;

    async fn on_disconnect(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds the processors for one drive.
pub trait ProcessorFactory: Send + Sync {
    fn create(&self, drive: &DocumentHeader) -> anyhow::Result<Vec<ProcessorRecord>>;
}

impl<F> ProcessorFactory for F
where
    F: Fn(&DocumentHeader) -> anyhow::Result<Vec<ProcessorRecord>> + Send + Sync,
{
    fn create(&self, drive: &DocumentHeader) -> anyhow::Result<Vec<ProcessorRecord>> {
        self(drive)
    }
}

/// Which operations a processor wants. Each field is a list of accepted
/// values; an empty list or `"*"` accepts anything. Fields combine with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessorFilter {
    pub branch: Vec<String>,
    pub document_type: Vec<String>,
    pub scope: Vec<String>,
    pub document_id: Vec<String>,
}

impl ProcessorFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch.push(branch.into());
        self
    }

    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type.push(document_type.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope.push(scope.into());
        self
    }

    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id.push(document_id.into());
        self
    }

    pub fn matches(&self, row: &OperationWithContext) -> bool {
        fn accepts(allowed: &[String], value: &str) -> bool {
            allowed.is_empty() || allowed.iter().any(|a| a == ANY || a == value)
        }
        let ctx = &row.context;
        accepts(&self.branch, &ctx.branch)
            && accepts(&self.document_type, &ctx.document_type)
            && accepts(&self.scope, &ctx.scope)
            && accepts(&self.document_id, &ctx.document_id)
    }
}

#[derive(Clone)]
pub struct ProcessorRecord {
    pub processor: Arc<dyn Processor>,
    pub filter: ProcessorFilter,
}

impl ProcessorRecord {
    pub fn new(processor: Arc<dyn Processor>, filter: ProcessorFilter) -> Self {
        Self { processor, filter }
    }
}

// ---------------------------------------------------------------------------
// ProcessorManager
// ---------------------------------------------------------------------------

struct TrackedRecord {
    factory_id: String,
    record: ProcessorRecord,
}

#[derive(Default)]
struct ManagerState {
    factories: BTreeMap<String, Arc<dyn ProcessorFactory>>,
    drives: BTreeMap<String, DocumentHeader>,
    by_drive: BTreeMap<String, Vec<TrackedRecord>>,
    by_factory: BTreeMap<String, BTreeSet<String>>,
}

impl ManagerState {
    /// Instantiate `factory_id`'s processors on `drive_id`. A failing factory
    /// yields nothing and is logged.
    fn instantiate(&mut self, factory_id: &str, drive_id: &str) {
        let (Some(factory), Some(header)) = (
            self.factories.get(factory_id).cloned(),
            self.drives.get(drive_id),
        ) else {
            return;
        };

        let records = match factory.create(header) {
            Ok(records) => records,
            Err(e) => {
                let failure = ReactorError::FactoryFailure {
                    factory_id: factory_id.to_string(),
                    message: e.to_string(),
                };
                warn!(drive_id, error = %failure, "Processor factory failed");
                return;
            }
        };
        if records.is_empty() {
            return;
        }

        info!(factory_id, drive_id, count = records.len(), "Processors created");
        self.by_drive
            .entry(drive_id.to_string())
            .or_default()
            .extend(records.into_iter().map(|record| TrackedRecord {
                factory_id: factory_id.to_string(),
                record,
            }));
        self.by_factory
            .entry(factory_id.to_string())
            .or_default()
            .insert(drive_id.to_string());
    }

    fn forget_drive(&mut self, drive_id: &str) -> Vec<ProcessorRecord> {
        self.drives.remove(drive_id);
        for drives in self.by_factory.values_mut() {
            drives.remove(drive_id);
        }
        self.by_factory.retain(|_, drives| !drives.is_empty());
        self.by_drive
            .remove(drive_id)
            .unwrap_or_default()
            .into_iter()
            .map(|t| t.record)
            .collect()
    }

    fn forget_factory(&mut self, factory_id: &str) -> Vec<ProcessorRecord> {
        self.factories.remove(factory_id);
        let drives = self.by_factory.remove(factory_id).unwrap_or_default();
        let mut removed = Vec::new();
        for drive_id in drives {
            if let Some(records) = self.by_drive.get_mut(&drive_id) {
                let (gone, kept): (Vec<_>, Vec<_>) = records
                    .drain(..)
                    .partition(|t| t.factory_id == factory_id);
                *records = kept;
                removed.extend(gone.into_iter().map(|t| t.record));
            }
        }
        self.by_drive.retain(|_, records| !records.is_empty());
        removed
    }
}

/// Header of a drive created by `row`, if `row` is a drive-creation marker.
fn created_drive(row: &OperationWithContext, drive_type: &str) -> Option<DocumentHeader> {
    if row.context.scope != HEADER_SCOPE || row.operation.action.action_type != CREATE_DOCUMENT {
        return None;
    }
    let input: CreateDocumentInput =
        serde_json::from_value(row.operation.action.input.clone()).ok()?;
    if input.model != drive_type {
        return None;
    }
    replay_header(std::slice::from_ref(&row.operation))
        .ok()
        .map(|r| r.header)
}

fn is_deletion(row: &OperationWithContext) -> bool {
    row.context.scope == HEADER_SCOPE && row.operation.action.action_type == DELETE_DOCUMENT
}

pub struct ProcessorManager {
    drive_document_type: String,
    state: Mutex<ManagerState>,
}

impl ProcessorManager {
    pub fn new(drive_document_type: impl Into<String>) -> Self {
        Self {
            drive_document_type: drive_document_type.into(),
            state: Mutex::new(ManagerState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a factory and instantiate its processors on every known drive.
    /// Re-registering an id replaces the old factory and its processors.
    pub async fn register_factory(&self, factory_id: &str, factory: Arc<dyn ProcessorFactory>) {
        let replaced = {
            let mut state = self.state();
            let replaced = state.forget_factory(factory_id);
            state.factories.insert(factory_id.to_string(), factory);
            let drives: Vec<String> = state.drives.keys().cloned().collect();
            for drive_id in drives {
                state.instantiate(factory_id, &drive_id);
            }
            replaced
        };
        disconnect_all(replaced).await;
    }

    /// Disconnect and forget only the processors this factory created.
    pub async fn unregister_factory(&self, factory_id: &str) -> bool {
        let (known, removed) = {
            let mut state = self.state();
            let known = state.factories.contains_key(factory_id);
            (known, state.forget_factory(factory_id))
        };
        disconnect_all(removed).await;
        known
    }

    pub fn known_drives(&self) -> Vec<String> {
        self.state().drives.keys().cloned().collect()
    }

    pub fn processor_count(&self, drive_id: &str) -> usize {
        self.state().by_drive.get(drive_id).map_or(0, Vec::len)
    }

    pub fn drives_for_factory(&self, factory_id: &str) -> Vec<String> {
        self.state()
            .by_factory
            .get(factory_id)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }
}

async fn disconnect_all(records: Vec<ProcessorRecord>) {
    for record in records {
        if let Err(e) = record.processor.on_disconnect().await {
            warn!(error = %e, "Processor disconnect failed");
        }
    }
}

#[async_trait]
impl ReadModel for ProcessorManager {
    fn name(&self) -> &str {
        "processor-manager"
    }

    async fn index_operations(&self, operations: &[OperationWithContext]) -> anyhow::Result<()> {
        // New drives first, so their processors see this very batch.
        let (routes, removed) = {
            let mut state = self.state();
            for row in operations {
                let Some(header) = created_drive(row, &self.drive_document_type) else {
                    continue;
                };
                if state.drives.contains_key(&header.id) {
                    continue;
                }
                let drive_id = header.id.clone();
                state.drives.insert(drive_id.clone(), header);
                let factory_ids: Vec<String> = state.factories.keys().cloned().collect();
                for factory_id in factory_ids {
                    state.instantiate(&factory_id, &drive_id);
                }
            }

            let routes: Vec<(Arc<dyn Processor>, Vec<OperationWithContext>)> = state
                .by_drive
                .values()
                .flatten()
                .filter_map(|t| {
                    let matching: Vec<OperationWithContext> = operations
                        .iter()
                        .filter(|row| t.record.filter.matches(row))
                        .cloned()
                        .collect();
                    (!matching.is_empty()).then(|| (t.record.processor.clone(), matching))
                })
                .collect();

            let deleted: Vec<String> = operations
                .iter()
                .filter(|row| is_deletion(row) && state.drives.contains_key(&row.context.document_id))
                .map(|row| row.context.document_id.clone())
                .collect();
            let mut removed = Vec::new();
            for drive_id in deleted {
                info!(drive_id, "Drive deleted, disconnecting processors");
                removed.extend(state.forget_drive(&drive_id));
            }
            (routes, removed)
        };

        for (processor, batch) in routes {
            if let Err(e) = processor.on_operations(&batch).await {
                warn!(error = %e, "Processor failed on operations");
            }
        }
        disconnect_all(removed).await;
        Ok(())
    }
}
