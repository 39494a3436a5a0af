//! Job executor: turns one job into committed operations.
//!
//! Execute jobs reduce fresh actions on top of the current state. Load jobs
//! merge foreign operations through the reshuffle planner. Either way the
//! store write is optimistic against the revision read at the start.

use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use reactor_store::{
    append, derive_operation_id, hash_state, is_header_action, replay_header, Action,
    CreateDocumentInput, Operation, OperationStore, OperationWithContext, StoreError, StreamKey,
    CREATE_DOCUMENT, HEADER_SCOPE,
};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::ExecutorConfig;
use crate::error::{ReactorError, Result};
use crate::registry::DocumentModelRegistry;
use crate::reshuffle::plan_load;
use crate::types::{Job, JobKind};
use crate::write_cache::{reduce_operations, WriteCache};

// ---------------------------------------------------------------------------
// Batch validation
// ---------------------------------------------------------------------------

fn check_scopes<'a>(stream: &StreamKey, scopes: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut seen: BTreeSet<&str> = scopes.collect();
    if seen.len() == 1 && seen.contains(stream.scope.as_str()) {
        return Ok(());
    }
    seen.insert(&stream.scope);
    Err(ReactorError::ScopeMismatch {
        scopes: seen.into_iter().map(str::to_string).collect(),
    })
}

/// Actions must be non-empty, all in the stream's scope, and header actions
/// only in the header scope.
pub fn validate_actions(stream: &StreamKey, actions: &[Action]) -> Result<()> {
    if actions.is_empty() {
        return Err(ReactorError::EmptyBatch);
    }
    check_scopes(stream, actions.iter().map(|a| a.scope.as_str()))?;
    let header_scope = stream.scope == HEADER_SCOPE;
    for action in actions {
        if is_header_action(&action.action_type) != header_scope {
            return Err(ReactorError::InvalidAction(format!(
                "{} is not allowed in scope {}",
                action.action_type, stream.scope
            )));
        }
    }
    Ok(())
}

/// Foreign operations must be non-empty, single-scope and hashed.
pub fn validate_operations(stream: &StreamKey, operations: &[Operation]) -> Result<()> {
    if operations.is_empty() {
        return Err(ReactorError::EmptyBatch);
    }
    check_scopes(stream, operations.iter().map(|op| op.action.scope.as_str()))?;
    if let Some(op) = operations.iter().find(|op| op.hash.is_empty()) {
        return Err(ReactorError::HashRequired { index: op.index });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// JobExecutor
// ---------------------------------------------------------------------------

pub struct JobExecutor {
    store: Arc<dyn OperationStore>,
    cache: Arc<WriteCache>,
    registry: Arc<DocumentModelRegistry>,
    config: ExecutorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn OperationStore>,
        cache: Arc<WriteCache>,
        registry: Arc<DocumentModelRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            config,
        }
    }

    /// Run one job to completion. A batch that was already committed in full
    /// (same op ids) succeeds with no new operations.
    pub async fn execute(
        &self,
        job: &Job,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        let stream = &job.stream;
        debug!(job_id = %job.id, stream = %stream, kind = job.kind.name(), "Executing job");

        let committed = match &job.kind {
            JobKind::Execute { actions } => {
                validate_actions(stream, actions)?;
                if stream.scope == HEADER_SCOPE {
                    self.execute_header(stream, actions, cancel).await?
                } else {
                    self.execute_actions(stream, actions, cancel).await?
                }
            }
            JobKind::Load { operations } => {
                validate_operations(stream, operations)?;
                self.load_operations(stream, operations.clone(), cancel)
                    .await?
            }
        };

        info!(
            job_id = %job.id,
            stream = %stream,
            operations = committed.len(),
            "Job committed"
        );
        Ok(committed)
    }

    // -----------------------------------------------------------------------
    // Execute
    // -----------------------------------------------------------------------

    async fn execute_actions(
        &self,
        stream: &StreamKey,
        actions: &[Action],
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        let header = self
            .store
            .get_header(&stream.document_id, &stream.branch)
            .await?;
        if header.is_deleted() {
            return Err(ReactorError::DocumentDeleted(stream.document_id.clone()));
        }
        let model = self.registry.get(&header.document_type)?;
        let revision = header.revision.get(&stream.scope).copied().unwrap_or(0);

        let mut document = self.cache.get_state(stream, Some(revision)).await?;
        let mut state = document
            .state
            .get(&stream.scope)
            .cloned()
            .unwrap_or_else(|| json!({}));

        let mut operations = Vec::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            let mut next = state.clone();
            model
                .reducer
                .reduce(&mut next, action)
                .map_err(|e| ReactorError::ReducerFailure {
                    action_type: action.action_type.clone(),
                    document_id: stream.document_id.clone(),
                    message: e.to_string(),
                })?;
            state = next;

            operations.push(Operation {
                op_id: derive_operation_id(
                    &stream.document_id,
                    &stream.scope,
                    &stream.branch,
                    &action.id,
                ),
                prev_op_id: None,
                index: revision + i as u64,
                skip: 0,
                hash: hash_state(&state),
                timestamp_utc: action.timestamp_utc,
                action: action.clone(),
                resulting_state: self.config.record_resulting_state.then(|| state.clone()),
                error: None,
            });
        }

        let last_timestamp = operations.last().map(|op| op.timestamp_utc);
        let op_ids = op_ids(&operations);
        let committed = match self
            .store
            .apply(stream, &header.document_type, revision, append(operations), cancel)
            .await
        {
            Ok(committed) => committed,
            Err(e) if e.is_duplicate() => return self.resolve_duplicate(stream, &op_ids, e).await,
            Err(e) => {
                self.cache.invalidate(stream).await;
                return Err(e.into());
            }
        };

        let new_revision = revision + committed.len() as u64;
        document.state.insert(stream.scope.clone(), state);
        document
            .header
            .revision
            .insert(stream.scope.clone(), new_revision);
        if let Some(ts) = last_timestamp {
            document.header.last_modified_at_utc = document.header.last_modified_at_utc.max(ts);
        }
        self.cache
            .put_state(stream, revision, new_revision, document)
            .await;

        Ok(committed)
    }

    /// Header-scope lifecycle actions. Each operation's hash is the hash of
    /// the header it produces.
    async fn execute_header(
        &self,
        stream: &StreamKey,
        actions: &[Action],
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        let existing = self.store.get_stream(stream).await?;
        let revision = existing.last().map(|op| op.index + 1).unwrap_or(0);

        let op_id = |action: &Action| {
            derive_operation_id(&stream.document_id, &stream.scope, &stream.branch, &action.id)
        };

        match actions[0].action_type.as_str() {
            CREATE_DOCUMENT if revision > 0 => {
                let first = op_id(&actions[0]);
                if existing.iter().any(|op| op.op_id == first) {
                    debug!(stream = %stream, "Document creation already committed");
                    return Ok(Vec::new());
                }
                return Err(ReactorError::InvalidAction(format!(
                    "document {} already exists",
                    stream.document_id
                )));
            }
            CREATE_DOCUMENT => {
                let input: CreateDocumentInput =
                    serde_json::from_value(actions[0].input.clone())?;
                self.registry.get(&input.model)?;
            }
            _ if revision == 0 => {
                return Err(StoreError::DocumentNotFound(stream.document_id.clone()).into());
            }
            _ => {
                if replay_header(&existing)?.header.is_deleted() {
                    return Err(ReactorError::DocumentDeleted(stream.document_id.clone()));
                }
            }
        }

        let mut history = existing;
        let mut operations = Vec::with_capacity(actions.len());
        for (i, action) in actions.iter().enumerate() {
            history.push(Operation {
                op_id: op_id(action),
                prev_op_id: None,
                index: revision + i as u64,
                skip: 0,
                hash: String::new(),
                timestamp_utc: action.timestamp_utc,
                action: action.clone(),
                resulting_state: None,
                error: None,
            });
            let header = replay_header(&history)?.header;
            let header_json = serde_json::to_value(&header)?;
            if let Some(op) = history.last_mut() {
                op.hash = hash_state(&header_json);
                if self.config.record_resulting_state {
                    op.resulting_state = Some(header_json);
                }
                operations.push(op.clone());
            }
        }
        let document_type = replay_header(&history)?.header.document_type;
        let op_ids = op_ids(&operations);

        let committed = match self
            .store
            .apply(stream, &document_type, revision, append(operations), cancel)
            .await
        {
            Ok(committed) => committed,
            Err(e) if e.is_duplicate() => return self.resolve_duplicate(stream, &op_ids, e).await,
            Err(e) => return Err(e.into()),
        };

        // Every cached snapshot and keyframe embeds the header.
        self.cache
            .invalidate_document(&stream.document_id, &stream.branch)
            .await;
        Ok(committed)
    }

    // -----------------------------------------------------------------------
    // Load
    // -----------------------------------------------------------------------

    async fn load_operations(
        &self,
        stream: &StreamKey,
        incoming: Vec<Operation>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<OperationWithContext>> {
        let local = self.store.get_stream(stream).await?;
        let plan = plan_load(&local, incoming, self.config.max_skip_threshold)?;
        if plan.operations.is_empty() {
            debug!(stream = %stream, duplicates = plan.duplicates, "Nothing new to load");
            return Ok(Vec::new());
        }
        if plan.reshuffled {
            info!(
                stream = %stream,
                head = plan.head,
                skip = plan.operations[0].skip,
                count = plan.operations.len(),
                "Reshuffling foreign operations after local head"
            );
        }

        let mut merged = local;
        merged.extend(plan.operations.iter().cloned());

        // Validate the merged history before anything is written.
        let document_type = if stream.scope == HEADER_SCOPE {
            replay_header(&merged)?.header.document_type
        } else {
            let header_stream = StreamKey::new(&stream.document_id, HEADER_SCOPE, &stream.branch);
            let header_ops = self.store.get_stream(&header_stream).await?;
            if header_ops.is_empty() {
                return Err(StoreError::DocumentNotFound(stream.document_id.clone()).into());
            }
            let replay = replay_header(&header_ops)?;
            let model = self.registry.get(&replay.header.document_type)?;
            let mut state = replay
                .initial_state
                .get(&stream.scope)
                .or_else(|| model.initial_state.get(&stream.scope))
                .cloned()
                .unwrap_or_else(|| json!({}));
            reduce_operations(
                model.reducer.as_ref(),
                &mut state,
                &merged,
                &stream.document_id,
            )?;
            replay.header.document_type
        };

        let op_ids = op_ids(&plan.operations);
        let committed = match self
            .store
            .apply(
                stream,
                &document_type,
                plan.head,
                append(plan.operations),
                cancel,
            )
            .await
        {
            Ok(committed) => committed,
            Err(e) if e.is_duplicate() => return self.resolve_duplicate(stream, &op_ids, e).await,
            Err(e) => {
                warn!(stream = %stream, error = %e, "Load failed to commit");
                self.cache.invalidate(stream).await;
                return Err(e.into());
            }
        };

        if stream.scope == HEADER_SCOPE {
            self.cache
                .invalidate_document(&stream.document_id, &stream.branch)
                .await;
        } else if plan.reshuffled {
            self.cache.invalidate(stream).await;
        }
        Ok(committed)
    }

    // -----------------------------------------------------------------------
    // Duplicates
    // -----------------------------------------------------------------------

    /// A duplicate-id rejection is a harmless resubmission only when every
    /// operation of the batch is already stored. If some are new, the batch
    /// overlaps a committed one and the job fails rather than dropping them.
    async fn resolve_duplicate(
        &self,
        stream: &StreamKey,
        op_ids: &[String],
        error: StoreError,
    ) -> Result<Vec<OperationWithContext>> {
        let stored: HashSet<String> = self
            .store
            .get_stream(stream)
            .await?
            .into_iter()
            .map(|op| op.op_id)
            .collect();
        let missing = op_ids.iter().filter(|id| !stored.contains(*id)).count();
        if missing == 0 {
            debug!(stream = %stream, "Batch already committed, nothing to do");
            return Ok(Vec::new());
        }
        warn!(
            stream = %stream,
            missing,
            error = %error,
            "Batch partially overlaps committed operations"
        );
        Err(error.into())
    }
}

fn op_ids(operations: &[Operation]) -> Vec<String> {
    operations.iter().map(|op| op.op_id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(scope: &str) -> StreamKey {
        StreamKey::new("doc-1", scope, "main")
    }

    fn action(scope: &str, action_type: &str) -> Action {
        Action::new("a-1", action_type, scope, json!({}))
    }

    #[test]
    fn empty_batches_are_rejected() {
        let err = validate_actions(&stream("global"), &[]).unwrap_err();
        assert!(matches!(err, ReactorError::EmptyBatch));
        assert!(err.is_validation());
    }

    #[test]
    fn mixed_scopes_are_rejected() {
        let actions = vec![action("global", "SET"), action("local", "SET")];
        let err = validate_actions(&stream("global"), &actions).unwrap_err();
        match err {
            ReactorError::ScopeMismatch { scopes } => {
                assert_eq!(scopes, vec!["global".to_string(), "local".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn header_actions_stay_in_header_scope() {
        let err = validate_actions(&stream("global"), &[action("global", CREATE_DOCUMENT)])
            .unwrap_err();
        assert!(matches!(err, ReactorError::InvalidAction(_)));

        let err = validate_actions(&stream(HEADER_SCOPE), &[action(HEADER_SCOPE, "SET")])
            .unwrap_err();
        assert!(matches!(err, ReactorError::InvalidAction(_)));
    }

    #[test]
    fn foreign_operations_need_a_hash() {
        let op = Operation {
            op_id: "x".into(),
            prev_op_id: None,
            index: 3,
            skip: 0,
            hash: String::new(),
            timestamp_utc: chrono::Utc::now(),
            action: action("global", "SET"),
            resulting_state: None,
            error: None,
        };
        let err = validate_operations(&stream("global"), &[op]).unwrap_err();
        assert!(matches!(err, ReactorError::HashRequired { index: 3 }));
    }
}
