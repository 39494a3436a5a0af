//! Shared fixtures for reactor integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use reactor_engine::{
    DocumentModel, JobInfo, JobStatus, NewDocument, Processor, ReadModel, Reactor, ReactorConfig,
};
use reactor_store::{
    Action, MemoryKeyframeStore, MemoryOperationStore, OperationWithContext, DEFAULT_BRANCH,
};
use serde_json::json;

pub const PROFILE: &str = "test/profile";
pub const DRIVE: &str = "powerhouse/document-drive";

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

pub fn profile_model() -> DocumentModel {
    DocumentModel::new(
        PROFILE,
        |state: &mut serde_json::Value, action: &Action| -> anyhow::Result<()> {
            match action.action_type.as_str() {
                "SET_NAME" => {
                    state["name"] = action.input["name"].clone();
                    Ok(())
                }
                "INCREMENT" => {
                    let count = state["count"].as_i64().unwrap_or(0);
                    state["count"] = json!(count + 1);
                    Ok(())
                }
                "FAIL" => anyhow::bail!("profile rejects FAIL"),
                other => anyhow::bail!("unknown action {other}"),
            }
        },
    )
    .with_initial_state("global", json!({"name": "", "count": 0}))
}

pub fn drive_model() -> DocumentModel {
    DocumentModel::new(
        DRIVE,
        |state: &mut serde_json::Value, action: &Action| -> anyhow::Result<()> {
            state["lastAction"] = json!(action.action_type);
            Ok(())
        },
    )
}

// ---------------------------------------------------------------------------
// Reactors
// ---------------------------------------------------------------------------

pub struct TestReactor {
    pub reactor: Reactor,
    pub store: Arc<MemoryOperationStore>,
    pub keyframes: Arc<MemoryKeyframeStore>,
}

pub async fn memory_reactor() -> TestReactor {
    memory_reactor_with(ReactorConfig::default(), Vec::new()).await
}

pub async fn memory_reactor_with(
    config: ReactorConfig,
    read_models: Vec<Arc<dyn ReadModel>>,
) -> TestReactor {
    let store = Arc::new(MemoryOperationStore::new());
    let keyframes = Arc::new(MemoryKeyframeStore::new());
    memory_reactor_on(store, keyframes, config, read_models).await
}

/// A reactor over existing stores, as after a restart.
pub async fn memory_reactor_on(
    store: Arc<MemoryOperationStore>,
    keyframes: Arc<MemoryKeyframeStore>,
    config: ReactorConfig,
    read_models: Vec<Arc<dyn ReadModel>>,
) -> TestReactor {
    let mut builder = Reactor::builder(store.clone(), keyframes.clone())
        .with_config(config)
        .with_document_model(profile_model())
        .with_document_model(drive_model());
    for read_model in read_models {
        builder = builder.with_read_model(read_model);
    }
    TestReactor {
        reactor: builder.build().await.unwrap(),
        store,
        keyframes,
    }
}

// ---------------------------------------------------------------------------
// Actions and jobs
// ---------------------------------------------------------------------------

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
}

pub fn set_name(action_id: &str, name: &str, secs: i64) -> Action {
    Action::new(action_id, "SET_NAME", "global", json!({"name": name})).with_timestamp(at(secs))
}

pub fn increment(action_id: &str) -> Action {
    Action::new(action_id, "INCREMENT", "global", json!({}))
}

/// Wait for a job and require that read models saw it.
pub async fn settle(reactor: &Reactor, info: JobInfo) -> JobInfo {
    let done = reactor.wait_for_job(&info.id).await;
    assert_eq!(
        done.status,
        JobStatus::ReadModelsReady,
        "job failed: {:?}",
        done.error
    );
    done
}

pub async fn create_profile(reactor: &Reactor, id: &str) -> JobInfo {
    let info = reactor
        .create(NewDocument::new(id, PROFILE))
        .await
        .unwrap();
    settle(reactor, info).await
}

pub async fn execute(reactor: &Reactor, id: &str, actions: Vec<Action>) -> JobInfo {
    let info = reactor
        .execute(id, DEFAULT_BRANCH, actions)
        .await
        .unwrap();
    settle(reactor, info).await
}

// ---------------------------------------------------------------------------
// Recorders
// ---------------------------------------------------------------------------

/// Read model that remembers the size of every batch it indexed.
#[derive(Default)]
pub struct BatchRecorder {
    pub batches: Mutex<Vec<usize>>,
}

#[async_trait]
impl ReadModel for BatchRecorder {
    fn name(&self) -> &str {
        "batch-recorder"
    }

    async fn index_operations(&self, operations: &[OperationWithContext]) -> anyhow::Result<()> {
        self.batches.lock().unwrap().push(operations.len());
        Ok(())
    }
}

/// Processor that remembers the action types it was handed.
#[derive(Default)]
pub struct RecordingProcessor {
    pub seen: Mutex<Vec<String>>,
    pub disconnected: Mutex<bool>,
}

impl RecordingProcessor {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.lock().unwrap()
    }
}

#[async_trait]
impl Processor for RecordingProcessor {
    async fn on_operations(&self, operations: &[OperationWithContext]) -> anyhow::Result<()> {
        let mut seen = self.seen.lock().unwrap();
        seen.extend(
            operations
                .iter()
                .map(|row| row.operation.action.action_type.clone()),
        );
        Ok(())
    }

    async fn on_disconnect(&self) -> anyhow::Result<()> {
        *self.disconnected.lock().unwrap() = true;
        Ok(())
    }
}
