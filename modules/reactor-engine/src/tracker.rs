//! Job status tracking and consistency tokens.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reactor_store::OperationWithContext;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::event_bus::{EventHandler, ReactorEvent};

// ---------------------------------------------------------------------------
// Consistency tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyCoordinate {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
    pub operation_index: u64,
}

impl ConsistencyCoordinate {
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.document_id, self.scope, self.branch)
    }
}

/// Opaque proof that a set of writes was observed. Compare with `>=` to ask
/// "has everything in `other` been seen by `self`".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsistencyToken {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub coordinates: Vec<ConsistencyCoordinate>,
}

impl ConsistencyToken {
    pub fn empty() -> Self {
        Self {
            version: 1,
            created_at: Utc::now(),
            coordinates: Vec::new(),
        }
    }

    /// One coordinate per stream, holding the highest index in `operations`.
    pub fn from_operations(operations: &[OperationWithContext]) -> Self {
        let mut highest: BTreeMap<String, ConsistencyCoordinate> = BTreeMap::new();
        for row in operations {
            let coordinate = ConsistencyCoordinate {
                document_id: row.context.document_id.clone(),
                scope: row.context.scope.clone(),
                branch: row.context.branch.clone(),
                operation_index: row.operation.index,
            };
            highest
                .entry(coordinate.key())
                .and_modify(|c| c.operation_index = c.operation_index.max(coordinate.operation_index))
                .or_insert(coordinate);
        }
        Self {
            version: 1,
            created_at: Utc::now(),
            coordinates: highest.into_values().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    fn high_water(&self) -> BTreeMap<String, u64> {
        let mut marks = BTreeMap::new();
        for c in &self.coordinates {
            let entry = marks.entry(c.key()).or_insert(c.operation_index);
            *entry = (*entry).max(c.operation_index);
        }
        marks
    }

    /// Every coordinate of `other` is at or below one of ours.
    pub fn covers(&self, other: &ConsistencyToken) -> bool {
        let mine = self.high_water();
        other
            .high_water()
            .iter()
            .all(|(key, index)| mine.get(key).is_some_and(|m| m >= index))
    }
}

impl PartialEq for ConsistencyToken {
    fn eq(&self, other: &Self) -> bool {
        self.high_water() == other.high_water()
    }
}

impl PartialOrd for ConsistencyToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self.covers(other), other.covers(self)) {
            (true, true) => Some(Ordering::Equal),
            (true, false) => Some(Ordering::Greater),
            (false, true) => Some(Ordering::Less),
            (false, false) => None,
        }
    }
}

/// Highest observed index per stream. Never regresses.
#[derive(Default)]
pub struct ConsistencyTracker {
    marks: Mutex<HashMap<String, u64>>,
    notify: Notify,
}

impl ConsistencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, coordinates: &[ConsistencyCoordinate]) {
        {
            let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
            for c in coordinates {
                let entry = marks.entry(c.key()).or_insert(c.operation_index);
                *entry = (*entry).max(c.operation_index);
            }
        }
        self.notify.notify_waiters();
    }

    /// Highest index seen for `"{document}:{scope}:{branch}"`.
    pub fn get_latest(&self, key: &str) -> Option<u64> {
        self.marks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
    }

    pub fn is_satisfied(&self, token: &ConsistencyToken) -> bool {
        let marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        token
            .coordinates
            .iter()
            .all(|c| marks.get(&c.key()).is_some_and(|m| *m >= c.operation_index))
    }

    /// Resolve once every coordinate of `token` has been observed. No timeout;
    /// wrap in `tokio::time::timeout` for a deadline.
    pub async fn wait_for(&self, token: &ConsistencyToken) {
        loop {
            let notified = self.notify.notified();
            if self.is_satisfied(token) {
                return;
            }
            notified.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Job tracking
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    ReadModelsReady,
    Failed,
}

impl JobStatus {
    /// No further transitions expected from the executor.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::ReadModelsReady | JobStatus::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub operation_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Most recent first.
    pub error_history: Vec<String>,
    pub consistency_token: ConsistencyToken,
    pub result: Option<JobResult>,
}

impl JobInfo {
    fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            error: None,
            error_history: Vec::new(),
            consistency_token: ConsistencyToken::empty(),
            result: None,
        }
    }
}

/// Settled jobs are kept for `retention` after they finish, then pruned the
/// next time a job is registered.
pub struct JobTracker {
    jobs: RwLock<HashMap<String, JobInfo>>,
    consistency: Arc<ConsistencyTracker>,
    error_history_limit: usize,
    retention: chrono::Duration,
    changed: Notify,
}

impl JobTracker {
    pub fn new(consistency: Arc<ConsistencyTracker>, error_history_limit: usize) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            consistency,
            error_history_limit,
            retention: chrono::Duration::hours(1),
            changed: Notify::new(),
        }
    }

    pub fn with_retention(mut self, retention: std::time::Duration) -> Self {
        self.retention = chrono::Duration::from_std(retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        self
    }

    /// Drop settled jobs that finished longer than the retention window ago.
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now() - self.retention;
        let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
        let before = jobs.len();
        jobs.retain(|_, info| {
            !(info.status.is_settled() && info.completed_at.is_some_and(|at| at <= cutoff))
        });
        let pruned = before - jobs.len();
        if pruned > 0 {
            debug!(pruned, "Pruned settled jobs");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(&self, job_id: &str, f: impl FnOnce(&mut JobInfo)) {
        {
            let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
            if let Some(info) = jobs.get_mut(job_id) {
                f(info);
                debug!(job_id, status = ?info.status, "Job status changed");
            }
        }
        self.changed.notify_waiters();
    }

    pub fn register_pending(&self, job_id: &str) -> JobInfo {
        self.prune();
        let info = JobInfo::pending(job_id);
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string(), info.clone());
        info
    }

    pub fn mark_running(&self, job_id: &str) {
        self.update(job_id, |info| info.status = JobStatus::Running);
    }

    pub fn mark_completed(&self, job_id: &str, operations: &[OperationWithContext]) {
        self.update(job_id, |info| {
            info.status = JobStatus::Completed;
            info.completed_at = Some(Utc::now());
            info.result = Some(JobResult {
                operation_count: operations.len(),
            });
        });
    }

    /// Read models have seen the batch: advance the tracker, hand out a token.
    pub fn mark_read_ready(&self, job_id: &str, operations: &[OperationWithContext]) {
        let token = ConsistencyToken::from_operations(operations);
        self.consistency.update(&token.coordinates);
        self.update(job_id, |info| {
            // A job never moves backwards out of FAILED.
            if info.status != JobStatus::Failed {
                info.status = JobStatus::ReadModelsReady;
                info.consistency_token = token;
            }
        });
    }

    pub fn mark_failed(&self, job_id: &str, error: impl Into<String>) {
        let error = error.into();
        let limit = self.error_history_limit.max(1);
        self.update(job_id, |info| {
            info.status = JobStatus::Failed;
            info.completed_at = Some(Utc::now());
            info.error_history.insert(0, error.clone());
            info.error_history.truncate(limit);
            info.error = Some(error);
        });
    }

    /// Status of a job. Unknown ids report FAILED with "Job not found".
    pub fn get(&self, job_id: &str) -> JobInfo {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| {
                let mut info = JobInfo::pending(job_id);
                info.status = JobStatus::Failed;
                info.error = Some("Job not found".to_string());
                info.error_history = vec!["Job not found".to_string()];
                info
            })
    }

    /// Wait until the job satisfies `done`. Unknown jobs resolve immediately.
    pub async fn wait_until(&self, job_id: &str, done: impl Fn(&JobInfo) -> bool) -> JobInfo {
        loop {
            let notified = self.changed.notified();
            let known = self
                .jobs
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .contains_key(job_id);
            let info = self.get(job_id);
            if !known || done(&info) {
                return info;
            }
            notified.await;
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|info| info.status == status)
            .count()
    }
}

#[async_trait]
impl EventHandler for JobTracker {
    async fn handle(&self, event: &ReactorEvent) -> anyhow::Result<()> {
        if let ReactorEvent::JobReadReady { job_id, operations } = event {
            self.mark_read_ready(job_id, operations);
        }
        Ok(())
    }
}
