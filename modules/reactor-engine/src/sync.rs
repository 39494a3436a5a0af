//! Replication boundary. Transports live elsewhere; this module only moves
//! batches between a remote's mailbox and the reactor.
//!
//! Remote batches enter only through [`Reactor::load`]. Local commits leave
//! only through the store's ordinal tail.

use std::collections::BTreeMap;

use reactor_store::{Operation, Paging, StreamKey, HEADER_SCOPE};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::reactor::Reactor;
use crate::tracker::JobStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Applied,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord {
    pub id: String,
    pub remote_name: String,
    pub document_id: String,
    pub scopes: Vec<String>,
    pub branch: String,
    pub operations: Vec<Operation>,
    pub status: SyncStatus,
    pub error: Option<String>,
}

impl SyncRecord {
    pub fn new(
        remote_name: impl Into<String>,
        document_id: impl Into<String>,
        branch: impl Into<String>,
        operations: Vec<Operation>,
    ) -> Self {
        let mut scopes: Vec<String> = Vec::new();
        for op in &operations {
            if !scopes.contains(&op.action.scope) {
                scopes.push(op.action.scope.clone());
            }
        }
        Self {
            id: Uuid::new_v4().to_string(),
            remote_name: remote_name.into(),
            document_id: document_id.into(),
            scopes,
            branch: branch.into(),
            operations,
            status: SyncStatus::Pending,
            error: None,
        }
    }

    fn fail(&mut self, error: String) {
        self.status = SyncStatus::Error;
        self.error = Some(error);
    }

    /// Operations split per scope, header scope first so creation lands
    /// before the document's content.
    fn batches(&self) -> Vec<(String, Vec<Operation>)> {
        let mut by_scope: BTreeMap<&str, Vec<Operation>> = BTreeMap::new();
        for op in &self.operations {
            by_scope
                .entry(op.action.scope.as_str())
                .or_default()
                .push(op.clone());
        }
        let header = by_scope.remove(HEADER_SCOPE);
        header
            .map(|ops| (HEADER_SCOPE.to_string(), ops))
            .into_iter()
            .chain(by_scope.into_iter().map(|(s, ops)| (s.to_string(), ops)))
            .collect()
    }
}

/// The three queues of one sync channel.
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    /// Received, not yet applied.
    pub inbox: Vec<SyncRecord>,
    /// Sent, not yet acknowledged.
    pub outbox: Vec<SyncRecord>,
    /// Permanently rejected.
    pub dead_letter: Vec<SyncRecord>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive(&mut self, record: SyncRecord) {
        self.inbox.push(record);
    }

    /// Drop an outbox record the remote has confirmed.
    pub fn acknowledge(&mut self, record_id: &str) -> bool {
        let before = self.outbox.len();
        self.outbox.retain(|r| r.id != record_id);
        self.outbox.len() != before
    }

    pub fn pending_inbox(&self) -> usize {
        self.inbox
            .iter()
            .filter(|r| r.status == SyncStatus::Pending)
            .count()
    }
}

/// Queue every operation committed after `ordinal` into the outbox, one
/// record per stream. Returns the ordinal to resume from.
pub async fn export_since(
    reactor: &Reactor,
    mailbox: &mut Mailbox,
    remote_name: &str,
    ordinal: i64,
    paging: Option<&Paging>,
) -> Result<i64> {
    let page = reactor.store().get_since_id(ordinal, paging).await?;

    let mut cursor = ordinal;
    let mut order: Vec<StreamKey> = Vec::new();
    let mut grouped: BTreeMap<StreamKey, Vec<Operation>> = BTreeMap::new();
    for row in page.results {
        cursor = cursor.max(row.context.ordinal);
        let stream = row.stream();
        if !grouped.contains_key(&stream) {
            order.push(stream.clone());
        }
        grouped.entry(stream).or_default().push(row.operation);
    }

    let exported = order.len();
    for stream in order {
        let operations = grouped.remove(&stream).unwrap_or_default();
        mailbox.outbox.push(SyncRecord::new(
            remote_name,
            &stream.document_id,
            &stream.branch,
            operations,
        ));
    }
    if exported > 0 {
        info!(remote_name, records = exported, cursor, "Exported operations to outbox");
    }
    Ok(cursor)
}

/// Submit every pending inbox record through `load` and record the outcome.
/// Records rejected as malformed move to the dead-letter queue. Returns the
/// number of records applied.
pub async fn drain_inbox(reactor: &Reactor, mailbox: &mut Mailbox) -> usize {
    let mut applied = 0;
    let mut kept = Vec::new();

    for mut record in std::mem::take(&mut mailbox.inbox) {
        if record.status != SyncStatus::Pending {
            kept.push(record);
            continue;
        }

        let mut jobs = Vec::new();
        let mut rejected = None;
        for (scope, operations) in record.batches() {
            match reactor
                .load(&record.document_id, &record.branch, operations)
                .await
            {
                Ok(info) => jobs.push(info.id),
                Err(e) => {
                    warn!(record_id = %record.id, scope = %scope, error = %e, "Sync record rejected");
                    rejected = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = rejected {
            let dead = e.is_validation();
            record.fail(e.to_string());
            if dead {
                mailbox.dead_letter.push(record);
            } else {
                kept.push(record);
            }
            continue;
        }

        let mut failure = None;
        for job_id in jobs {
            let info = reactor.wait_for_job(&job_id).await;
            if info.status == JobStatus::Failed {
                failure = info.error.or_else(|| Some("load failed".to_string()));
                break;
            }
        }
        match failure {
            Some(error) => record.fail(error),
            None => {
                record.status = SyncStatus::Applied;
                applied += 1;
            }
        }
        kept.push(record);
    }

    mailbox.inbox = kept;
    applied
}
