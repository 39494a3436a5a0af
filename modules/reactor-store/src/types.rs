//! Core types for the operation store. Document-model agnostic.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Scope whose operations describe the document header itself.
pub const HEADER_SCOPE: &str = "header";

/// Branch used when a caller does not name one.
pub const DEFAULT_BRANCH: &str = "main";

/// A user intent. Reducers turn actions into state; the store records them
/// inside operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub action_type: String,
    pub scope: String,
    pub input: serde_json::Value,
    pub timestamp_utc: DateTime<Utc>,
}

impl Action {
    pub fn new(
        id: impl Into<String>,
        action_type: impl Into<String>,
        scope: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            action_type: action_type.into(),
            scope: scope.into(),
            input,
            timestamp_utc: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp_utc: DateTime<Utc>) -> Self {
        self.timestamp_utc = timestamp_utc;
        self
    }
}

/// One immutable entry in a stream's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Content-derived id, identical on every reactor. See [`derive_operation_id`].
    pub op_id: String,
    /// The op id of the row directly before this one in the stream.
    /// Assigned by the store at commit time.
    pub prev_op_id: Option<String>,
    pub index: u64,
    pub skip: u64,
    pub hash: String,
    pub timestamp_utc: DateTime<Utc>,
    pub action: Action,
    pub resulting_state: Option<serde_json::Value>,
    pub error: Option<String>,
}

/// Where an operation lives, plus the global ordinal assigned at commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub document_id: String,
    pub document_type: String,
    pub scope: String,
    pub branch: String,
    pub ordinal: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationWithContext {
    pub operation: Operation,
    pub context: OperationContext,
}

impl OperationWithContext {
    pub fn stream(&self) -> StreamKey {
        StreamKey::new(
            &self.context.document_id,
            &self.context.scope,
            &self.context.branch,
        )
    }
}

/// Identifies one operation log: (documentId, scope, branch).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub document_id: String,
    pub scope: String,
    pub branch: String,
}

impl StreamKey {
    pub fn new(document_id: &str, scope: &str, branch: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            scope: scope.to_string(),
            branch: branch.to_string(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.document_id, self.scope, self.branch)
    }
}

/// Per-scope revision counts for one document branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Revisions {
    pub revision: BTreeMap<String, u64>,
    pub latest_timestamp: Option<DateTime<Utc>>,
}

impl Revisions {
    pub fn of(&self, scope: &str) -> u64 {
        self.revision.get(scope).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Paging {
    /// Opaque resume position returned as `next_cursor` by a previous page.
    pub cursor: Option<String>,
    pub limit: usize,
}

impl Paging {
    pub fn first(limit: usize) -> Self {
        Self {
            cursor: None,
            limit,
        }
    }

    pub(crate) fn offset(&self) -> usize {
        self.cursor
            .as_deref()
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0)
    }
}

impl Default for Paging {
    fn default() -> Self {
        Self::first(100)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResults<T> {
    pub results: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> PagedResults<T> {
    /// Slice `all` according to `paging`. `all` must already be ordered.
    pub fn paginate(all: Vec<T>, paging: Option<&Paging>) -> Self {
        let Some(paging) = paging else {
            return Self {
                results: all,
                next_cursor: None,
            };
        };
        let offset = paging.offset();
        let total = all.len();
        let results: Vec<T> = all.into_iter().skip(offset).take(paging.limit).collect();
        let end = offset + results.len();
        Self {
            results,
            next_cursor: (end < total).then(|| end.to_string()),
        }
    }
}

/// Stable operation id: the same action on the same stream always yields the
/// same id, whatever index it ends up at.
pub fn derive_operation_id(document_id: &str, scope: &str, branch: &str, action_id: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [document_id, scope, branch, action_id] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// Content fingerprint of a state value.
pub fn hash_state(state: &serde_json::Value) -> String {
    // serde_json maps are ordered, so this serialization is canonical.
    let bytes = serde_json::to_vec(state).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_id_ignores_index_but_not_stream() {
        let a = derive_operation_id("doc", "global", "main", "action-1");
        let b = derive_operation_id("doc", "global", "main", "action-1");
        let c = derive_operation_id("doc", "local", "main", "action-1");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn operation_id_parts_do_not_run_together() {
        let a = derive_operation_id("ab", "c", "main", "x");
        let b = derive_operation_id("a", "bc", "main", "x");
        assert_ne!(a, b);
    }

    #[test]
    fn state_hash_is_key_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(hash_state(&a), hash_state(&b));
    }

    #[test]
    fn paginate_reports_next_cursor_until_exhausted() {
        let all: Vec<u32> = (0..5).collect();
        let page = PagedResults::paginate(all.clone(), Some(&Paging::first(2)));
        assert_eq!(page.results, vec![0, 1]);
        assert_eq!(page.next_cursor.as_deref(), Some("2"));

        let last = PagedResults::paginate(
            all,
            Some(&Paging {
                cursor: Some("4".into()),
                limit: 2,
            }),
        );
        assert_eq!(last.results, vec![4]);
        assert!(last.next_cursor.is_none());
    }
}
