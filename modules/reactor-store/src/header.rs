//! Document header, rebuilt purely from the ordered "header"-scope slice.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::visible_operations;
use crate::error::{Result, StoreError};
use crate::types::{Operation, HEADER_SCOPE};

pub const CREATE_DOCUMENT: &str = "CREATE_DOCUMENT";
pub const UPGRADE_DOCUMENT: &str = "UPGRADE_DOCUMENT";
pub const DELETE_DOCUMENT: &str = "DELETE_DOCUMENT";

/// True for the lifecycle actions that live in the header scope.
pub fn is_header_action(action_type: &str) -> bool {
    matches!(
        action_type,
        CREATE_DOCUMENT | UPGRADE_DOCUMENT | DELETE_DOCUMENT
    )
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signing {
    pub nonce: String,
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentHeader {
    pub id: String,
    pub document_type: String,
    pub slug: Option<String>,
    pub version: u32,
    pub created_at_utc: DateTime<Utc>,
    pub last_modified_at_utc: DateTime<Utc>,
    /// scope -> number of operations in that scope's log.
    pub revision: BTreeMap<String, u64>,
    pub signing: Signing,
    pub deleted_at_utc: Option<DateTime<Utc>>,
}

impl DocumentHeader {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at_utc.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentInput {
    pub document_id: String,
    pub model: String,
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub signing: Signing,
    pub created_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeDocumentInput {
    pub document_id: String,
    pub from_version: u32,
    pub to_version: u32,
    /// Initial state per scope, set when a document is first created.
    #[serde(default)]
    pub initial_state: Option<BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteDocumentInput {
    pub document_id: String,
}

/// Header plus the per-scope initial state carried by UPGRADE_DOCUMENT.
#[derive(Debug, Clone, PartialEq)]
pub struct HeaderReplay {
    pub header: DocumentHeader,
    pub initial_state: BTreeMap<String, serde_json::Value>,
}

/// Fold the header-scope log into a header. `ops` must be ordered by index.
///
/// Identity, type and signing come from CREATE_DOCUMENT only; later header
/// operations touch version, deletion and revision bookkeeping.
pub fn replay_header(ops: &[Operation]) -> Result<HeaderReplay> {
    let visible = visible_operations(ops);
    let mut iter = visible.iter();

    let create = iter
        .next()
        .ok_or_else(|| StoreError::DocumentNotFound("empty header scope".into()))?;
    if create.action.action_type != CREATE_DOCUMENT {
        return Err(StoreError::InvalidOperation(format!(
            "first header operation must be {CREATE_DOCUMENT}, found {}",
            create.action.action_type
        )));
    }
    let input: CreateDocumentInput = serde_json::from_value(create.action.input.clone())?;

    let mut header = DocumentHeader {
        id: input.document_id,
        document_type: input.model,
        slug: input.slug,
        version: input.version,
        created_at_utc: input.created_at_utc,
        last_modified_at_utc: create.timestamp_utc,
        revision: BTreeMap::new(),
        signing: input.signing,
        deleted_at_utc: None,
    };
    let mut initial_state = BTreeMap::new();

    for op in iter {
        match op.action.action_type.as_str() {
            UPGRADE_DOCUMENT => {
                let upgrade: UpgradeDocumentInput = serde_json::from_value(op.action.input.clone())?;
                header.version = upgrade.to_version;
                if let Some(state) = upgrade.initial_state {
                    initial_state.extend(state);
                }
            }
            DELETE_DOCUMENT => {
                header.deleted_at_utc = Some(op.timestamp_utc);
            }
            other => {
                return Err(StoreError::InvalidOperation(format!(
                    "unexpected header action {other}"
                )));
            }
        }
        header.last_modified_at_utc = header.last_modified_at_utc.max(op.timestamp_utc);
    }

    let header_revision = ops.last().map(|op| op.index + 1).unwrap_or(0);
    header.revision.insert(HEADER_SCOPE.to_string(), header_revision);

    Ok(HeaderReplay {
        header,
        initial_state,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Action;
    use chrono::TimeZone;
    use serde_json::json;

    fn header_op(index: u64, action_type: &str, input: serde_json::Value) -> Operation {
        let ts = Utc.timestamp_opt(1_700_000_000 + index as i64, 0).unwrap();
        Operation {
            op_id: format!("op-{index}"),
            prev_op_id: None,
            index,
            skip: 0,
            hash: String::new(),
            timestamp_utc: ts,
            action: Action::new(format!("a-{index}"), action_type, HEADER_SCOPE, input)
                .with_timestamp(ts),
            resulting_state: None,
            error: None,
        }
    }

    fn create_input() -> serde_json::Value {
        json!({
            "documentId": "doc-1",
            "model": "powerhouse/budget",
            "version": 1,
            "slug": "budget",
            "signing": {"nonce": "n-1", "publicKey": "pk"},
            "createdAtUtc": "2023-11-14T22:13:20Z",
        })
    }

    #[test]
    fn identity_survives_interleaved_header_ops() {
        let just_created = replay_header(&[header_op(0, CREATE_DOCUMENT, create_input())]).unwrap();

        let ops = vec![
            header_op(0, CREATE_DOCUMENT, create_input()),
            header_op(
                1,
                UPGRADE_DOCUMENT,
                json!({"documentId": "doc-1", "fromVersion": 1, "toVersion": 2}),
            ),
            header_op(
                2,
                UPGRADE_DOCUMENT,
                json!({"documentId": "doc-1", "fromVersion": 2, "toVersion": 3}),
            ),
        ];
        let upgraded = replay_header(&ops).unwrap();

        assert_eq!(upgraded.header.id, just_created.header.id);
        assert_eq!(upgraded.header.document_type, just_created.header.document_type);
        assert_eq!(upgraded.header.signing, just_created.header.signing);
        assert_eq!(upgraded.header.slug, just_created.header.slug);
        assert_eq!(upgraded.header.version, 3);
        assert_eq!(upgraded.header.revision.get(HEADER_SCOPE), Some(&3));
    }

    #[test]
    fn upgrade_carries_initial_state() {
        let ops = vec![
            header_op(0, CREATE_DOCUMENT, create_input()),
            header_op(
                1,
                UPGRADE_DOCUMENT,
                json!({
                    "documentId": "doc-1",
                    "fromVersion": 0,
                    "toVersion": 1,
                    "initialState": {"global": {"name": ""}},
                }),
            ),
        ];
        let replay = replay_header(&ops).unwrap();
        assert_eq!(replay.initial_state.get("global"), Some(&json!({"name": ""})));
    }

    #[test]
    fn delete_marks_header() {
        let ops = vec![
            header_op(0, CREATE_DOCUMENT, create_input()),
            header_op(1, DELETE_DOCUMENT, json!({"documentId": "doc-1"})),
        ];
        let replay = replay_header(&ops).unwrap();
        assert!(replay.header.is_deleted());
    }

    #[test]
    fn header_must_start_with_create() {
        let ops = vec![header_op(
            0,
            DELETE_DOCUMENT,
            json!({"documentId": "doc-1"}),
        )];
        assert!(matches!(
            replay_header(&ops),
            Err(StoreError::InvalidOperation(_))
        ));
    }
}
