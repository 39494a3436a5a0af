//! Moving operations between two reactors through sync mailboxes.

mod common;

use common::*;
use reactor_engine::{drain_inbox, export_since, Mailbox, SyncRecord, SyncStatus};
use reactor_store::{DEFAULT_BRANCH, HEADER_SCOPE};
use serde_json::json;

#[tokio::test]
async fn exported_outbox_replays_on_a_remote() {
    let a = memory_reactor().await;
    let b = memory_reactor().await;
    create_profile(&a.reactor, "doc-1").await;
    execute(&a.reactor, "doc-1", vec![set_name("a-1", "Alice", 1)]).await;
    execute(&a.reactor, "doc-1", vec![increment("a-2")]).await;

    let mut outgoing = Mailbox::new();
    let cursor = export_since(&a.reactor, &mut outgoing, "reactor-b", 0, None)
        .await
        .unwrap();
    assert_eq!(cursor, 4);
    assert_eq!(outgoing.outbox.len(), 2);
    assert_eq!(outgoing.outbox[0].scopes, vec![HEADER_SCOPE.to_string()]);
    assert_eq!(outgoing.outbox[1].scopes, vec!["global".to_string()]);
    assert_eq!(outgoing.outbox[1].operations.len(), 2);

    let mut incoming = Mailbox::new();
    for record in outgoing.outbox.clone() {
        incoming.receive(record);
    }
    assert_eq!(incoming.pending_inbox(), 2);

    let applied = drain_inbox(&b.reactor, &mut incoming).await;
    assert_eq!(applied, 2);
    assert_eq!(incoming.pending_inbox(), 0);
    assert!(incoming
        .inbox
        .iter()
        .all(|r| r.status == SyncStatus::Applied));

    let doc = b.reactor.get("doc-1", DEFAULT_BRANCH, None).await.unwrap();
    assert_eq!(doc.scope_state("global"), Some(&json!({"name": "Alice", "count": 1})));

    // Nothing new after the cursor.
    let mut again = Mailbox::new();
    let next = export_since(&a.reactor, &mut again, "reactor-b", cursor, None)
        .await
        .unwrap();
    assert_eq!(next, cursor);
    assert!(again.outbox.is_empty());

    let id = outgoing.outbox[0].id.clone();
    assert!(outgoing.acknowledge(&id));
    assert!(!outgoing.acknowledge(&id));
}

#[tokio::test]
async fn malformed_records_go_to_dead_letter() {
    let a = memory_reactor().await;
    let b = memory_reactor().await;
    create_profile(&a.reactor, "doc-1").await;

    let mut outgoing = Mailbox::new();
    export_since(&a.reactor, &mut outgoing, "reactor-b", 0, None)
        .await
        .unwrap();
    let mut record = outgoing.outbox.remove(0);
    record.operations[0].hash.clear();

    let mut incoming = Mailbox::new();
    incoming.receive(record);
    let applied = drain_inbox(&b.reactor, &mut incoming).await;

    assert_eq!(applied, 0);
    assert!(incoming.inbox.is_empty());
    assert_eq!(incoming.dead_letter.len(), 1);
    assert_eq!(incoming.dead_letter[0].status, SyncStatus::Error);
    assert!(incoming.dead_letter[0]
        .error
        .as_deref()
        .unwrap()
        .contains("no hash"));
}

#[tokio::test]
async fn records_for_unknown_documents_end_in_error() {
    let a = memory_reactor().await;
    let b = memory_reactor().await;
    create_profile(&a.reactor, "doc-1").await;
    execute(&a.reactor, "doc-1", vec![set_name("a-1", "Alice", 1)]).await;

    let mut outgoing = Mailbox::new();
    export_since(&a.reactor, &mut outgoing, "reactor-b", 0, None)
        .await
        .unwrap();
    // Content without its header.
    let content: SyncRecord = outgoing.outbox.remove(1);

    let mut incoming = Mailbox::new();
    incoming.receive(content);
    let applied = drain_inbox(&b.reactor, &mut incoming).await;

    assert_eq!(applied, 0);
    assert!(incoming.dead_letter.is_empty());
    assert_eq!(incoming.inbox[0].status, SyncStatus::Error);
    assert!(incoming.inbox[0].error.as_deref().unwrap().contains("doc-1"));
}
