//! Reactor running on the Postgres stores.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

mod common;

use std::sync::Arc;

use common::*;
use reactor_engine::{OperationFilter, Reactor, ReactorConfig};
use reactor_store::{migrate, PgKeyframeStore, PgOperationStore, DEFAULT_BRANCH};
use serde_json::json;
use sqlx::PgPool;

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    migrate(&pool).await.ok()?;
    Some(pool)
}

async fn pg_reactor(pool: &PgPool, config: ReactorConfig) -> Reactor {
    Reactor::builder(
        Arc::new(PgOperationStore::new(pool.clone())),
        Arc::new(PgKeyframeStore::new(pool.clone())),
    )
    .with_config(config)
    .with_document_model(profile_model())
    .with_document_model(drive_model())
    .build()
    .await
    .unwrap()
}

fn fresh_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[tokio::test]
async fn execute_and_read_back() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let mut config = ReactorConfig::default();
    config.write_cache.keyframe_interval = 2;
    let reactor = pg_reactor(&pool, config).await;
    let id = fresh_id();

    create_profile(&reactor, &id).await;
    execute(&reactor, &id, vec![set_name("a-1", "Alice", 1)]).await;
    execute(&reactor, &id, vec![increment("a-2"), increment("a-3")]).await;

    // Cold read from the database, starting at the persisted keyframe.
    reactor.cache().evict(&id, None, None);
    let doc = reactor.get(&id, DEFAULT_BRANCH, None).await.unwrap();
    assert_eq!(doc.revision("global"), 3);
    assert_eq!(doc.scope_state("global"), Some(&json!({"name": "Alice", "count": 2})));

    reactor.kill().await;
}

#[tokio::test]
async fn postgres_history_reshuffles_into_a_memory_reactor() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let a = pg_reactor(&pool, ReactorConfig::default()).await;
    let b = memory_reactor().await;
    let id = fresh_id();

    create_profile(&a, &id).await;
    let filter = OperationFilter {
        branch: None,
        scopes: Some(vec!["header".to_string()]),
    };
    let header = a
        .get_operations(&id, &filter, None, None)
        .await
        .unwrap()
        .remove("header")
        .unwrap()
        .results;
    let info = b.reactor.load(&id, DEFAULT_BRANCH, header).await.unwrap();
    settle(&b.reactor, info).await;

    execute(&a, &id, vec![set_name("a-1", "A1", 1)]).await;
    execute(&b.reactor, &id, vec![set_name("b-1", "B1", 2)]).await;

    let filter = OperationFilter {
        branch: None,
        scopes: Some(vec!["global".to_string()]),
    };
    let from_a = a
        .get_operations(&id, &filter, None, None)
        .await
        .unwrap()
        .remove("global")
        .unwrap()
        .results;
    let info = b.reactor.load(&id, DEFAULT_BRANCH, from_a).await.unwrap();
    settle(&b.reactor, info).await;

    let doc = b.reactor.get(&id, DEFAULT_BRANCH, None).await.unwrap();
    assert_eq!(doc.scope_state("global").unwrap()["name"], json!("A1"));

    a.kill().await;
}
