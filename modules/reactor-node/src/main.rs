//! Reactor node: runs a reactor against Postgres until Ctrl-C.
//!
//! This binary registers no document models. It applies migrations, lets
//! read models catch up and drains jobs, but creates, executes and loads
//! fail with "No document model registered" until an embedding application
//! builds its own node with `with_document_model` for its types. Treat it
//! as the template for that embedding.

use std::sync::Arc;

use anyhow::Result;
use reactor_engine::Reactor;
use reactor_store::{migrate, PgKeyframeStore, PgOperationStore};
use sqlx::postgres::PgPoolOptions;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::NodeConfig;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("reactor=info".parse()?))
        .init();

    info!("Reactor node starting...");

    let config = NodeConfig::from_env()?;
    let reactor_config = config.reactor_config()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    migrate(&pool).await?;
    info!("Migrations applied");

    let reactor = Reactor::builder(
        Arc::new(PgOperationStore::new(pool.clone())),
        Arc::new(PgKeyframeStore::new(pool.clone())),
    )
    .with_config(reactor_config)
    .build()
    .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    let status = reactor.kill().await;
    info!(pending_jobs = status.pending_jobs, "Reactor node stopped");
    pool.close().await;
    Ok(())
}
