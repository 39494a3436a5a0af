//! Read models and the coordinator that fans commits out to them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use reactor_store::{KeyframeStore, OperationStore, OperationWithContext, Paging};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event_bus::{EventBus, EventHandler, EventKind, ReactorEvent, SubscriptionId};

/// Anything that indexes committed operations into a derived structure.
///
/// Delivery is at-least-once, so `index_operations` must be idempotent.
#[async_trait]
pub trait ReadModel: Send + Sync {
    fn name(&self) -> &str;

    /// Durable models keep their index across restarts and resume after the
    /// ordinal recorded for them. Others rebuild from the start of the log.
    fn is_durable(&self) -> bool {
        false
    }

    async fn index_operations(&self, operations: &[OperationWithContext]) -> anyhow::Result<()>;
}

/// On each write-ready event, runs every read model concurrently and then
/// emits one read-ready event, unless stopped in the meantime.
///
/// A read model error is logged and does not hold back the signal: "ready"
/// means every model was attempted.
pub struct ReadModelCoordinator {
    read_models: Vec<Arc<dyn ReadModel>>,
    event_bus: Arc<EventBus>,
    view_states: Option<Arc<dyn KeyframeStore>>,
    running: AtomicBool,
}

impl ReadModelCoordinator {
    pub fn new(event_bus: Arc<EventBus>, read_models: Vec<Arc<dyn ReadModel>>) -> Self {
        Self {
            read_models,
            event_bus,
            view_states: None,
            running: AtomicBool::new(false),
        }
    }

    /// Record durable read-model progress in `view_states`.
    pub fn with_view_states(mut self, view_states: Arc<dyn KeyframeStore>) -> Self {
        self.view_states = Some(view_states);
        self
    }

    /// Subscribe to write-ready events on the bus this coordinator emits on.
    pub fn attach(self: &Arc<Self>) -> SubscriptionId {
        self.event_bus
            .subscribe(EventKind::JobWriteReady, self.clone())
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn read_model_names(&self) -> Vec<String> {
        self.read_models.iter().map(|m| m.name().to_string()).collect()
    }

    /// Feed each read model every committed operation it has not seen, in
    /// commit order, a page at a time. Runs before the coordinator starts.
    ///
    /// A model that fails is left where it stopped and logged; the others
    /// still catch up. Returns the number of rows indexed across all models.
    pub async fn catch_up(&self, store: &dyn OperationStore, page_size: usize) -> Result<usize> {
        let paging = Paging::first(page_size.max(1));
        let mut indexed = 0;

        for model in &self.read_models {
            let mut after = self.resume_point(model.as_ref()).await?;
            let start = after;
            loop {
                let page = store.get_since_id(after, Some(&paging)).await?;
                let Some(last) = page.results.last().map(|row| row.context.ordinal) else {
                    break;
                };
                if let Err(e) = model.index_operations(&page.results).await {
                    warn!(read_model = model.name(), after, error = %e, "Read model catch-up failed");
                    break;
                }
                indexed += page.results.len();
                self.record_progress(model.as_ref(), last).await;
                after = last;
                if page.results.len() < paging.limit {
                    break;
                }
            }
            if after > start {
                info!(read_model = model.name(), from = start, to = after, "Read model caught up");
            }
        }
        Ok(indexed)
    }

    async fn resume_point(&self, model: &dyn ReadModel) -> Result<i64> {
        match &self.view_states {
            Some(view_states) if model.is_durable() => {
                Ok(view_states.get_view_state(model.name()).await?.unwrap_or(0))
            }
            _ => Ok(0),
        }
    }

    async fn record_progress(&self, model: &dyn ReadModel, ordinal: i64) {
        let Some(view_states) = &self.view_states else {
            return;
        };
        if !model.is_durable() {
            return;
        }
        if let Err(e) = view_states.put_view_state(model.name(), ordinal).await {
            warn!(read_model = model.name(), ordinal, error = %e, "Failed to record view state");
        }
    }

    async fn index_batch(&self, operations: &[OperationWithContext]) {
        let results = join_all(
            self.read_models
                .iter()
                .map(|model| async move { (model, model.index_operations(operations).await) }),
        )
        .await;

        let highest = operations.iter().map(|row| row.context.ordinal).max();
        for (model, result) in results {
            match result {
                Ok(()) => {
                    if let Some(ordinal) = highest {
                        self.record_progress(model.as_ref(), ordinal).await;
                    }
                }
                Err(e) => {
                    warn!(read_model = model.name(), error = %e, "Read model indexing failed");
                }
            }
        }
    }
}

#[async_trait]
impl EventHandler for ReadModelCoordinator {
    async fn handle(&self, event: &ReactorEvent) -> anyhow::Result<()> {
        let ReactorEvent::JobWriteReady { job_id, operations } = event else {
            return Ok(());
        };
        if !self.is_running() {
            return Ok(());
        }

        self.index_batch(operations).await;

        if !self.is_running() {
            debug!(job_id, "Coordinator stopped during indexing, suppressing ready signal");
            return Ok(());
        }
        self.event_bus
            .emit(ReactorEvent::JobReadReady {
                job_id: job_id.clone(),
                operations: operations.clone(),
            })
            .await?;
        Ok(())
    }
}
