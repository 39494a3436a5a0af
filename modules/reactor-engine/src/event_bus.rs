//! In-process publish/subscribe. Decouples commit from indexing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use reactor_store::OperationWithContext;
use tracing::warn;

use crate::error::{ReactorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    JobAvailable,
    JobWriteReady,
    JobReadReady,
    JobFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReactorEvent {
    /// A job was queued.
    JobAvailable { job_id: String },
    /// A job committed. Carries exactly the committed rows.
    JobWriteReady {
        job_id: String,
        operations: Vec<OperationWithContext>,
    },
    /// Every read model has been handed the batch.
    JobReadReady {
        job_id: String,
        operations: Vec<OperationWithContext>,
    },
    JobFailed { job_id: String, error: String },
}

impl ReactorEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ReactorEvent::JobAvailable { .. } => EventKind::JobAvailable,
            ReactorEvent::JobWriteReady { .. } => EventKind::JobWriteReady,
            ReactorEvent::JobReadReady { .. } => EventKind::JobReadReady,
            ReactorEvent::JobFailed { .. } => EventKind::JobFailed,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            ReactorEvent::JobAvailable { job_id }
            | ReactorEvent::JobWriteReady { job_id, .. }
            | ReactorEvent::JobReadReady { job_id, .. }
            | ReactorEvent::JobFailed { job_id, .. } => job_id,
        }
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &ReactorEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Subscriber { id, kind, handler });
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every subscriber of its kind, one at a time, in
    /// registration order. A failing handler does not stop the rest; all
    /// failures come back as one error.
    pub async fn emit(&self, event: ReactorEvent) -> Result<()> {
        let kind = event.kind();
        // Snapshot so handlers can subscribe/unsubscribe without affecting this delivery.
        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.handler.clone())
            .collect();

        let mut errors = Vec::new();
        for handler in handlers {
            if let Err(e) = handler.handle(&event).await {
                warn!(job_id = event.job_id(), ?kind, error = %e, "Event handler failed");
                errors.push(e.to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ReactorError::EventBus(errors.join("; ")))
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn handle(&self, _event: &ReactorEvent) -> anyhow::Result<()> {
            self.log.lock().unwrap().push(self.name);
            if self.fail {
                anyhow::bail!("{} failed", self.name);
            }
            Ok(())
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<Recorder> {
        Arc::new(Recorder {
            name,
            log: log.clone(),
            fail,
        })
    }

    fn available() -> ReactorEvent {
        ReactorEvent::JobAvailable {
            job_id: "job-1".into(),
        }
    }

    #[tokio::test]
    async fn handlers_run_in_registration_order_and_errors_aggregate() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::JobAvailable, recorder("first", &log, true));
        bus.subscribe(EventKind::JobAvailable, recorder("second", &log, false));
        bus.subscribe(EventKind::JobAvailable, recorder("third", &log, true));
        bus.subscribe(EventKind::JobFailed, recorder("other-kind", &log, false));

        let err = bus.emit(available()).await.unwrap_err();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
        let message = err.to_string();
        assert!(message.contains("first failed"));
        assert!(message.contains("third failed"));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe(EventKind::JobAvailable, recorder("only", &log, false));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(available()).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    struct SelfRemoving {
        bus: Arc<EventBus>,
        id: Mutex<Option<SubscriptionId>>,
        calls: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl EventHandler for SelfRemoving {
        async fn handle(&self, _event: &ReactorEvent) -> anyhow::Result<()> {
            *self.calls.lock().unwrap() += 1;
            if let Some(id) = self.id.lock().unwrap().take() {
                self.bus.unsubscribe(id);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn unsubscribing_during_emit_applies_to_the_next_emit() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(Mutex::new(0));
        let remover = Arc::new(SelfRemoving {
            bus: bus.clone(),
            id: Mutex::new(None),
            calls: calls.clone(),
        });
        let id = bus.subscribe(EventKind::JobAvailable, remover.clone());
        *remover.id.lock().unwrap() = Some(id);
        bus.subscribe(EventKind::JobAvailable, recorder("after", &log, false));

        bus.emit(available()).await.unwrap();
        bus.emit(available()).await.unwrap();

        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(*log.lock().unwrap(), vec!["after", "after"]);
    }
}
