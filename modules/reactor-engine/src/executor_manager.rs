//! Worker pool draining the job queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::event_bus::{EventBus, ReactorEvent};
use crate::executor::JobExecutor;
use crate::queue::JobQueue;
use crate::tracker::JobTracker;
use crate::types::Job;

struct Worker {
    executor: Arc<JobExecutor>,
    queue: Arc<JobQueue>,
    tracker: Arc<JobTracker>,
    event_bus: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
}

impl Worker {
    async fn run(self: Arc<Self>, worker_id: usize) {
        while let Some(job) = self.queue.dequeue().await {
            self.process(worker_id, &job).await;
            // Released after the events, so the next job on this document
            // observes this one's read models.
            self.queue.release(&job);
        }
        info!(worker_id, "Worker stopped");
    }

    async fn process(&self, worker_id: usize, job: &Job) {
        self.tracker.mark_running(&job.id);

        match self.executor.execute(job, Some(self.cancel.as_ref())).await {
            Ok(operations) => {
                self.tracker.mark_completed(&job.id, &operations);
                let event = ReactorEvent::JobWriteReady {
                    job_id: job.id.clone(),
                    operations,
                };
                if let Err(e) = self.event_bus.emit(event).await {
                    warn!(worker_id, job_id = %job.id, error = %e, "Write-ready delivery failed");
                }
            }
            Err(e) => {
                warn!(worker_id, job_id = %job.id, stream = %job.stream, error = %e, "Job failed");
                self.tracker.mark_failed(&job.id, e.to_string());
                let event = ReactorEvent::JobFailed {
                    job_id: job.id.clone(),
                    error: e.to_string(),
                };
                if let Err(e) = self.event_bus.emit(event).await {
                    warn!(worker_id, job_id = %job.id, error = %e, "Failure delivery failed");
                }
            }
        }
    }
}

/// Owns the spawned workers. Stopping closes the queue and waits for each
/// worker to finish its current job.
pub struct ExecutorManager {
    queue: Arc<JobQueue>,
    cancel: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutorManager {
    pub fn start(
        executor: Arc<JobExecutor>,
        queue: Arc<JobQueue>,
        tracker: Arc<JobTracker>,
        event_bus: Arc<EventBus>,
        worker_count: usize,
    ) -> Self {
        let cancel = Arc::new(AtomicBool::new(false));
        let worker = Arc::new(Worker {
            executor,
            queue: queue.clone(),
            tracker,
            event_bus,
            cancel: cancel.clone(),
        });

        let worker_count = worker_count.max(1);
        let handles = (0..worker_count)
            .map(|worker_id| tokio::spawn(worker.clone().run(worker_id)))
            .collect();
        info!(worker_count, "Executor workers started");

        Self {
            queue,
            cancel,
            handles: Mutex::new(handles),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Close the queue, abort writes that have not opened a transaction yet,
    /// and wait for the workers. Returns the number of jobs left queued.
    pub async fn stop(&self) -> usize {
        let pending = self.queue.size();
        self.queue.close();
        self.cancel.store(true, Ordering::SeqCst);

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker panicked");
            }
        }
        pending
    }
}
