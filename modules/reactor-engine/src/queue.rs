//! Job queue: per-stream FIFO, at most one job in flight per document.
//!
//! A job may name other jobs in its queue hint. Its stream stays parked
//! until none of them is queued or running any more.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use reactor_store::StreamKey;
use tokio::sync::Notify;

use crate::error::{ReactorError, Result};
use crate::types::Job;

#[derive(Default)]
struct QueueState {
    streams: BTreeMap<StreamKey, VecDeque<(u64, Job)>>,
    /// document id -> job id currently executing
    executing: HashMap<String, String>,
    withdrawn: HashMap<String, Instant>,
    next_seq: u64,
    blocked: bool,
    closed: bool,
    paused: bool,
}

impl QueueState {
    fn queued(&self) -> usize {
        self.streams.values().map(VecDeque::len).sum()
    }

    fn is_pending(&self, job_id: &str) -> bool {
        self.executing.values().any(|id| id == job_id)
            || self
                .streams
                .values()
                .flatten()
                .any(|(_, job)| job.id == job_id)
    }

    fn hints_met(&self, job: &Job) -> bool {
        job.queue_hint.iter().all(|id| !self.is_pending(id))
    }

    /// Oldest stream head whose document is idle and whose hints are met.
    fn take_next(&mut self) -> Option<Job> {
        if self.paused {
            return None;
        }
        let key = self
            .streams
            .iter()
            .filter_map(|(key, jobs)| jobs.front().map(|(seq, job)| (*seq, key, job)))
            .filter(|(_, _, job)| !self.executing.contains_key(job.document_id()))
            .filter(|(_, _, job)| self.hints_met(job))
            .min_by_key(|(seq, _, _)| *seq)
            .map(|(_, key, _)| key.clone())?;

        let jobs = self.streams.get_mut(&key)?;
        let (_, job) = jobs.pop_front()?;
        if jobs.is_empty() {
            self.streams.remove(&key);
        }
        self.executing
            .insert(job.document_id().to_string(), job.id.clone());
        Some(job)
    }

    fn prune_withdrawn(&mut self, retention: Duration) {
        self.withdrawn.retain(|_, at| at.elapsed() < retention);
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    retention: Duration,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_retention(Duration::from_secs(3600))
    }

    /// `retention` bounds how long withdrawn job ids are remembered.
    pub fn with_retention(retention: Duration) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            retention,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut state = self.lock();
            if state.blocked || state.closed {
                return Err(ReactorError::QueueBlocked);
            }
            state.prune_withdrawn(self.retention);
            state.next_seq += 1;
            let seq = state.next_seq;
            state
                .streams
                .entry(job.stream.clone())
                .or_default()
                .push_back((seq, job));
        }
        self.notify.notify_waiters();
        Ok(())
    }

    /// Take the next dispatchable job without waiting.
    pub fn try_dequeue(&self) -> Option<Job> {
        let mut state = self.lock();
        if state.closed {
            return None;
        }
        state.take_next()
    }

    /// Wait for the next dispatchable job. Returns `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            // Registered before checking, so a wakeup between check and await is not lost.
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                if let Some(job) = state.take_next() {
                    return Some(job);
                }
            }
            notified.await;
        }
    }

    /// Mark a dispatched job finished, freeing its document for the next job
    /// and any job hinted on it.
    pub fn release(&self, job: &Job) {
        {
            let mut state = self.lock();
            if state.executing.get(job.document_id()) == Some(&job.id) {
                state.executing.remove(job.document_id());
            }
        }
        self.notify.notify_waiters();
    }

    /// Withdraw a queued job. Jobs already dispatched cannot be removed.
    pub fn remove(&self, job_id: &str) -> bool {
        let removed = {
            let mut state = self.lock();
            let mut found = None;
            for (key, jobs) in state.streams.iter_mut() {
                if let Some(pos) = jobs.iter().position(|(_, job)| job.id == job_id) {
                    jobs.remove(pos);
                    found = Some(key.clone());
                    break;
                }
            }
            match found {
                Some(key) => {
                    if state.streams.get(&key).is_some_and(VecDeque::is_empty) {
                        state.streams.remove(&key);
                    }
                    state.prune_withdrawn(self.retention);
                    state.withdrawn.insert(job_id.to_string(), Instant::now());
                    true
                }
                None => false,
            }
        };
        if removed {
            // A withdrawn job no longer holds back jobs hinted on it.
            self.notify.notify_waiters();
        }
        removed
    }

    /// Refuse further enqueues. Queued jobs still dispatch.
    pub fn block(&self) {
        self.lock().blocked = true;
    }

    pub fn unblock(&self) {
        self.lock().blocked = false;
    }

    pub fn is_blocked(&self) -> bool {
        self.lock().blocked
    }

    /// Hold back dispatch. Enqueues are still accepted.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    /// Resume dispatch and wake every waiting worker.
    pub fn resume(&self) {
        self.lock().paused = false;
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// Stop dispatching entirely and wake every waiting worker.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            state.blocked = true;
            state.closed = true;
        }
        self.notify.notify_waiters();
    }

    /// Number of queued, undispatched jobs.
    pub fn size(&self) -> usize {
        self.lock().queued()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().executing.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.queued() == 0 && state.executing.is_empty()
    }

    pub fn was_withdrawn(&self, job_id: &str) -> bool {
        self.lock().withdrawn.contains_key(job_id)
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::JobKind;

    fn job(doc: &str, scope: &str) -> Job {
        Job::new(
            StreamKey::new(doc, scope, "main"),
            JobKind::Execute { actions: vec![] },
        )
    }

    #[test]
    fn one_job_per_document_in_flight() {
        let queue = JobQueue::new();
        let header = job("doc-1", "header");
        let global = job("doc-1", "global");
        let other = job("doc-2", "global");
        queue.enqueue(header.clone()).unwrap();
        queue.enqueue(global.clone()).unwrap();
        queue.enqueue(other.clone()).unwrap();

        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(header.id.clone()));
        // doc-1 is busy, so doc-2 jumps ahead.
        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(other.id.clone()));
        assert!(queue.try_dequeue().is_none());

        queue.release(&header);
        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(global.id));
        assert_eq!(queue.in_flight(), 2);
    }

    #[test]
    fn same_stream_is_fifo() {
        let queue = JobQueue::new();
        let first = job("doc-1", "global");
        let second = job("doc-1", "global");
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(second.clone()).unwrap();

        let a = queue.try_dequeue().unwrap();
        queue.release(&a);
        let b = queue.try_dequeue().unwrap();
        assert_eq!((a.id, b.id), (first.id, second.id));
    }

    #[test]
    fn remove_withdraws_only_queued_jobs() {
        let queue = JobQueue::new();
        let dispatched = job("doc-1", "global");
        let queued = job("doc-1", "global");
        queue.enqueue(dispatched.clone()).unwrap();
        queue.enqueue(queued.clone()).unwrap();
        queue.try_dequeue().unwrap();

        assert!(!queue.remove(&dispatched.id));
        assert!(queue.remove(&queued.id));
        assert!(queue.was_withdrawn(&queued.id));
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn blocked_queue_refuses_jobs() {
        let queue = JobQueue::new();
        queue.block();
        assert!(matches!(
            queue.enqueue(job("doc-1", "global")),
            Err(ReactorError::QueueBlocked)
        ));
        queue.unblock();
        queue.enqueue(job("doc-1", "global")).unwrap();
        assert_eq!(queue.size(), 1);
        assert!(!queue.is_idle());
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_enqueue_and_close() {
        let queue = std::sync::Arc::new(JobQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let j = job("doc-1", "global");
        queue.enqueue(j.clone()).unwrap();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.map(|g| g.id), Some(j.id));

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        queue.close();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn hinted_job_waits_for_its_dependency() {
        let queue = JobQueue::new();
        let first = job("doc-1", "header");
        let dependent = job("doc-2", "global").with_queue_hint([first.id.clone()]);
        let free = job("doc-3", "global");
        queue.enqueue(dependent.clone()).unwrap();
        queue.enqueue(first.clone()).unwrap();
        queue.enqueue(free.clone()).unwrap();

        // The dependent is oldest, but its hint is still queued.
        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(first.id.clone()));
        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(free.id));
        // Running still counts as pending.
        assert!(queue.try_dequeue().is_none());

        queue.release(&first);
        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(dependent.id));
    }

    #[test]
    fn withdrawing_a_dependency_unparks_the_dependent() {
        let queue = JobQueue::new();
        let busy = job("doc-1", "global");
        let dependency = job("doc-1", "global");
        let dependent = job("doc-2", "global").with_queue_hint([dependency.id.clone()]);
        queue.enqueue(busy.clone()).unwrap();
        queue.enqueue(dependency.clone()).unwrap();
        queue.enqueue(dependent.clone()).unwrap();

        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(busy.id));
        assert!(queue.try_dequeue().is_none());

        assert!(queue.remove(&dependency.id));
        assert_eq!(queue.try_dequeue().map(|j| j.id), Some(dependent.id));
    }

    #[test]
    fn paused_queue_accepts_but_does_not_dispatch() {
        let queue = JobQueue::new();
        queue.pause();
        let j = job("doc-1", "global");
        queue.enqueue(j.clone()).unwrap();
        assert!(queue.is_paused());
        assert!(queue.try_dequeue().is_none());

        queue.resume();
        assert_eq!(queue.try_dequeue().map(|g| g.id), Some(j.id));
    }

    #[tokio::test]
    async fn resume_wakes_a_waiting_worker() {
        let queue = std::sync::Arc::new(JobQueue::new());
        queue.pause();
        let j = job("doc-1", "global");
        queue.enqueue(j.clone()).unwrap();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        queue.resume();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.map(|g| g.id), Some(j.id));
    }

    #[test]
    fn withdrawn_ids_expire_after_retention() {
        let queue = JobQueue::with_retention(Duration::ZERO);
        let j = job("doc-1", "global");
        queue.enqueue(j.clone()).unwrap();
        assert!(queue.remove(&j.id));
        assert!(queue.was_withdrawn(&j.id));

        queue.enqueue(job("doc-1", "global")).unwrap();
        assert!(!queue.was_withdrawn(&j.id));
    }
}
