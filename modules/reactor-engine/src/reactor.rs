//! Reactor facade: wires the components together and exposes the external API.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use reactor_store::{
    Action, CreateDocumentInput, DeleteDocumentInput, KeyframeStore, Operation, OperationStore,
    PagedResults, Paging, StreamKey, UpgradeDocumentInput, CREATE_DOCUMENT, DEFAULT_BRANCH,
    DELETE_DOCUMENT, HEADER_SCOPE, UPGRADE_DOCUMENT,
};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ReactorConfig;
use crate::document_view::DocumentView;
use crate::error::{ReactorError, Result};
use crate::event_bus::{EventBus, EventKind, ReactorEvent, SubscriptionId};
use crate::executor::{validate_actions, validate_operations, JobExecutor};
use crate::executor_manager::ExecutorManager;
use crate::processor::{ProcessorFactory, ProcessorManager};
use crate::queue::JobQueue;
use crate::read_model::{ReadModel, ReadModelCoordinator};
use crate::registry::{DocumentModel, DocumentModelRegistry};
use crate::tracker::{ConsistencyToken, ConsistencyTracker, JobInfo, JobStatus, JobTracker};
use crate::types::{Document, Job, JobKind, NewDocument, OperationFilter, ShutdownStatus};
use crate::write_cache::WriteCache;

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct ReactorBuilder {
    store: Arc<dyn OperationStore>,
    keyframes: Arc<dyn KeyframeStore>,
    config: ReactorConfig,
    models: Vec<DocumentModel>,
    read_models: Vec<Arc<dyn ReadModel>>,
}

impl ReactorBuilder {
    pub fn with_config(mut self, config: ReactorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_document_model(mut self, model: DocumentModel) -> Self {
        self.models.push(model);
        self
    }

    pub fn with_read_model(mut self, read_model: Arc<dyn ReadModel>) -> Self {
        self.read_models.push(read_model);
        self
    }

    /// Wire everything, let read models catch up with the existing log, then
    /// spawn the workers. Must run inside a Tokio runtime.
    pub async fn build(self) -> Result<Reactor> {
        let config = self.config;

        let registry = Arc::new(DocumentModelRegistry::new());
        for model in self.models {
            registry.register(model);
        }

        let event_bus = Arc::new(EventBus::new());
        let consistency = Arc::new(ConsistencyTracker::new());
        let tracker = Arc::new(
            JobTracker::new(consistency.clone(), config.executor.error_history_limit)
                .with_retention(config.executor.job_retention()),
        );
        let queue = Arc::new(JobQueue::with_retention(config.executor.job_retention()));
        let cache = Arc::new(WriteCache::new(
            self.store.clone(),
            self.keyframes.clone(),
            registry.clone(),
            config.write_cache.clone(),
        ));

        let processors = Arc::new(ProcessorManager::new(config.drive_document_type.clone()));
        let documents = Arc::new(DocumentView::new());
        let mut read_models: Vec<Arc<dyn ReadModel>> = vec![processors.clone(), documents.clone()];
        read_models.extend(self.read_models);
        let coordinator = Arc::new(
            ReadModelCoordinator::new(event_bus.clone(), read_models)
                .with_view_states(self.keyframes),
        );

        let caught_up = coordinator
            .catch_up(self.store.as_ref(), config.read_models.catch_up_page_size)
            .await?;
        if caught_up > 0 {
            info!(rows = caught_up, "Read models caught up with the log");
        }

        let subscriptions = vec![
            event_bus.subscribe(EventKind::JobReadReady, tracker.clone()),
            coordinator.attach(),
        ];
        coordinator.start();

        let executor = Arc::new(JobExecutor::new(
            self.store.clone(),
            cache.clone(),
            registry.clone(),
            config.executor.clone(),
        ));
        let executors = ExecutorManager::start(
            executor,
            queue.clone(),
            tracker.clone(),
            event_bus.clone(),
            config.executor.worker_count,
        );

        info!(
            workers = config.executor.worker_count,
            document_types = ?registry.document_types(),
            read_models = ?coordinator.read_model_names(),
            "Reactor started"
        );

        Ok(Reactor {
            store: self.store,
            registry,
            cache,
            queue,
            tracker,
            consistency,
            event_bus,
            coordinator,
            processors,
            documents,
            executors,
            subscriptions: Mutex::new(subscriptions),
            shut_down: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// Reactor
// ---------------------------------------------------------------------------

pub struct Reactor {
    store: Arc<dyn OperationStore>,
    registry: Arc<DocumentModelRegistry>,
    cache: Arc<WriteCache>,
    queue: Arc<JobQueue>,
    tracker: Arc<JobTracker>,
    consistency: Arc<ConsistencyTracker>,
    event_bus: Arc<EventBus>,
    coordinator: Arc<ReadModelCoordinator>,
    processors: Arc<ProcessorManager>,
    documents: Arc<DocumentView>,
    executors: ExecutorManager,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    shut_down: AtomicBool,
}

impl Reactor {
    pub fn builder(
        store: Arc<dyn OperationStore>,
        keyframes: Arc<dyn KeyframeStore>,
    ) -> ReactorBuilder {
        ReactorBuilder {
            store,
            keyframes,
            config: ReactorConfig::default(),
            models: Vec::new(),
            read_models: Vec::new(),
        }
    }

    async fn submit(&self, job: Job) -> Result<JobInfo> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(ReactorError::Shutdown);
        }
        let job_id = job.id.clone();
        let info = self.tracker.register_pending(&job_id);
        if let Err(e) = self.queue.enqueue(job) {
            self.tracker.mark_failed(&job_id, e.to_string());
            return Err(e);
        }
        if let Err(e) = self
            .event_bus
            .emit(ReactorEvent::JobAvailable {
                job_id: job_id.clone(),
            })
            .await
        {
            warn!(job_id, error = %e, "Job-available delivery failed");
        }
        Ok(info)
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Enqueue document creation: CREATE_DOCUMENT followed by an
    /// UPGRADE_DOCUMENT carrying the initial state, in one header job.
    pub async fn create(&self, document: NewDocument) -> Result<JobInfo> {
        let model = self.registry.get(&document.document_type)?;
        let now = Utc::now();

        let mut initial_state = model.initial_state.clone();
        initial_state.extend(document.initial_state.unwrap_or_default());

        let create = CreateDocumentInput {
            document_id: document.id.clone(),
            model: document.document_type.clone(),
            version: document.version,
            slug: document.slug,
            signing: document.signing,
            created_at_utc: now,
        };
        let upgrade = UpgradeDocumentInput {
            document_id: document.id.clone(),
            from_version: 0,
            to_version: document.version,
            initial_state: Some(initial_state),
        };
        let actions = vec![
            header_action(CREATE_DOCUMENT, serde_json::to_value(create)?),
            header_action(UPGRADE_DOCUMENT, serde_json::to_value(upgrade)?),
        ];

        let stream = StreamKey::new(&document.id, HEADER_SCOPE, DEFAULT_BRANCH);
        self.submit(Job::new(stream, JobKind::Execute { actions }))
            .await
    }

    /// Enqueue actions against one scope of a document. All actions must
    /// share a scope.
    pub async fn execute(
        &self,
        document_id: &str,
        branch: &str,
        actions: Vec<Action>,
    ) -> Result<JobInfo> {
        self.execute_after(document_id, branch, actions, Vec::new())
            .await
    }

    /// Like `execute`, but not dispatched until every job in `after` has
    /// left the queue (finished, failed or withdrawn).
    pub async fn execute_after(
        &self,
        document_id: &str,
        branch: &str,
        actions: Vec<Action>,
        after: Vec<String>,
    ) -> Result<JobInfo> {
        let scope = actions
            .first()
            .map(|a| a.scope.clone())
            .ok_or(ReactorError::EmptyBatch)?;
        let stream = StreamKey::new(document_id, &scope, branch);
        validate_actions(&stream, &actions)?;
        let job = Job::new(stream, JobKind::Execute { actions }).with_queue_hint(after);
        self.submit(job).await
    }

    pub async fn delete_document(&self, document_id: &str, branch: &str) -> Result<JobInfo> {
        let input = serde_json::to_value(DeleteDocumentInput {
            document_id: document_id.to_string(),
        })?;
        let stream = StreamKey::new(document_id, HEADER_SCOPE, branch);
        let actions = vec![header_action(DELETE_DOCUMENT, input)];
        self.submit(Job::new(stream, JobKind::Execute { actions }))
            .await
    }

    /// Enqueue foreign operations for merge. Malformed batches (empty, mixed
    /// scope, missing hash) are rejected here, before a job exists.
    pub async fn load(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<Operation>,
    ) -> Result<JobInfo> {
        self.load_after(document_id, branch, operations, Vec::new())
            .await
    }

    /// Like `load`, ordered after the jobs in `after`.
    pub async fn load_after(
        &self,
        document_id: &str,
        branch: &str,
        operations: Vec<Operation>,
        after: Vec<String>,
    ) -> Result<JobInfo> {
        let scope = operations
            .first()
            .map(|op| op.action.scope.clone())
            .ok_or(ReactorError::EmptyBatch)?;
        let stream = StreamKey::new(document_id, &scope, branch);
        validate_operations(&stream, &operations)?;
        let job = Job::new(stream, JobKind::Load { operations }).with_queue_hint(after);
        self.submit(job).await
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Materialize a document. With a token, waits until the token's writes
    /// have reached the read models first.
    pub async fn get(
        &self,
        document_id: &str,
        branch: &str,
        token: Option<&ConsistencyToken>,
    ) -> Result<Document> {
        if let Some(token) = token {
            self.consistency.wait_for(token).await;
        }

        let header = self.store.get_header(document_id, branch).await?;
        if header.is_deleted() {
            return Err(ReactorError::DocumentDeleted(document_id.to_string()));
        }
        let model = self.registry.get(&header.document_type)?;

        let scopes: BTreeSet<String> = header
            .revision
            .keys()
            .chain(model.initial_state.keys())
            .filter(|scope| scope.as_str() != HEADER_SCOPE)
            .cloned()
            .collect();

        let mut state = BTreeMap::new();
        for scope in scopes {
            let revision = header.revision.get(&scope).copied().unwrap_or(0);
            let stream = StreamKey::new(document_id, &scope, branch);
            let mut scoped = self.cache.get_state(&stream, Some(revision)).await?;
            if let Some(value) = scoped.state.remove(&scope) {
                state.insert(scope, value);
            }
        }

        Ok(Document { header, state })
    }

    /// Whether each document exists and is not deleted, per the document view.
    pub async fn exists(
        &self,
        document_ids: &[String],
        token: Option<&ConsistencyToken>,
    ) -> Vec<bool> {
        if let Some(token) = token {
            self.consistency.wait_for(token).await;
        }
        self.documents.exists(document_ids)
    }

    /// Raw operation logs, one page per scope.
    pub async fn get_operations(
        &self,
        document_id: &str,
        filter: &OperationFilter,
        paging: Option<&Paging>,
        token: Option<&ConsistencyToken>,
    ) -> Result<BTreeMap<String, PagedResults<Operation>>> {
        if let Some(token) = token {
            self.consistency.wait_for(token).await;
        }

        let branch = filter.branch.as_deref().unwrap_or(DEFAULT_BRANCH);
        let scopes = match &filter.scopes {
            Some(scopes) => scopes.clone(),
            None => self
                .store
                .get_revisions(document_id, branch)
                .await?
                .revision
                .into_keys()
                .collect(),
        };

        let mut pages = BTreeMap::new();
        for scope in scopes {
            let stream = StreamKey::new(document_id, &scope, branch);
            let page = self.store.get_since(&stream, 0, paging).await?;
            pages.insert(scope, page);
        }
        Ok(pages)
    }

    // -----------------------------------------------------------------------
    // Jobs
    // -----------------------------------------------------------------------

    pub fn get_job_status(&self, job_id: &str) -> JobInfo {
        self.tracker.get(job_id)
    }

    /// Wait until read models have seen the job, or it failed. No timeout:
    /// if the coordinator is stopped mid-job this never resolves.
    pub async fn wait_for_job(&self, job_id: &str) -> JobInfo {
        self.tracker
            .wait_until(job_id, |info| {
                matches!(info.status, JobStatus::ReadModelsReady | JobStatus::Failed)
            })
            .await
    }

    /// Withdraw a job that has not been dispatched yet.
    pub fn remove_job(&self, job_id: &str) -> bool {
        let removed = self.queue.remove(job_id);
        if removed {
            self.tracker.mark_failed(job_id, "job withdrawn");
        }
        removed
    }

    // -----------------------------------------------------------------------
    // Processors
    // -----------------------------------------------------------------------

    pub async fn register_processor_factory(
        &self,
        factory_id: &str,
        factory: Arc<dyn ProcessorFactory>,
    ) {
        self.processors.register_factory(factory_id, factory).await;
    }

    pub async fn unregister_processor_factory(&self, factory_id: &str) -> bool {
        self.processors.unregister_factory(factory_id).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Stop accepting work, stop the read-model coordinator and wait for the
    /// workers. Safe to call more than once.
    pub async fn kill(&self) -> ShutdownStatus {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return ShutdownStatus {
                is_shutdown: true,
                pending_jobs: self.queue.size(),
            };
        }

        info!("Reactor shutting down");
        self.queue.block();
        self.coordinator.stop();
        let pending_jobs = self.executors.stop().await;

        let subscriptions: Vec<SubscriptionId> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for id in subscriptions {
            self.event_bus.unsubscribe(id);
        }

        info!(pending_jobs, "Reactor stopped");
        ShutdownStatus {
            is_shutdown: true,
            pending_jobs,
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Component handles
    // -----------------------------------------------------------------------

    pub fn store(&self) -> &Arc<dyn OperationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<DocumentModelRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<WriteCache> {
        &self.cache
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn coordinator(&self) -> &Arc<ReadModelCoordinator> {
        &self.coordinator
    }

    pub fn processors(&self) -> &Arc<ProcessorManager> {
        &self.processors
    }

    pub fn documents(&self) -> &Arc<DocumentView> {
        &self.documents
    }

    pub fn consistency(&self) -> &Arc<ConsistencyTracker> {
        &self.consistency
    }
}

fn header_action(action_type: &str, input: serde_json::Value) -> Action {
    Action::new(Uuid::new_v4().to_string(), action_type, HEADER_SCOPE, input)
}
