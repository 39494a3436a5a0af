//! Reactor: job-driven document engine on top of the operation store.
//!
//! Callers enqueue jobs (execute new actions, or load foreign operations).
//! Workers reduce, commit through the store, update the write cache and
//! publish the commit; read models index it; the job tracker hands back a
//! consistency token for read-your-writes.

pub mod config;
pub mod document_view;
pub mod error;
pub mod event_bus;
pub mod executor;
pub mod executor_manager;
pub mod locks;
pub mod processor;
pub mod queue;
pub mod reactor;
pub mod read_model;
pub mod registry;
pub mod reshuffle;
pub mod sync;
pub mod tracker;
pub mod types;
pub mod write_cache;

pub use config::{load_config, ExecutorConfig, ReactorConfig, ReadModelConfig, WriteCacheConfig};
pub use document_view::{DocumentSnapshot, DocumentView};
pub use error::{ReactorError, Result};
pub use event_bus::{EventBus, EventHandler, EventKind, ReactorEvent, SubscriptionId};
pub use executor::{validate_actions, validate_operations, JobExecutor};
pub use executor_manager::ExecutorManager;
pub use locks::KeyedLocks;
pub use processor::{Processor, ProcessorFactory, ProcessorFilter, ProcessorManager, ProcessorRecord};
pub use queue::JobQueue;
pub use reactor::{Reactor, ReactorBuilder};
pub use read_model::{ReadModel, ReadModelCoordinator};
pub use registry::{DocumentModel, DocumentModelRegistry, Reducer};
pub use reshuffle::{plan_load, ReshufflePlan};
pub use sync::{drain_inbox, export_since, Mailbox, SyncRecord, SyncStatus};
pub use tracker::{
    ConsistencyCoordinate, ConsistencyToken, ConsistencyTracker, JobInfo, JobResult, JobStatus,
    JobTracker,
};
pub use types::{Document, Job, JobKind, NewDocument, OperationFilter, ShutdownStatus};
pub use write_cache::{reduce_operations, WriteCache};
