//! Running services: contexts, host integrations and the workflow engine

pub mod cluster;
pub mod context;
pub mod engine;
pub mod executor;
pub mod service;
pub mod tracker;
pub mod transaction;

pub use cluster::{Cluster, LocalCluster, LockGuard};
pub use context::{AbortHandle, ExecutionContext, ServiceContext};
pub use engine::VmService;
pub use executor::{ExecutorProvider, InlineExecutor, LocalRunner, ServiceRunner, TargetRegistry, TaskExecutor, TokioExecutor};
pub use service::{FnService, Service, ServiceInterface, ServiceRegistry, ServiceResolver};
pub use tracker::{RecordingTracker, RuntimeTracker, TraceModeTracker, TrackerEvent, TrackerEventKind};
pub use transaction::{InMemoryTransactions, TransactionContext, TransactionEvent};
