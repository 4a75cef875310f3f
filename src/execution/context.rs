//! Host environment of an execution
//!
//! [`ExecutionContext`] bundles everything the interpreter consumes from its
//! surroundings: service resolution, types, transactions, feature flags, an
//! optional cluster, a tracker, target runners, an async task executor and
//! the abort signal. It is cheap to clone.

use crate::core::types::TypeRegistry;
use crate::execution::cluster::Cluster;
use crate::execution::executor::{ExecutorProvider, InlineExecutor, TaskExecutor};
use crate::execution::service::{ServiceRegistry, ServiceResolver};
use crate::execution::tracker::RuntimeTracker;
use crate::execution::transaction::{InMemoryTransactions, TransactionContext};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared flag used to abort a running execution
#[derive(Debug, Clone, Default)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

/// What static validation needs: types and services
#[derive(Clone)]
pub struct ServiceContext {
    pub types: Arc<TypeRegistry>,
    pub services: Arc<dyn ServiceResolver>,
}

impl ServiceContext {
    pub fn new(types: Arc<TypeRegistry>, services: Arc<dyn ServiceResolver>) -> Self {
        Self { types, services }
    }

    /// Fresh registries, convenient for tests and single-file runs
    pub fn standalone() -> (Self, Arc<ServiceRegistry>) {
        let registry = Arc::new(ServiceRegistry::new());
        let context = Self::new(Arc::new(TypeRegistry::new()), registry.clone());
        (context, registry)
    }
}

/// Everything an execution consumes from its host
#[derive(Clone)]
pub struct ExecutionContext {
    service_context: ServiceContext,
    transactions: Arc<dyn TransactionContext>,
    features: Option<Arc<BTreeSet<String>>>,
    cluster: Option<Arc<dyn Cluster>>,
    tracker: Option<Arc<dyn RuntimeTracker>>,
    executors: Option<Arc<dyn ExecutorProvider>>,
    tasks: Arc<dyn TaskExecutor>,
    abort: AbortHandle,

    /// Step depth of the caller when this context runs a nested service
    depth: usize,
}

impl ExecutionContext {
    pub fn new(service_context: ServiceContext) -> Self {
        Self {
            service_context,
            transactions: Arc::new(InMemoryTransactions::new()),
            features: None,
            cluster: None,
            tracker: None,
            executors: None,
            tasks: Arc::new(InlineExecutor),
            abort: AbortHandle::new(),
            depth: 0,
        }
    }

    /// Resolve types from another registry, keeping everything else
    pub fn with_types(mut self, types: Arc<TypeRegistry>) -> Self {
        self.service_context.types = types;
        self
    }

    pub fn with_transactions(mut self, transactions: Arc<dyn TransactionContext>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Enable feature flag support with the given enabled features
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = Some(Arc::new(features.into_iter().map(Into::into).collect()));
        self
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn Cluster>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn with_tracker(mut self, tracker: Arc<dyn RuntimeTracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    pub fn with_executors(mut self, executors: Arc<dyn ExecutorProvider>) -> Self {
        self.executors = Some(executors);
        self
    }

    pub fn with_task_executor(mut self, tasks: Arc<dyn TaskExecutor>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn service_context(&self) -> &ServiceContext {
        &self.service_context
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.service_context.types
    }

    pub fn services(&self) -> &Arc<dyn ServiceResolver> {
        &self.service_context.services
    }

    pub fn transactions(&self) -> &Arc<dyn TransactionContext> {
        &self.transactions
    }

    /// Enabled features, `None` when feature flags are not supported
    pub fn features(&self) -> Option<&BTreeSet<String>> {
        self.features.as_deref()
    }

    pub fn cluster(&self) -> Option<&Arc<dyn Cluster>> {
        self.cluster.as_ref()
    }

    pub fn tracker(&self) -> Option<&Arc<dyn RuntimeTracker>> {
        self.tracker.as_ref()
    }

    pub fn executors(&self) -> Option<&Arc<dyn ExecutorProvider>> {
        self.executors.as_ref()
    }

    pub fn tasks(&self) -> &Arc<dyn TaskExecutor> {
        &self.tasks
    }

    pub fn abort_handle(&self) -> &AbortHandle {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    /// Step depth a service run on this context starts from
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Copy for a service invoked at the given step depth
    pub fn nested(&self, depth: usize) -> ExecutionContext {
        ExecutionContext {
            depth,
            ..self.clone()
        }
    }

    /// Copy with independent transaction state, if the transactions can be forked
    pub fn fork(&self) -> Option<ExecutionContext> {
        self.transactions.fork().map(|transactions| ExecutionContext {
            transactions,
            ..self.clone()
        })
    }
}
