//! Task executors and service runners
//!
//! Asynchronous invokes are handed to a [`TaskExecutor`]. Invokes that name a
//! target environment run through a [`ServiceRunner`] picked by an
//! [`ExecutorProvider`].

use crate::core::error::{codes, ExecutionError};
use crate::core::value::Record;
use crate::execution::context::ExecutionContext;
use crate::execution::service::Service;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Unit of work submitted for asynchronous execution
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks without the submitter waiting for them
pub trait TaskExecutor: Send + Sync {
    fn submit(&self, task: Task);
}

/// Runs every task immediately on the submitting thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl TaskExecutor for InlineExecutor {
    fn submit(&self, task: Task) {
        task();
    }
}

/// Runs tasks on the blocking pool of a tokio runtime
#[derive(Debug, Clone)]
pub struct TokioExecutor {
    handle: Handle,
}

impl TokioExecutor {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// Executor bound to the runtime of the calling thread, if any
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }
}

impl TaskExecutor for TokioExecutor {
    fn submit(&self, task: Task) {
        debug!("Submitting task to the blocking pool");
        // Fire and forget, nobody awaits the result of an asynchronous invoke
        drop(self.handle.spawn_blocking(task));
    }
}

/// Executes a service in some environment
pub trait ServiceRunner: Send + Sync {
    fn run(
        &self,
        service: &Arc<dyn Service>,
        context: &ExecutionContext,
        input: Record,
        properties: &Record,
    ) -> Result<Record, ExecutionError>;
}

/// Runs the service in-process, ignoring the target properties
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalRunner;

impl ServiceRunner for LocalRunner {
    fn run(
        &self,
        service: &Arc<dyn Service>,
        context: &ExecutionContext,
        input: Record,
        _properties: &Record,
    ) -> Result<Record, ExecutionError> {
        service.execute(context, input)
    }
}

/// Resolves named target environments to runners
pub trait ExecutorProvider: Send + Sync {
    fn runner(&self, target: &str) -> Option<Arc<dyn ServiceRunner>>;

    /// Names of all known targets
    fn targets(&self) -> Vec<String>;
}

/// Fixed set of named runners
#[derive(Default, Clone)]
pub struct TargetRegistry {
    runners: HashMap<String, Arc<dyn ServiceRunner>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_target(mut self, name: impl Into<String>, runner: Arc<dyn ServiceRunner>) -> Self {
        self.runners.insert(name.into(), runner);
        self
    }
}

impl ExecutorProvider for TargetRegistry {
    fn runner(&self, target: &str) -> Option<Arc<dyn ServiceRunner>> {
        self.runners.get(target).cloned()
    }

    fn targets(&self) -> Vec<String> {
        let mut targets: Vec<_> = self.runners.keys().cloned().collect();
        targets.sort();
        targets
    }
}

/// Run a service on a named target
pub fn run_on_target(
    provider: Option<&Arc<dyn ExecutorProvider>>,
    target: &str,
    service: &Arc<dyn Service>,
    context: &ExecutionContext,
    input: Record,
    properties: &Record,
) -> Result<Record, ExecutionError> {
    let runner = provider.and_then(|p| p.runner(target)).ok_or_else(|| {
        ExecutionError::vm(
            codes::INVALID_TARGET,
            format!("Invalid target environment '{}' for service '{}'", target, service.id()),
        )
    })?;
    info!("Running service {} on target {}", service.id(), target);
    runner
        .run(service, context, input, properties)
        .map_err(|e| {
            if e.class.is_a(crate::core::error::ErrorClass::Execution) {
                e
            } else {
                ExecutionError::vm(
                    codes::REMOTE_FAILED,
                    format!("Remote execution of '{}' on '{}' failed", service.id(), target),
                )
                .with_cause(e)
            }
        })
}
