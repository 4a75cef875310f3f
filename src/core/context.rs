//! Per-execution interpreter state

use crate::core::config::VmConfig;
use crate::core::content::PipelineContent;
use crate::core::error::{codes, ExecutionError};
use crate::core::resource::{Closeable, CloseableScope, ResourceList};
use crate::core::types::TypeRegistry;
use crate::execution::cluster::Cluster;
use crate::execution::context::{ExecutionContext, ServiceContext};
use std::sync::Arc;
use tracing::debug;

/// State of one top-level execution
///
/// Owned by a single service instance and never shared between executions.
pub struct VmContext<'a> {
    execution: &'a ExecutionContext,
    config: &'a VmConfig,

    /// Lock source for synchronized sequences
    cluster: Arc<dyn Cluster>,

    /// The live pipeline record
    pub pipeline: PipelineContent,

    /// Exception being handled by the innermost running Catch
    caught: Option<Arc<ExecutionError>>,

    /// Resources closed at the end of the current Map step
    map_resources: ResourceList,

    /// Resources closed at the end of the whole execution
    service_resources: ResourceList,

    /// Running steps, including those of invoking services
    depth: usize,
}

impl<'a> VmContext<'a> {
    pub fn new(
        execution: &'a ExecutionContext,
        config: &'a VmConfig,
        cluster: Arc<dyn Cluster>,
        pipeline: PipelineContent,
    ) -> Self {
        Self {
            execution,
            config,
            cluster,
            pipeline,
            caught: None,
            map_resources: ResourceList::new(),
            service_resources: ResourceList::new(),
            depth: execution.depth(),
        }
    }

    pub fn execution(&self) -> &'a ExecutionContext {
        self.execution
    }

    pub fn service_context(&self) -> &'a ServiceContext {
        self.execution.service_context()
    }

    pub fn config(&self) -> &'a VmConfig {
        self.config
    }

    pub fn registry(&self) -> &'a Arc<TypeRegistry> {
        self.execution.types()
    }

    pub fn cluster(&self) -> &Arc<dyn Cluster> {
        &self.cluster
    }

    pub fn is_aborted(&self) -> bool {
        self.execution.is_aborted()
    }

    pub fn caught(&self) -> Option<&Arc<ExecutionError>> {
        self.caught.as_ref()
    }

    /// Install the exception under handling, returning the previous one
    pub fn replace_caught(&mut self, caught: Option<Arc<ExecutionError>>) -> Option<Arc<ExecutionError>> {
        std::mem::replace(&mut self.caught, caught)
    }

    pub fn map_resources(&mut self) -> &mut ResourceList {
        &mut self.map_resources
    }

    pub fn service_resources(&mut self) -> &mut ResourceList {
        &mut self.service_resources
    }

    pub fn register(&mut self, scope: CloseableScope, owner: &str, resource: Arc<dyn Closeable>) {
        debug!("Registering resource for {} at {:?} scope", owner, scope);
        match scope {
            CloseableScope::Map => self.map_resources.register(owner, resource),
            CloseableScope::Service => self.service_resources.register(owner, resource),
        }
    }

    /// Enter a nested step, failing fatally past the configured depth
    pub fn enter(&mut self) -> Result<(), ExecutionError> {
        if self.depth >= self.config.max_depth {
            return Err(ExecutionError::vm(
                codes::MAX_DEPTH,
                format!("Maximum execution depth of {} exceeded", self.config.max_depth),
            ));
        }
        self.depth += 1;
        Ok(())
    }

    pub fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl Drop for VmContext<'_> {
    fn drop(&mut self) {
        // Only non-empty when the run unwound without reaching its cleanup
        self.map_resources.close_all();
        self.service_resources.close_all();
    }
}
