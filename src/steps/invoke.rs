//! Invoke: call another service with an input built from links

use super::{generate_id, label_allows, Step, StepMeta};
use crate::core::content::PipelineContent;
use crate::core::context::VmContext;
use crate::core::error::{codes, Diagnostic, ExecutionError};
use crate::core::resource::CloseableScope;
use crate::core::state::Flow;
use crate::core::types::TypeHandle;
use crate::core::value::{Record, Value};
use crate::execution::context::ServiceContext;
use crate::execution::executor::run_on_target;
use crate::execution::service::Service;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};

fn default_result_name() -> Option<String> {
    Some(format!("result{}", generate_id()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Invoke {
    #[serde(flatten)]
    pub meta: StepMeta,

    /// Id of the service to call
    pub service: String,

    /// Pipeline variable receiving the output, null discards it
    #[serde(default = "default_result_name")]
    pub result_name: Option<String>,

    #[serde(default)]
    pub invocation_order: u32,

    /// Fire and forget on the task executor
    #[serde(default)]
    pub asynchronous: bool,

    /// Named execution environment, literal or `=expression`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub target_properties: IndexMap<String, String>,

    /// Paths within the result holding resources to close automatically
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub managed_closeables: Vec<String>,

    #[serde(default)]
    pub closeable_scope: CloseableScope,

    /// Links building the input
    #[serde(default)]
    pub children: Vec<Step>,
}

impl Invoke {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            meta: StepMeta::new(),
            service: service.into(),
            result_name: default_result_name(),
            invocation_order: 0,
            asynchronous: false,
            target: None,
            target_properties: IndexMap::new(),
            managed_closeables: Vec::new(),
            closeable_scope: CloseableScope::default(),
            children: Vec::new(),
        }
    }

    fn resolve(&self, vm: &VmContext<'_>) -> Result<Arc<dyn Service>, ExecutionError> {
        vm.execution().services().resolve(&self.service).ok_or_else(|| {
            ExecutionError::vm(codes::SERVICE_NOT_FOUND, format!("Service not found: {}", self.service))
                .with_source(self.meta.id.clone())
        })
    }

    /// Input record of the called service, built by the link children
    fn build_input(&self, vm: &VmContext<'_>, input_type: TypeHandle) -> Result<Record, ExecutionError> {
        let mut input = PipelineContent::new(vm.registry().clone(), input_type);
        for child in &self.children {
            let Step::Link(link) = child else {
                continue;
            };
            if link.meta.disabled || !label_allows(child, vm)? {
                continue;
            }
            link.link_into(vm.pipeline.record(), &mut input)?;
        }
        Ok(input.into_record())
    }

    pub fn execute(&self, vm: &mut VmContext<'_>, _scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let service = self.resolve(vm)?;
        let input = self.build_input(vm, service.interface().input)?;

        let target = match &self.target {
            Some(raw) => {
                let value = self.meta.literal_or_expression(raw, vm.pipeline.record())?;
                value.to_text().filter(|t| !t.is_empty())
            }
            None => None,
        };
        let mut properties = Record::new();
        for (name, raw) in &self.target_properties {
            let value = self.meta.literal_or_expression(raw, vm.pipeline.record())?;
            properties.insert(name.clone(), value);
        }

        if self.asynchronous {
            let execution = vm.execution();
            let context = execution.fork().unwrap_or_else(|| execution.clone()).nested(vm.depth());
            let id = self.meta.id.clone();
            debug!("Invoke {} submits {} asynchronously", id, service.id());
            execution.tasks().submit(Box::new(move || {
                let result = match &target {
                    Some(target) => run_on_target(context.executors(), target, &service, &context, input, &properties),
                    None => service.execute(&context, input),
                };
                if let Err(e) = result {
                    error!("Asynchronous invoke {} of {} failed: {}", id, service.id(), e.trace());
                }
            }));
            return Ok(Flow::Completed);
        }

        debug!("Invoke {} calls {}", self.meta.id, service.id());
        let nested = vm.execution().nested(vm.depth());
        let output = match &target {
            Some(target) => run_on_target(nested.executors(), target, &service, &nested, input, &properties)?,
            None => service.execute(&nested, input)?,
        };

        if let Some(name) = &self.result_name {
            vm.pipeline.set_field(name, Value::Record(output))?;
            for path in &self.managed_closeables {
                self.manage(vm, name, path)?;
            }
        }
        Ok(Flow::Completed)
    }

    fn manage(&self, vm: &mut VmContext<'_>, result: &str, path: &str) -> Result<(), ExecutionError> {
        let query = format!("{}/{}", result, path.trim_start_matches('/'));
        let resources = match self.meta.evaluate(&query, vm.pipeline.record())? {
            Value::Null => Vec::new(),
            Value::Resource(resource) => vec![resource],
            Value::List(items) => items
                .into_iter()
                .filter(|item| !item.is_null())
                .map(|item| match item {
                    Value::Resource(resource) => Ok(resource),
                    other => Err(self.not_closeable(path, &other)),
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => return Err(self.not_closeable(path, &other)),
        };
        for resource in resources {
            vm.register(self.closeable_scope, &self.meta.id, resource);
        }
        Ok(())
    }

    fn not_closeable(&self, path: &str, value: &Value) -> ExecutionError {
        ExecutionError::vm(
            codes::INVALID_CLOSEABLE,
            format!("Managed closeable '{}' is a {}, not a resource", path, value.kind_name()),
        )
        .with_source(self.meta.id.clone())
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        let Some(service) = context.services.resolve(&self.service) else {
            diagnostics.push(Diagnostic::error(format!("Service not found: {}", self.service)));
            return diagnostics;
        };
        if let Some(target) = &self.target {
            diagnostics.extend(self.meta.validate_literal_or_expression(target, context, scope));
        }
        for raw in self.target_properties.values() {
            diagnostics.extend(self.meta.validate_literal_or_expression(raw, context, scope));
        }
        for child in &self.children {
            if let Step::Link(link) = child {
                if !link.meta.disabled {
                    diagnostics.extend(
                        link.validate_between(context, scope, service.interface().input)
                            .into_iter()
                            .map(|d| d.within(link.meta.id.clone())),
                    );
                }
            }
        }
        diagnostics
    }
}
