//! For: iteration over lists, ranges and conditions

use super::{expression, optional_expression, run_block, validate_children, Step, StepMeta};
use crate::core::context::VmContext;
use crate::core::error::{codes, Diagnostic, ExecutionError};
use crate::core::state::{BreakOutcome, Flow};
use crate::core::types::{FieldDef, FieldKind, TypeHandle};
use crate::core::value::Value;
use crate::execution::context::ServiceContext;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Runs its children once per element of a collection
///
/// The query may yield a list (one iteration per item), an integer `n`
/// (iterations `0..n`), a boolean (re-evaluated before every iteration,
/// like a while loop) or null (no iterations).
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct For {
    #[serde(flatten)]
    pub meta: StepMeta,

    #[serde(default, deserialize_with = "expression")]
    pub query: String,

    /// Receives the iteration index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,

    /// Receives the current element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,

    /// Iterate over chunks of this size instead of single elements
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "optional_expression")]
    pub batch_size: Option<String>,

    /// Collect this variable after every iteration into a list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub into: Option<String>,

    #[serde(default)]
    pub children: Vec<Step>,

    #[serde(skip)]
    pipeline: OnceLock<TypeHandle>,
}

enum Iteration {
    Next,
    Stop(Flow),
}

impl For {
    pub fn pipeline_type(&self, context: &ServiceContext, scope: TypeHandle) -> TypeHandle {
        if self.index.is_none() && self.variable.is_none() {
            return scope;
        }
        *self.pipeline.get_or_init(|| {
            let batched = self.batch_size.is_some();
            let field = |name: &String, kind: FieldKind| {
                let field = FieldDef::new(name.clone(), kind);
                if batched {
                    field.list()
                } else {
                    field
                }
            };
            let mut fields = Vec::new();
            if let Some(index) = &self.index {
                fields.push(field(index, FieldKind::Integer));
            }
            if let Some(variable) = &self.variable {
                fields.push(field(variable, FieldKind::Any));
            }
            context.types.extend(scope, fields)
        })
    }

    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let ty = self.pipeline_type(vm.service_context(), scope);
        let batch = self.batch(vm)?;
        let source = self.meta.evaluate(&self.query, vm.pipeline.record())?;

        let mut accumulated = match &self.into {
            Some(name) => Some(match vm.pipeline.take(name) {
                Some(Value::List(items)) => items,
                Some(Value::Null) | None => Vec::new(),
                Some(value) => vec![value],
            }),
            None => None,
        };

        let result = match source {
            Value::Null => Ok(Flow::Completed),
            Value::Bool(condition) => self.run_while(vm, ty, condition, batch, &mut accumulated),
            Value::Integer(count) => self.run_items(vm, ty, (0..count.max(0)).map(Value::Integer), batch, &mut accumulated),
            Value::List(items) => self.run_items(vm, ty, items.into_iter(), batch, &mut accumulated),
            other => Err(ExecutionError::vm(
                codes::NOT_ITERABLE,
                format!("The query '{}' does not yield a collection but a {}", self.query, other.kind_name()),
            )),
        };

        // Collected values survive a failing body
        let restored = vm.pipeline.cast(scope).and_then(|()| match (&self.into, accumulated) {
            (Some(name), Some(items)) => vm.pipeline.set_field(name, Value::List(items)),
            _ => Ok(()),
        });
        let flow = result?;
        restored?;
        Ok(flow)
    }

    fn batch(&self, vm: &VmContext<'_>) -> Result<Option<usize>, ExecutionError> {
        let Some(raw) = &self.batch_size else {
            return Ok(None);
        };
        let value = self.meta.evaluate(raw, vm.pipeline.record())?;
        match value.as_i64() {
            Some(size) if size > 0 => Ok(Some(size as usize)),
            _ => Err(ExecutionError::vm(
                codes::INVALID_BATCH_SIZE,
                format!("Invalid batch size '{}': {}", raw, value),
            )),
        }
    }

    fn run_items(
        &self,
        vm: &mut VmContext<'_>,
        ty: TypeHandle,
        mut items: impl Iterator<Item = Value>,
        batch: Option<usize>,
        accumulated: &mut Option<Vec<Value>>,
    ) -> Result<Flow, ExecutionError> {
        let mut position = 0i64;
        loop {
            let (index, value) = match batch {
                None => {
                    let Some(item) = items.next() else { break };
                    position += 1;
                    (Value::Integer(position - 1), item)
                }
                Some(size) => {
                    let chunk: Vec<Value> = items.by_ref().take(size).collect();
                    if chunk.is_empty() {
                        break;
                    }
                    let indexes = (position..position + chunk.len() as i64).map(Value::Integer).collect();
                    position += chunk.len() as i64;
                    (Value::List(indexes), Value::List(chunk))
                }
            };
            if let Iteration::Stop(flow) = self.iterate(vm, ty, index, value, accumulated)? {
                return Ok(flow);
            }
        }
        Ok(Flow::Completed)
    }

    fn run_while(
        &self,
        vm: &mut VmContext<'_>,
        ty: TypeHandle,
        mut condition: bool,
        batch: Option<usize>,
        accumulated: &mut Option<Vec<Value>>,
    ) -> Result<Flow, ExecutionError> {
        let mut position = 0i64;
        while condition {
            let (index, value) = match batch {
                None => (Value::Integer(position), Value::Bool(true)),
                Some(_) => (
                    Value::List(vec![Value::Integer(position)]),
                    Value::List(vec![Value::Bool(true)]),
                ),
            };
            position += 1;
            if let Iteration::Stop(flow) = self.iterate(vm, ty, index, value, accumulated)? {
                return Ok(flow);
            }
            let value = self.meta.evaluate(&self.query, vm.pipeline.record())?;
            condition = value.to_boolean().unwrap_or(false);
        }
        Ok(Flow::Completed)
    }

    fn iterate(
        &self,
        vm: &mut VmContext<'_>,
        ty: TypeHandle,
        index: Value,
        value: Value,
        accumulated: &mut Option<Vec<Value>>,
    ) -> Result<Iteration, ExecutionError> {
        vm.pipeline.cast(ty)?;
        debug!("For {} iteration {}", self.meta.id, index);
        if let Some(name) = &self.index {
            vm.pipeline.set_field(name, index)?;
        }
        if let Some(name) = &self.variable {
            vm.pipeline.set_field(name, value)?;
        }

        let flow = run_block(&self.children, vm, ty);

        if let (Some(name), Some(items)) = (&self.into, accumulated.as_mut()) {
            match vm.pipeline.take(name) {
                Some(Value::List(values)) => items.extend(values),
                Some(Value::Null) | None => {}
                Some(value) => items.push(value),
            }
        }
        let flow = flow?;

        Ok(match flow {
            Flow::Completed if vm.is_aborted() => Iteration::Stop(Flow::Aborted),
            Flow::Completed => Iteration::Next,
            Flow::Aborted => Iteration::Stop(Flow::Aborted),
            Flow::Break { count, resume } => match Flow::consume_break(count, resume) {
                BreakOutcome::Propagate(flow) => Iteration::Stop(flow),
                BreakOutcome::Resume if vm.is_aborted() => Iteration::Stop(Flow::Aborted),
                BreakOutcome::Resume => Iteration::Next,
                BreakOutcome::Stop => Iteration::Stop(Flow::Completed),
            },
        })
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let ty = self.pipeline_type(context, scope);
        let mut diagnostics = Vec::new();
        if self.query.trim().is_empty() {
            diagnostics.push(Diagnostic::error("For step has no source query"));
        } else {
            diagnostics.extend(self.meta.validate_query(&self.query, context, scope));
        }
        if let Some(batch) = &self.batch_size {
            diagnostics.extend(self.meta.validate_query(batch, context, scope));
        }
        if let Some(into) = &self.into {
            if context.types.field(scope, into).is_none() {
                diagnostics.push(Diagnostic::error(format!("Unknown variable '{}' for into", into)));
            }
        }
        diagnostics.extend(
            context
                .types
                .collisions(ty)
                .into_iter()
                .map(|name| Diagnostic::error(format!("Loop variable '{}' hides an outer variable", name))),
        );
        diagnostics.extend(validate_children(&self.children, context, ty));
        diagnostics
    }

    pub fn refresh(&mut self) {
        self.meta.refresh();
        self.pipeline = OnceLock::new();
    }
}
