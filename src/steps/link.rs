//! Link: assign the value of an expression to a variable

use super::{expression, StepMeta};
use crate::core::content::PipelineContent;
use crate::core::context::VmContext;
use crate::core::error::{codes, Diagnostic, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::{FieldKind, TypeHandle};
use crate::core::value::{Record, Value};
use crate::execution::context::ServiceContext;
use crate::query::Query;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Link {
    #[serde(flatten)]
    pub meta: StepMeta,

    /// Source expression, or a literal when `fixed_value` is set
    #[serde(default, deserialize_with = "expression")]
    pub from: String,

    /// Target path
    #[serde(default)]
    pub to: String,

    /// Treat `from` as a literal unless it starts with `=`
    #[serde(default)]
    pub fixed_value: bool,

    /// Skip when the target already holds a value
    #[serde(default)]
    pub optional: bool,

    /// Skip when the source is null
    #[serde(default)]
    pub source_not_null: bool,

    /// Skip when the source path is not set at all
    #[serde(default)]
    pub patch: bool,

    /// Project the value onto the declared shape of the target
    #[serde(default)]
    pub mask: bool,
}

impl Link {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Self::default()
        }
    }

    pub fn execute(&self, vm: &mut VmContext<'_>, _scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let value = self.source_value(vm.pipeline.record(), &vm.pipeline)?;
        if let Some(value) = value {
            self.assign(&mut vm.pipeline, value)?;
        }
        Ok(Flow::Completed)
    }

    /// Evaluate against `source` and assign into a different content
    pub fn link_into(&self, source: &Record, target: &mut PipelineContent) -> Result<(), ExecutionError> {
        if let Some(value) = self.source_value(source, target)? {
            self.assign(target, value)?;
        }
        Ok(())
    }

    /// The value to assign, `None` when a modifier says to skip
    fn source_value(&self, source: &Record, target: &PipelineContent) -> Result<Option<Value>, ExecutionError> {
        if self.to.trim().is_empty() {
            return Err(ExecutionError::vm(
                codes::MISSING_LINK_TARGET,
                format!("Link {} has no target", self.meta.id),
            )
            .with_source(self.meta.id.clone()));
        }
        if self.optional && !self.meta.evaluate(&self.to, target.record())?.is_null() {
            return Ok(None);
        }
        let value = if self.fixed_value {
            self.meta.literal_or_expression(&self.from, source)?
        } else {
            if self.patch && !self.meta.query(&self.from)?.is_defined(source).map_err(ExecutionError::from)? {
                return Ok(None);
            }
            self.meta.evaluate(&self.from, source)?
        };
        if self.source_not_null && value.is_null() {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn assign(&self, target: &mut PipelineContent, value: Value) -> Result<(), ExecutionError> {
        let query = self.meta.query(&self.to)?;
        if !query.is_variable() {
            return Err(ExecutionError::vm(
                codes::INVALID_SET,
                format!("Can not set '{}', it is not a variable", self.to),
            )
            .with_source(self.meta.id.clone()));
        }
        let path = query.resolve(target.record()).map_err(|e| {
            ExecutionError::vm(codes::INVALID_SET, format!("Can not set '{}'", self.to))
                .with_source(self.meta.id.clone())
                .with_cause(ExecutionError::from(e))
        })?;
        let value = if self.mask { self.masked(target, &path, value)? } else { value };
        target.set(&path, value).map_err(|e| {
            if e.source_id.is_none() {
                e.with_source(self.meta.id.clone())
            } else {
                e
            }
        })
    }

    fn masked(
        &self,
        target: &PipelineContent,
        path: &[crate::core::content::PathSegment],
        value: Value,
    ) -> Result<Value, ExecutionError> {
        match target.declared(path) {
            Some(field) => match field.kind {
                FieldKind::Record(shape) => target.registry().mask(shape, value),
                FieldKind::Any => Ok(value),
                other => Err(ExecutionError::vm(
                    codes::MASK_TYPE,
                    format!("Can not mask '{}' as {:?}, it is not a structure", self.to, other),
                )),
            },
            None => Ok(value),
        }
    }

    /// Checks for a link reading `source` and writing `target`
    pub fn validate_between(&self, context: &ServiceContext, source: TypeHandle, target: TypeHandle) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if self.to.trim().is_empty() {
            diagnostics.push(Diagnostic::error("Link has no target"));
        } else {
            match Query::parse(&self.to) {
                Ok(query) if !query.is_variable() => {
                    diagnostics.push(Diagnostic::error(format!("Link target '{}' is not a variable", self.to)));
                }
                Ok(query) => {
                    if let Some(root) = query.variables().first() {
                        if context.types.field(target, root).is_none() {
                            diagnostics.push(Diagnostic::error(format!("Unknown link target '{}'", self.to)));
                        }
                    }
                }
                Err(e) => diagnostics.push(Diagnostic::error(e.to_string())),
            }
        }
        if self.fixed_value {
            diagnostics.extend(self.meta.validate_literal_or_expression(&self.from, context, source));
        } else if self.from.trim().is_empty() {
            diagnostics.push(Diagnostic::error("Link has no source"));
        } else {
            diagnostics.extend(self.meta.validate_query(&self.from, context, source));
        }
        diagnostics
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        self.validate_between(context, scope, scope)
    }
}
