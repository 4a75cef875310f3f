//! Catch and Finally clauses of a Sequence

use super::{run_block, validate_children, Step, StepMeta};
use crate::core::context::VmContext;
use crate::core::error::{Diagnostic, ErrorClass, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::{FieldDef, FieldKind, TypeHandle};
use crate::core::value::Value;
use crate::execution::context::ServiceContext;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Handles errors raised by earlier siblings in a Sequence
///
/// A clause is selected by regex over the error trace, then by error code,
/// then by error class. A clause without any discriminator is the default.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Catch {
    #[serde(flatten)]
    pub meta: StepMeta,

    /// Binds the caught error for the body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variable: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<ErrorClass>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codes: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regex: Option<String>,

    /// Do not log the errors this clause handles
    #[serde(default)]
    pub suppress_exception: bool,

    #[serde(default)]
    pub children: Vec<Step>,

    #[serde(skip)]
    pipeline: OnceLock<TypeHandle>,

    #[serde(skip)]
    pattern: OnceLock<Option<Regex>>,
}

impl Catch {
    pub fn is_default(&self) -> bool {
        self.regex.is_none() && self.codes.is_empty() && self.types.is_empty()
    }

    fn pattern(&self) -> Option<&Regex> {
        self.pattern
            .get_or_init(|| {
                let source = self.regex.as_ref()?;
                match Regex::new(&format!("(?s)^(?:{})$", source)) {
                    Ok(regex) => Some(regex),
                    Err(e) => {
                        warn!("Catch {} has an invalid regex '{}': {}", self.meta.id, source, e);
                        None
                    }
                }
            })
            .as_ref()
    }

    fn matches_regex(&self, error: &ExecutionError) -> bool {
        self.pattern().is_some_and(|regex| regex.is_match(&error.trace()))
    }

    fn matches_code(&self, error: &ExecutionError) -> bool {
        error
            .chain()
            .any(|e| e.code.as_ref().is_some_and(|code| self.codes.contains(code)))
    }

    /// The outermost error in the chain whose class is one of the caught types
    pub fn matching_error(&self, error: &Arc<ExecutionError>) -> Option<Arc<ExecutionError>> {
        let mut current = Some(error.clone());
        while let Some(candidate) = current {
            if self.types.iter().any(|ty| candidate.class.is_a(*ty)) {
                return Some(candidate);
            }
            current = candidate.cause.clone();
        }
        None
    }

    fn matches_type(&self, error: &ExecutionError) -> bool {
        error
            .chain()
            .any(|candidate| self.types.iter().any(|ty| candidate.class.is_a(*ty)))
    }

    pub fn pipeline_type(&self, context: &ServiceContext, scope: TypeHandle) -> TypeHandle {
        match &self.variable {
            Some(variable) => *self.pipeline.get_or_init(|| {
                let class = if self.types.is_empty() {
                    ErrorClass::Exception
                } else {
                    ErrorClass::common_ancestor(&self.types)
                };
                context
                    .types
                    .extend(scope, vec![FieldDef::new(variable.clone(), FieldKind::Error(class))])
            }),
            None => scope,
        }
    }

    /// Run the clause for the error installed in the context
    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let ty = self.pipeline_type(vm.service_context(), scope);
        vm.pipeline.cast(ty)?;
        if let (Some(variable), Some(caught)) = (&self.variable, vm.caught().cloned()) {
            let bound = self.matching_error(&caught).unwrap_or(caught);
            vm.pipeline.set_field(variable, Value::Error(bound))?;
        }
        run_block(&self.children, vm, ty)
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let ty = self.pipeline_type(context, scope);
        let mut diagnostics = Vec::new();
        if let Some(source) = &self.regex {
            if let Err(e) = Regex::new(source) {
                diagnostics.push(Diagnostic::error(format!("Invalid regex '{}': {}", source, e)));
            }
        }
        diagnostics.extend(
            context
                .types
                .collisions(ty)
                .into_iter()
                .map(|name| Diagnostic::error(format!("Catch variable '{}' hides an outer variable", name))),
        );
        diagnostics.extend(validate_children(&self.children, context, ty));
        diagnostics
    }

    pub fn refresh(&mut self) {
        self.meta.refresh();
        self.pipeline = OnceLock::new();
        self.pattern = OnceLock::new();
    }
}

/// Pick the Catch clause for an error among the children from `start` on
///
/// Fatal errors are never caught.
pub(crate) fn select_catch(children: &[Step], start: usize, error: &ExecutionError) -> Option<usize> {
    if error.is_fatal() {
        return None;
    }
    let clauses: Vec<(usize, &Catch)> = children
        .iter()
        .enumerate()
        .skip(start)
        .filter_map(|(index, child)| match child {
            Step::Catch(catch) if !catch.meta.disabled => Some((index, catch)),
            _ => None,
        })
        .collect();

    let tiers: [&dyn Fn(&Catch) -> bool; 4] = [
        &|c| c.regex.is_some() && c.matches_regex(error),
        &|c| !c.codes.is_empty() && c.matches_code(error),
        &|c| !c.types.is_empty() && c.matches_type(error),
        &|c| c.is_default(),
    ];
    tiers
        .iter()
        .find_map(|tier| clauses.iter().find(|(_, catch)| tier(*catch)).map(|(index, _)| *index))
}

/// Cleanup clause of a Sequence, runs after the body and any Catch
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Finally {
    #[serde(flatten)]
    pub meta: StepMeta,

    #[serde(default)]
    pub children: Vec<Step>,
}

impl Finally {
    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        run_block(&self.children, vm, scope)
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        validate_children(&self.children, context, scope)
    }
}
