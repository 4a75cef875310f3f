//! Map: invokes, then links, then drops

use super::{run_child, validate_children, Step, StepMeta};
use crate::core::context::VmContext;
use crate::core::error::{Diagnostic, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::{FieldDef, FieldKind, TypeHandle};
use crate::execution::context::ServiceContext;
use crate::query::Query;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing::debug;

/// Data mapping block
///
/// Invokes run first in ascending invocation order, so later invokes can
/// consume the results of earlier ones. Links and drops follow. Resources
/// registered at map scope are closed when the block ends.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Map {
    #[serde(flatten)]
    pub meta: StepMeta,

    #[serde(default)]
    pub children: Vec<Step>,

    #[serde(skip)]
    pipeline: OnceLock<TypeHandle>,
}

impl Map {
    pub fn pipeline_type(&self, context: &ServiceContext, scope: TypeHandle) -> TypeHandle {
        *self.pipeline.get_or_init(|| {
            let fields: Vec<FieldDef> = self
                .invokes()
                .filter_map(|invoke| {
                    let Step::Invoke(invoke) = invoke else {
                        return None;
                    };
                    let name = invoke.result_name.as_ref()?;
                    let kind = match context.services.resolve(&invoke.service) {
                        Some(service) => FieldKind::Record(service.interface().output),
                        None => FieldKind::Any,
                    };
                    Some(FieldDef::new(name.clone(), kind).hidden())
                })
                .collect();
            if fields.is_empty() {
                scope
            } else {
                context.types.extend(scope, fields)
            }
        })
    }

    fn invokes(&self) -> impl Iterator<Item = &Step> {
        self.children.iter().filter(|child| matches!(child, Step::Invoke(_)))
    }

    /// Invokes sorted by invocation order, stable for equal orders
    fn ordered_invokes(&self) -> Vec<&Step> {
        let mut invokes: Vec<&Step> = self.invokes().collect();
        invokes.sort_by_key(|step| match step {
            Step::Invoke(invoke) => invoke.invocation_order,
            _ => 0,
        });
        invokes
    }

    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        vm.map_resources().reset();
        let result = self.run(vm, scope);
        let failures = vm.map_resources().close_all();
        if failures > 0 {
            debug!("Map {} closed its resources with {} failures", self.meta.id, failures);
        }
        result
    }

    fn run(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let ty = self.pipeline_type(vm.service_context(), scope);
        vm.pipeline.cast(ty)?;

        let links = self.children.iter().filter(|child| matches!(child, Step::Link(_)));
        let drops = self.children.iter().filter(|child| matches!(child, Step::Drop(_)));
        let phases = self.ordered_invokes().into_iter().chain(links).chain(drops);
        for child in phases {
            if let Flow::Aborted = run_child(child, vm, ty)? {
                return Ok(Flow::Aborted);
            }
            if vm.is_aborted() {
                return Ok(Flow::Aborted);
            }
        }
        Ok(Flow::Completed)
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let ty = self.pipeline_type(context, scope);
        let mut diagnostics: Vec<Diagnostic> = context
            .types
            .collisions(ty)
            .into_iter()
            .map(|name| Diagnostic::error(format!("Invoke result '{}' hides an outer variable", name)))
            .collect();
        diagnostics.extend(self.validate_invocation_order());
        diagnostics.extend(validate_children(&self.children, context, ty));
        diagnostics
    }

    /// An invoke may only read results of invokes that run strictly before it
    fn validate_invocation_order(&self) -> Vec<Diagnostic> {
        let invokes: Vec<_> = self
            .children
            .iter()
            .filter_map(|child| match child {
                Step::Invoke(invoke) if !invoke.meta.disabled => Some(invoke),
                _ => None,
            })
            .collect();

        let mut diagnostics = Vec::new();
        for reader in &invokes {
            let read: Vec<String> = reader
                .children
                .iter()
                .filter_map(|child| match child {
                    Step::Link(link) if !link.fixed_value => Query::parse(&link.from).ok(),
                    _ => None,
                })
                .flat_map(|query| query.variables())
                .collect();
            for producer in &invokes {
                let Some(result) = &producer.result_name else {
                    continue;
                };
                if std::ptr::eq(*producer, *reader) || !read.contains(result) {
                    continue;
                }
                if producer.invocation_order >= reader.invocation_order {
                    diagnostics.push(
                        Diagnostic::error(format!(
                            "Invoke {} reads '{}' of invoke {} which does not run before it",
                            reader.meta.id, result, producer.meta.id
                        ))
                        .within(reader.meta.id.clone()),
                    );
                }
            }
        }
        diagnostics
    }

    pub fn refresh(&mut self) {
        self.meta.refresh();
        self.pipeline = OnceLock::new();
    }
}
