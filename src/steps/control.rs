//! Break and Drop

use super::{expression, StepMeta};
use crate::core::context::VmContext;
use crate::core::error::{codes, Diagnostic, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::TypeHandle;
use crate::execution::context::ServiceContext;
use crate::query::Query;
use serde::{Deserialize, Serialize};

fn one() -> u32 {
    1
}

/// Leave enclosing sequences and loops
#[derive(Debug, Serialize, Deserialize)]
pub struct Break {
    #[serde(flatten)]
    pub meta: StepMeta,

    /// Number of enclosing levels to leave
    #[serde(default = "one")]
    pub count: u32,

    /// Resume the construct where the count runs out instead of leaving it
    #[serde(default, rename = "continue")]
    pub resume: bool,
}

impl Default for Break {
    fn default() -> Self {
        Self {
            meta: StepMeta::new(),
            count: one(),
            resume: false,
        }
    }
}

impl Break {
    pub fn execute(&self, _vm: &mut VmContext<'_>, _scope: TypeHandle) -> Result<Flow, ExecutionError> {
        Ok(Flow::Break {
            count: self.count,
            resume: self.resume,
        })
    }

    pub fn validate(&self, _context: &ServiceContext, _scope: TypeHandle) -> Vec<Diagnostic> {
        if self.count == 0 {
            vec![Diagnostic::error("Break count must be at least 1")]
        } else {
            Vec::new()
        }
    }
}

/// Unset a variable
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DropVariable {
    #[serde(flatten)]
    pub meta: StepMeta,

    #[serde(default, deserialize_with = "expression")]
    pub path: String,
}

impl DropVariable {
    pub fn execute(&self, vm: &mut VmContext<'_>, _scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let query = self.meta.query(&self.path)?;
        if !query.is_variable() {
            return Err(ExecutionError::vm(
                codes::INVALID_SET,
                format!("Can not drop '{}', it is not a variable", self.path),
            )
            .with_source(self.meta.id.clone()));
        }
        let path = query.resolve(vm.pipeline.record()).map_err(ExecutionError::from)?;
        vm.pipeline.remove(&path)?;
        Ok(Flow::Completed)
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        match Query::parse(&self.path) {
            Ok(query) if query.is_variable() => query.validate(&context.types, scope),
            Ok(_) => vec![Diagnostic::error(format!("Drop path '{}' is not a variable", self.path))],
            Err(e) => vec![Diagnostic::error(e.to_string())],
        }
    }
}
