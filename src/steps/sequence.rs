//! Sequence: ordered children with error handling, transactions and locking

use super::catch::select_catch;
use super::{guards_allow, run_child, run_tracked, validate_children, Step, StepMeta};
use crate::core::context::VmContext;
use crate::core::error::{Diagnostic, ExecutionError};
use crate::core::state::{BreakOutcome, Flow};
use crate::core::types::{FieldDef, FieldKind, TypeHandle};
use crate::core::value::Value;
use crate::execution::cluster::LockGuard;
use crate::execution::context::ServiceContext;
use crate::execution::transaction::TransactionContext;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use tracing::{error, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Sequence {
    #[serde(flatten)]
    pub meta: StepMeta,

    /// Start a transaction for the body and bind its id to this variable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_variable: Option<String>,

    /// Run the body under a fresh default transaction
    #[serde(default)]
    pub scope_default_transaction: bool,

    /// Hold a cluster lock named after the step id while running
    #[serde(default)]
    pub synchronized: bool,

    #[serde(default)]
    pub children: Vec<Step>,

    #[serde(skip)]
    pipeline: OnceLock<TypeHandle>,
}

/// Transactions opened by one sequence run
#[derive(Default)]
struct TransactionScope {
    opened: Vec<String>,
    previous_default: Option<Option<String>>,
}

impl TransactionScope {
    fn commit(&mut self, transactions: &dyn TransactionContext) -> Result<(), ExecutionError> {
        while let Some(id) = self.opened.pop() {
            if let Err(e) = transactions.commit(&id) {
                self.opened.push(id);
                return Err(e);
            }
            info!("Committed transaction {}", id);
        }
        Ok(())
    }

    fn rollback(&mut self, transactions: &dyn TransactionContext) {
        while let Some(id) = self.opened.pop() {
            match transactions.rollback(&id) {
                Ok(()) => info!("Rolled back transaction {}", id),
                Err(e) => warn!("Could not roll back transaction {}: {}", id, e),
            }
        }
    }

    fn restore_default(&mut self, transactions: &dyn TransactionContext) {
        if let Some(previous) = self.previous_default.take() {
            transactions.set_default_transaction(previous);
        }
    }
}

impl Sequence {
    pub fn new(children: Vec<Step>) -> Self {
        Self {
            children,
            ..Self::default()
        }
    }

    pub fn pipeline_type(&self, context: &ServiceContext, scope: TypeHandle) -> TypeHandle {
        match &self.transaction_variable {
            Some(variable) => *self.pipeline.get_or_init(|| {
                context
                    .types
                    .extend(scope, vec![FieldDef::new(variable.clone(), FieldKind::String)])
            }),
            None => scope,
        }
    }

    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let ty = self.pipeline_type(vm.service_context(), scope);
        vm.pipeline.cast(ty)?;
        let transactions = vm.execution().transactions().clone();
        let mut transaction_scope = TransactionScope::default();
        let mut lock = None;
        let mut last_started = None;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_body(vm, ty, &*transactions, &mut transaction_scope, &mut lock, &mut last_started)
        }));
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(payload) => {
                transaction_scope.rollback(&*transactions);
                transaction_scope.restore_default(&*transactions);
                error!(
                    "Sequence {} failed fatally after starting child {}",
                    self.meta.id,
                    self.child_id(last_started)
                );
                panic::resume_unwind(payload);
            }
        };

        let result = match outcome {
            Ok(Flow::Aborted) => {
                transaction_scope.rollback(&*transactions);
                Ok(Flow::Aborted)
            }
            Ok(flow) => match transaction_scope.commit(&*transactions) {
                Ok(()) => Ok(flow),
                Err(e) => {
                    transaction_scope.rollback(&*transactions);
                    Err(e)
                }
            },
            Err(e) => {
                transaction_scope.rollback(&*transactions);
                self.handle(vm, ty, e, last_started)
            }
        };
        transaction_scope.restore_default(&*transactions);

        let result = self.finish(vm, ty, last_started, result);
        drop(lock);
        result
    }

    fn run_body(
        &self,
        vm: &mut VmContext<'_>,
        ty: TypeHandle,
        transactions: &dyn TransactionContext,
        transaction_scope: &mut TransactionScope,
        lock: &mut Option<LockGuard>,
        last_started: &mut Option<usize>,
    ) -> Result<Flow, ExecutionError> {
        if let Some(variable) = &self.transaction_variable {
            let id = transactions.start()?;
            info!("Sequence {} started transaction {}", self.meta.id, id);
            transaction_scope.opened.push(id.clone());
            vm.pipeline.set_field(variable, Value::String(id))?;
        }
        if self.scope_default_transaction {
            let id = transactions.start()?;
            info!("Sequence {} runs under default transaction {}", self.meta.id, id);
            transaction_scope.opened.push(id.clone());
            transaction_scope.previous_default = Some(transactions.default_transaction());
            transactions.set_default_transaction(Some(id));
        }
        if self.synchronized {
            *lock = Some(vm.cluster().lock(&self.meta.id)?);
        }

        for (index, child) in self.children.iter().enumerate() {
            if child.is_disabled() || matches!(child, Step::Catch(_) | Step::Finally(_)) {
                continue;
            }
            *last_started = Some(index);
            let flow = run_child(child, vm, ty)?;
            vm.pipeline.cast(ty)?;
            match flow {
                Flow::Completed => {}
                Flow::Aborted => return Ok(Flow::Aborted),
                Flow::Break { count, resume } => match Flow::consume_break(count, resume) {
                    BreakOutcome::Propagate(flow) => return Ok(flow),
                    BreakOutcome::Resume => {}
                    BreakOutcome::Stop => return Ok(Flow::Completed),
                },
            }
            if vm.is_aborted() {
                return Ok(Flow::Aborted);
            }
        }
        Ok(Flow::Completed)
    }

    /// Hand an error to the first matching Catch after the failing child
    fn handle(
        &self,
        vm: &mut VmContext<'_>,
        ty: TypeHandle,
        error: ExecutionError,
        last_started: Option<usize>,
    ) -> Result<Flow, ExecutionError> {
        if error.is_fatal() {
            return Err(error);
        }
        let start = last_started.map_or(0, |index| index + 1);
        let Some(index) = select_catch(&self.children, start, &error) else {
            return Err(error);
        };
        let Step::Catch(catch) = &self.children[index] else {
            return Err(error);
        };
        if vm.config().log_errors && !catch.suppress_exception {
            warn!("Sequence {} caught: {}", self.meta.id, error.trace());
        }

        vm.pipeline.cast(ty)?;
        // A guarded-off catch still handles the error
        if !guards_allow(&self.children[index], vm)? {
            return Ok(Flow::Completed);
        }
        let previous = vm.replace_caught(Some(Arc::new(error)));
        let result = run_tracked(&self.children[index], vm, ty);
        vm.replace_caught(previous);
        vm.pipeline.cast(ty)?;
        result
    }

    /// Run the first Finally after the last started child
    fn finish(
        &self,
        vm: &mut VmContext<'_>,
        ty: TypeHandle,
        last_started: Option<usize>,
        result: Result<Flow, ExecutionError>,
    ) -> Result<Flow, ExecutionError> {
        let start = last_started.map_or(0, |index| index + 1);
        let Some(finally) = self
            .children
            .iter()
            .skip(start)
            .find(|child| matches!(child, Step::Finally(_)) && !child.is_disabled())
        else {
            return result;
        };
        vm.pipeline.cast(ty)?;
        if guards_allow(finally, vm)? {
            run_tracked(finally, vm, ty)?;
        }
        result
    }

    fn child_id(&self, index: Option<usize>) -> &str {
        index
            .and_then(|index| self.children.get(index))
            .map_or("none", |child| child.id())
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let ty = self.pipeline_type(context, scope);
        let mut diagnostics: Vec<Diagnostic> = context
            .types
            .collisions(ty)
            .into_iter()
            .map(|name| Diagnostic::error(format!("Transaction variable '{}' hides an outer variable", name)))
            .collect();
        diagnostics.extend(validate_children(&self.children, context, ty));
        diagnostics
    }

    pub fn refresh(&mut self) {
        self.meta.refresh();
        self.pipeline = OnceLock::new();
    }
}
