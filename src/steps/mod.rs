//! Workflow steps
//!
//! A workflow is a tree of [`Step`]s. Every step carries a [`StepMeta`]
//! header (id, label, disabled flag, feature gate, description) and a kind
//! specific body. Groups pass the pipeline type visible to their children
//! down as a `scope` handle; groups that introduce local variables extend it.

pub mod catch;
pub mod control;
pub mod for_loop;
pub mod invoke;
pub mod link;
pub mod map;
pub mod sequence;
pub mod switch;
pub mod throw;

pub use catch::{Catch, Finally};
pub use control::{Break, DropVariable};
pub use for_loop::For;
pub use invoke::Invoke;
pub use link::Link;
pub use map::Map;
pub use sequence::Sequence;
pub use switch::Switch;
pub use throw::Throw;

use crate::core::context::VmContext;
use crate::core::error::{codes, Diagnostic, ErrorClass, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::TypeHandle;
use crate::core::value::{Record, Value};
use crate::execution::context::ServiceContext;
use crate::execution::tracker::StepRef;
use crate::query::{Query, QueryCache};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Discriminant of a [`Step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Sequence,
    For,
    Switch,
    Map,
    Invoke,
    Link,
    Drop,
    Throw,
    Break,
    Catch,
    Finally,
}

impl StepKind {
    pub fn name(self) -> &'static str {
        match self {
            StepKind::Sequence => "sequence",
            StepKind::For => "for",
            StepKind::Switch => "switch",
            StepKind::Map => "map",
            StepKind::Invoke => "invoke",
            StepKind::Link => "link",
            StepKind::Drop => "drop",
            StepKind::Throw => "throw",
            StepKind::Break => "break",
            StepKind::Catch => "catch",
            StepKind::Finally => "finally",
        }
    }

    /// Kinds that may appear as direct children
    pub fn allowed_children(self) -> &'static [StepKind] {
        use StepKind::*;
        match self {
            Sequence => &[Switch, For, Map, Throw, Sequence, Finally, Catch, Break],
            Catch | Finally | Switch => &[Switch, For, Map, Throw, Sequence, Break],
            For => &[Switch, For, Map, Throw, Sequence],
            Map => &[Invoke, Link, Drop],
            Invoke => &[Link],
            Link | Drop | Throw | Break => &[],
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Generate a step id, a uuid without dashes
pub fn generate_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Attributes shared by every step
#[derive(Debug, Serialize, Deserialize)]
pub struct StepMeta {
    #[serde(default = "generate_id")]
    pub id: String,

    /// Guard expression, the step only runs when it evaluates to true
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "optional_expression")]
    pub label: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,

    /// Reported to the runtime tracker, `=` makes it an expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Feature gate, an expression over feature names
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<String>,

    #[serde(skip)]
    queries: QueryCache,
}

impl StepMeta {
    pub fn new() -> Self {
        Self {
            id: generate_id(),
            label: None,
            disabled: false,
            comment: None,
            description: None,
            features: None,
            queries: QueryCache::new(),
        }
    }

    /// Parsed form of a query, cached for the lifetime of the step
    pub fn query(&self, source: &str) -> Result<Arc<Query>, ExecutionError> {
        self.queries
            .get(source)
            .map_err(|e| ExecutionError::from(e).with_source(self.id.clone()))
    }

    /// Evaluate a query against a record
    pub fn evaluate(&self, source: &str, record: &Record) -> Result<Value, ExecutionError> {
        self.query(source)?.evaluate(record).map_err(|e| {
            ExecutionError::vm(codes::GET_FAILED, format!("Could not get '{}'", source))
                .with_source(self.id.clone())
                .with_cause(ExecutionError::from(e))
        })
    }

    /// A literal, or an expression when prefixed with `=`
    ///
    /// A lone `=` is a literal, `\=` escapes a literal leading `=`.
    pub fn literal_or_expression(&self, raw: &str, record: &Record) -> Result<Value, ExecutionError> {
        if let Some(escaped) = raw.strip_prefix("\\=") {
            Ok(Value::String(format!("={}", escaped)))
        } else if let Some(expression) = raw.strip_prefix('=').filter(|e| !e.is_empty()) {
            self.evaluate(expression, record)
        } else {
            Ok(Value::String(raw.to_string()))
        }
    }

    pub fn refresh(&mut self) {
        self.queries.clear();
    }

    fn validate_query(&self, source: &str, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        match Query::parse(source) {
            Ok(query) => query.validate(&context.types, scope),
            Err(e) => vec![Diagnostic::error(e.to_string())],
        }
    }

    fn validate_literal_or_expression(
        &self,
        raw: &str,
        context: &ServiceContext,
        scope: TypeHandle,
    ) -> Vec<Diagnostic> {
        match raw.strip_prefix('=').filter(|e| !e.is_empty()) {
            Some(expression) if !raw.starts_with("\\=") => self.validate_query(expression, context, scope),
            _ => Vec::new(),
        }
    }
}

impl Default for StepMeta {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawExpression {
    Text(String),
    Integer(i64),
    Decimal(f64),
    Bool(bool),
}

impl From<RawExpression> for String {
    fn from(raw: RawExpression) -> Self {
        match raw {
            RawExpression::Text(s) => s,
            RawExpression::Integer(i) => i.to_string(),
            RawExpression::Decimal(d) => d.to_string(),
            RawExpression::Bool(b) => b.to_string(),
        }
    }
}

/// Accept scalars of any kind where an expression string is expected
pub(crate) fn expression<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    RawExpression::deserialize(deserializer).map(String::from)
}

pub(crate) fn optional_expression<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    Option::<RawExpression>::deserialize(deserializer).map(|raw| raw.map(String::from))
}

/// A node of the workflow tree
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Step {
    Sequence(Sequence),
    For(For),
    Switch(Switch),
    Map(Map),
    Invoke(Invoke),
    Link(Link),
    Drop(DropVariable),
    Throw(Throw),
    Break(Break),
    Catch(Catch),
    Finally(Finally),
}

macro_rules! dispatch {
    ($step:expr, $inner:ident => $body:expr) => {
        match $step {
            Step::Sequence($inner) => $body,
            Step::For($inner) => $body,
            Step::Switch($inner) => $body,
            Step::Map($inner) => $body,
            Step::Invoke($inner) => $body,
            Step::Link($inner) => $body,
            Step::Drop($inner) => $body,
            Step::Throw($inner) => $body,
            Step::Break($inner) => $body,
            Step::Catch($inner) => $body,
            Step::Finally($inner) => $body,
        }
    };
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Sequence(_) => StepKind::Sequence,
            Step::For(_) => StepKind::For,
            Step::Switch(_) => StepKind::Switch,
            Step::Map(_) => StepKind::Map,
            Step::Invoke(_) => StepKind::Invoke,
            Step::Link(_) => StepKind::Link,
            Step::Drop(_) => StepKind::Drop,
            Step::Throw(_) => StepKind::Throw,
            Step::Break(_) => StepKind::Break,
            Step::Catch(_) => StepKind::Catch,
            Step::Finally(_) => StepKind::Finally,
        }
    }

    pub fn meta(&self) -> &StepMeta {
        dispatch!(self, step => &step.meta)
    }

    pub fn meta_mut(&mut self) -> &mut StepMeta {
        dispatch!(self, step => &mut step.meta)
    }

    pub fn id(&self) -> &str {
        &self.meta().id
    }

    pub fn is_disabled(&self) -> bool {
        self.meta().disabled
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.meta_mut().id = id.into();
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.meta_mut().label = Some(label.into());
        self
    }

    pub fn with_features(mut self, features: impl Into<String>) -> Self {
        self.meta_mut().features = Some(features.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.meta_mut().disabled = true;
        self
    }

    pub fn children(&self) -> &[Step] {
        match self {
            Step::Sequence(s) => &s.children,
            Step::For(s) => &s.children,
            Step::Switch(s) => &s.children,
            Step::Map(s) => &s.children,
            Step::Invoke(s) => &s.children,
            Step::Catch(s) => &s.children,
            Step::Finally(s) => &s.children,
            Step::Link(_) | Step::Drop(_) | Step::Throw(_) | Step::Break(_) => &[],
        }
    }

    /// Visit this step and all its descendants, depth first
    pub fn walk<'s>(&'s self, visitor: &mut impl FnMut(&'s Step)) {
        visitor(self);
        for child in self.children() {
            child.walk(visitor);
        }
    }

    /// Pipeline type visible to the children of this step
    pub fn pipeline_type(&self, context: &ServiceContext, scope: TypeHandle) -> TypeHandle {
        match self {
            Step::Sequence(s) => s.pipeline_type(context, scope),
            Step::For(s) => s.pipeline_type(context, scope),
            Step::Map(s) => s.pipeline_type(context, scope),
            Step::Catch(s) => s.pipeline_type(context, scope),
            _ => scope,
        }
    }

    /// Run the step itself, guards are checked by the parent
    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        match self {
            Step::Sequence(s) => s.execute(vm, scope),
            Step::For(s) => s.execute(vm, scope),
            Step::Switch(s) => s.execute(vm, scope),
            Step::Map(s) => s.execute(vm, scope),
            Step::Invoke(s) => s.execute(vm, scope),
            Step::Link(s) => s.execute(vm, scope),
            Step::Drop(s) => s.execute(vm, scope),
            Step::Throw(s) => s.execute(vm, scope),
            Step::Break(s) => s.execute(vm, scope),
            Step::Catch(s) => s.execute(vm, scope),
            Step::Finally(s) => s.execute(vm, scope),
        }
    }

    /// Static checks of this step and its descendants
    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let meta = self.meta();
        let mut diagnostics = Vec::new();
        if let Some(label) = &meta.label {
            diagnostics.extend(meta.validate_query(label, context, scope));
        }
        if let Some(features) = &meta.features {
            if let Err(e) = Query::parse(features) {
                diagnostics.push(Diagnostic::error(format!("Invalid feature gate: {}", e)));
            }
        }
        if let Some(description) = &meta.description {
            diagnostics.extend(meta.validate_literal_or_expression(description, context, scope));
        }
        let allowed = self.kind().allowed_children();
        for child in self.children() {
            if !allowed.contains(&child.kind()) {
                diagnostics.push(Diagnostic::error(format!(
                    "A {} step is not allowed in a {} step",
                    child.kind(),
                    self.kind()
                )).within(child.id()));
            }
        }
        diagnostics.extend(match self {
            Step::Sequence(s) => s.validate(context, scope),
            Step::For(s) => s.validate(context, scope),
            Step::Switch(s) => s.validate(context, scope),
            Step::Map(s) => s.validate(context, scope),
            Step::Invoke(s) => s.validate(context, scope),
            Step::Link(s) => s.validate(context, scope),
            Step::Drop(s) => s.validate(context, scope),
            Step::Throw(s) => s.validate(context, scope),
            Step::Break(s) => s.validate(context, scope),
            Step::Catch(s) => s.validate(context, scope),
            Step::Finally(s) => s.validate(context, scope),
        });
        diagnostics.into_iter().map(|d| d.within(self.id())).collect()
    }

    /// Drop cached queries and pipeline types, required after structural edits
    pub fn refresh(&mut self) {
        match &mut *self {
            Step::Sequence(s) => s.refresh(),
            Step::For(s) => s.refresh(),
            Step::Map(s) => s.refresh(),
            Step::Catch(s) => s.refresh(),
            other => other.meta_mut().refresh(),
        }
        if let Some(children) = self.children_mut() {
            children.iter_mut().for_each(Step::refresh);
        }
    }

    fn children_mut(&mut self) -> Option<&mut Vec<Step>> {
        match self {
            Step::Sequence(s) => Some(&mut s.children),
            Step::For(s) => Some(&mut s.children),
            Step::Switch(s) => Some(&mut s.children),
            Step::Map(s) => Some(&mut s.children),
            Step::Invoke(s) => Some(&mut s.children),
            Step::Catch(s) => Some(&mut s.children),
            Step::Finally(s) => Some(&mut s.children),
            Step::Link(_) | Step::Drop(_) | Step::Throw(_) | Step::Break(_) => None,
        }
    }

    fn step_ref(&self) -> StepRef<'_> {
        StepRef {
            id: self.id(),
            kind: self.kind().name(),
        }
    }
}

/// Validate children against the pipeline type they will see
pub(crate) fn validate_children(children: &[Step], context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
    children
        .iter()
        .filter(|child| !child.is_disabled())
        .flat_map(|child| child.validate(context, scope))
        .collect()
}

/// Whether the feature gate of a step lets it run
pub(crate) fn features_allow(step: &Step, vm: &VmContext<'_>) -> Result<bool, ExecutionError> {
    let meta = step.meta();
    let (Some(gate), Some(enabled)) = (&meta.features, vm.execution().features()) else {
        return Ok(true);
    };
    let query = meta.query(gate)?;
    let flags: Record = query
        .variables()
        .into_iter()
        .map(|name| {
            let on = enabled.contains(&name);
            (name, Value::Bool(on))
        })
        .collect();
    let value = query.evaluate(&flags).map_err(ExecutionError::from)?;
    Ok(value.to_boolean().unwrap_or(true))
}

/// Whether the label of a step lets it run
///
/// Null counts as false, values without a boolean form count as true.
pub(crate) fn label_allows(step: &Step, vm: &VmContext<'_>) -> Result<bool, ExecutionError> {
    let meta = step.meta();
    let Some(label) = &meta.label else {
        return Ok(true);
    };
    let value = meta.evaluate(label, vm.pipeline.record())?;
    Ok(value.to_boolean().unwrap_or(true))
}

/// Whether a step is enabled, its feature gate is open and its label is true
pub(crate) fn guards_allow(step: &Step, vm: &VmContext<'_>) -> Result<bool, ExecutionError> {
    Ok(!step.is_disabled() && features_allow(step, vm)? && label_allows(step, vm)?)
}

/// Run a child unless it is disabled, gated off or its label is false
pub(crate) fn run_child(child: &Step, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
    if !guards_allow(child, vm)? {
        return Ok(Flow::Completed);
    }
    run_tracked(child, vm, scope)
}

/// Run a child with tracking and depth accounting, ignoring its guards
pub(crate) fn run_tracked(child: &Step, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
    vm.enter().map_err(|e| e.with_source(child.id()))?;
    let tracker = vm.execution().tracker().cloned();
    if let Some(tracker) = &tracker {
        if let Err(e) = tracker.before(child.step_ref()) {
            warn!("Tracker failed before step {}: {:#}", child.id(), e);
        }
        if let Some(description) = &child.meta().description {
            match child.meta().literal_or_expression(description, vm.pipeline.record()) {
                Ok(value) => {
                    if let Err(e) = tracker.describe(child.step_ref(), &value) {
                        warn!("Tracker failed to describe step {}: {:#}", child.id(), e);
                    }
                }
                Err(e) => warn!("Could not evaluate description of step {}: {}", child.id(), e),
            }
        }
    }

    debug!("Executing {} step {}", child.kind(), child.id());
    let result = child.execute(vm, scope).map_err(|e| attribute(e, child.id()));
    vm.leave();

    if let Some(tracker) = &tracker {
        let outcome = match &result {
            Ok(_) => tracker.after(child.step_ref()),
            Err(e) => tracker.error(child.step_ref(), e),
        };
        if let Err(e) = outcome {
            warn!("Tracker failed after step {}: {:#}", child.id(), e);
        }
    }
    result
}

/// Attribute an error to the step it escaped from, wrapping host failures
fn attribute(error: ExecutionError, step_id: &str) -> ExecutionError {
    if error.class == ErrorClass::Host {
        return ExecutionError::vm(codes::STEP_FAILED, format!("Step {} failed: {}", step_id, error.message))
            .with_source(step_id)
            .with_cause(error);
    }
    if error.source_id.is_none() {
        return error.with_source(step_id);
    }
    error
}

/// Run children in order until one breaks or the run aborts
///
/// Catch and Finally children only have meaning inside a Sequence and are
/// skipped here.
pub(crate) fn run_block(children: &[Step], vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
    for child in children {
        if matches!(child, Step::Catch(_) | Step::Finally(_)) {
            continue;
        }
        match run_child(child, vm, scope)? {
            Flow::Completed => {}
            other => return Ok(other),
        }
        if vm.is_aborted() {
            return Ok(Flow::Aborted);
        }
    }
    Ok(Flow::Completed)
}
