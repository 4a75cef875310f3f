//! Switch: run the first child whose label matches

use super::{features_allow, optional_expression, run_tracked, validate_children, Step, StepMeta};
use crate::core::context::VmContext;
use crate::core::error::{codes, Diagnostic, ExecutionError};
use crate::core::state::Flow;
use crate::core::types::TypeHandle;
use crate::core::value::Value;
use crate::execution::context::ServiceContext;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Switch {
    #[serde(flatten)]
    pub meta: StepMeta,

    /// Selector, children labels are compared against its value
    ///
    /// Without a selector the first child whose label is true runs.
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "optional_expression")]
    pub query: Option<String>,

    #[serde(default)]
    pub children: Vec<Step>,
}

impl Switch {
    pub fn execute(&self, vm: &mut VmContext<'_>, scope: TypeHandle) -> Result<Flow, ExecutionError> {
        let selector = match &self.query {
            Some(query) => self.meta.evaluate(query, vm.pipeline.record())?,
            None => Value::Bool(true),
        };

        for child in &self.children {
            if child.is_disabled() || !features_allow(child, vm)? {
                continue;
            }
            let matched = match &child.meta().label {
                None => true,
                Some(label) => {
                    let value = child.meta().evaluate(label, vm.pipeline.record())?;
                    self.matches(&selector, &value, child.id())?
                }
            };
            if matched {
                return run_tracked(child, vm, scope);
            }
            if vm.is_aborted() {
                return Ok(Flow::Aborted);
            }
        }
        Ok(Flow::Completed)
    }

    fn matches(&self, selector: &Value, label: &Value, child: &str) -> Result<bool, ExecutionError> {
        if selector.is_null() || label.is_null() {
            return Ok(selector.is_null() && label.is_null());
        }
        match label.convert_like(selector) {
            Some(converted) => Ok(converted.loosely_equals(selector)),
            None if matches!(selector, Value::Bool(_)) => Ok(Value::Bool(true).loosely_equals(selector)),
            None => Err(ExecutionError::vm(
                codes::SWITCH_CONVERSION,
                format!(
                    "Label of {} is a {} and can not be compared with a {}",
                    child,
                    label.kind_name(),
                    selector.kind_name()
                ),
            )
            .with_source(self.meta.id.clone())),
        }
    }

    pub fn validate(&self, context: &ServiceContext, scope: TypeHandle) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        if let Some(query) = &self.query {
            diagnostics.extend(self.meta.validate_query(query, context, scope));
        }
        diagnostics.extend(validate_children(&self.children, context, scope));
        diagnostics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::*;

    const ROUTE: &str = r#"
kind: switch
query: choice
children:
  - kind: sequence
    label: "'a'"
    children:
      - kind: map
        children:
          - kind: link
            from: "'first'"
            to: taken
  - kind: sequence
    label: "2"
    children:
      - kind: map
        children:
          - kind: link
            from: "'second'"
            to: taken
  - kind: sequence
    children:
      - kind: map
        children:
          - kind: link
            from: "'default'"
            to: taken
"#;

    fn taken(choice: Value) -> Result<Value, ExecutionError> {
        let fixture = Fixture::new(&["choice", "taken"]);
        let mut vm = fixture.vm();
        vm.pipeline.set_field("choice", choice).unwrap();
        step(ROUTE).execute(&mut vm, fixture.root)?;
        Ok(vm.pipeline.get("taken").cloned().unwrap_or_default())
    }

    #[test]
    fn test_first_matching_child_runs() {
        assert_eq!(taken("a".into()).unwrap(), Value::from("first"));
        assert_eq!(taken("2".into()).unwrap(), Value::from("second"));
        assert_eq!(taken("z".into()).unwrap(), Value::from("default"));
    }

    #[test]
    fn test_unlabelled_child_matches_null_selector() {
        assert_eq!(taken(Value::Null).unwrap(), Value::from("default"));
    }

    #[test]
    fn test_boolean_switch_without_selector() {
        let fixture = Fixture::new(&["flag", "taken"]);
        let mut vm = fixture.vm();
        vm.pipeline.set_field("flag", true.into()).unwrap();
        let yaml = r#"
kind: switch
children:
  - kind: sequence
    label: "!flag"
    children:
      - kind: map
        children:
          - kind: link
            from: "1"
            to: taken
  - kind: sequence
    label: flag
    children:
      - kind: map
        children:
          - kind: link
            from: "2"
            to: taken
"#;
        step(yaml).execute(&mut vm, fixture.root).unwrap();
        assert_eq!(vm.pipeline.get("taken"), Some(&Value::from(2)));
    }

    #[test]
    fn test_unconvertible_label_fails() {
        let error = taken(2.into()).unwrap_err();
        assert_eq!(error.code.as_deref(), Some(codes::SWITCH_CONVERSION));

        let fixture = Fixture::new(&["choice", "record"]);
        let mut vm = fixture.vm();
        vm.pipeline.set_field("choice", 1.into()).unwrap();
        vm.pipeline.set_field("record", Value::record([("a", Value::from(1))])).unwrap();
        let yaml = "kind: switch\nquery: choice\nchildren:\n  - kind: break\n    label: record\n";
        let error = step(yaml).execute(&mut vm, fixture.root).unwrap_err();
        assert_eq!(error.code.as_deref(), Some(codes::SWITCH_CONVERSION));
    }
}
