//! Trackers, aborts, feature gates and labels during a run

use crate::helpers::*;
use serde_json::json;
use std::sync::Arc;
use stepvm::core::error::{codes, ExecutionError};
use stepvm::execution::tracker::{RuntimeTracker, StepRef};
use stepvm::execution::{AbortHandle, TrackerEventKind};

const GATED: &str = r#"
name: gated
output:
  - name: path
steps:
  - kind: map
    features: beta && !legacy
    children:
      - kind: link
        from: "'beta'"
        to: output/path
  - kind: map
    label: output/path == null
    children:
      - kind: link
        from: "'stable'"
        to: output/path
  - kind: map
    disabled: true
    children:
      - kind: link
        from: "'disabled'"
        to: output/path
"#;

/// Tracker whose every callback fails
struct Broken;

impl RuntimeTracker for Broken {
    fn before(&self, _step: StepRef<'_>) -> anyhow::Result<()> {
        anyhow::bail!("tracker offline")
    }

    fn after(&self, _step: StepRef<'_>) -> anyhow::Result<()> {
        anyhow::bail!("tracker offline")
    }

    fn error(&self, _step: StepRef<'_>, _error: &ExecutionError) -> anyhow::Result<()> {
        anyhow::bail!("tracker offline")
    }
}

/// Tracker that aborts the run when a given step is about to start
struct AbortAt {
    step: &'static str,
    abort: AbortHandle,
}

impl RuntimeTracker for AbortAt {
    fn before(&self, step: StepRef<'_>) -> anyhow::Result<()> {
        if step.id == self.step {
            self.abort.abort();
        }
        Ok(())
    }

    fn after(&self, _step: StepRef<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn error(&self, _step: StepRef<'_>, _error: &ExecutionError) -> anyhow::Result<()> {
        Ok(())
    }
}

fn path(harness: &Harness, features: Option<Vec<&str>>) -> String {
    let mut execution = harness.execution();
    if let Some(features) = features {
        execution = execution.with_features(features);
    }
    let output = harness.run_with(&execution, json!({})).unwrap();
    output.get("path").and_then(|v| v.as_str()).unwrap_or_default().to_string()
}

#[test]
fn test_feature_gates_and_labels() {
    let harness = Harness::load(GATED);
    assert_eq!(path(&harness, Some(vec!["beta"])), "beta");
    assert_eq!(path(&harness, Some(vec!["beta", "legacy"])), "stable");
    assert_eq!(path(&harness, Some(vec![])), "stable");
    // Without feature support every gate is open
    assert_eq!(path(&harness, None), "beta");
}

#[test]
fn test_tracker_sees_every_step() {
    let harness = Harness::load(GATED);
    harness.run(json!({})).unwrap();

    let events = harness.tracker.events();
    let links = events
        .iter()
        .filter(|e| e.step_kind == "link" && e.kind == TrackerEventKind::Before)
        .count();
    assert_eq!(links, 1);
    assert_eq!(events.first().map(|e| e.step_kind), Some("sequence"));
    assert_eq!(events.last().map(|e| e.kind.clone()), Some(TrackerEventKind::After));
}

#[test]
fn test_tracker_errors_are_reported_for_failing_steps() {
    let harness = Harness::load("name: failing\nsteps:\n  - kind: throw\n    id: boom\n    code: E-BOOM\n");
    assert_error_code(&harness.run(json!({})), "E-BOOM");
    assert!(harness
        .tracker
        .events()
        .iter()
        .any(|e| e.step_id == "boom" && matches!(e.kind, TrackerEventKind::Error(_))));
}

#[test]
fn test_broken_tracker_does_not_fail_the_run() {
    let harness = Harness::load(GATED);
    let execution = harness.execution().with_tracker(Arc::new(Broken));
    let output = harness.run_with(&execution, json!({})).unwrap();
    assert_eq!(output.get("path").and_then(|v| v.as_str()), Some("beta"));
}

#[test]
fn test_abort_stops_before_remaining_steps() {
    let harness = Harness::load(
        r#"
name: long
output:
  - name: reached
    list: true
steps:
  - kind: for
    query: "10"
    variable: i
    children:
      - kind: map
        id: work
        children:
          - kind: link
            from: "output/reached + [i]"
            to: output/reached
  - kind: map
    id: after
"#,
    );
    let abort = AbortHandle::new();
    let execution = harness
        .execution()
        .with_abort_handle(abort.clone())
        .with_tracker(Arc::new(AbortAt { step: "work", abort }));

    assert_error_code(&harness.run_with(&execution, json!({})), codes::ABORTED);
}

#[test]
fn test_switch_routes_on_input() {
    let harness = Harness::load(
        r#"
name: router
input:
  - name: tier
output:
  - name: discount
    type: integer
steps:
  - kind: switch
    query: input/tier
    children:
      - kind: map
        label: "'gold'"
        children:
          - kind: link
            from: "20"
            to: output/discount
      - kind: map
        label: "'silver'"
        children:
          - kind: link
            from: "10"
            to: output/discount
      - kind: map
        children:
          - kind: link
            from: "0"
            to: output/discount
"#,
    );

    assert_output(&harness.run(json!({"tier": "silver"})), json!({"discount": 10}));
    assert_output(&harness.run(json!({"tier": "bronze"})), json!({"discount": 0}));
    assert_output(&harness.run(json!({})), json!({"discount": 0}));
}
