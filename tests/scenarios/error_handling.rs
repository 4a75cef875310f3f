//! Catch, Finally and Throw across a whole service run

use crate::helpers::*;
use serde_json::json;
use stepvm::core::error::{codes, ErrorClass, ExecutionError};
use stepvm::core::value::Record;

fn finally_runs(harness: &Harness) -> usize {
    harness
        .tracker
        .started()
        .iter()
        .filter(|id| id.as_str() == "cleanup")
        .count()
}

#[test]
fn test_default_catch_swallows_error_and_finally_runs_once() {
    let harness = Harness::load(
        r#"
name: checkout
output:
  - name: log
    list: true
steps:
  - kind: throw
    code: E-PAY
    message: Payment declined
  - kind: map
    id: skipped
    children:
      - kind: link
        from: "['unreachable']"
        to: output/log
  - kind: catch
    children:
      - kind: map
        children:
          - kind: link
            from: "['caught']"
            to: output/log
  - kind: finally
    id: cleanup
    children:
      - kind: map
        children:
          - kind: link
            from: "output/log + ['finally']"
            to: output/log
"#,
    );

    let result = harness.run(json!({}));
    assert_output(&result, json!({"log": ["caught", "finally"]}));
    assert_eq!(finally_runs(&harness), 1);
    assert!(!harness.tracker.started().contains(&"skipped".to_string()));
}

#[test]
fn test_uncaught_error_still_runs_finally() {
    let harness = Harness::load(
        r#"
name: checkout
steps:
  - kind: throw
    code: E-PAY
  - kind: catch
    codes: [E-OTHER]
  - kind: finally
    id: cleanup
"#,
    );

    let result = harness.run(json!({}));
    assert_error_code(&result, "E-PAY");
    assert_eq!(finally_runs(&harness), 1);
}

#[test]
fn test_business_code_is_caught_across_services() {
    let harness = Harness::load(
        r#"
name: orders
output:
  - name: reason
    type: string
steps:
  - kind: map
    children:
      - kind: invoke
        service: inventory
  - kind: catch
    codes: [E-PRICE]
    children:
      - kind: map
        children:
          - kind: link
            from: "'price'"
            to: output/reason
  - kind: catch
    codes: [E-STOCK]
    variable: failure
    children:
      - kind: map
        children:
          - kind: link
            from: failure/message
            to: output/reason
services:
  - name: inventory
    steps:
      - kind: throw
        code: E-STOCK
        message: Out of stock
"#,
    );

    assert_output(&harness.run(json!({})), json!({"reason": "Out of stock"}));
}

#[test]
fn test_code_deep_in_cause_chain_is_caught() {
    let harness = Harness::load(
        r#"
name: archive
output:
  - name: code
steps:
  - kind: map
    id: store
    children:
      - kind: invoke
        service: disk
  - kind: catch
    codes: [E-DISK]
    variable: failure
    children:
      - kind: map
        children:
          - kind: link
            from: failure/code
            to: output/code
"#,
    );
    harness.native("disk", &[], &[], |_, _| {
        let mut root = ExecutionError::new(ErrorClass::Business, "disk full");
        root.code = Some("E-DISK".to_string());
        Err(ExecutionError::new(ErrorClass::Host, "write failed").with_cause(root))
    });

    assert_output(&harness.run(json!({})), json!({"code": codes::STEP_FAILED}));
}

#[test]
fn test_regex_catch_matches_the_error_trace() {
    let harness = Harness::load(
        r#"
name: archive
output:
  - name: handled
    type: boolean
steps:
  - kind: map
    children:
      - kind: invoke
        service: disk
  - kind: catch
    regex: ".*Caused by: .*disk full.*"
    children:
      - kind: map
        children:
          - kind: link
            from: "true"
            to: output/handled
"#,
    );
    harness.native("disk", &[], &[], |_, _| {
        Err(ExecutionError::new(ErrorClass::Host, "write failed")
            .with_cause(ExecutionError::new(ErrorClass::Host, "disk full")))
    });

    assert_output(&harness.run(json!({})), json!({"handled": true}));
}

#[test]
fn test_throw_code_from_expression() {
    let harness = Harness::load(
        r#"
name: reject
input:
  - name: reason
steps:
  - kind: throw
    code: "=input/reason"
    message: "='Rejected: ' + input/reason"
"#,
    );

    let result = harness.run(json!({"reason": "E1"}));
    assert_error_code(&result, "E1");
    assert_eq!(result.unwrap_err().message, "Rejected: E1");
}

#[test]
fn test_rethrow_keeps_the_original_error() {
    let harness = Harness::load(
        r#"
name: orders
steps:
  - kind: map
    children:
      - kind: invoke
        service: inventory
  - kind: catch
    variable: failure
    children:
      - kind: throw
        message: "=failure"
services:
  - name: inventory
    steps:
      - kind: throw
        id: out-of-stock
        code: E-STOCK
        message: Out of stock
"#,
    );

    let error = harness.run(json!({})).unwrap_err();
    assert_eq!(error.code.as_deref(), Some("E-STOCK"));
    assert_eq!(error.source_id.as_deref(), Some("out-of-stock"));
    assert!(error.explicit);
}

#[test]
fn test_fatal_errors_are_never_caught() {
    let harness = Harness::load(
        r#"
name: fragile
steps:
  - kind: map
    children:
      - kind: invoke
        service: crash
  - kind: catch
    id: handler
"#,
    );
    harness.native("crash", &[], &[], |_, _| -> Result<Record, ExecutionError> {
        Err(ExecutionError::new(ErrorClass::Fatal, "stack exhausted"))
    });

    let error = harness.run(json!({})).unwrap_err();
    assert_eq!(error.class, ErrorClass::Fatal);
    assert!(!harness.tracker.started().contains(&"handler".to_string()));
}

const SELF_INVOKING: &str = r#"
name: loop.self
steps:
  - kind: map
    children:
      - kind: invoke
        service: loop.self
  - kind: catch
    id: handler
"#;

#[test]
fn test_self_invoking_service_hits_the_depth_limit() {
    let yaml = SELF_INVOKING.replace("name: loop.self\n", "name: loop.self\nvm:\n  max_depth: 40\n");
    let harness = Harness::load(&yaml);

    let result = harness.run(json!({}));
    assert_error_code(&result, codes::MAX_DEPTH);
    let error = result.unwrap_err();
    assert_eq!(error.class, ErrorClass::Fatal);
    assert!(!harness.tracker.started().contains(&"handler".to_string()));
}

#[test]
fn test_self_invoking_service_is_bounded_by_default() {
    // Roomy stack so the default limit is reached in debug builds too
    let outcome = std::thread::Builder::new()
        .stack_size(128 * 1024 * 1024)
        .spawn(|| {
            let harness = Harness::load(SELF_INVOKING);
            harness.run(json!({})).map(|_| ()).map_err(|e| e.code)
        })
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(outcome, Err(Some(codes::MAX_DEPTH.to_string())));
}
