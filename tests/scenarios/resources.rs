//! Managed closeables at map and service scope

use crate::helpers::*;
use serde_json::json;
use std::sync::Arc;
use stepvm::core::error::codes;
use stepvm::core::resource::Closeable;
use stepvm::core::value::{Record, Value};

fn register_opener(harness: &Harness, probe: &Arc<Probe>) {
    let probe = probe.clone();
    harness.native("open", &[], &["handle"], move |_, _| {
        let handle: Arc<dyn Closeable> = probe.clone();
        Ok(Record::from([("handle".to_string(), Value::Resource(handle))]))
    });
}

#[test]
fn test_map_scope_closes_even_when_a_sibling_fails() {
    let harness = Harness::load(
        r#"
name: reader
steps:
  - kind: map
    children:
      - kind: invoke
        service: open
        result_name: opened
        managed_closeables: [handle]
      - kind: link
        from: "1"
        to: 1 + 1
"#,
    );
    let probe = Probe::new();
    register_opener(&harness, &probe);

    assert_error_code(&harness.run(json!({})), codes::INVALID_SET);
    assert_eq!(probe.closed(), 1);
}

#[test]
fn test_service_scope_outlives_maps_and_closes_once() {
    let harness = Harness::load(
        r#"
name: session
steps:
  - kind: map
    children:
      - kind: invoke
        service: open
        managed_closeables: [handle]
        closeable_scope: service
  - kind: map
    children:
      - kind: invoke
        service: check
  - kind: map
    children:
      - kind: invoke
        service: check
"#,
    );
    let probe = Probe::new();
    register_opener(&harness, &probe);
    let log = CallLog::new();
    let (seen, observed) = (log.clone(), probe.clone());
    harness.native("check", &[], &[], move |_, _| {
        seen.push(observed.closed().to_string());
        Ok(Record::new())
    });

    harness.run(json!({})).unwrap();
    assert_eq!(log.calls(), vec!["0".to_string(), "0".to_string()]);
    assert_eq!(probe.closed(), 1);
}

#[test]
fn test_service_scope_closes_when_the_run_fails() {
    let harness = Harness::load(
        r#"
name: session
steps:
  - kind: map
    children:
      - kind: invoke
        service: open
        managed_closeables: [handle]
        closeable_scope: service
  - kind: throw
    code: E-LATER
"#,
    );
    let probe = Probe::new();
    register_opener(&harness, &probe);

    assert_error_code(&harness.run(json!({})), "E-LATER");
    assert_eq!(probe.closed(), 1);
}

#[test]
fn test_close_failure_does_not_change_the_result() {
    let harness = Harness::load(
        r#"
name: reader
output:
  - name: done
    type: boolean
steps:
  - kind: map
    children:
      - kind: invoke
        service: open
        managed_closeables: [handle]
      - kind: link
        from: "true"
        to: output/done
"#,
    );
    let probe = Probe::failing();
    register_opener(&harness, &probe);

    assert_output(&harness.run(json!({})), json!({"done": true}));
    assert_eq!(probe.closed(), 1);
}
