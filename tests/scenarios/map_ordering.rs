//! Invocation order inside a Map

use crate::helpers::*;
use serde_json::json;
use stepvm::core::value::{Record, Value};

const PIPELINE: &str = r#"
name: quote
input:
  - name: amount
    type: integer
output:
  - name: total
    type: integer
steps:
  - kind: map
    children:
      - kind: link
        from: taxed/value
        to: output/total
      - kind: invoke
        service: tax
        result_name: taxed
        invocation_order: 1
        children:
          - kind: link
            from: priced/value
            to: value
      - kind: invoke
        service: price
        result_name: priced
        invocation_order: 0
        children:
          - kind: link
            from: input/amount
            to: value
"#;

fn register(harness: &Harness, log: &CallLog) {
    for (id, delta) in [("price", 100), ("tax", 20)] {
        let log = log.clone();
        harness.native(id, &["value"], &["value"], move |_, input| {
            log.push(id);
            let value = input.get("value").and_then(Value::as_i64).unwrap_or_default();
            Ok(Record::from([("value".to_string(), Value::from(value + delta))]))
        });
    }
}

#[test]
fn test_lower_order_runs_first_and_links_run_last() {
    let harness = Harness::load(PIPELINE);
    let log = CallLog::new();
    register(&harness, &log);

    let result = harness.run(json!({"amount": 1}));
    assert_output(&result, json!({"total": 121}));
    assert_eq!(log.calls(), vec!["price".to_string(), "tax".to_string()]);
}

#[test]
fn test_invoke_results_do_not_outlive_the_map() {
    let harness = Harness::load(
        r#"
name: leak
output:
  - name: after
steps:
  - kind: map
    children:
      - kind: invoke
        service: price
        result_name: priced
  - kind: map
    children:
      - kind: link
        from: priced
        to: output/after
"#,
    );
    register(&harness, &CallLog::new());

    let output = harness.run(json!({})).unwrap();
    assert!(output.get("after").map_or(true, |v| v.is_null()));
}

#[test]
fn test_reading_a_later_result_is_reported() {
    let harness = Harness::load(
        r#"
name: cyclic
steps:
  - kind: map
    children:
      - kind: invoke
        service: price
        result_name: priced
        children:
          - kind: link
            from: taxed/value
            to: value
      - kind: invoke
        service: tax
        result_name: taxed
"#,
    );
    register(&harness, &CallLog::new());

    let diagnostics = harness.diagnostics();
    assert!(
        diagnostics.iter().any(|d| d.message.contains("taxed")),
        "{:?}",
        diagnostics
    );
}

#[test]
fn test_asynchronous_invoke_binds_no_result() {
    let harness = Harness::load(
        r#"
name: notify
output:
  - name: answer
steps:
  - kind: map
    children:
      - kind: invoke
        service: price
        result_name: priced
        asynchronous: true
        children:
          - kind: link
            from: "1"
            to: value
      - kind: link
        from: priced
        to: output/answer
"#,
    );
    let log = CallLog::new();
    register(&harness, &log);

    let output = harness.run(json!({})).unwrap();
    assert!(output.get("answer").map_or(true, |v| v.is_null()));
    assert_eq!(log.calls(), vec!["price".to_string()]);
}
