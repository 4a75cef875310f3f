//! Link modifiers seen from the service surface

use crate::helpers::*;
use serde_json::json;
use stepvm::core::error::codes;

const DEFAULTS: &str = r#"
name: defaults
input:
  - name: region
  - name: note
output:
  - name: region
  - name: note
steps:
  - kind: map
    children:
      - kind: link
        from: input/region
        to: output/region
      - kind: link
        from: "'eu'"
        to: output/region
        optional: true
      - kind: link
        from: "'untouched'"
        to: output/note
      - kind: link
        from: input/note
        to: output/note
        patch: true
"#;

#[test]
fn test_optional_link_keeps_existing_value() {
    let harness = Harness::load(DEFAULTS);
    let result = harness.run(json!({"region": "us"}));
    assert_eq!(result.unwrap().get("region").and_then(|v| v.as_str()), Some("us"));

    let result = harness.run(json!({}));
    assert_eq!(result.unwrap().get("region").and_then(|v| v.as_str()), Some("eu"));
}

#[test]
fn test_patch_link_distinguishes_unset_from_null() {
    let harness = Harness::load(DEFAULTS);

    let output = harness.run(json!({})).unwrap();
    assert_eq!(output.get("note").and_then(|v| v.as_str()), Some("untouched"));

    let output = harness.run(json!({"note": null})).unwrap();
    assert!(output.get("note").map_or(true, |v| v.is_null()));
}

#[test]
fn test_mask_drops_undeclared_fields() {
    let harness = Harness::load(
        r#"
name: customer
types:
  - name: public_customer
    fields:
      - name: name
        type: string
      - name: email
        type: string
input:
  - name: customer
output:
  - name: customer
    type: public_customer
steps:
  - kind: map
    children:
      - kind: link
        from: input/customer
        to: output/customer
        mask: true
"#,
    );

    let result = harness.run(json!({"customer": {"name": "Ada", "email": "ada@example.com", "password": "x"}}));
    assert_output(&result, json!({"customer": {"name": "Ada", "email": "ada@example.com"}}));
}

#[test]
fn test_undeclared_variable_can_not_be_set() {
    let harness = Harness::load(
        r#"
name: strict
steps:
  - kind: map
    id: assign
    children:
      - kind: link
        id: assign-stray
        from: "1"
        to: stray
"#,
    );

    let result = harness.run(json!({}));
    assert_error_code(&result, codes::SET_FAILED);
    assert_eq!(result.unwrap_err().source_id.as_deref(), Some("assign-stray"));
    assert!(!harness.diagnostics().is_empty());
}

#[test]
fn test_drop_removes_a_nested_value() {
    let harness = Harness::load(
        r#"
name: scrub
input:
  - name: user
output:
  - name: user
steps:
  - kind: map
    children:
      - kind: link
        from: input/user
        to: output/user
      - kind: drop
        path: output/user/password
"#,
    );

    let result = harness.run(json!({"user": {"name": "ada", "password": "secret"}}));
    assert_output(&result, json!({"user": {"name": "ada"}}));
}

#[test]
fn test_link_without_target_fails_at_run_time() {
    let harness = Harness::load(
        r#"
name: broken
steps:
  - kind: map
    children:
      - kind: link
        from: "1"
"#,
    );

    assert_error_code(&harness.run(json!({})), codes::MISSING_LINK_TARGET);
}
