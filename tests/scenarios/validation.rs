//! Static validation of whole service definitions

use crate::helpers::*;
use stepvm::core::config::ServiceConfig;

#[test]
fn test_valid_definition_has_no_findings() {
    let harness = Harness::load(
        r#"
name: echo
input:
  - name: text
output:
  - name: text
steps:
  - kind: map
    children:
      - kind: link
        from: input/text
        to: output/text
"#,
    );
    assert_eq!(harness.diagnostics(), Vec::new());
}

#[test]
fn test_findings_are_collected_across_the_tree() {
    let harness = Harness::load(
        r#"
name: sloppy
steps:
  - kind: map
    id: lookup
    children:
      - kind: invoke
        id: call
        service: nowhere
  - kind: link
    id: misplaced
    from: "1"
    to: output
  - kind: sequence
    id: loop-exit
    children:
      - kind: break
        id: exit
        count: 0
  - kind: for
    id: walk
    query: ghosts
    children:
      - kind: map
        children:
          - kind: link
            from: "(1"
            to: output
"#,
    );

    let diagnostics = harness.diagnostics();
    let messages: Vec<String> = diagnostics.iter().map(|d| d.to_string()).collect();
    let mentions = |needle: &str| messages.iter().any(|m| m.contains(needle));
    assert!(mentions("Service not found: nowhere"), "{:#?}", messages);
    assert!(mentions("misplaced"), "{:#?}", messages);
    assert!(mentions("Break count must be at least 1"), "{:#?}", messages);
    assert!(mentions("ghosts"), "{:#?}", messages);
    assert!(mentions("(1"), "{:#?}", messages);
    assert!(diagnostics.iter().all(|d| d.context.first().map(String::as_str) == Some("sloppy")));
}

#[test]
fn test_duplicate_step_ids_are_rejected_on_load() {
    let yaml = r#"
name: twins
steps:
  - kind: map
    id: same
  - kind: map
    id: same
"#;
    let error = ServiceConfig::from_yaml(yaml).unwrap_err();
    assert!(format!("{:#}", error).contains("same"));
}

#[test]
fn test_declared_exceptions_include_throw_codes() {
    let harness = Harness::load(
        r#"
name: payments
steps:
  - kind: throw
    id: declined
    code: E-DECLINED
    message: Card declined
    error_description: The issuer refused the payment
"#,
    );
    let exceptions = harness.main().exceptions();
    let declined = exceptions.iter().find(|e| e.code == "E-DECLINED").unwrap();
    assert_eq!(declined.id, "declined");
    assert_eq!(declined.description.as_deref(), Some("The issuer refused the payment"));
}
