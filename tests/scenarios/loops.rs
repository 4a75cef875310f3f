//! For loops: batching, accumulators and multi-level breaks

use crate::helpers::*;
use serde_json::json;

#[test]
fn test_batches_of_two() {
    let harness = Harness::load(
        r#"
name: chunker
input:
  - name: items
    list: true
output:
  - name: chunks
    list: true
  - name: positions
    list: true
steps:
  - kind: for
    query: input/items
    index: at
    variable: chunk
    batch_size: 2
    children:
      - kind: map
        children:
          - kind: link
            from: "output/chunks + [chunk]"
            to: output/chunks
          - kind: link
            from: "output/positions + [at]"
            to: output/positions
"#,
    );

    let result = harness.run(json!({"items": [1, 2, 3, 4, 5]}));
    assert_output(
        &result,
        json!({
            "chunks": [[1, 2], [3, 4], [5]],
            "positions": [[0, 1], [2, 3], [4]],
        }),
    );
}

#[test]
fn test_into_accumulates_every_iteration() {
    let harness = Harness::load(
        r#"
name: doubler
input:
  - name: items
    list: true
output:
  - name: doubled
    list: true
variables:
  - name: acc
    list: true
steps:
  - kind: for
    query: input/items
    variable: x
    into: acc
    children:
      - kind: map
        children:
          - kind: link
            from: "[x * 2]"
            to: acc
  - kind: map
    children:
      - kind: link
        from: acc
        to: output/doubled
"#,
    );

    assert_output(&harness.run(json!({"items": [1, 2, 3]})), json!({"doubled": [2, 4, 6]}));
}

#[test]
fn test_break_two_levels_leaves_both_loops() {
    let harness = Harness::load(
        r#"
name: grid
output:
  - name: visited
    list: true
steps:
  - kind: for
    query: "3"
    variable: row
    children:
      - kind: for
        query: "3"
        variable: col
        children:
          - kind: switch
            children:
              - kind: break
                label: row == 1 && col == 1
                count: 2
          - kind: map
            children:
              - kind: link
                from: "output/visited + [row * 10 + col]"
                to: output/visited
      - kind: map
        id: after-inner
        children:
          - kind: link
            from: "output/visited + ['row done']"
            to: output/visited
"#,
    );

    let result = harness.run(json!({}));
    assert_output(&result, json!({"visited": [0, 1, 2, "row done", 10]}));
}

#[test]
fn test_continue_resumes_the_next_iteration() {
    let harness = Harness::load(
        r#"
name: odd
output:
  - name: odd
    list: true
steps:
  - kind: for
    query: "5"
    variable: n
    children:
      - kind: switch
        children:
          - kind: break
            label: n % 2 == 0
            continue: true
      - kind: map
        children:
          - kind: link
            from: "output/odd + [n]"
            to: output/odd
"#,
    );

    assert_output(&harness.run(json!({})), json!({"odd": [1, 3]}));
}

#[test]
fn test_loop_over_missing_list_does_nothing() {
    let harness = Harness::load(
        r#"
name: empty
input:
  - name: items
    list: true
output:
  - name: count
    type: integer
steps:
  - kind: map
    children:
      - kind: link
        from: "0"
        to: output/count
  - kind: for
    query: input/items
    children:
      - kind: map
        children:
          - kind: link
            from: output/count + 1
            to: output/count
"#,
    );

    assert_output(&harness.run(json!({})), json!({"count": 0}));
}
