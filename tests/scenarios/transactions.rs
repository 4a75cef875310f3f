//! Sequence transactions, default transaction scoping and cluster locks

use crate::helpers::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepvm::core::error::{codes, ErrorClass, ExecutionError};
use stepvm::core::value::{Record, Value};
use stepvm::execution::{Cluster, LocalCluster, TransactionContext};

#[test]
fn test_successful_run_commits_the_root_transaction() {
    let harness = Harness::load(
        r#"
name: booking
transaction_variable: tx
output:
  - name: transaction
steps:
  - kind: map
    children:
      - kind: link
        from: tx
        to: output/transaction
"#,
    );

    let output = harness.run(json!({})).unwrap();
    let transaction = output.get("transaction").and_then(Value::as_str).unwrap();
    assert_eq!(harness.transactions.open(), Vec::<String>::new());
    assert_eq!(harness.committed(), 1);
    assert_eq!(harness.rolled_back(), 0);
    assert!(!transaction.is_empty());
}

#[test]
fn test_uncaught_error_rolls_back_every_open_transaction() {
    let harness = Harness::load(
        r#"
name: booking
transaction_variable: outer
steps:
  - kind: sequence
    transaction_variable: inner
    children:
      - kind: throw
        code: E-FULL
"#,
    );

    assert_error_code(&harness.run(json!({})), "E-FULL");
    assert_eq!(harness.committed(), 0);
    assert_eq!(harness.rolled_back(), 2);
    assert!(harness.transactions.open().is_empty());
}

#[test]
fn test_caught_error_commits_the_outer_transaction() {
    let harness = Harness::load(
        r#"
name: booking
transaction_variable: outer
steps:
  - kind: sequence
    transaction_variable: inner
    children:
      - kind: throw
        code: E-FULL
  - kind: catch
"#,
    );

    harness.run(json!({})).unwrap();
    assert_eq!(harness.rolled_back(), 1);
    assert_eq!(harness.committed(), 1);
}

#[test]
fn test_default_transaction_is_scoped_to_the_sequence() {
    let harness = Harness::load(
        r#"
name: ledger
output:
  - name: seen
  - name: expected
steps:
  - kind: sequence
    transaction_variable: tx
    scope_default_transaction: true
    children:
      - kind: map
        children:
          - kind: invoke
            service: observe
            result_name: observed
          - kind: link
            from: observed/default
            to: output/seen
          - kind: link
            from: tx
            to: output/expected
"#,
    );
    harness.native("observe", &[], &["default"], |context, _| {
        let default = context.transactions().default_transaction().map(Value::from).unwrap_or_default();
        Ok(Record::from([("default".to_string(), default)]))
    });

    let output = harness.run(json!({})).unwrap();
    assert_eq!(output.get("seen"), output.get("expected"));
    assert!(output.get("seen").is_some_and(|v| !v.is_null()));
    assert_eq!(harness.transactions.default_transaction(), None);
}

#[test]
fn test_synchronized_sequence_runs_one_at_a_time() {
    let harness = Harness::load(
        r#"
name: counter
steps:
  - kind: sequence
    id: critical-section
    synchronized: true
    children:
      - kind: map
        children:
          - kind: invoke
            service: critical
"#,
    );
    let inside = Arc::new(AtomicUsize::new(0));
    let most = Arc::new(AtomicUsize::new(0));
    let (now, peak) = (inside.clone(), most.clone());
    harness.native("critical", &[], &[], move |_, _| {
        let current = now.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(current, Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(20));
        now.fetch_sub(1, Ordering::SeqCst);
        Ok(Record::new())
    });

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| harness.run(json!({})).unwrap());
        }
    });
    assert_eq!(most.load(Ordering::SeqCst), 1);
    assert_eq!(inside.load(Ordering::SeqCst), 0);
}

const GUARDED: &str = r#"
name: guarded
steps:
  - kind: sequence
    id: guarded-section
    synchronized: true
    children:
      - kind: map
        children:
          - kind: invoke
            service: fragile
"#;

#[test]
fn test_synchronized_lock_is_released_when_the_body_fails() {
    let harness = Harness::load(GUARDED);
    harness.native("fragile", &[], &[], |_, _| {
        Err(ExecutionError::new(ErrorClass::Business, "refused").with_code("E-REFUSED"))
    });
    let cluster = Arc::new(LocalCluster::new());
    let execution = harness.execution().with_cluster(cluster.clone());

    let result = harness.run_with(&execution, json!({}));
    assert_error_code(&result, "E-REFUSED");
    assert!(!cluster.is_locked("guarded-section"));

    // Another thread must be able to take the lock now
    std::thread::scope(|scope| {
        let taken = scope.spawn(|| cluster.lock("guarded-section").map(|guard| guard.name().to_string()));
        assert_eq!(taken.join().unwrap().unwrap(), "guarded-section");
    });
}

#[test]
fn test_synchronized_lock_is_released_when_the_run_aborts() {
    let harness = Harness::load(GUARDED);
    harness.native("fragile", &[], &[], |context, _| {
        context.abort_handle().abort();
        Ok(Record::new())
    });
    let cluster = Arc::new(LocalCluster::new());
    let execution = harness.execution().with_cluster(cluster.clone());

    let result = harness.run_with(&execution, json!({}));
    assert_error_code(&result, codes::ABORTED);
    assert!(!cluster.is_locked("guarded-section"));
}
