//! The sample definitions under demos/ load, validate and run

use crate::helpers::*;
use serde_json::json;
use stepvm::core::config::ServiceConfig;

const ORDER_PRICING: &str = include_str!("../../demos/order_pricing.yaml");

#[test]
fn test_order_pricing_is_valid() {
    let harness = Harness::load(ORDER_PRICING);
    assert_eq!(harness.services.len(), 2);
    assert_eq!(harness.diagnostics(), Vec::new());
}

#[test]
fn test_order_pricing_run() {
    let harness = Harness::load(ORDER_PRICING);
    let input = json!({
        "tier": "gold",
        "lines": [
            {"sku": "apple", "quantity": 3, "unit_price": 12},
            {"sku": "pear", "quantity": 2, "unit_price": 5}
        ]
    });

    let result = harness.run(input);
    assert_output(&result, json!({"subtotals": [36, 10], "total": 40, "status": "priced"}));
    assert_eq!(harness.committed(), 1);
}

#[test]
fn test_order_pricing_rejects_empty_lines() {
    let harness = Harness::load(ORDER_PRICING);
    let input = json!({
        "lines": [
            {"sku": "apple", "quantity": 3, "unit_price": 12},
            {"sku": "pear", "quantity": 0, "unit_price": 5}
        ]
    });

    let result = harness.run(input);
    assert_output(&result, json!({"status": "Invalid quantity for pear"}));
}

#[test]
fn test_order_pricing_requires_lines() {
    let harness = Harness::load(ORDER_PRICING);
    let error = harness.run(json!({"tier": "gold"})).unwrap_err();
    assert_eq!(error.code.as_deref(), Some(stepvm::core::error::codes::INVALID_INPUT));
}

#[test]
fn test_demo_file_loads_from_disk() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/demos/order_pricing.yaml");
    let config = ServiceConfig::from_file(path).unwrap();
    assert_eq!(config.name, "orders.price");
    assert_eq!(config.services.len(), 1);
}
