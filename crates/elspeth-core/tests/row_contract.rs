// crates/elspeth-core/tests/row_contract.rs
// ============================================================================
// Module: Pipeline Row & Contract Tests
// Description: Dual-name access, inference, locking, and fixed-mode limits.
// ============================================================================
//! ## Overview
//! Verifies that a row's fields resolve under both original and normalized
//! names, that observed/flexible contracts infer and lock on the first
//! valid row, and that fixed contracts reject undeclared fields.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use elspeth_core::ContractError;
use elspeth_core::ContractMode;
use elspeth_core::FieldSource;
use elspeth_core::FieldSpec;
use elspeth_core::SchemaContract;
use elspeth_core::ValueKind;
use elspeth_core::normalize_field_name;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;

fn raw(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs.iter().map(|(name, value)| ((*name).to_string(), value.clone())).collect()
}

#[test]
fn normalization_lowercases_and_underscores() {
    assert_eq!(normalize_field_name("Customer Name"), "customer_name");
    assert_eq!(normalize_field_name("ID"), "id");
    assert_eq!(normalize_field_name("a-b.c"), "a_b_c");
}

#[test]
fn observed_contract_infers_and_locks_on_first_row() {
    let mut contract = SchemaContract::new(ContractMode::Observed);
    assert!(!contract.locked);
    let first = raw(&[("Customer Name", json!("ada")), ("Age", json!(36))]);
    contract.observe(&first).expect("observe first row");
    assert!(contract.locked);
    assert_eq!(contract.fields.len(), 2);
    assert_eq!(contract.fields[0].normalized_name, "customer_name");
    assert_eq!(contract.fields[0].source, FieldSource::Inferred);
    assert_eq!(contract.fields[1].value_kind, ValueKind::Integer);

    // A later row with a new field violates the locked contract.
    let second = raw(&[("Customer Name", json!("bob")), ("Extra", json!(true))]);
    assert!(matches!(contract.observe(&second), Err(ContractError::Locked)));
}

#[test]
fn dual_name_access_resolves_original_and_normalized() {
    let mut contract = SchemaContract::new(ContractMode::Observed);
    let data = raw(&[("Customer Name", json!("ada"))]);
    contract.observe(&data).expect("observe");
    let row = contract.build_row(&data).expect("build row");
    assert_eq!(row.get("customer_name"), Some(&json!("ada")));
    assert_eq!(row.get("Customer Name"), Some(&json!("ada")));
    assert_eq!(row.get("missing"), None);
}

#[test]
fn fixed_contract_rejects_undeclared_fields() {
    let contract = SchemaContract::with_declared_fields(ContractMode::Fixed, vec![FieldSpec {
        normalized_name: "id".to_string(),
        original_name: "id".to_string(),
        value_kind: ValueKind::Integer,
        required: true,
        source: FieldSource::Declared,
    }])
    .expect("declared contract");
    assert!(contract.locked);
    let data = raw(&[("id", json!(1)), ("surprise", json!("x"))]);
    assert!(matches!(
        contract.build_row(&data),
        Err(ContractError::UndeclaredField(field)) if field == "surprise"
    ));
}

#[test]
fn required_field_missing_fails_row_build() {
    let contract = SchemaContract::with_declared_fields(ContractMode::Fixed, vec![FieldSpec {
        normalized_name: "id".to_string(),
        original_name: "id".to_string(),
        value_kind: ValueKind::Integer,
        required: true,
        source: FieldSource::Declared,
    }])
    .expect("declared contract");
    let data = raw(&[]);
    assert!(matches!(
        contract.build_row(&data),
        Err(ContractError::MissingField(field)) if field == "id"
    ));
}

#[test]
fn declared_name_collision_is_rejected() {
    let result = SchemaContract::with_declared_fields(ContractMode::Fixed, vec![
        FieldSpec {
            normalized_name: "a_b".to_string(),
            original_name: "A B".to_string(),
            value_kind: ValueKind::String,
            required: false,
            source: FieldSource::Declared,
        },
        FieldSpec {
            normalized_name: "a_b".to_string(),
            original_name: "a-b".to_string(),
            value_kind: ValueKind::String,
            required: false,
            source: FieldSource::Declared,
        },
    ]);
    assert!(matches!(result, Err(ContractError::NameCollision(_))));
}

#[test]
fn field_order_follows_contract_order() {
    let mut contract = SchemaContract::new(ContractMode::Observed);
    let data = raw(&[("z", json!(1)), ("a", json!(2)), ("m", json!(3))]);
    contract.observe(&data).expect("observe");
    let row = contract.build_row(&data).expect("build row");
    let names: Vec<&str> = row.fields().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["z", "a", "m"]);
    let contract_order: Vec<&str> =
        row.contract().fields.iter().map(|field| field.normalized_name.as_str()).collect();
    assert_eq!(names, contract_order);
}

#[test]
fn merge_missing_keeps_existing_fields() {
    let mut contract_a = SchemaContract::new(ContractMode::Observed);
    let data_a = raw(&[("id", json!(1)), ("left", json!("a"))]);
    contract_a.observe(&data_a).expect("observe a");
    let mut row_a = contract_a.build_row(&data_a).expect("row a");

    let mut contract_b = SchemaContract::new(ContractMode::Observed);
    let data_b = raw(&[("id", json!(99)), ("right", json!("b"))]);
    contract_b.observe(&data_b).expect("observe b");
    let row_b = contract_b.build_row(&data_b).expect("row b");

    row_a.merge_missing(&row_b);
    assert_eq!(row_a.get("id"), Some(&json!(1)));
    assert_eq!(row_a.get("left"), Some(&json!("a")));
    assert_eq!(row_a.get("right"), Some(&json!("b")));
}
