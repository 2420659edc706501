//! 规则引擎集成测试
//!
//! 以 Add Payment 规则（流程 800166）测试完整的 注册 -> callout -> 执行 工作流。

use payscript::{
    execute_logic, CalloutRunner, EvaluationContext, FieldUpdates, FormValues,
    GenericPayScriptCallout, GridEntity, GridSelection, InMemoryForm, RuleRegistry,
    VALIDATIONS_KEY,
};
use serde_json::{json, Value};
use std::sync::Arc;

const PROCESS_ID: &str = "800166";
const ADD_PAYMENT_RULES: &str = include_str!("../rules/800166.ts");

fn create_callout() -> GenericPayScriptCallout {
    let registry = RuleRegistry::new();
    assert!(registry.register_dsl(PROCESS_ID, ADD_PAYMENT_RULES));
    GenericPayScriptCallout::new(registry)
}

fn form(values: Value) -> FormValues {
    let mut values = values.as_object().cloned().unwrap();
    values.insert("_processId".to_string(), json!(PROCESS_ID));
    values
}

/// 创建发票表格选择
fn invoices(rows: Value) -> GridSelection {
    GridSelection::from([(
        "order_invoice".to_string(),
        GridEntity::selected(rows.as_array().cloned().unwrap()),
    )])
}

fn run(values: Value, grid: Option<GridSelection>) -> FieldUpdates {
    create_callout().evaluate(&form(values), grid.as_ref())
}

fn validation<'a>(updates: &'a FieldUpdates, id: &str) -> Vec<&'a Value> {
    updates[VALIDATIONS_KEY]
        .as_array()
        .unwrap()
        .iter()
        .filter(|v| v["id"] == json!(id))
        .collect()
}

// ==================== Add Payment 场景 ====================

#[test]
fn test_totals_from_selected_invoices() {
    let updates = run(
        json!({ "actual_payment": 1000, "issotrx": true }),
        Some(invoices(json!([
            { "id": "1", "outstandingAmount": 500, "amount": 500 },
            { "id": "2", "outstandingAmount": 300, "amount": 300 }
        ]))),
    );

    assert_eq!(updates["expected_payment"], json!("800.00"));
    assert_eq!(updates["amount_inv_ords"], json!("800.00"));
    assert_eq!(updates["total"], json!("800.00"));
    assert_eq!(updates["difference"], json!("200.00"));
    assert_eq!(updates["overpayment_action"], json!("CR"));
    assert_eq!(updates["overpayment_action_display_logic"], json!("Y"));
}

#[test]
fn test_legacy_alias_names() {
    let updates = run(
        json!({ "actual_payment": 1000 }),
        Some(invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]))),
    );

    for name in ["Expected_Payment", "expectedPayment", "Expected Payment"] {
        assert_eq!(updates[name], json!("500.00"), "{}", name);
    }
    assert_eq!(updates["Amount on Invoices and/or Orders"], json!("500.00"));
    assert_eq!(updates["TOTAL"], json!("500.00"));
    assert_eq!(updates["Difference"], json!("500.00"));
    assert_eq!(updates["There is a difference of"], json!("500.00"));
    // 内部步骤不输出
    assert!(updates.get("actualPayment").is_none());
    assert!(updates.get("selectedInvoices").is_none());
}

#[test]
fn test_empty_grid_selection() {
    let updates = run(json!({ "actual_payment": 1000, "issotrx": true }), None);

    assert_eq!(updates["expected_payment"], json!("0.00"));
    assert_eq!(updates["total"], json!("0.00"));
    assert_eq!(updates["difference"], json!("1000.00"));
    assert_eq!(updates["order_invoice"], json!([]));
}

#[test]
fn test_used_credit() {
    let updates = run(
        json!({ "actual_payment": 1000, "used_credit": 150, "issotrx": true }),
        Some(invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]))),
    );

    assert_eq!(updates["used_credit"], json!("150.00"));
    assert_eq!(updates["difference"], json!("650.00"));
}

#[test]
fn test_expected_payment_from_outstanding() {
    let updates = run(
        json!({ "actual_payment": 1000, "issotrx": true }),
        Some(invoices(json!([
            { "id": "1", "outstandingAmount": 600, "amount": 600 },
            { "id": "2", "outstandingAmount": 300, "amount": 300 },
            { "id": "3", "outstandingAmount": 200, "amount": 100 }
        ]))),
    );

    assert_eq!(updates["expected_payment"], json!("1100.00"));
    assert_eq!(updates["total"], json!("1000.00"));
    assert_eq!(updates["difference"], json!("0.00"));
    // 1100 + 0 - 1000
    assert_eq!(updates["expected_difference"], json!("100.00"));
}

#[test]
fn test_no_overpayment_when_difference_is_zero() {
    let updates = run(
        json!({ "actual_payment": 500, "issotrx": true }),
        Some(invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]))),
    );

    assert_eq!(updates["difference"], json!("0.00"));
    assert_eq!(updates["overpayment_action"], json!(""));
    assert_eq!(updates["overpayment_action_display_logic"], json!("N"));
}

#[test]
fn test_amount_with_currency_suffix() {
    let updates = run(
        json!({ "actual_payment": "1,000.50 EUR" }),
        Some(invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]))),
    );

    assert_eq!(updates["total"], json!("500.00"));
    assert_eq!(updates["difference"], json!("500.50"));
    assert_eq!(updates["overpayment_action"], json!("CR"));
}

#[test]
fn test_mixed_field_naming_conventions() {
    let updates = run(
        json!({ "actualPayment": 1000, "isSOTrx": true }),
        Some(invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]))),
    );

    assert_eq!(updates["expected_payment"], json!("500.00"));
    assert_eq!(updates["total"], json!("500.00"));
    assert_eq!(updates["difference"], json!("500.00"));
}

#[test]
fn test_zero_actual_payment() {
    let updates = run(
        json!({ "actual_payment": 0, "issotrx": true }),
        Some(invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]))),
    );

    assert_eq!(updates["difference"], json!("-500.00"));
    assert_eq!(updates["overpayment_action"], json!(""));

    let more_allocated = validation(&updates, "APRM_MORE_ALLOCATED");
    assert_eq!(more_allocated[0]["isValid"], json!(false));
}

#[test]
fn test_multicurrency() {
    let updates = run(
        json!({
            "actual_payment": 1000,
            "issotrx": true,
            "currency_id": "USD",
            "currencyToId": "EUR",
            "conversionRate": 0.85,
            "currencyPrecision": 2
        }),
        Some(invoices(json!([]))),
    );

    assert_eq!(updates["expected_payment"], json!("0.00"));
    assert_eq!(updates["difference"], json!("1000.00"));
    assert_eq!(updates["converted_amount"], json!("850.00"));
}

#[test]
fn test_payment_distributed_to_unallocated_rows() {
    let updates = run(
        json!({ "actual_payment": 80 }),
        Some(invoices(json!([
            { "id": "1", "outstandingAmount": 50, "amount": 0 },
            { "id": "2", "outstandingAmount": 50, "amount": 0 }
        ]))),
    );

    assert_eq!(updates["amount_inv_ords"], json!("80.00"));
    assert_eq!(updates["difference"], json!("0.00"));

    let rows = updates["order_invoice"].as_array().unwrap();
    assert_eq!(rows[0]["amount"], json!(50));
    assert_eq!(rows[1]["amount"], json!(30));
    assert!(rows.iter().all(|r| r["selected"] == json!(true) && r["obSelected"] == json!(true)));
}

#[test]
fn test_credit_rows_default_to_outstanding() {
    let mut grid = invoices(json!([{ "id": "1", "outstandingAmount": 100, "amount": 0 }]));
    grid.insert(
        "credit_to_use".to_string(),
        GridEntity::selected(vec![json!({ "id": "c1", "paymentAmount": 0, "outstandingAmount": 20 })]),
    );
    let updates = run(json!({ "actual_payment": 80 }), Some(grid));

    assert_eq!(updates["used_credit"], json!("20.00"));
    assert_eq!(updates["total"], json!("100.00"));
    assert_eq!(updates["difference"], json!("0.00"));
    assert_eq!(updates["credit_to_use"][0]["paymentAmount"], json!(20));
}

#[test]
fn test_row_amount_exceeds_outstanding() {
    let updates = run(
        json!({ "actual_payment": 100 }),
        Some(invoices(json!([
            { "id": "1", "amount": 60, "outstandingAmount": 50 },
            { "id": "2", "amount": 40, "outstandingAmount": 40 }
        ]))),
    );

    let rows = validation(&updates, "AMOUNT_EXCEEDS_OUTSTANDING");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["isValid"], json!(false));
    assert_eq!(rows[0]["context"]["id"], json!("1"));
    assert_eq!(rows[1]["isValid"], json!(true));
}

#[test]
fn test_overpayment_without_business_partner() {
    let updates = run(
        json!({ "actual_payment": 100, "overpayment_action": "CR" }),
        None,
    );
    assert_eq!(validation(&updates, "APRM_CREDIT_NO_BPARTNER")[0]["isValid"], json!(false));

    let updates = run(
        json!({ "actual_payment": 100, "overpayment_action": "CR", "c_bpartner_id": "BP1" }),
        None,
    );
    assert_eq!(validation(&updates, "APRM_CREDIT_NO_BPARTNER")[0]["isValid"], json!(true));
}

#[test]
fn test_internal_summary() {
    let updates = run(
        json!({ "actual_payment": 100, "received_from": "BP1" }),
        Some(invoices(json!([
            { "id": "1", "outstandingAmount": 80, "amount": 60, "writeoff": true },
            { "id": "2", "outstandingAmount": -10, "amount": -10 }
        ]))),
    );

    let summary = &updates["_computed"];
    assert_eq!(summary["totalOutstanding"], json!(70));
    assert_eq!(summary["negativeAmount"], json!(10));
    assert_eq!(summary["totalWriteOffAmount"], json!(20));
    assert_eq!(summary["selectedInvoicesCount"], json!(2));
    assert_eq!(summary["hasReceivedFrom"], json!(true));
    assert_eq!(summary["hasBslAmount"], json!(false));
}

// ==================== 注册表行为 ====================

#[test]
fn test_reregistration_last_write_wins() {
    let callout = create_callout();
    callout.registry().register_dsl(
        PROCESS_ID,
        r#"export const Rules = { compute: [{ name: "total", value: 42, format: "money" }] };"#,
    );

    let updates = callout.evaluate(&form(json!({ "actual_payment": 1000 })), None);
    assert_eq!(updates["total"], json!("42.00"));
    assert!(updates.get("difference").is_none());
}

#[test]
fn test_malformed_dsl_never_registers() {
    let registry = RuleRegistry::new();

    assert!(!registry.register_dsl("bad", "export const Rules = { compute: [ { name: };"));
    assert!(!registry.register_dsl("bad", "export const Rules = 42;"));
    assert!(!registry.register_dsl("bad", ""));
    assert!(!registry.contains("bad"));
}

#[test]
fn test_unregistered_process_is_noop() {
    let callout = create_callout();
    let mut values = form(json!({ "actual_payment": 1000 }));
    values.insert("_processId".to_string(), json!("unknown"));

    assert!(callout.evaluate(&values, None).is_empty());
}

#[test]
fn test_evaluation_is_idempotent() {
    let registry = RuleRegistry::new();
    registry.register_dsl(PROCESS_ID, ADD_PAYMENT_RULES);
    let rules = registry.get(PROCESS_ID).unwrap();

    let mut context_json = json!({
        "_processId": PROCESS_ID,
        "actual_payment": "1,234.5",
        "used_credit": 10
    });
    context_json["_gridSelection"] = json!({
        "order_invoice": { "_selection": [{ "outstandingAmount": 700, "amount": 0 }] }
    });
    let context = EvaluationContext::from_json(&context_json).unwrap();

    let first = execute_logic(&rules, &context);
    let second = execute_logic(&rules, &context);

    assert!(first.success);
    assert_eq!(first.computed, second.computed);
    assert_eq!(first.invoices, second.invoices);
    assert_eq!(first.validations, second.validations);
}

// ==================== 表单应用 ====================

#[tokio::test]
async fn test_runner_applies_updates_to_form() {
    let runner = CalloutRunner::new(Arc::new(create_callout()));
    let form = InMemoryForm::new(form(json!({ "actual_payment": 1000 })));
    let grid = invoices(json!([{ "id": "1", "outstandingAmount": 500, "amount": 500 }]));

    let validations = runner.on_change(&form, Some(&grid)).await.unwrap();

    assert_eq!(validations.len(), 3);
    assert_eq!(form.value("difference"), Some(json!("500.00")));
    assert_eq!(form.value("overpayment_action"), Some(json!("CR")));
    assert!(form.grid("order_invoice").is_some());
    assert!(form.value(VALIDATIONS_KEY).is_none());
}
