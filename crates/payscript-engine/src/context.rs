//! 评估上下文
//!
//! 一次评估的输入：表单字段值 + 表格选择 + 流程 ID。
//! 表单字段命名风格混杂（snake_case / camelCase / PascalCase / 展示名），
//! 统一在这里通过 [`canonical_key`] 归一化，规则求值时不再关心别名。

use crate::value::Value;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashMap};

/// 表单字段值（字段名 -> JSON 值）
pub type FormValues = serde_json::Map<String, JsonValue>;

/// 表格选择：实体名 -> 选中行/全部行
pub type GridSelection = BTreeMap<String, GridEntity>;

/// 单个表格的选择状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridEntity {
    #[serde(rename = "_selection", default)]
    pub selection: Vec<JsonValue>,
    #[serde(rename = "_allRows", default)]
    pub all_rows: Vec<JsonValue>,
}

impl GridEntity {
    pub fn selected(rows: Vec<JsonValue>) -> Self {
        Self {
            selection: rows,
            all_rows: Vec::new(),
        }
    }
}

pub const PROCESS_ID_KEY: &str = "_processId";
pub const GRID_SELECTION_KEY: &str = "_gridSelection";

/// 已知的同义字段（归一化后的别名 -> 归一化后的标准名）
const KNOWN_SYNONYMS: &[(&str, &str)] = &[
    ("finpaymentrate", "conversionrate"),
    ("cbpartnerid", "receivedfrom"),
    ("bankstatementlineamount", "bslamount"),
    ("ccurrencyid", "currencyid"),
    ("finpaymentcurrency", "currencytoid"),
    ("documentno", "document"),
    ("finpaymentid", "payment"),
];

/// 字段名归一化
///
/// 转小写并去掉 `_`、`-`、空格，再套用同义字段表：
/// `actual_payment`、`actualPayment`、`ActualPayment`、`Actual Payment` 都归一为 `actualpayment`。
pub fn canonical_key(raw: &str) -> String {
    let squashed: String = raw
        .chars()
        .filter(|c| !matches!(c, '_' | '-' | ' '))
        .flat_map(char::to_lowercase)
        .collect();

    KNOWN_SYNONYMS
        .iter()
        .find(|(alias, _)| *alias == squashed)
        .map(|(_, canonical)| canonical.to_string())
        .unwrap_or(squashed)
}

#[derive(Debug, Clone, Default)]
struct GridRows {
    selection: Vec<Value>,
    all_rows: Vec<Value>,
}

/// 评估上下文
#[derive(Debug, Clone, Default)]
pub struct EvaluationContext {
    process_id: String,
    fields: HashMap<String, Value>,
    /// 归一化字段名 -> 原始字段名
    canonical: HashMap<String, String>,
    grids: BTreeMap<String, GridRows>,
}

impl EvaluationContext {
    /// 构建上下文：`{ ...formValues, _gridSelection, _processId }`
    pub fn new(
        process_id: impl Into<String>,
        form_values: &FormValues,
        grid_selection: Option<&GridSelection>,
    ) -> Self {
        let mut fields = HashMap::with_capacity(form_values.len());
        for (key, value) in form_values {
            if key == PROCESS_ID_KEY || key == GRID_SELECTION_KEY {
                continue;
            }
            fields.insert(key.clone(), Value::from_json(value));
        }

        let canonical = build_canonical_index(&fields);

        let grids = grid_selection
            .map(|selection| {
                selection
                    .iter()
                    .map(|(name, entity)| {
                        let rows = GridRows {
                            selection: entity.selection.iter().map(Value::from_json).collect(),
                            all_rows: entity.all_rows.iter().map(Value::from_json).collect(),
                        };
                        (name.clone(), rows)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            process_id: process_id.into(),
            fields,
            canonical,
            grids,
        }
    }

    /// 从完整的上下文 JSON 构建（包含 `_processId` 与 `_gridSelection`）
    pub fn from_json(json: &JsonValue) -> crate::error::Result<Self> {
        let empty = FormValues::new();
        let form_values = json.as_object().unwrap_or(&empty);

        let process_id = form_values
            .get(PROCESS_ID_KEY)
            .and_then(JsonValue::as_str)
            .unwrap_or_default()
            .to_string();

        let grid_selection: Option<GridSelection> = match form_values.get(GRID_SELECTION_KEY) {
            Some(JsonValue::Null) | None => None,
            Some(raw) => Some(serde_json::from_value(raw.clone())?),
        };

        Ok(Self::new(process_id, form_values, grid_selection.as_ref()))
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    /// 按字段名查找：先精确匹配，再按归一化名匹配；null 不会遮蔽其他别名
    pub fn lookup(&self, name: &str) -> Value {
        if let Some(value) = self.fields.get(name).filter(|v| !v.is_null()) {
            return value.clone();
        }

        if let Some(value) = self
            .canonical
            .get(&canonical_key(name))
            .and_then(|raw| self.fields.get(raw))
        {
            return value.clone();
        }

        match name {
            PROCESS_ID_KEY => Value::String(self.process_id.clone()),
            GRID_SELECTION_KEY => self.grid_selection_value(),
            _ => Value::Null,
        }
    }

    /// 依次查找多个字段名，返回第一个非 null 的值
    pub fn first_of<S: AsRef<str>>(&self, names: &[S]) -> Value {
        names
            .iter()
            .map(|name| self.lookup(name.as_ref()))
            .find(|value| !value.is_null())
            .unwrap_or_default()
    }

    /// 获取选中行；`grids` 为空时返回所有表格的选中行
    pub fn selected_rows<S: AsRef<str>>(&self, grids: &[S]) -> Vec<Value> {
        self.grids
            .iter()
            .filter(|(name, _)| grids.is_empty() || grids.iter().any(|g| g.as_ref() == *name))
            .flat_map(|(_, rows)| rows.selection.iter().cloned())
            .collect()
    }

    /// 获取某个表格的全部行
    pub fn all_rows(&self, grid: &str) -> Vec<Value> {
        self.grids
            .get(grid)
            .map(|rows| rows.all_rows.clone())
            .unwrap_or_default()
    }

    fn grid_selection_value(&self) -> Value {
        let grids = self
            .grids
            .iter()
            .map(|(name, rows)| {
                let mut entity = BTreeMap::new();
                entity.insert("_selection".to_string(), Value::List(rows.selection.clone()));
                entity.insert("_allRows".to_string(), Value::List(rows.all_rows.clone()));
                (name.clone(), Value::Record(entity))
            })
            .collect();
        Value::Record(grids)
    }
}

/// 构建归一化索引
///
/// `inp` 前缀字段（如 `inpactualPayment`）以去掉前缀后的归一化名登记，优先级低于无前缀字段。
fn build_canonical_index(fields: &HashMap<String, Value>) -> HashMap<String, String> {
    let mut keys: Vec<&String> = fields
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, _)| k)
        .collect();
    // HashMap 迭代顺序不稳定，排序保证同一输入总是得到同一索引
    keys.sort();

    let mut index = HashMap::with_capacity(keys.len());
    for key in &keys {
        index
            .entry(canonical_key(key))
            .or_insert_with(|| (*key).clone());
    }

    for key in &keys {
        let has_prefix = key.len() > 3 && key.is_char_boundary(3) && key[..3].eq_ignore_ascii_case("inp");
        if has_prefix {
            index
                .entry(canonical_key(&key[3..]))
                .or_insert_with(|| (*key).clone());
        }
    }

    index
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn form(value: JsonValue) -> FormValues {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_canonical_key_conventions() {
        assert_eq!(canonical_key("actual_payment"), "actualpayment");
        assert_eq!(canonical_key("actualPayment"), "actualpayment");
        assert_eq!(canonical_key("ActualPayment"), "actualpayment");
        assert_eq!(canonical_key("Actual Payment"), "actualpayment");
        assert_eq!(canonical_key("isSOTrx"), "issotrx");
    }

    #[test]
    fn test_canonical_key_synonyms() {
        assert_eq!(canonical_key("finPaymentRate"), canonical_key("conversion_rate"));
        assert_eq!(canonical_key("c_bpartner_id"), canonical_key("receivedFrom"));
        assert_eq!(canonical_key("documentNo"), "document");
    }

    #[test]
    fn test_lookup_tolerates_naming_conventions() {
        let values = form(json!({"actualPayment": 1000, "isSOTrx": true}));
        let ctx = EvaluationContext::new("800166", &values, None);

        assert_eq!(ctx.lookup("actual_payment"), Value::Number(Decimal::from(1000)));
        assert_eq!(ctx.lookup("issotrx"), Value::Bool(true));
        assert_eq!(ctx.lookup("missing"), Value::Null);
    }

    #[test]
    fn test_exact_key_wins_and_null_does_not_shadow() {
        let values = form(json!({"used_credit": null, "usedCredit": 150, "Total": 1, "total": 2}));
        let ctx = EvaluationContext::new("p", &values, None);

        assert_eq!(ctx.lookup("used_credit"), Value::Number(Decimal::from(150)));
        assert_eq!(ctx.lookup("Total"), Value::Number(Decimal::from(1)));
        assert_eq!(ctx.lookup("total"), Value::Number(Decimal::from(2)));
    }

    #[test]
    fn test_inp_prefix_fallback() {
        let values = form(json!({"inpactualPayment": 10, "input_amount": 5}));
        let ctx = EvaluationContext::new("p", &values, None);

        assert_eq!(ctx.lookup("actual_payment"), Value::Number(Decimal::from(10)));
        assert_eq!(ctx.lookup("input_amount"), Value::Number(Decimal::from(5)));
    }

    #[test]
    fn test_special_keys() {
        let values = form(json!({"_processId": "ignored", "amount": 1}));
        let mut grids = GridSelection::new();
        grids.insert(
            "order_invoice".to_string(),
            GridEntity::selected(vec![json!({"id": "1"})]),
        );
        let ctx = EvaluationContext::new("800166", &values, Some(&grids));

        assert_eq!(ctx.lookup("_processId"), Value::from("800166"));
        let selection = ctx.lookup("_gridSelection");
        assert_eq!(
            selection.field("order_invoice").field("_selection"),
            Value::List(vec![Value::from_json(&json!({"id": "1"}))])
        );
    }

    #[test]
    fn test_selected_rows_filtered_by_grid() {
        let mut grids = GridSelection::new();
        grids.insert("order_invoice".into(), GridEntity::selected(vec![json!({"id": "1"})]));
        grids.insert("credit_to_use".into(), GridEntity::selected(vec![json!({"id": "c"})]));
        let ctx = EvaluationContext::new("p", &FormValues::new(), Some(&grids));

        assert_eq!(ctx.selected_rows(&["order_invoice"]).len(), 1);
        assert_eq!(ctx.selected_rows::<&str>(&[]).len(), 2);
        assert!(ctx.all_rows("order_invoice").is_empty());
    }

    #[test]
    fn test_from_json() {
        let ctx = EvaluationContext::from_json(&json!({
            "_processId": "800166",
            "actual_payment": 1000,
            "_gridSelection": {
                "order_invoice": {"_selection": [{"amount": 5}], "_allRows": []}
            }
        }))
        .unwrap();

        assert_eq!(ctx.process_id(), "800166");
        assert_eq!(ctx.selected_rows(&["order_invoice"]).len(), 1);
    }
}
