//! 规则数据模型定义

use crate::dsl::Expr;
use crate::value::{format_fixed, round_half_up, Value};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// 一个流程的规则定义
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleDefinition {
    /// 流程 ID（注册时强制覆盖）
    pub id: String,
    /// 计算步骤，按声明顺序执行
    pub compute: Vec<ComputeStep>,
    pub validations: Vec<ValidationRule>,
    pub invoices: Vec<TransformStep>,
    pub gl_items: Vec<TransformStep>,
    pub credit_to_use: Vec<TransformStep>,
}

impl RuleDefinition {
    /// 按固定顺序遍历所有转换步骤
    pub fn transforms(&self) -> impl Iterator<Item = (TransformKind, &TransformStep)> {
        TransformKind::ALL.into_iter().flat_map(move |kind| {
            self.transform_steps(kind).iter().map(move |step| (kind, step))
        })
    }

    pub fn transform_steps(&self, kind: TransformKind) -> &[TransformStep] {
        match kind {
            TransformKind::Invoices => &self.invoices,
            TransformKind::GlItems => &self.gl_items,
            TransformKind::CreditToUse => &self.credit_to_use,
        }
    }

    /// 对外输出的字段名（含别名）
    pub fn output_fields(&self) -> Vec<&str> {
        self.compute
            .iter()
            .filter(|step| !step.hidden)
            .flat_map(|step| std::iter::once(step.name.as_str()).chain(step.aliases.iter().map(String::as_str)))
            .collect()
    }
}

/// 计算步骤
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeStep {
    pub name: String,
    pub value: Expr,
    pub format: OutputFormat,
    /// 额外输出的字段名，值与 `name` 相同
    pub aliases: Vec<String>,
    /// 仅在后续步骤中可见，不输出
    pub hidden: bool,
}

impl ComputeStep {
    pub fn new(name: impl Into<String>, value: Expr) -> Self {
        Self {
            name: name.into(),
            value,
            format: OutputFormat::Raw,
            aliases: Vec::new(),
            hidden: false,
        }
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }
}

/// 输出格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// 按值的自然形式输出
    #[default]
    Raw,
    /// 定点字符串，如 "800.00"
    Money { precision: u32 },
    Number { precision: Option<u32> },
    String,
    Boolean,
}

impl OutputFormat {
    pub const DEFAULT_MONEY_PRECISION: u32 = 2;

    pub fn parse(name: &str, precision: Option<u32>) -> Option<Self> {
        let format = match name {
            "money" => Self::Money {
                precision: precision.unwrap_or(Self::DEFAULT_MONEY_PRECISION),
            },
            "number" => Self::Number { precision },
            "string" => Self::String,
            "boolean" => Self::Boolean,
            "raw" => Self::Raw,
            _ => return None,
        };
        Some(format)
    }

    /// 按格式转换输出值
    pub fn apply(&self, value: &Value) -> Result<Value> {
        let formatted = match self {
            Self::Raw => value.clone(),
            Self::Money { precision } => {
                Value::String(format_fixed(value.numeric_operand()?, *precision))
            }
            Self::Number { precision: None } => Value::Number(value.numeric_operand()?),
            Self::Number {
                precision: Some(dp),
            } => Value::Number(round_half_up(value.numeric_operand()?, *dp)),
            Self::String => Value::String(value.to_display_string()),
            Self::Boolean => match value {
                Value::String(_) => Value::Bool(value.to_flag()),
                other => Value::Bool(other.truthy()),
            },
        };
        Ok(formatted)
    }
}

/// 校验规则
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationRule {
    pub id: String,
    /// 断言，真值表示通过
    pub assert: Expr,
    pub message: String,
    pub severity: Severity,
    /// 逐行校验的集合，每个元素绑定为 `row`
    pub each: Option<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
    Info,
}

impl Severity {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "error" => Some(Self::Error),
            "warning" => Some(Self::Warning),
            "info" => Some(Self::Info),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
        };
        write!(f, "{}", s)
    }
}

/// 表格行转换步骤
#[derive(Debug, Clone, PartialEq)]
pub struct TransformStep {
    /// 输出字段名
    pub name: String,
    /// 来源集合
    pub source: Expr,
    /// 行过滤条件（`row` 已绑定，或 lambda）
    pub filter: Option<Expr>,
    /// 行字段赋值
    pub set: Vec<(String, Expr)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformKind {
    Invoices,
    GlItems,
    CreditToUse,
}

impl TransformKind {
    pub const ALL: [TransformKind; 3] = [Self::Invoices, Self::GlItems, Self::CreditToUse];

    /// DSL 中的键名
    pub fn key(self) -> &'static str {
        match self {
            Self::Invoices => "invoices",
            Self::GlItems => "glItems",
            Self::CreditToUse => "creditToUse",
        }
    }
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// 单条校验结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub id: String,
    pub is_valid: bool,
    pub message: String,
    pub severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<JsonValue>,
}

/// 评估结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationResult {
    pub success: bool,
    #[serde(default)]
    pub computed: Map<String, JsonValue>,
    #[serde(default)]
    pub validations: Vec<ValidationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoices: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gl_items: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credit_to_use: Option<Map<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evaluation_trace: Vec<String>,
    #[serde(default)]
    pub evaluation_time_ms: i64,
}

impl EvaluationResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn transformed(&self, kind: TransformKind) -> Option<&Map<String, JsonValue>> {
        match kind {
            TransformKind::Invoices => self.invoices.as_ref(),
            TransformKind::GlItems => self.gl_items.as_ref(),
            TransformKind::CreditToUse => self.credit_to_use.as_ref(),
        }
    }

    pub(crate) fn transformed_mut(&mut self, kind: TransformKind) -> &mut Map<String, JsonValue> {
        let slot = match kind {
            TransformKind::Invoices => &mut self.invoices,
            TransformKind::GlItems => &mut self.gl_items,
            TransformKind::CreditToUse => &mut self.credit_to_use,
        };
        slot.get_or_insert_with(Map::new)
    }

    /// 未通过的校验
    pub fn failed_validations(&self) -> impl Iterator<Item = &ValidationOutcome> {
        self.validations.iter().filter(|v| !v.is_valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_output_format_parse() {
        assert_eq!(
            OutputFormat::parse("money", None),
            Some(OutputFormat::Money { precision: 2 })
        );
        assert_eq!(
            OutputFormat::parse("money", Some(4)),
            Some(OutputFormat::Money { precision: 4 })
        );
        assert_eq!(OutputFormat::parse("currency", None), None);
    }

    #[test]
    fn test_money_format() {
        let value = Value::Number(Decimal::from_str("199.995").unwrap());
        let formatted = OutputFormat::Money { precision: 2 }.apply(&value).unwrap();
        assert_eq!(formatted, Value::from("200.00"));

        let from_string = OutputFormat::Money { precision: 2 }
            .apply(&Value::from("1,000"))
            .unwrap();
        assert_eq!(from_string, Value::from("1000.00"));
    }

    #[test]
    fn test_boolean_format() {
        assert_eq!(
            OutputFormat::Boolean.apply(&Value::from("Y")).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            OutputFormat::Boolean.apply(&Value::Number(Decimal::ZERO)).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn test_validation_outcome_serialization() {
        let outcome = ValidationOutcome {
            id: "APRM_MORE_ALLOCATED".to_string(),
            is_valid: false,
            message: "too much".to_string(),
            severity: Severity::Warning,
            context: None,
        };

        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "id": "APRM_MORE_ALLOCATED",
                "isValid": false,
                "message": "too much",
                "severity": "warning"
            })
        );
    }

    #[test]
    fn test_failure_result_serialization() {
        let result = EvaluationResult::failure("boom");
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["success"], json!(false));
        assert_eq!(json["error"], json!("boom"));
        assert!(json.get("invoices").is_none());
        assert!(json.get("evaluationTrace").is_none());
    }

    #[test]
    fn test_output_fields_skip_hidden() {
        let definition = RuleDefinition {
            compute: vec![
                ComputeStep::new("total", Expr::Literal(Value::Null)).with_aliases(["amount"]),
                ComputeStep::new("rows", Expr::Literal(Value::Null)).hidden(),
            ],
            ..Default::default()
        };
        assert_eq!(definition.output_fields(), vec!["total", "amount"]);
    }
}
