//! 运行时值模型
//!
//! 规则求值过程中所有数值都以 `rust_decimal::Decimal` 表示，避免二进制浮点误差；
//! 与表单层交互时再与 `serde_json::Value` 互相转换。

use crate::error::{PayScriptError, Result};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::{Map, Number, Value as JsonValue};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::str::FromStr;

/// 规则求值使用的值
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Decimal),
    String(String),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// 从 JSON 值转换
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Number(json_number_to_decimal(n)),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => Value::List(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Record(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// 转换为 JSON 值
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(d) => decimal_to_json(*d),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::List(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Record(map) => {
                let mut out = Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                JsonValue::Object(out)
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// 获取值的类型名称
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    /// 真值判断（与 JavaScript 一致：null / false / 0 / "" 为假）
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(d) => !d.is_zero(),
            Value::String(s) => !s.is_empty(),
            Value::List(_) | Value::Record(_) => true,
        }
    }

    /// 宽松数值转换，无法解析时返回 0
    ///
    /// 字符串会先去掉千分位逗号再解析。
    pub fn to_decimal(&self) -> Decimal {
        match self {
            Value::Number(d) => *d,
            Value::String(s) => parse_number_prefix(s).unwrap_or(Decimal::ZERO),
            Value::Bool(true) => Decimal::ONE,
            _ => Decimal::ZERO,
        }
    }

    /// 算术运算使用的数值转换，列表和记录无法参与运算
    pub fn numeric_operand(&self) -> Result<Decimal> {
        match self {
            Value::List(_) | Value::Record(_) => {
                Err(PayScriptError::type_mismatch("number", self.type_name()))
            }
            other => Ok(other.to_decimal()),
        }
    }

    /// 布尔转换：布尔值原样返回，字符串 y / yes / true 视为真，其余为假
    pub fn to_flag(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::String(s) => {
                let low = s.trim().to_lowercase();
                low == "y" || low == "yes" || low == "true"
            }
            _ => false,
        }
    }

    /// 转换为展示字符串，null 转为空串
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(d) => d.normalize().to_string(),
            Value::String(s) => s.clone(),
            Value::List(items) => items
                .iter()
                .map(Value::to_display_string)
                .collect::<Vec<_>>()
                .join(","),
            Value::Record(_) => self.to_json().to_string(),
        }
    }

    /// 读取记录字段，非记录或字段不存在时返回 null
    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Record(map) => map.get(name).cloned().unwrap_or_default(),
            _ => Value::Null,
        }
    }

    /// 展开为列表：null 视为空列表
    pub fn into_list(self) -> Result<Vec<Value>> {
        match self {
            Value::List(items) => Ok(items),
            Value::Null => Ok(Vec::new()),
            other => Err(PayScriptError::type_mismatch("list", other.type_name())),
        }
    }

    /// 空值判断：null、空字符串、空列表、空记录
    pub fn is_empty_value(&self) -> bool {
        match self {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::List(items) => items.is_empty(),
            Value::Record(map) => map.is_empty(),
            _ => false,
        }
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Number(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// 宽松相等比较
///
/// 任一侧为数值时按数值比较（字符串和布尔先转换），否则按结构比较。
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(a), Value::Number(b)) => a == b,
        (Value::Number(n), other) | (other, Value::Number(n)) => match other {
            Value::String(s) => match parse_number_str(s) {
                Some(parsed) => parsed == *n,
                None => s.trim().is_empty() && n.is_zero(),
            },
            Value::Bool(_) => other.to_decimal() == *n,
            _ => false,
        },
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Bool(_), Value::String(_)) | (Value::String(_), Value::Bool(_)) => {
            left.to_decimal() == right.to_decimal()
        }
        _ => left == right,
    }
}

/// 大小比较：两侧都是字符串时按字典序，否则按数值
pub fn compare(left: &Value, right: &Value) -> Result<Ordering> {
    if let (Value::String(a), Value::String(b)) = (left, right) {
        return Ok(a.cmp(b));
    }
    let a = left.numeric_operand()?;
    let b = right.numeric_operand()?;
    Ok(a.cmp(&b))
}

/// 解析数值字符串，忽略千分位逗号
pub fn parse_number_str(s: &str) -> Option<Decimal> {
    let clean: String = s.chars().filter(|c| *c != ',').collect();
    let clean = clean.trim();
    if clean.is_empty() {
        return None;
    }
    Decimal::from_str(clean)
        .or_else(|_| Decimal::from_scientific(clean))
        .ok()
}

/// 解析字符串开头的数值部分，忽略千分位逗号，其后的内容丢弃
///
/// `"12.5 EUR"` -> 12.5，`"EUR 12.5"` -> None。
pub fn parse_number_prefix(s: &str) -> Option<Decimal> {
    let clean: String = s.chars().filter(|c| *c != ',').collect();
    let bytes = clean.trim_start().as_bytes();
    let digits_from = |start: usize| {
        bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut pos = 0;
    let negative = match bytes.first() {
        Some(b'-') => {
            pos = 1;
            true
        }
        Some(b'+') => {
            pos = 1;
            false
        }
        _ => false,
    };

    let int_len = digits_from(pos);
    let int_part = &bytes[pos..pos + int_len];
    pos += int_len;

    let mut frac_part: &[u8] = &[];
    if bytes.get(pos) == Some(&b'.') {
        let frac_len = digits_from(pos + 1);
        frac_part = &bytes[pos + 1..pos + 1 + frac_len];
        if frac_len > 0 {
            pos += 1 + frac_len;
        }
    }
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    let mut exponent: &[u8] = &[];
    if matches!(bytes.get(pos), Some(b'e' | b'E')) {
        let sign_len = usize::from(matches!(bytes.get(pos + 1), Some(b'+' | b'-')));
        let exp_len = digits_from(pos + 1 + sign_len);
        if exp_len > 0 {
            exponent = &bytes[pos + 1..pos + 1 + sign_len + exp_len];
        }
    }

    let mut text = String::new();
    if negative {
        text.push('-');
    }
    if int_part.is_empty() {
        text.push('0');
    } else {
        text.push_str(std::str::from_utf8(int_part).ok()?);
    }
    if !frac_part.is_empty() {
        text.push('.');
        text.push_str(std::str::from_utf8(frac_part).ok()?);
    }
    if exponent.is_empty() {
        return Decimal::from_str(&text).ok();
    }
    text.push('e');
    text.push_str(std::str::from_utf8(exponent).ok()?.trim_start_matches('+'));
    Decimal::from_scientific(&text).ok()
}

/// 四舍五入（远离零）到指定小数位
pub fn round_half_up(d: Decimal, dp: u32) -> Decimal {
    let rounded = d.round_dp_with_strategy(dp, RoundingStrategy::MidpointAwayFromZero);
    // 不输出 "-0.00"
    if rounded.is_zero() {
        Decimal::ZERO
    } else {
        rounded
    }
}

/// 定点格式化，例如 800 -> "800.00"
pub fn format_fixed(d: Decimal, dp: u32) -> String {
    let rounded = round_half_up(d, dp);
    format!("{:.*}", dp as usize, rounded)
}

fn json_number_to_decimal(n: &Number) -> Decimal {
    if let Some(i) = n.as_i64() {
        return Decimal::from(i);
    }
    if let Some(u) = n.as_u64() {
        return Decimal::from(u);
    }
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
        .or_else(|| n.as_f64().and_then(Decimal::from_f64))
        .unwrap_or(Decimal::ZERO)
}

fn decimal_to_json(d: Decimal) -> JsonValue {
    let normalized = d.normalize();
    if normalized.scale() == 0 {
        if let Some(i) = normalized.to_i64() {
            return JsonValue::Number(Number::from(i));
        }
    }
    normalized
        .to_f64()
        .and_then(Number::from_f64)
        .map(JsonValue::Number)
        .unwrap_or(JsonValue::Null)
}
