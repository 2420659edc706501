//! 表达式求值器
//!
//! 标识符解析顺序：lambda / 行局部变量 -> 已计算步骤（归一化名） -> 上下文字段 -> null。
//! 逻辑运算 `&&`、`||`、`??` 与 JavaScript 一致，返回操作数本身。

use crate::builtins::{checked_add, overflow, Builtin};
use crate::compiler::ROW_BINDING;
use crate::context::{canonical_key, EvaluationContext};
use crate::dsl::{BinaryOp, Expr, UnaryOp};
use crate::error::{PayScriptError, Result};
use crate::value::{compare, loose_eq, Value};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::HashMap;

/// 表达式求值器
pub struct ExpressionEvaluator<'a> {
    context: &'a EvaluationContext,
    /// 已计算步骤（归一化名 -> 值）
    computed: HashMap<String, Value>,
    locals: Vec<(String, Value)>,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(context: &'a EvaluationContext) -> Self {
        Self {
            context,
            computed: HashMap::new(),
            locals: Vec::new(),
        }
    }

    pub fn context(&self) -> &EvaluationContext {
        self.context
    }

    /// 登记计算步骤结果，供后续步骤引用
    pub fn define(&mut self, name: &str, value: Value) {
        self.computed.insert(canonical_key(name), value);
    }

    pub fn computed(&self, name: &str) -> Option<&Value> {
        self.computed.get(&canonical_key(name))
    }

    /// 求值表达式
    pub fn evaluate(&mut self, expr: &Expr) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => Ok(self.resolve(name)),
            Expr::Array(items) => items
                .iter()
                .map(|item| self.evaluate(item))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Expr::Object(entries) => {
                let mut record = std::collections::BTreeMap::new();
                for (key, value) in entries {
                    record.insert(key.clone(), self.evaluate(value)?);
                }
                Ok(Value::Record(record))
            }
            Expr::Member { object, property } => {
                let target = self.evaluate(object)?;
                Ok(member(&target, property))
            }
            Expr::Index { object, index } => {
                let target = self.evaluate(object)?;
                let key = self.evaluate(index)?;
                Ok(index_value(&target, &key))
            }
            Expr::Call { function, args } => self.call(*function, args),
            Expr::Unary { op, operand } => {
                let value = self.evaluate(operand)?;
                unary(*op, &value)
            }
            Expr::Binary { op, left, right } => self.binary(*op, left, right),
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                if self.evaluate(test)?.truthy() {
                    self.evaluate(consequent)
                } else {
                    self.evaluate(alternate)
                }
            }
            Expr::Lambda { .. } => Err(PayScriptError::ExecutionError(
                "lambda 不能直接作为值使用".to_string(),
            )),
        }
    }

    /// 逐行求值：lambda 作用于该行，其他表达式在绑定 `row` 后求值
    pub fn evaluate_with_row(&mut self, expr: &Expr, row: &Value, index: usize) -> Result<Value> {
        if expr.is_lambda() {
            return self.apply_lambda(expr, row.clone(), index);
        }
        self.locals.push((ROW_BINDING.to_string(), row.clone()));
        let result = self.evaluate(expr);
        self.locals.pop();
        result
    }

    fn resolve(&self, name: &str) -> Value {
        if let Some((_, value)) = self.locals.iter().rev().find(|(local, _)| local == name) {
            return value.clone();
        }
        if let Some(value) = self.computed(name) {
            return value.clone();
        }
        self.context.lookup(name)
    }

    fn apply_lambda(&mut self, lambda: &Expr, item: Value, index: usize) -> Result<Value> {
        let Expr::Lambda { params, body } = lambda else {
            return Err(PayScriptError::ExecutionError(
                "高阶函数参数必须是 lambda".to_string(),
            ));
        };

        let depth = self.locals.len();
        let mut bound = [item, Value::Number(Decimal::from(index))].into_iter();
        for param in params {
            let value = bound.next().unwrap_or_default();
            self.locals.push((param.clone(), value));
        }
        let result = self.evaluate(body);
        self.locals.truncate(depth);
        result
    }

    fn call(&mut self, function: Builtin, args: &[Expr]) -> Result<Value> {
        let lambda = function
            .lambda_slot()
            .and_then(|slot| args.get(slot.index()))
            .filter(|arg| arg.is_lambda());

        let Some(lambda) = lambda else {
            let values = args
                .iter()
                .map(|arg| self.evaluate(arg))
                .collect::<Result<Vec<_>>>()?;
            return function.apply(values, self.context);
        };

        let items = match args.first() {
            Some(source) => self.evaluate(source)?.into_list()?,
            None => Vec::new(),
        };

        match function {
            Builtin::Sum => {
                let mut total = Decimal::ZERO;
                for (i, item) in items.into_iter().enumerate() {
                    let part = self.apply_lambda(lambda, item, i)?.to_decimal();
                    total = checked_add(total, part)?;
                }
                Ok(Value::Number(total))
            }
            Builtin::Count => {
                let mut count = 0usize;
                for (i, item) in items.into_iter().enumerate() {
                    if self.apply_lambda(lambda, item, i)?.truthy() {
                        count += 1;
                    }
                }
                Ok(Value::Number(Decimal::from(count)))
            }
            Builtin::Filter => {
                let mut kept = Vec::new();
                for (i, item) in items.into_iter().enumerate() {
                    if self.apply_lambda(lambda, item.clone(), i)?.truthy() {
                        kept.push(item);
                    }
                }
                Ok(Value::List(kept))
            }
            Builtin::Map => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| self.apply_lambda(lambda, item, i))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            Builtin::Any => {
                for (i, item) in items.into_iter().enumerate() {
                    if self.apply_lambda(lambda, item, i)?.truthy() {
                        return Ok(Value::Bool(true));
                    }
                }
                Ok(Value::Bool(false))
            }
            Builtin::All => {
                for (i, item) in items.into_iter().enumerate() {
                    if !self.apply_lambda(lambda, item, i)?.truthy() {
                        return Ok(Value::Bool(false));
                    }
                }
                Ok(Value::Bool(true))
            }
            other => Err(PayScriptError::ExecutionError(format!(
                "{} 不接受 lambda 参数",
                other
            ))),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr) -> Result<Value> {
        let lhs = self.evaluate(left)?;

        // 短路求值
        match op {
            BinaryOp::And if !lhs.truthy() => return Ok(lhs),
            BinaryOp::Or if lhs.truthy() => return Ok(lhs),
            BinaryOp::Coalesce if !lhs.is_null() => return Ok(lhs),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => return self.evaluate(right),
            _ => {}
        }

        let rhs = self.evaluate(right)?;
        let value = match op {
            BinaryOp::Eq => Value::Bool(loose_eq(&lhs, &rhs)),
            BinaryOp::Neq => Value::Bool(!loose_eq(&lhs, &rhs)),
            BinaryOp::Lt => Value::Bool(compare(&lhs, &rhs)? == Ordering::Less),
            BinaryOp::Lte => Value::Bool(compare(&lhs, &rhs)? != Ordering::Greater),
            BinaryOp::Gt => Value::Bool(compare(&lhs, &rhs)? == Ordering::Greater),
            BinaryOp::Gte => Value::Bool(compare(&lhs, &rhs)? != Ordering::Less),
            arithmetic => Value::Number(arithmetic_op(
                arithmetic,
                lhs.numeric_operand()?,
                rhs.numeric_operand()?,
            )?),
        };
        Ok(value)
    }
}

fn arithmetic_op(op: BinaryOp, a: Decimal, b: Decimal) -> Result<Decimal> {
    if matches!(op, BinaryOp::Div | BinaryOp::Rem) && b.is_zero() {
        return Err(PayScriptError::ExecutionError(format!(
            "除数为零: {} {} {}",
            a, op, b
        )));
    }

    let result = match op {
        BinaryOp::Add => a.checked_add(b),
        BinaryOp::Sub => a.checked_sub(b),
        BinaryOp::Mul => a.checked_mul(b),
        BinaryOp::Div => a.checked_div(b),
        BinaryOp::Rem => a.checked_rem(b),
        other => {
            return Err(PayScriptError::ExecutionError(format!(
                "不支持的算术运算: {}",
                other
            )));
        }
    };
    result.ok_or_else(|| overflow(&op.to_string()))
}

fn unary(op: UnaryOp, value: &Value) -> Result<Value> {
    let result = match op {
        UnaryOp::Not => Value::Bool(!value.truthy()),
        UnaryOp::Neg => Value::Number(-value.numeric_operand()?),
        UnaryOp::Plus => Value::Number(value.numeric_operand()?),
    };
    Ok(result)
}

/// 成员访问：对 null 等非记录值宽松地返回 null
fn member(target: &Value, property: &str) -> Value {
    match (target, property) {
        (Value::Record(map), _) => map.get(property).cloned().unwrap_or_default(),
        (Value::List(items), "length") => Value::Number(Decimal::from(items.len())),
        (Value::String(s), "length") => Value::Number(Decimal::from(s.chars().count())),
        _ => Value::Null,
    }
}

fn index_value(target: &Value, key: &Value) -> Value {
    match (target, key) {
        (Value::List(items), Value::Number(n)) if n.fract().is_zero() => n
            .to_usize()
            .and_then(|i| items.get(i))
            .cloned()
            .unwrap_or_default(),
        (_, key) => member(target, &key.to_display_string()),
    }
}
