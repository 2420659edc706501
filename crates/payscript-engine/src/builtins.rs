//! 内置函数
//!
//! 规则中只能调用这里登记的函数；`util.NAME(...)` 与 `Math.NAME(...)` 视为 `NAME` 的别名。
//! 需要 lambda 的高阶函数（sum / count / filter / map / any / all）由求值器负责，
//! 其余函数在参数求值完成后通过 [`Builtin::apply`] 执行。

use crate::context::EvaluationContext;
use crate::error::{PayScriptError, Result};
use crate::value::{format_fixed, round_half_up, Value};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Builtin {
    // 类型转换
    Num,
    Str,
    Bool,

    // 上下文取值
    Val,
    ValNum,
    ValStr,
    ValBool,

    // 表格选择
    Rows,
    AllRows,
    GetGridItems,

    // 集合
    Sum,
    Count,
    Filter,
    Map,
    Any,
    All,

    // 数值
    Min,
    Max,
    Abs,
    Round,
    Convert,
    Distribute,
    Fixed,

    // 其他
    Coalesce,
    Concat,
    Empty,
}

/// lambda 参数位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LambdaSlot {
    /// 该位置必须是 lambda
    Required(usize),
    /// 该位置可以是 lambda，也可以是普通表达式
    Optional(usize),
}

impl LambdaSlot {
    pub fn index(self) -> usize {
        match self {
            Self::Required(i) | Self::Optional(i) => i,
        }
    }
}

impl Builtin {
    /// 按名称解析，兼容 camelCase 别名
    pub fn from_name(name: &str) -> Option<Self> {
        let builtin = match name {
            "num" | "Number" => Self::Num,
            "str" | "String" => Self::Str,
            "bool" | "Boolean" => Self::Bool,
            "val" => Self::Val,
            "valNum" => Self::ValNum,
            "valStr" => Self::ValStr,
            "valBool" => Self::ValBool,
            "rows" => Self::Rows,
            "allRows" => Self::AllRows,
            "getGridItems" => Self::GetGridItems,
            "sum" => Self::Sum,
            "count" => Self::Count,
            "filter" => Self::Filter,
            "map" => Self::Map,
            "any" | "some" => Self::Any,
            "all" | "every" => Self::All,
            "min" => Self::Min,
            "max" => Self::Max,
            "abs" => Self::Abs,
            "round" => Self::Round,
            "convert" => Self::Convert,
            "distribute" | "distributeAmount" => Self::Distribute,
            "fixed" | "toFixed" => Self::Fixed,
            "coalesce" => Self::Coalesce,
            "concat" => Self::Concat,
            "empty" | "isEmpty" => Self::Empty,
            _ => return None,
        };
        Some(builtin)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Num => "num",
            Self::Str => "str",
            Self::Bool => "bool",
            Self::Val => "val",
            Self::ValNum => "valNum",
            Self::ValStr => "valStr",
            Self::ValBool => "valBool",
            Self::Rows => "rows",
            Self::AllRows => "allRows",
            Self::GetGridItems => "getGridItems",
            Self::Sum => "sum",
            Self::Count => "count",
            Self::Filter => "filter",
            Self::Map => "map",
            Self::Any => "any",
            Self::All => "all",
            Self::Min => "min",
            Self::Max => "max",
            Self::Abs => "abs",
            Self::Round => "round",
            Self::Convert => "convert",
            Self::Distribute => "distribute",
            Self::Fixed => "fixed",
            Self::Coalesce => "coalesce",
            Self::Concat => "concat",
            Self::Empty => "empty",
        }
    }

    /// 参数个数范围 (最少, 最多)，`None` 表示不限
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            Self::Num | Self::Str | Self::Bool | Self::Abs | Self::Empty | Self::AllRows => {
                (1, Some(1))
            }
            Self::Val | Self::ValNum | Self::ValStr | Self::ValBool => (1, None),
            Self::Rows | Self::Concat => (0, None),
            Self::GetGridItems => (0, Some(2)),
            Self::Sum | Self::Count | Self::Round | Self::Fixed => (1, Some(2)),
            Self::Filter | Self::Map | Self::Any | Self::All => (2, Some(2)),
            Self::Min | Self::Max | Self::Coalesce => (1, None),
            Self::Convert => (3, Some(4)),
            Self::Distribute => (2, Some(4)),
        }
    }

    /// 可以出现 lambda 的参数位置
    pub fn lambda_slot(self) -> Option<LambdaSlot> {
        match self {
            Self::Sum | Self::Count => Some(LambdaSlot::Optional(1)),
            Self::Filter | Self::Map | Self::Any | Self::All => Some(LambdaSlot::Required(1)),
            _ => None,
        }
    }

    /// 是否读取上下文字段（参数为字段名字符串）
    pub fn reads_fields(self) -> bool {
        matches!(self, Self::Val | Self::ValNum | Self::ValStr | Self::ValBool)
    }

    /// 检查参数个数
    pub fn check_arity(self, actual: usize) -> Result<()> {
        let (min, max) = self.arity();
        let within = actual >= min && max.is_none_or(|max| actual <= max);
        if within {
            return Ok(());
        }
        let expected = match max {
            Some(max) if max == min => min.to_string(),
            Some(max) => format!("{}..{}", min, max),
            None => format!("{}+", min),
        };
        Err(PayScriptError::Arity {
            function: self.name().to_string(),
            expected,
            actual,
        })
    }

    /// 执行非高阶函数
    pub fn apply(self, args: Vec<Value>, ctx: &EvaluationContext) -> Result<Value> {
        self.check_arity(args.len())?;

        let value = match self {
            Self::Num => Value::Number(args[0].to_decimal()),
            Self::Str => Value::String(args[0].to_display_string()),
            Self::Bool => Value::Bool(args[0].to_flag()),

            Self::Val => lookup_first(&args, ctx),
            Self::ValNum => Value::Number(lookup_first(&args, ctx).to_decimal()),
            Self::ValStr => Value::String(lookup_first(&args, ctx).to_display_string()),
            Self::ValBool => Value::Bool(lookup_first(&args, ctx).to_flag()),

            Self::Rows => {
                let grids = string_args(&args);
                Value::List(ctx.selected_rows(&grids))
            }
            Self::AllRows => Value::List(ctx.all_rows(&args[0].to_display_string())),
            Self::GetGridItems => get_grid_items(&args, ctx)?,

            Self::Sum => {
                let mut args = args.into_iter();
                let items = next_arg(&mut args).into_list()?;
                let field = next_arg(&mut args);
                let mut total = Decimal::ZERO;
                for item in &items {
                    let part = if field.is_null() {
                        item.to_decimal()
                    } else {
                        item.field(&field.to_display_string()).to_decimal()
                    };
                    total = checked_add(total, part)?;
                }
                Value::Number(total)
            }
            Self::Count => {
                let items = args.into_iter().next().unwrap_or_default().into_list()?;
                Value::Number(Decimal::from(items.len()))
            }
            Self::Filter | Self::Map | Self::Any | Self::All => {
                return Err(PayScriptError::ExecutionError(format!(
                    "{} 需要 lambda 参数",
                    self.name()
                )));
            }

            Self::Min | Self::Max => extremum(self, args)?,
            Self::Abs => Value::Number(args[0].numeric_operand()?.abs()),
            Self::Round => {
                let dp = decimal_places(args.get(1), 0)?;
                Value::Number(round_half_up(args[0].numeric_operand()?, dp))
            }
            Self::Convert => convert(&args)?,
            Self::Distribute => distribute(args)?,
            Self::Fixed => {
                let dp = decimal_places(args.get(1), 2)?;
                Value::String(format_fixed(args[0].numeric_operand()?, dp))
            }

            Self::Coalesce => args.into_iter().find(|v| !v.is_null()).unwrap_or_default(),
            Self::Concat => Value::String(args.iter().map(Value::to_display_string).collect()),
            Self::Empty => Value::Bool(args[0].is_empty_value()),
        };

        Ok(value)
    }
}

impl fmt::Display for Builtin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

fn next_arg(args: &mut impl Iterator<Item = Value>) -> Value {
    args.next().unwrap_or_default()
}

fn string_args(args: &[Value]) -> Vec<String> {
    args.iter()
        .flat_map(|arg| match arg {
            Value::List(items) => items.iter().map(Value::to_display_string).collect(),
            other => vec![other.to_display_string()],
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn lookup_first(args: &[Value], ctx: &EvaluationContext) -> Value {
    ctx.first_of(&string_args(args))
}

/// 选中行，列出的字段转为数值，并标记 selected / obSelected
fn get_grid_items(args: &[Value], ctx: &EvaluationContext) -> Result<Value> {
    let fields = match args.first() {
        Some(v) => string_args(std::slice::from_ref(v)),
        None => Vec::new(),
    };
    let grids = match args.get(1) {
        Some(v) => string_args(std::slice::from_ref(v)),
        None => Vec::new(),
    };

    let rows = ctx
        .selected_rows(&grids)
        .into_iter()
        .map(|row| {
            let mut record = match row {
                Value::Record(map) => map,
                _ => Default::default(),
            };
            for field in &fields {
                if let Some(value) = record.get_mut(field) {
                    *value = Value::Number(value.to_decimal());
                }
            }
            record.insert("selected".to_string(), Value::Bool(true));
            record.insert("obSelected".to_string(), Value::Bool(true));
            Value::Record(record)
        })
        .collect();

    Ok(Value::List(rows))
}

fn extremum(builtin: Builtin, args: Vec<Value>) -> Result<Value> {
    let items = match <[Value; 1]>::try_from(args) {
        Ok([Value::List(items)]) => items,
        Ok([single]) => vec![single],
        Err(args) => args,
    };

    let mut best: Option<Decimal> = None;
    for item in &items {
        let n = item.numeric_operand()?;
        best = Some(match best {
            None => n,
            Some(b) if builtin == Builtin::Min => b.min(n),
            Some(b) => b.max(n),
        });
    }
    Ok(best.map(Value::Number).unwrap_or_default())
}

/// amount × from ÷ to，四舍五入到 precision 位；汇率为假值时视为 1
fn convert(args: &[Value]) -> Result<Value> {
    let rate = |v: &Value| -> Result<Decimal> {
        if v.truthy() {
            let r = v.numeric_operand()?;
            Ok(if r.is_zero() { Decimal::ONE } else { r })
        } else {
            Ok(Decimal::ONE)
        }
    };

    let amount = args[0].numeric_operand()?;
    let from = rate(&args[1])?;
    let to = rate(&args[2])?;
    let dp = decimal_places(args.get(3), 2)?;

    let product = amount
        .checked_mul(from)
        .ok_or_else(|| overflow("convert"))?;
    let converted = product
        .checked_div(to)
        .ok_or_else(|| overflow("convert"))?;
    Ok(Value::Number(round_half_up(converted, dp)))
}

/// 分配金额
///
/// 先扣除已手工分配（金额非零）的行，剩余金额按顺序分配给金额为零的行，
/// 每行最多分配其正的未结金额。
fn distribute(args: Vec<Value>) -> Result<Value> {
    let mut args = args.into_iter();
    let items = next_arg(&mut args).into_list()?;
    let total = next_arg(&mut args).numeric_operand()?;
    let amount_field = match next_arg(&mut args) {
        Value::Null => "amount".to_string(),
        v => v.to_display_string(),
    };
    let outstanding_field = match next_arg(&mut args) {
        Value::Null => "outstandingAmount".to_string(),
        v => v.to_display_string(),
    };

    let mut remaining = total;
    for item in &items {
        let current = item.field(&amount_field).to_decimal();
        if !current.is_zero() {
            remaining = remaining
                .checked_sub(current)
                .ok_or_else(|| overflow("distribute"))?;
        }
    }

    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let mut record = match item {
            Value::Record(record) => record,
            other => {
                out.push(other);
                continue;
            }
        };

        if remaining > Decimal::ZERO {
            let current = record
                .get(&amount_field)
                .map(Value::to_decimal)
                .unwrap_or_default();
            let outstanding = record
                .get(&outstanding_field)
                .map(Value::to_decimal)
                .unwrap_or_default();

            if current.is_zero() && outstanding > Decimal::ZERO {
                let alloc = remaining.min(outstanding);
                record.insert(amount_field.clone(), Value::Number(alloc));
                remaining -= alloc;
            }
        }
        out.push(Value::Record(record));
    }

    Ok(Value::List(out))
}

fn decimal_places(arg: Option<&Value>, default: u32) -> Result<u32> {
    match arg {
        None | Some(Value::Null) => Ok(default),
        Some(v) => {
            let n = v.numeric_operand()?;
            if n.is_sign_negative() || n > Decimal::from(28) {
                return Err(PayScriptError::ExecutionError(format!(
                    "小数位数超出范围: {}",
                    n
                )));
            }
            Ok(n.trunc().to_u32().unwrap_or(default))
        }
    }
}

pub(crate) fn checked_add(a: Decimal, b: Decimal) -> Result<Decimal> {
    a.checked_add(b).ok_or_else(|| overflow("+"))
}

pub(crate) fn overflow(op: &str) -> PayScriptError {
    PayScriptError::ExecutionError(format!("数值溢出: {}", op))
}
