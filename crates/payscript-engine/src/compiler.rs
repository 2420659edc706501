//! 规则编译器
//!
//! 将 DSL 顶层对象字面量降级为 [`RuleDefinition`]，并在注册时完成所有静态检查：
//! 步骤结构、内置函数参数个数、lambda 位置、计算步骤重名。
//! 同时预提取规则引用的外部字段，便于排查表单缺少哪些值。

use crate::builtins::{Builtin, LambdaSlot};
use crate::context::{canonical_key, GRID_SELECTION_KEY, PROCESS_ID_KEY};
use crate::dsl::{parse_rules_source, Expr};
use crate::error::{PayScriptError, Result};
use crate::models::{
    ComputeStep, OutputFormat, RuleDefinition, Severity, TransformKind, TransformStep,
    ValidationRule,
};
use crate::value::Value;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use std::collections::{BTreeSet, HashSet};

/// 逐行上下文中绑定的变量名
pub const ROW_BINDING: &str = "row";

const COMPUTE_KEYS: &[&str] = &["name", "value", "format", "precision", "aliases", "hidden"];
const VALIDATION_KEYS: &[&str] = &["id", "assert", "message", "severity", "each"];
const TRANSFORM_KEYS: &[&str] = &["name", "source", "filter", "set"];

/// 编译后的规则
#[derive(Debug, Clone)]
pub struct CompiledRules {
    pub definition: RuleDefinition,
    /// 规则引用的外部字段
    pub required_fields: BTreeSet<String>,
    /// 编译版本号（重复注册时递增）
    pub compile_version: u64,
    pub registered_at: DateTime<Utc>,
}

impl CompiledRules {
    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

/// 规则编译器
pub struct RuleCompiler {
    compile_version: u64,
}

impl RuleCompiler {
    pub fn new() -> Self {
        Self { compile_version: 0 }
    }

    /// 从规则源码编译
    pub fn compile_source(&mut self, process_id: &str, source: &str) -> Result<CompiledRules> {
        let expr = parse_rules_source(source)?;
        self.compile_expr(process_id, &expr)
    }

    /// 从已解析的顶层表达式编译
    pub fn compile_expr(&mut self, process_id: &str, expr: &Expr) -> Result<CompiledRules> {
        let definition = lower(process_id, expr)?;
        self.compile(definition)
    }

    /// 编译规则定义
    pub fn compile(&mut self, definition: RuleDefinition) -> Result<CompiledRules> {
        let required_fields = check_definition(&definition)?;

        self.compile_version += 1;

        Ok(CompiledRules {
            definition,
            required_fields,
            compile_version: self.compile_version,
            registered_at: Utc::now(),
        })
    }
}

impl Default for RuleCompiler {
    fn default() -> Self {
        Self::new()
    }
}

/// 顶层对象字面量 -> 规则定义；未知的顶层键忽略
pub fn lower(process_id: &str, expr: &Expr) -> Result<RuleDefinition> {
    if !matches!(expr, Expr::Object(_)) {
        return Err(PayScriptError::NotAnObject);
    }

    let compute = step_objects(expr, "compute")?
        .into_iter()
        .enumerate()
        .map(|(i, step)| lower_compute(step, &format!("compute[{}]", i)))
        .collect::<Result<Vec<_>>>()?;

    let validations = step_objects(expr, "validations")?
        .into_iter()
        .enumerate()
        .map(|(i, step)| lower_validation(step, &format!("validations[{}]", i)))
        .collect::<Result<Vec<_>>>()?;

    let transforms = |kind: TransformKind| -> Result<Vec<TransformStep>> {
        step_objects(expr, kind.key())?
            .into_iter()
            .enumerate()
            .map(|(i, step)| lower_transform(step, &format!("{}[{}]", kind, i)))
            .collect()
    };
    let invoices = transforms(TransformKind::Invoices)?;
    let gl_items = transforms(TransformKind::GlItems)?;
    let credit_to_use = transforms(TransformKind::CreditToUse)?;

    Ok(RuleDefinition {
        id: process_id.to_string(),
        compute,
        validations,
        invoices,
        gl_items,
        credit_to_use,
    })
}

/// 读取步骤数组，缺省为空
fn step_objects<'a>(root: &'a Expr, key: &str) -> Result<Vec<&'a Expr>> {
    match root.get(key) {
        None | Some(Expr::Literal(Value::Null)) => Ok(Vec::new()),
        Some(Expr::Array(items)) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Expr::Object(_) => Ok(item),
                _ => Err(compile_error(format!("{}[{}] 必须是对象", key, i))),
            })
            .collect(),
        Some(_) => Err(compile_error(format!("'{}' 必须是数组", key))),
    }
}

fn check_keys(step: &Expr, allowed: &[&str], path: &str) -> Result<()> {
    if let Expr::Object(entries) = step {
        for (key, _) in entries {
            if !allowed.contains(&key.as_str()) {
                return Err(compile_error(format!("{} 包含未知字段 '{}'", path, key)));
            }
        }
    }
    Ok(())
}

fn required<'a>(step: &'a Expr, key: &str, path: &str) -> Result<&'a Expr> {
    step.get(key)
        .ok_or_else(|| compile_error(format!("{} 缺少 '{}'", path, key)))
}

fn literal_string(step: &Expr, key: &str, path: &str) -> Result<Option<String>> {
    match step.get(key) {
        None => Ok(None),
        Some(expr) => expr
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| compile_error(format!("{}.{} 必须是字符串字面量", path, key))),
    }
}

fn required_string(step: &Expr, key: &str, path: &str) -> Result<String> {
    literal_string(step, key, path)?
        .ok_or_else(|| compile_error(format!("{} 缺少 '{}'", path, key)))
}

fn lower_compute(step: &Expr, path: &str) -> Result<ComputeStep> {
    check_keys(step, COMPUTE_KEYS, path)?;

    let name = required_string(step, "name", path)?;
    let value = required(step, "value", path)?.clone();

    let precision = match step.get("precision").map(Expr::as_literal) {
        None => None,
        Some(Some(Value::Number(n))) if n.fract().is_zero() => Some(
            n.to_u32()
                .filter(|p| *p <= 28)
                .ok_or_else(|| compile_error(format!("{}.precision 超出范围: {}", path, n)))?,
        ),
        Some(_) => return Err(compile_error(format!("{}.precision 必须是非负整数", path))),
    };

    let format = match literal_string(step, "format", path)? {
        None => match precision {
            Some(dp) => OutputFormat::Number {
                precision: Some(dp),
            },
            None => OutputFormat::Raw,
        },
        Some(name) => OutputFormat::parse(&name, precision)
            .ok_or_else(|| compile_error(format!("{}.format 未知格式 '{}'", path, name)))?,
    };

    let aliases = match step.get("aliases").map(Expr::as_literal) {
        None => Vec::new(),
        Some(Some(Value::String(alias))) => vec![alias],
        Some(Some(Value::List(items))) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                _ => Err(compile_error(format!("{}.aliases 只能包含字符串", path))),
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(compile_error(format!("{}.aliases 必须是字符串数组", path))),
    };

    let hidden = match step.get("hidden").map(Expr::as_literal) {
        None => false,
        Some(Some(Value::Bool(b))) => b,
        Some(_) => return Err(compile_error(format!("{}.hidden 必须是布尔字面量", path))),
    };

    let step = ComputeStep::new(name, value)
        .with_format(format)
        .with_aliases(aliases);
    Ok(if hidden { step.hidden() } else { step })
}

fn lower_validation(step: &Expr, path: &str) -> Result<ValidationRule> {
    check_keys(step, VALIDATION_KEYS, path)?;

    let id = required_string(step, "id", path)?;
    let assert = required(step, "assert", path)?.clone();
    let message = required_string(step, "message", path)?;
    let severity = match literal_string(step, "severity", path)? {
        None => Severity::default(),
        Some(name) => Severity::parse(&name)
            .ok_or_else(|| compile_error(format!("{}.severity 未知级别 '{}'", path, name)))?,
    };

    Ok(ValidationRule {
        id,
        assert,
        message,
        severity,
        each: step.get("each").cloned(),
    })
}

fn lower_transform(step: &Expr, path: &str) -> Result<TransformStep> {
    check_keys(step, TRANSFORM_KEYS, path)?;

    let name = required_string(step, "name", path)?;
    let source = required(step, "source", path)?.clone();
    let set = match step.get("set") {
        None => Vec::new(),
        Some(Expr::Object(entries)) => entries.clone(),
        Some(_) => return Err(compile_error(format!("{}.set 必须是对象字面量", path))),
    };

    Ok(TransformStep {
        name,
        source,
        filter: step.get("filter").cloned(),
        set,
    })
}

/// 静态检查规则定义，返回引用的外部字段
fn check_definition(definition: &RuleDefinition) -> Result<BTreeSet<String>> {
    let mut checker = Checker::default();

    let mut names = HashSet::new();
    for step in &definition.compute {
        if step.name.is_empty() {
            return Err(compile_error("计算步骤名称不能为空"));
        }
        // 作用域按规范化键存放，`total` 与 `Total` 视为同名
        if !names.insert(canonical_key(&step.name)) {
            return Err(compile_error(format!("计算步骤重名: {}", step.name)));
        }
        checker.expr(&step.value, false)?;
        checker.computed.insert(canonical_key(&step.name));
    }

    for step in definition.transforms().map(|(_, step)| step) {
        checker.expr(&step.source, false)?;
        checker.with_row(|c| {
            if let Some(filter) = &step.filter {
                c.row_callback(filter)?;
            }
            for (_, value) in &step.set {
                c.row_callback(value)?;
            }
            Ok(())
        })?;
    }

    for rule in &definition.validations {
        match &rule.each {
            Some(each) => {
                checker.expr(each, false)?;
                checker.with_row(|c| c.expr(&rule.assert, false))?;
            }
            None => checker.expr(&rule.assert, false)?,
        }
    }

    Ok(checker.fields)
}

#[derive(Default)]
struct Checker {
    /// 已声明的计算步骤（归一化名）
    computed: HashSet<String>,
    /// 当前作用域内的局部变量
    locals: Vec<String>,
    fields: BTreeSet<String>,
}

impl Checker {
    fn with_row<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.locals.push(ROW_BINDING.to_string());
        let result = f(self);
        self.locals.pop();
        result
    }

    /// 逐行回调：lambda 或绑定了 `row` 的表达式
    fn row_callback(&mut self, expr: &Expr) -> Result<()> {
        self.expr(expr, true)
    }

    fn expr(&mut self, expr: &Expr, lambda_allowed: bool) -> Result<()> {
        match expr {
            Expr::Literal(_) => Ok(()),
            Expr::Ident(name) => {
                self.reference(name);
                Ok(())
            }
            Expr::Array(items) => items.iter().try_for_each(|item| self.expr(item, false)),
            Expr::Object(entries) => entries.iter().try_for_each(|(_, v)| self.expr(v, false)),
            Expr::Member { object, .. } => self.expr(object, false),
            Expr::Index { object, index } => {
                self.expr(object, false)?;
                self.expr(index, false)
            }
            Expr::Unary { operand, .. } => self.expr(operand, false),
            Expr::Binary { left, right, .. } => {
                self.expr(left, false)?;
                self.expr(right, false)
            }
            Expr::Conditional {
                test,
                consequent,
                alternate,
            } => {
                self.expr(test, false)?;
                self.expr(consequent, false)?;
                self.expr(alternate, false)
            }
            Expr::Lambda { params, body } => {
                if !lambda_allowed {
                    return Err(compile_error("lambda 只能作为高阶函数参数或行转换回调"));
                }
                if params.len() > 2 {
                    return Err(compile_error(format!(
                        "lambda 参数过多: {}",
                        params.len()
                    )));
                }
                let depth = self.locals.len();
                self.locals.extend(params.iter().cloned());
                let result = self.expr(body, false);
                self.locals.truncate(depth);
                result
            }
            Expr::Call { function, args } => self.call(*function, args),
        }
    }

    fn call(&mut self, function: Builtin, args: &[Expr]) -> Result<()> {
        function.check_arity(args.len())?;

        let slot = function.lambda_slot();
        for (i, arg) in args.iter().enumerate() {
            let lambda_here = slot.is_some_and(|s| s.index() == i);
            if let Some(LambdaSlot::Required(idx)) = slot {
                if idx == i && !arg.is_lambda() {
                    return Err(compile_error(format!(
                        "{} 的第 {} 个参数必须是 lambda",
                        function,
                        i + 1
                    )));
                }
            }
            self.expr(arg, lambda_here)?;
        }

        if function.reads_fields() {
            for arg in args {
                match arg.as_literal() {
                    Some(Value::String(name)) => {
                        self.fields.insert(name);
                    }
                    Some(Value::List(names)) => {
                        self.fields.extend(names.iter().map(Value::to_display_string));
                    }
                    _ => {}
                }
            }
        }

        Ok(())
    }

    fn reference(&mut self, name: &str) {
        if self.locals.iter().any(|l| l == name)
            || self.computed.contains(&canonical_key(name))
            || name == PROCESS_ID_KEY
            || name == GRID_SELECTION_KEY
        {
            return;
        }
        self.fields.insert(name.to_string());
    }
}

fn compile_error(message: impl Into<String>) -> PayScriptError {
    PayScriptError::CompileError(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<CompiledRules> {
        RuleCompiler::new().compile_source("800166", source)
    }

    #[test]
    fn test_compile_full_definition() {
        let compiled = compile(
            r#"{
                id: "ignored",
                compute: [
                    { name: "invoices", value: getGridItems(["amount"]), hidden: true },
                    { name: "total", value: sum(invoices, "amount"), format: "money", aliases: ["amount_inv_ords"] },
                    { name: "difference", value: valNum("actual_payment") - total, format: "money", precision: 2 },
                ],
                validations: [
                    { id: "POSITIVE", assert: row.amount >= 0, message: "negative", each: invoices, severity: "warning" },
                ],
                invoices: [
                    { name: "order_invoice", source: invoices, filter: r => r.amount > 0, set: { paid: row.amount } },
                ],
                unknownTopLevel: 42,
            }"#,
        )
        .unwrap();

        let definition = &compiled.definition;
        assert_eq!(compiled.id(), "800166");
        assert_eq!(compiled.compile_version, 1);
        assert_eq!(definition.compute.len(), 3);
        assert!(definition.compute[0].hidden);
        assert_eq!(definition.compute[1].aliases, vec!["amount_inv_ords"]);
        assert_eq!(
            definition.compute[2].format,
            OutputFormat::Money { precision: 2 }
        );
        assert_eq!(definition.validations[0].severity, Severity::Warning);
        assert!(definition.validations[0].each.is_some());
        assert_eq!(definition.invoices.len(), 1);
        assert!(definition.gl_items.is_empty());
        assert_eq!(
            compiled.required_fields.iter().collect::<Vec<_>>(),
            vec!["actual_payment"]
        );
    }

    #[test]
    fn test_compile_version_increments() {
        let mut compiler = RuleCompiler::new();
        let first = compiler.compile_source("a", "{ compute: [] }").unwrap();
        let second = compiler.compile_source("a", "{ compute: [] }").unwrap();
        assert_eq!(first.compile_version, 1);
        assert_eq!(second.compile_version, 2);
    }

    #[test]
    fn test_not_an_object() {
        assert!(matches!(compile("[1, 2]"), Err(PayScriptError::NotAnObject)));
        assert!(matches!(compile("42"), Err(PayScriptError::NotAnObject)));
    }

    #[test]
    fn test_unknown_step_key() {
        let err = compile(r#"{ compute: [{ name: "a", value: 1, formt: "money" }] }"#).unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(ref m) if m.contains("formt")));
    }

    #[test]
    fn test_non_literal_name() {
        let err = compile(r#"{ compute: [{ name: other, value: 1 }] }"#).unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(_)));
    }

    #[test]
    fn test_duplicate_compute_name() {
        let err = compile(r#"{ compute: [{ name: "a", value: 1 }, { name: "a", value: 2 }] }"#)
            .unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(ref m) if m.contains("重名")));
    }

    #[test]
    fn test_duplicate_compute_name_differs_only_in_case() {
        let err = compile(
            r#"{
                compute: [
                    { name: "total", value: 1, format: "money" },
                    { name: "Total", value: 99, hidden: true },
                    { name: "out", value: total },
                ],
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(ref m) if m.contains("Total")));

        let err = compile(
            r#"{ compute: [{ name: "used_credit", value: 1 }, { name: "usedCredit", value: 2 }] }"#,
        )
        .unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(_)));
    }

    #[test]
    fn test_wrong_arity() {
        let err = compile(r#"{ compute: [{ name: "a", value: convert(1, 2) }] }"#).unwrap_err();
        assert!(matches!(err, PayScriptError::Arity { .. }));
    }

    #[test]
    fn test_misplaced_lambda() {
        let err = compile(r#"{ compute: [{ name: "a", value: x => x }] }"#).unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(ref m) if m.contains("lambda")));

        let err = compile(r#"{ compute: [{ name: "a", value: filter(rows(), true) }] }"#)
            .unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(ref m) if m.contains("lambda")));
    }

    #[test]
    fn test_unknown_format() {
        let err = compile(r#"{ compute: [{ name: "a", value: 1, format: "currency" }] }"#)
            .unwrap_err();
        assert!(matches!(err, PayScriptError::CompileError(_)));
    }

    #[test]
    fn test_required_fields_exclude_locals_and_computed() {
        let compiled = compile(
            r#"{ compute: [
                { name: "usedCredit", value: val("used_credit", "usedCredit") },
                { name: "total", value: sum(rows(), r => r.amount) + used_credit + issotrx },
            ] }"#,
        )
        .unwrap();

        assert_eq!(
            compiled.required_fields.into_iter().collect::<Vec<_>>(),
            vec!["issotrx", "usedCredit", "used_credit"]
        );
    }
}
