//! 规则执行器
//!
//! 按固定顺序执行：计算步骤 -> 行转换 -> 校验。
//! 任何步骤出错都会整体失败，调用方拿到的只有错误信息，不会看到部分结果。

use crate::compiler::CompiledRules;
use crate::context::EvaluationContext;
use crate::error::{PayScriptError, Result};
use crate::evaluator::ExpressionEvaluator;
use crate::models::{
    ComputeStep, EvaluationResult, TransformKind, TransformStep, ValidationOutcome,
    ValidationRule,
};
use crate::value::Value;
use payscript_shared::observability::metrics;
use serde_json::json;
use std::time::Instant;
use tracing::debug;

/// 规则执行器
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleExecutor {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl RuleExecutor {
    pub fn new() -> Self {
        Self {
            trace_enabled: false,
        }
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 执行规则评估，错误折叠为 `success: false`
    pub fn execute(&self, rules: &CompiledRules, context: &EvaluationContext) -> EvaluationResult {
        let start = Instant::now();

        let mut result = match self.run(rules, context) {
            Ok(result) => result,
            Err(e) => {
                debug!(process_id = %rules.id(), error = %e, "规则评估失败");
                EvaluationResult::failure(e.to_string())
            }
        };

        let elapsed = start.elapsed();
        result.evaluation_time_ms = elapsed.as_millis() as i64;
        metrics::record_evaluation(rules.id(), result.success, elapsed.as_secs_f64());

        result
    }

    fn run(&self, rules: &CompiledRules, context: &EvaluationContext) -> Result<EvaluationResult> {
        let definition = &rules.definition;
        let mut evaluator = ExpressionEvaluator::new(context);
        let mut result = EvaluationResult {
            success: true,
            ..Default::default()
        };

        for (i, step) in definition.compute.iter().enumerate() {
            self.compute_step(&mut evaluator, step, i, &mut result)?;
        }

        for (kind, step) in definition.transforms() {
            self.transform_step(&mut evaluator, kind, step, &mut result)?;
        }

        for rule in &definition.validations {
            self.validation_step(&mut evaluator, rule, &mut result)?;
        }

        Ok(result)
    }

    /// 计算步骤：作用域内保留原始值，只有输出值按格式转换
    fn compute_step(
        &self,
        evaluator: &mut ExpressionEvaluator<'_>,
        step: &ComputeStep,
        index: usize,
        result: &mut EvaluationResult,
    ) -> Result<()> {
        let raw = evaluator
            .evaluate(&step.value)
            .map_err(|e| step_error(&format!("compute '{}'", step.name), e))?;
        evaluator.define(&step.name, raw.clone());

        if self.trace_enabled {
            result.evaluation_trace.push(format!(
                "compute[{}]: {} = {}{}",
                index,
                step.name,
                raw.to_json(),
                if step.hidden { " (hidden)" } else { "" }
            ));
        }

        if step.hidden {
            return Ok(());
        }

        let output = step
            .format
            .apply(&raw)
            .map_err(|e| step_error(&format!("compute '{}'", step.name), e))?
            .to_json();

        for alias in &step.aliases {
            result.computed.insert(alias.clone(), output.clone());
        }
        result.computed.insert(step.name.clone(), output);

        Ok(())
    }

    /// 行转换：过滤后写入 `set` 字段，并强制标记为选中
    fn transform_step(
        &self,
        evaluator: &mut ExpressionEvaluator<'_>,
        kind: TransformKind,
        step: &TransformStep,
        result: &mut EvaluationResult,
    ) -> Result<()> {
        let label = format!("{} '{}'", kind, step.name);
        let source = evaluator
            .evaluate(&step.source)
            .and_then(Value::into_list)
            .map_err(|e| step_error(&label, e))?;
        let total = source.len();

        let mut rows = Vec::with_capacity(total);
        for (i, row) in source.into_iter().enumerate() {
            if let Some(filter) = &step.filter {
                let keep = evaluator
                    .evaluate_with_row(filter, &row, i)
                    .map_err(|e| step_error(&label, e))?;
                if !keep.truthy() {
                    continue;
                }
            }

            let mut fields = match &row {
                Value::Record(fields) => fields.clone(),
                other => {
                    return Err(step_error(
                        &label,
                        PayScriptError::type_mismatch("record", other.type_name()),
                    ));
                }
            };

            for (field, expr) in &step.set {
                let value = evaluator
                    .evaluate_with_row(expr, &row, i)
                    .map_err(|e| step_error(&label, e))?;
                fields.insert(field.clone(), value);
            }
            fields.insert("selected".to_string(), Value::Bool(true));
            fields.insert("obSelected".to_string(), Value::Bool(true));

            rows.push(Value::Record(fields).to_json());
        }

        if self.trace_enabled {
            result.evaluation_trace.push(format!(
                "{}.{}: {}/{} 行",
                kind,
                step.name,
                rows.len(),
                total
            ));
        }

        result
            .transformed_mut(kind)
            .insert(step.name.clone(), serde_json::Value::Array(rows));

        Ok(())
    }

    /// 校验：失败的断言只作为结果返回，不中断评估
    fn validation_step(
        &self,
        evaluator: &mut ExpressionEvaluator<'_>,
        rule: &ValidationRule,
        result: &mut EvaluationResult,
    ) -> Result<()> {
        let label = format!("validation '{}'", rule.id);

        let Some(each) = &rule.each else {
            let is_valid = evaluator
                .evaluate(&rule.assert)
                .map_err(|e| step_error(&label, e))?
                .truthy();
            self.push_outcome(result, rule, is_valid, None);
            return Ok(());
        };

        let rows = evaluator
            .evaluate(each)
            .and_then(Value::into_list)
            .map_err(|e| step_error(&label, e))?;

        for (i, row) in rows.iter().enumerate() {
            let is_valid = evaluator
                .evaluate_with_row(&rule.assert, row, i)
                .map_err(|e| step_error(&label, e))?
                .truthy();

            let mut context = json!({ "index": i });
            let row_id = row.field("id");
            if !row_id.is_null() {
                context["id"] = row_id.to_json();
            }
            self.push_outcome(result, rule, is_valid, Some(context));
        }

        Ok(())
    }

    fn push_outcome(
        &self,
        result: &mut EvaluationResult,
        rule: &ValidationRule,
        is_valid: bool,
        context: Option<serde_json::Value>,
    ) {
        if self.trace_enabled {
            result.evaluation_trace.push(format!(
                "validation {}{}: {}",
                rule.id,
                context
                    .as_ref()
                    .map(|c| format!("[{}]", c["index"]))
                    .unwrap_or_default(),
                if is_valid { "PASS" } else { "FAIL" }
            ));
        }

        result.validations.push(ValidationOutcome {
            id: rule.id.clone(),
            is_valid,
            message: rule.message.clone(),
            severity: rule.severity,
            context,
        });
    }
}

fn step_error(label: &str, error: PayScriptError) -> PayScriptError {
    PayScriptError::ExecutionError(format!("{}: {}", label, error))
}

/// 执行规则（不记录追踪）
pub fn execute_logic(rules: &CompiledRules, context: &EvaluationContext) -> EvaluationResult {
    RuleExecutor::new().execute(rules, context)
}
