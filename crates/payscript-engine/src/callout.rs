//! Callout 适配层
//!
//! 把规则引擎接到外部表单：从表单值中提取流程 ID、构建上下文、执行规则，
//! 再把计算结果合并为一份字段更新。该边界上所有失败都折叠为“无更新”。

use crate::context::{EvaluationContext, FormValues, GridSelection};
use crate::executor::RuleExecutor;
use crate::registry::RuleRegistry;
use async_trait::async_trait;
use parking_lot::RwLock;
use payscript_shared::observability::metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// 字段更新（字段名 -> 新值）
pub type FieldUpdates = serde_json::Map<String, JsonValue>;

/// 校验结果在更新中的键名
pub const VALIDATIONS_KEY: &str = "_validations";

/// 依次尝试的流程 ID 字段
const PROCESS_ID_FIELDS: [&str; 4] = ["_processId", "processId", "process_id", "ad_process_id"];

/// 提取流程 ID：第一个非空字符串生效
pub fn extract_process_id(form_values: &FormValues) -> Option<&str> {
    PROCESS_ID_FIELDS
        .iter()
        .filter_map(|key| form_values.get(*key).and_then(JsonValue::as_str))
        .find(|id| !id.is_empty())
}

/// 外部表单状态
pub trait FormState: Send + Sync {
    /// 当前所有字段值的快照
    fn values(&self) -> FormValues;

    fn set_value(&self, field: &str, value: JsonValue);

    /// 更新表格数据，默认按普通字段写入
    fn set_grid(&self, grid: &str, rows: JsonValue) {
        self.set_value(grid, rows);
    }
}

/// 内存表单，用于 CLI 与测试
#[derive(Debug, Default)]
pub struct InMemoryForm {
    values: RwLock<FormValues>,
    grids: RwLock<BTreeMap<String, JsonValue>>,
}

impl InMemoryForm {
    pub fn new(values: FormValues) -> Self {
        Self {
            values: RwLock::new(values),
            grids: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn value(&self, field: &str) -> Option<JsonValue> {
        self.values.read().get(field).cloned()
    }

    pub fn grid(&self, grid: &str) -> Option<JsonValue> {
        self.grids.read().get(grid).cloned()
    }
}

impl FormState for InMemoryForm {
    fn values(&self) -> FormValues {
        self.values.read().clone()
    }

    fn set_value(&self, field: &str, value: JsonValue) {
        self.values.write().insert(field.to_string(), value);
    }

    fn set_grid(&self, grid: &str, rows: JsonValue) {
        self.grids.write().insert(grid.to_string(), rows);
    }
}

/// 流程 callout：字段变化时计算派生字段更新
#[async_trait]
pub trait ProcessCallout: Send + Sync {
    async fn call(
        &self,
        form_values: &FormValues,
        form: &dyn FormState,
        grid_selection: Option<&GridSelection>,
    ) -> FieldUpdates;
}

/// 通用 PayScript callout，适用于任何注册了规则的流程
#[derive(Clone)]
pub struct GenericPayScriptCallout {
    registry: RuleRegistry,
    executor: RuleExecutor,
}

impl GenericPayScriptCallout {
    pub fn new(registry: RuleRegistry) -> Self {
        Self {
            registry,
            executor: RuleExecutor::new(),
        }
    }

    pub fn with_executor(mut self, executor: RuleExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// 同步执行：流程 ID 缺失、规则未注册、评估失败都返回空更新
    pub fn evaluate(
        &self,
        form_values: &FormValues,
        grid_selection: Option<&GridSelection>,
    ) -> FieldUpdates {
        let Some(process_id) = extract_process_id(form_values) else {
            debug!("表单值中没有流程 ID");
            metrics::record_callout("noop");
            return FieldUpdates::new();
        };

        let Some(rules) = self.registry.get(process_id) else {
            debug!("流程未注册规则: {}", process_id);
            metrics::record_callout("noop");
            return FieldUpdates::new();
        };

        let context = EvaluationContext::new(process_id, form_values, grid_selection);
        let result = self.executor.execute(&rules, &context);
        for line in &result.evaluation_trace {
            debug!(process_id = %process_id, "{}", line);
        }

        if !result.success {
            error!(
                process_id = %process_id,
                error = result.error.as_deref().unwrap_or_default(),
                "规则执行失败"
            );
            metrics::record_callout("failed");
            return FieldUpdates::new();
        }

        for failed in result.failed_validations() {
            warn!(
                process_id = %process_id,
                id = %failed.id,
                severity = %failed.severity,
                "校验未通过: {}",
                failed.message
            );
        }

        let mut updates = result.computed;
        for transformed in [result.invoices, result.gl_items, result.credit_to_use]
            .into_iter()
            .flatten()
        {
            updates.extend(transformed);
        }

        let validations = serde_json::to_value(&result.validations)
            .unwrap_or_else(|_| JsonValue::Array(Vec::new()));
        updates.insert(VALIDATIONS_KEY.to_string(), validations);

        debug!(process_id = %process_id, fields = updates.len(), "callout 执行成功");
        metrics::record_callout("applied");
        updates
    }
}

#[async_trait]
impl ProcessCallout for GenericPayScriptCallout {
    async fn call(
        &self,
        form_values: &FormValues,
        _form: &dyn FormState,
        grid_selection: Option<&GridSelection>,
    ) -> FieldUpdates {
        self.evaluate(form_values, grid_selection)
    }
}

/// 一次 callout 请求（CLI 的 JSON 输入）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalloutRequest {
    #[serde(default)]
    pub form_values: FormValues,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_selection: Option<GridSelection>,
}

/// 按表单实例串行化 callout：执行期间到达的变化事件直接跳过
pub struct CalloutRunner {
    callout: Arc<dyn ProcessCallout>,
    running: AtomicBool,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CalloutRunner {
    pub fn new(callout: Arc<dyn ProcessCallout>) -> Self {
        Self {
            callout,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 处理一次字段变化
    ///
    /// 返回 `None` 表示已有 callout 在执行而被跳过；否则把更新写回表单
    /// （列表值写入表格，`_validations` 除外），并返回校验结果。
    pub async fn on_change(
        &self,
        form: &dyn FormState,
        grid_selection: Option<&GridSelection>,
    ) -> Option<Vec<JsonValue>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("callout 正在执行，跳过本次变化");
            metrics::record_callout("skipped");
            return None;
        }
        let _guard = RunningGuard(&self.running);

        let form_values = form.values();
        let mut updates = self.callout.call(&form_values, form, grid_selection).await;

        let validations = match updates.remove(VALIDATIONS_KEY) {
            Some(JsonValue::Array(items)) => items,
            _ => Vec::new(),
        };

        for (field, value) in updates {
            if value.is_array() {
                form.set_grid(&field, value);
            } else {
                form.set_value(&field, value);
            }
        }

        Some(validations)
    }
}
