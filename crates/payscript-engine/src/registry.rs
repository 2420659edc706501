//! 规则注册表
//!
//! 流程 ID -> 已编译规则。使用 DashMap 提供线程安全的读写，同一流程 ID 重复注册时后写入者生效。
//! 注册表是显式传递的句柄，克隆后共享同一份数据。

use crate::compiler::{CompiledRules, RuleCompiler};
use crate::dsl::snippet;
use crate::error::{PayScriptError, Result};
use crate::models::RuleDefinition;
use dashmap::DashMap;
use payscript_shared::observability::metrics;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// 解析失败时日志中保留的源码字符数
pub const DEFAULT_SNIPPET_LEN: usize = 100;

/// 规则注册表
#[derive(Clone)]
pub struct RuleRegistry {
    rules: Arc<DashMap<String, Arc<CompiledRules>>>,
    compiler: Arc<parking_lot::Mutex<RuleCompiler>>,
    snippet_len: usize,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self {
            rules: Arc::new(DashMap::new()),
            compiler: Arc::new(parking_lot::Mutex::new(RuleCompiler::new())),
            snippet_len: DEFAULT_SNIPPET_LEN,
        }
    }

    /// 设置解析失败日志中的源码片段长度
    pub fn with_snippet_len(mut self, snippet_len: usize) -> Self {
        self.snippet_len = snippet_len;
        self
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// 注册规则定义，`id` 强制改写为流程 ID
    #[instrument(skip(self, definition))]
    pub fn register(&self, process_id: &str, mut definition: RuleDefinition) -> Result<()> {
        definition.id = process_id.to_string();

        let compiled = {
            let mut compiler = self.compiler.lock();
            compiler.compile(definition)
        };

        match compiled {
            Ok(compiled) => {
                self.insert(compiled);
                Ok(())
            }
            Err(e) => {
                metrics::record_registration(process_id, "rejected");
                warn!("规则注册失败: {}: {}", process_id, e);
                Err(e)
            }
        }
    }

    /// 从 DSL 源码注册，失败时返回错误，已注册的旧规则保持不变
    #[instrument(skip(self, source), fields(source_len = source.len()))]
    pub fn try_register_dsl(&self, process_id: &str, source: &str) -> Result<()> {
        let compiled = {
            let mut compiler = self.compiler.lock();
            compiler.compile_source(process_id, source)
        };

        match compiled {
            Ok(compiled) => {
                self.insert(compiled);
                Ok(())
            }
            Err(e) => {
                metrics::record_registration(process_id, "rejected");
                warn!(
                    error = %e,
                    snippet = %snippet(source, self.snippet_len),
                    "规则源码解析失败: {}",
                    process_id
                );
                Err(e)
            }
        }
    }

    /// 从 DSL 源码注册，错误只记录日志；返回是否注册成功
    ///
    /// 源码须来自可信的后端规则服务。
    pub fn register_dsl(&self, process_id: &str, source: &str) -> bool {
        self.try_register_dsl(process_id, source).is_ok()
    }

    fn insert(&self, compiled: CompiledRules) {
        let process_id = compiled.id().to_string();
        let version = compiled.compile_version;
        let replaced = self
            .rules
            .insert(process_id.clone(), Arc::new(compiled))
            .is_some();

        metrics::record_registration(&process_id, if replaced { "replaced" } else { "added" });
        info!(version, replaced, "规则已注册: {}", process_id);
    }

    /// 获取规则
    pub fn get(&self, process_id: &str) -> Option<Arc<CompiledRules>> {
        self.rules.get(process_id).map(|r| Arc::clone(r.value()))
    }

    /// 删除规则
    #[instrument(skip(self))]
    pub fn remove(&self, process_id: &str) -> Result<()> {
        if self.rules.remove(process_id).is_some() {
            info!("规则已删除: {}", process_id);
            Ok(())
        } else {
            warn!("删除不存在的规则: {}", process_id);
            Err(PayScriptError::RuleNotFound(process_id.to_string()))
        }
    }

    pub fn contains(&self, process_id: &str) -> bool {
        self.rules.contains_key(process_id)
    }

    /// 所有已注册的流程 ID（已排序）
    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rules.iter().map(|r| r.key().clone()).collect();
        ids.sort();
        ids
    }

    #[instrument(skip(self))]
    pub fn clear(&self) {
        let count = self.rules.len();
        self.rules.clear();
        info!("已清空 {} 个流程的规则", count);
    }

    /// 获取注册表统计信息
    pub fn stats(&self) -> RuleRegistryStats {
        let mut stats = RuleRegistryStats::default();
        for entry in self.rules.iter() {
            let definition = &entry.definition;
            stats.processes += 1;
            stats.compute_steps += definition.compute.len();
            stats.validations += definition.validations.len();
            stats.transforms += definition.transforms().count();
            stats.required_fields += entry.required_fields.len();
        }
        stats
    }
}

impl Default for RuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 注册表统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleRegistryStats {
    /// 已注册的流程数
    pub processes: usize,
    pub compute_steps: usize,
    pub validations: usize,
    pub transforms: usize,
    /// 所有流程引用的外部字段总数
    pub required_fields: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::Expr;
    use crate::models::ComputeStep;
    use crate::value::Value;

    const RULES: &str = r#"
export const Rules = {
  id: "ignored",
  compute: [{ name: "total", value: num(amount) * 2, format: "money" }],
  validations: [{ id: "POSITIVE", assert: total > 0, message: "must be positive" }],
};
"#;

    #[test]
    fn test_register_dsl_forces_process_id() {
        let registry = RuleRegistry::new();

        assert!(registry.register_dsl("800166", RULES));
        assert!(registry.contains("800166"));
        assert_eq!(registry.get("800166").unwrap().id(), "800166");
        assert!(registry.get("ignored").is_none());
    }

    #[test]
    fn test_register_dsl_deeply_nested_source_is_noop() {
        let registry = RuleRegistry::new();
        registry.register_dsl("p", RULES);

        let nested = format!(
            "{{ compute: [{{ name: \"x\", value: {}1{} }}] }}",
            "(".repeat(300),
            ")".repeat(300)
        );
        assert!(!registry.register_dsl("p", &nested));
        assert!(matches!(
            registry.try_register_dsl("q", &nested),
            Err(PayScriptError::Parse { .. })
        ));

        // 旧规则保持不变
        assert_eq!(registry.get("p").unwrap().definition.compute[0].name, "total");
        assert!(!registry.contains("q"));
    }

    #[test]
    fn test_last_write_wins() {
        let registry = RuleRegistry::new();
        registry.register_dsl("p", RULES);
        let first = registry.get("p").unwrap();

        registry.register_dsl("p", r#"{ compute: [{ name: "other", value: 1 }] }"#);
        let second = registry.get("p").unwrap();

        assert_eq!(registry.len(), 1);
        assert!(second.compile_version > first.compile_version);
        assert_eq!(second.definition.compute[0].name, "other");
    }

    #[test]
    fn test_malformed_source_is_noop() {
        let registry = RuleRegistry::new();

        assert!(!registry.register_dsl("p", "export const Rules = { compute: [ ;"));
        assert!(!registry.contains("p"));

        let err = registry.try_register_dsl("p", "[1, 2]").unwrap_err();
        assert!(matches!(err, PayScriptError::NotAnObject));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failed_reregistration_keeps_previous() {
        let registry = RuleRegistry::new();
        registry.register_dsl("p", RULES);

        assert!(!registry.register_dsl("p", "{ compute: [{ name: 1 }] }"));
        assert_eq!(registry.get("p").unwrap().definition.compute[0].name, "total");
    }

    #[test]
    fn test_register_definition() {
        let registry = RuleRegistry::new();
        let definition = RuleDefinition {
            id: "other".to_string(),
            compute: vec![ComputeStep::new("x", Expr::Literal(Value::from("y")))],
            ..Default::default()
        };

        registry.register("p", definition).unwrap();
        assert_eq!(registry.get("p").unwrap().id(), "p");
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = RuleRegistry::new();
        registry.register_dsl("a", RULES);
        registry.register_dsl("b", RULES);

        assert_eq!(registry.list_ids(), vec!["a", "b"]);
        registry.remove("a").unwrap();
        assert!(matches!(
            registry.remove("a"),
            Err(PayScriptError::RuleNotFound(_))
        ));

        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_state() {
        let registry = RuleRegistry::new();
        let handle = registry.clone();
        handle.register_dsl("p", RULES);
        assert!(registry.contains("p"));
    }

    #[test]
    fn test_stats() {
        let registry = RuleRegistry::new();
        registry.register_dsl("p", RULES);

        let stats = registry.stats();
        assert_eq!(stats.processes, 1);
        assert_eq!(stats.compute_steps, 1);
        assert_eq!(stats.validations, 1);
        assert_eq!(stats.transforms, 0);
        assert_eq!(stats.required_fields, 1);
    }
}
