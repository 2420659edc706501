//! PayScript 规则引擎
//!
//! 为 ERP 流程表单计算派生字段（付款合计、超额处理、币种换算等）的声明式规则解释器。
//!
//! ## 核心功能
//!
//! - **DSL 解析**: 容忍 import/export 包装与轻量 TypeScript 注解，解析为表达式语法树
//! - **规则编译**: 注册时完成结构检查，预提取规则引用的外部字段
//! - **规则执行**: 计算步骤按声明顺序执行，随后是行转换与校验
//! - **Callout**: 从表单值构建上下文并返回字段更新，失败时不产生任何更新
//!
//! ## 示例
//!
//! ```rust
//! use payscript::{EvaluationContext, RuleRegistry, execute_logic};
//! use serde_json::json;
//!
//! let registry = RuleRegistry::new();
//! registry.register_dsl(
//!     "800166",
//!     r#"export const Rules = {
//!         compute: [{ name: "total", value: sum(rows(), "amount"), format: "money" }],
//!     };"#,
//! );
//!
//! let context = EvaluationContext::from_json(&json!({
//!     "_processId": "800166",
//!     "_gridSelection": { "order_invoice": { "_selection": [{ "amount": 500 }, { "amount": 300 }] } }
//! })).unwrap();
//!
//! let rules = registry.get("800166").unwrap();
//! let result = execute_logic(&rules, &context);
//! assert_eq!(result.computed["total"], json!("800.00"));
//! ```

pub mod builtins;
pub mod callout;
pub mod compiler;
pub mod context;
pub mod dsl;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod loader;
pub mod models;
pub mod registry;
pub mod value;

pub use callout::{
    extract_process_id, CalloutRequest, CalloutRunner, FieldUpdates, FormState,
    GenericPayScriptCallout, InMemoryForm, ProcessCallout, VALIDATIONS_KEY,
};
pub use compiler::{CompiledRules, RuleCompiler};
pub use context::{canonical_key, EvaluationContext, FormValues, GridEntity, GridSelection};
pub use error::{PayScriptError, Result};
pub use executor::{execute_logic, RuleExecutor};
pub use loader::{LoadReport, RuleDirWatcher, RuleLoader};
pub use models::{
    ComputeStep, EvaluationResult, OutputFormat, RuleDefinition, Severity, TransformKind,
    TransformStep, ValidationOutcome, ValidationRule,
};
pub use registry::{RuleRegistry, RuleRegistryStats};
pub use value::Value;
