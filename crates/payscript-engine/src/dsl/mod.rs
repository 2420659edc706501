//! PayScript DSL
//!
//! 规则源码 -> 正则清理 -> 词法分析 -> 表达式语法树。
//! 不存在任何动态代码执行：源码只会被解析为 [`Expr`]，再由编译器降级为规则定义。

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod source;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use parser::parse_expression;
pub use source::{clean_source, snippet};

use crate::error::Result;

/// 解析规则源码为顶层表达式
///
/// 规则源码来自后端，视为可信内容，不应接受终端用户输入。
/// 解析只产生表达式树，函数调用限定在内置函数表内。
pub fn parse_rules_source(raw: &str) -> Result<Expr> {
    let code = clean_source(raw);
    parse_expression(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typescript_rules_source() {
        let raw = r#"
import type { PayScriptRules } from "@/payscript";

export const AddPaymentRules: PayScriptRules = {
  id: "placeholder",
  compute: [
    { name: "total", value: util.sum(rows(), (row: any) => row.amount), format: "money" },
  ],
} as const;
"#;
        let expr = parse_rules_source(raw).unwrap();
        assert!(matches!(expr, Expr::Object(_)));
        assert!(expr.get("compute").is_some());
    }
}
