//! PayScript 引擎错误类型

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayScriptError {
    #[error("DSL 词法错误 (第 {line} 行): {message}")]
    Lex { line: u32, message: String },

    #[error("DSL 解析失败 (第 {line} 行): {message}")]
    Parse { line: u32, message: String },

    #[error("DSL 顶层表达式不是对象")]
    NotAnObject,

    #[error("规则编译失败: {0}")]
    CompileError(String),

    #[error("规则执行失败: {0}")]
    ExecutionError(String),

    #[error("未知函数: {0}")]
    UnknownFunction(String),

    #[error("函数 {function} 参数个数错误: 期望 {expected}, 实际 {actual}")]
    Arity {
        function: String,
        expected: String,
        actual: usize,
    },

    #[error("类型不匹配: 期望 {expected}, 实际 {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("规则未找到: {0}")]
    RuleNotFound(String),

    #[error("读取规则文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("规则目录监听失败: {0}")]
    Watch(#[from] notify::Error),

    #[error("JSON 序列化错误: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl PayScriptError {
    pub(crate) fn lex(line: u32, message: impl Into<String>) -> Self {
        Self::Lex {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn parse(line: u32, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn type_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PayScriptError>;
