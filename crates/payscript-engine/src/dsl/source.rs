//! 规则源码预处理
//!
//! 后端下发的规则文本是 `import ...; export const Rules: T = { ... };` 形式的
//! JavaScript / TypeScript 源码。这里只做有限的正则清理，把它还原为单个对象字面量表达式；
//! 类型剥离只覆盖 `as any` / `as const`、单参数类型标注和箭头函数返回类型，不是完整的 TypeScript 编译器。

use regex::Regex;
use std::sync::LazyLock;

/// 行首的 import 语句（可跨行）
static IMPORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*import\s+[\s\S]+?;").expect("valid import regex"));

/// `export const NAME[: Type] = `
static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"export\s+const\s+\w+(\s*:\s*\w+)?\s*=\s*").expect("valid export regex")
});

static AS_ANY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bas\s+any\b").expect("valid as-any regex"));

static AS_CONST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bas\s+const\b").expect("valid as-const regex"));

/// `(n: any)` -> `(n)`
static PARAM_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\s*([a-zA-Z0-9_]+)\s*:\s*[a-zA-Z0-9_\[\]<>]+\s*\)").expect("valid param regex")
});

/// `): number =>` -> `) =>`
static RETURN_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\)\s*:\s*[a-zA-Z0-9_\[\]<>]+\s*=>").expect("valid return-type regex")
});

/// 清理规则源码，返回待解析的表达式文本
pub fn clean_source(raw: &str) -> String {
    let without_imports = IMPORT_RE.replace_all(raw, "");
    let without_export = EXPORT_RE.replacen(&without_imports, 1, "");
    let mut code = without_export.trim().to_string();

    if code.ends_with(';') {
        code.pop();
    }

    if looks_like_typescript(raw) {
        code = strip_type_annotations(&code);
    }

    code
}

/// 包含箭头函数且出现 `: any` / `as any` / `as const` 时才做类型剥离
fn looks_like_typescript(raw: &str) -> bool {
    raw.contains("=>")
        && (raw.contains(": any") || raw.contains("as any") || raw.contains("as const"))
}

/// 尽力剥离 TypeScript 类型标注
pub fn strip_type_annotations(code: &str) -> String {
    let code = AS_ANY_RE.replace_all(code, "");
    let code = AS_CONST_RE.replace_all(&code, "");
    let code = PARAM_TYPE_RE.replace_all(&code, "($1)");
    let code = RETURN_TYPE_RE.replace_all(&code, ") =>");
    code.into_owned()
}

/// 截取源码片段用于日志
pub fn snippet(src: &str, max_chars: usize) -> String {
    let mut chars = src.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_imports_and_export() {
        let raw = r#"
import { PayScriptRules } from "@/payscript";
import type {
  Util,
} from "@/payscript/util";

export const Rules: PayScriptRules = {
  compute: [],
};
"#;
        assert_eq!(clean_source(raw), "{\n  compute: [],\n}");
    }

    #[test]
    fn test_plain_object_untouched() {
        assert_eq!(clean_source("{ a: 1 }"), "{ a: 1 }");
    }

    #[test]
    fn test_strips_type_annotations_when_typescript() {
        let raw = "export const R = { f: (row: any): number => row.amount, g: [1] as const };";
        assert_eq!(clean_source(raw), "{ f: (row) => row.amount, g: [1]  }");
    }

    #[test]
    fn test_no_stripping_without_arrow() {
        let raw = "{ label: \"x as any\" }";
        assert_eq!(clean_source(raw), raw);
    }

    #[test]
    fn test_as_inside_identifier_kept() {
        let stripped = strip_type_annotations("{ alias: hasConstraint }");
        assert_eq!(stripped, "{ alias: hasConstraint }");
    }

    #[test]
    fn test_snippet() {
        assert_eq!(snippet("abcdef", 3), "abc...");
        assert_eq!(snippet("abc", 3), "abc");
    }
}
