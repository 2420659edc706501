//! 词法分析
//!
//! 支持 `//`、`/* */` 注释，单双引号字符串及常见转义，
//! 数字直接解析为精确小数。

use crate::error::{PayScriptError, Result};
use rust_decimal::Decimal;
use std::str::FromStr;

/// 词法单元
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(Decimal),
    // 关键字
    True,
    False,
    Null,
    Undefined,
    // 标点
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Question,
    Arrow,
    // 算术
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    // 比较，`===` / `!==` 合并为宽松形式
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    // 逻辑
    Bang,
    AndAnd,
    OrOr,
    QuestionQuestion,
    Eof,
}

/// 带行号的词法单元
#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub line: u32,
}

/// 将源码切分为词法单元，末尾总是 `Eof`
pub fn lex(src: &str) -> Result<Vec<Spanned>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut pos = 0usize;
    let mut line: u32 = 1;

    let peek = |pos: usize| chars.get(pos).copied();

    while pos < chars.len() {
        let c = chars[pos];

        // 行注释
        if c == '/' && peek(pos + 1) == Some('/') {
            while pos < chars.len() && chars[pos] != '\n' {
                pos += 1;
            }
            continue;
        }

        // 块注释
        if c == '/' && peek(pos + 1) == Some('*') {
            pos += 2;
            loop {
                if pos >= chars.len() {
                    return Err(PayScriptError::lex(line, "unterminated block comment"));
                }
                if chars[pos] == '\n' {
                    line += 1;
                }
                if chars[pos] == '*' && peek(pos + 1) == Some('/') {
                    pos += 2;
                    break;
                }
                pos += 1;
            }
            continue;
        }

        if c.is_whitespace() {
            if c == '\n' {
                line += 1;
            }
            pos += 1;
            continue;
        }

        let tok_line = line;
        let mut push = |token: Token| {
            tokens.push(Spanned {
                token,
                line: tok_line,
            })
        };

        // 字符串字面量
        if c == '"' || c == '\'' {
            let quote = c;
            pos += 1;
            let mut s = String::new();
            loop {
                let Some(sc) = peek(pos) else {
                    return Err(PayScriptError::lex(tok_line, "unterminated string literal"));
                };
                if sc == quote {
                    pos += 1;
                    break;
                }
                if sc == '\n' {
                    return Err(PayScriptError::lex(tok_line, "unterminated string literal"));
                }
                if sc == '\\' {
                    pos += 1;
                    let Some(esc) = peek(pos) else {
                        return Err(PayScriptError::lex(tok_line, "unterminated escape in string"));
                    };
                    match esc {
                        'n' => s.push('\n'),
                        't' => s.push('\t'),
                        'r' => s.push('\r'),
                        '0' => s.push('\0'),
                        'u' => {
                            let hex: String = chars.iter().skip(pos + 1).take(4).collect();
                            let decoded = u32::from_str_radix(&hex, 16)
                                .ok()
                                .filter(|_| hex.len() == 4)
                                .and_then(char::from_u32)
                                .ok_or_else(|| {
                                    PayScriptError::lex(
                                        tok_line,
                                        format!("invalid unicode escape '\\u{}'", hex),
                                    )
                                })?;
                            s.push(decoded);
                            pos += 4;
                        }
                        other => s.push(other),
                    }
                    pos += 1;
                    continue;
                }
                s.push(sc);
                pos += 1;
            }
            push(Token::Str(s));
            continue;
        }

        // 数字
        if c.is_ascii_digit() {
            let start = pos;
            while peek(pos).is_some_and(|d| d.is_ascii_digit()) {
                pos += 1;
            }
            if peek(pos) == Some('.') && peek(pos + 1).is_some_and(|d| d.is_ascii_digit()) {
                pos += 1;
                while peek(pos).is_some_and(|d| d.is_ascii_digit()) {
                    pos += 1;
                }
            }
            let mut scientific = false;
            if matches!(peek(pos), Some('e' | 'E')) {
                let mut look = pos + 1;
                if matches!(peek(look), Some('+' | '-')) {
                    look += 1;
                }
                if peek(look).is_some_and(|d| d.is_ascii_digit()) {
                    scientific = true;
                    pos = look;
                    while peek(pos).is_some_and(|d| d.is_ascii_digit()) {
                        pos += 1;
                    }
                }
            }
            let text: String = chars[start..pos].iter().collect();
            let parsed = if scientific {
                Decimal::from_scientific(&text)
            } else {
                Decimal::from_str(&text)
            };
            let n = parsed
                .map_err(|_| PayScriptError::lex(tok_line, format!("invalid number '{}'", text)))?;
            push(Token::Number(n));
            continue;
        }

        // 标识符 / 关键字
        if c.is_ascii_alphabetic() || c == '_' || c == '$' {
            let start = pos;
            while peek(pos).is_some_and(|d| d.is_ascii_alphanumeric() || d == '_' || d == '$') {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            let token = match word.as_str() {
                "true" => Token::True,
                "false" => Token::False,
                "null" => Token::Null,
                "undefined" => Token::Undefined,
                _ => Token::Ident(word),
            };
            push(token);
            continue;
        }

        // 运算符与标点，最长匹配优先
        let next = peek(pos + 1);
        let next2 = peek(pos + 2);
        let (token, len) = match c {
            '{' => (Token::LBrace, 1),
            '}' => (Token::RBrace, 1),
            '[' => (Token::LBracket, 1),
            ']' => (Token::RBracket, 1),
            '(' => (Token::LParen, 1),
            ')' => (Token::RParen, 1),
            ',' => (Token::Comma, 1),
            ':' => (Token::Colon, 1),
            ';' => (Token::Semicolon, 1),
            '.' => (Token::Dot, 1),
            '+' => (Token::Plus, 1),
            '-' => (Token::Minus, 1),
            '*' => (Token::Star, 1),
            '/' => (Token::Slash, 1),
            '%' => (Token::Percent, 1),
            '?' => match next {
                Some('?') => (Token::QuestionQuestion, 2),
                // `?.` 可选链，后面跟数字时仍是三元表达式 `a ?.5 : b`
                Some('.') if !next2.is_some_and(|d| d.is_ascii_digit()) => (Token::Dot, 2),
                _ => (Token::Question, 1),
            },
            '=' => match (next, next2) {
                (Some('='), Some('=')) => (Token::EqEq, 3),
                (Some('='), _) => (Token::EqEq, 2),
                (Some('>'), _) => (Token::Arrow, 2),
                _ => {
                    return Err(PayScriptError::lex(
                        tok_line,
                        "assignment is not supported",
                    ));
                }
            },
            '!' => match (next, next2) {
                (Some('='), Some('=')) => (Token::NotEq, 3),
                (Some('='), _) => (Token::NotEq, 2),
                _ => (Token::Bang, 1),
            },
            '<' if next == Some('=') => (Token::Lte, 2),
            '<' => (Token::Lt, 1),
            '>' if next == Some('=') => (Token::Gte, 2),
            '>' => (Token::Gt, 1),
            '&' if next == Some('&') => (Token::AndAnd, 2),
            '|' if next == Some('|') => (Token::OrOr, 2),
            other => {
                return Err(PayScriptError::lex(
                    tok_line,
                    format!("unexpected character '{}'", other),
                ));
            }
        };
        push(token);
        pos += len;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        line,
    });
    Ok(tokens)
}
