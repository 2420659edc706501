//! 表达式解析（Pratt parser）
//!
//! 优先级从低到高：`?:`、`??`、`||`、`&&`、相等、关系、加减、乘除模、一元、后缀（调用 / 成员 / 下标）。

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{lex, Spanned, Token};
use crate::builtins::Builtin;
use crate::error::{PayScriptError, Result};
use crate::value::Value;

/// 解析单个表达式，允许末尾一个分号
pub fn parse_expression(src: &str) -> Result<Expr> {
    let tokens = lex(src)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.expression()?;
    parser.eat(&Token::Semicolon);
    parser.expect(&Token::Eof, "end of input")?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    /// 当前表达式树深度
    depth: usize,
}

/// 表达式最大嵌套深度，超出时报解析错误而不是耗尽调用栈
const MAX_DEPTH: usize = 128;

static EOF: Token = Token::Eof;

/// 命名空间前缀：`util.sum(...)`、`Math.round(...)`
const NAMESPACES: &[&str] = &["util", "Math"];

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map(|s| &s.token)
            .unwrap_or(&EOF)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|s| s.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<()> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn error(&self, message: impl Into<String>) -> PayScriptError {
        PayScriptError::parse(self.line(), message)
    }

    fn ident(&mut self, what: &str) -> Result<String> {
        match self.advance() {
            Token::Ident(name) => Ok(name),
            other => Err(PayScriptError::parse(
                self.line(),
                format!("expected {}, found {:?}", what, other),
            )),
        }
    }

    fn descend(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error(format!(
                "expression nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<Expr> {
        self.descend()?;
        let expr = if self.at_lambda() {
            self.lambda()?
        } else {
            self.conditional()?
        };
        self.depth -= 1;
        Ok(expr)
    }

    fn conditional(&mut self) -> Result<Expr> {
        let test = self.binary(0)?;
        if !self.eat(&Token::Question) {
            return Ok(test);
        }
        let consequent = self.expression()?;
        self.expect(&Token::Colon, "':' in conditional expression")?;
        let alternate = self.expression()?;
        Ok(Expr::Conditional {
            test: Box::new(test),
            consequent: Box::new(consequent),
            alternate: Box::new(alternate),
        })
    }

    fn binary(&mut self, min_bp: u8) -> Result<Expr> {
        let mut left = self.unary()?;
        let mut chain = 0;

        while let Some((op, bp)) = infix(self.peek()) {
            if bp <= min_bp {
                break;
            }
            // 左结合链每多一个运算符，树就深一层
            self.descend()?;
            chain += 1;
            self.advance();
            let right = self.binary(bp)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        self.depth -= chain;
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr> {
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Token::Bang => UnaryOp::Not,
                Token::Minus => UnaryOp::Neg,
                Token::Plus => UnaryOp::Plus,
                _ => break,
            };
            self.descend()?;
            self.advance();
            ops.push(op);
        }

        let mut expr = self.postfix()?;
        self.depth -= ops.len();

        for op in ops.into_iter().rev() {
            expr = match (op, expr) {
                // 负数字面量直接折叠
                (UnaryOp::Neg, Expr::Literal(Value::Number(n))) => {
                    Expr::Literal(Value::Number(-n))
                }
                (op, operand) => Expr::Unary {
                    op,
                    operand: Box::new(operand),
                },
            };
        }

        Ok(expr)
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        let mut chain = 0;

        loop {
            if matches!(self.peek(), Token::Dot | Token::LBracket | Token::LParen) {
                self.descend()?;
                chain += 1;
            }
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let property = self.ident("property name after '.'")?;
                    expr = Expr::Member {
                        object: Box::new(expr),
                        property,
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.expression()?;
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Index {
                        object: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                Token::LParen => {
                    let line = self.line();
                    self.advance();
                    let args = self.list(&Token::RParen, "')'")?;
                    expr = resolve_call(expr, args, line)?;
                }
                _ => {
                    self.depth -= chain;
                    return Ok(expr);
                }
            }
        }
    }

    fn primary(&mut self) -> Result<Expr> {
        let line = self.line();
        match self.advance() {
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null | Token::Undefined => Ok(Expr::Literal(Value::Null)),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LParen => {
                let inner = self.expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => Ok(Expr::Array(self.list(&Token::RBracket, "']'")?)),
            Token::LBrace => self.object(),
            other => Err(PayScriptError::parse(
                line,
                format!("unexpected token {:?}", other),
            )),
        }
    }

    /// 逗号分隔的表达式列表，允许尾逗号
    fn list(&mut self, close: &Token, what: &str) -> Result<Vec<Expr>> {
        let mut items = Vec::new();
        while !self.eat(close) {
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.expect(close, what)?;
                break;
            }
        }
        Ok(items)
    }

    /// 对象字面量（`{` 已消费）
    fn object(&mut self) -> Result<Expr> {
        let mut entries: Vec<(String, Expr)> = Vec::new();

        while !self.eat(&Token::RBrace) {
            let key = match self.advance() {
                Token::Ident(name) => name,
                Token::Str(s) => s,
                Token::Number(n) => n.normalize().to_string(),
                Token::True => "true".to_string(),
                Token::False => "false".to_string(),
                Token::Null => "null".to_string(),
                other => {
                    return Err(self.error(format!("expected object key, found {:?}", other)));
                }
            };

            let value = if self.eat(&Token::Colon) {
                self.expression()?
            } else {
                // `{ amount }` 简写
                Expr::Ident(key.clone())
            };

            // 重复键以最后一个为准
            entries.retain(|(k, _)| *k != key);
            entries.push((key, value));

            if !self.eat(&Token::Comma) {
                self.expect(&Token::RBrace, "'}' or ','")?;
                break;
            }
        }

        Ok(Expr::Object(entries))
    }

    /// `x =>`、`() =>`、`(x, y) =>`
    fn at_lambda(&self) -> bool {
        match self.peek() {
            Token::Ident(_) => self.peek_at(1) == &Token::Arrow,
            Token::LParen => {
                let mut offset = 1;
                if self.peek_at(offset) == &Token::RParen {
                    return self.peek_at(offset + 1) == &Token::Arrow;
                }
                loop {
                    if !matches!(self.peek_at(offset), Token::Ident(_)) {
                        return false;
                    }
                    offset += 1;
                    match self.peek_at(offset) {
                        Token::Comma => offset += 1,
                        Token::RParen => return self.peek_at(offset + 1) == &Token::Arrow,
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    fn lambda(&mut self) -> Result<Expr> {
        let mut params = Vec::new();
        if self.eat(&Token::LParen) {
            while !self.eat(&Token::RParen) {
                params.push(self.ident("lambda parameter")?);
                self.eat(&Token::Comma);
            }
        } else {
            params.push(self.ident("lambda parameter")?);
        }
        self.expect(&Token::Arrow, "'=>'")?;

        // `=> { return expr; }`
        let body = if self.peek() == &Token::LBrace
            && self.peek_at(1) == &Token::Ident("return".to_string())
        {
            self.advance();
            self.advance();
            let body = self.expression()?;
            self.eat(&Token::Semicolon);
            self.expect(&Token::RBrace, "'}' after return expression")?;
            body
        } else {
            self.expression()?
        };

        Ok(Expr::Lambda {
            params,
            body: Box::new(body),
        })
    }
}

fn infix(token: &Token) -> Option<(BinaryOp, u8)> {
    let entry = match token {
        Token::QuestionQuestion => (BinaryOp::Coalesce, 2),
        Token::OrOr => (BinaryOp::Or, 3),
        Token::AndAnd => (BinaryOp::And, 4),
        Token::EqEq => (BinaryOp::Eq, 5),
        Token::NotEq => (BinaryOp::Neq, 5),
        Token::Lt => (BinaryOp::Lt, 6),
        Token::Lte => (BinaryOp::Lte, 6),
        Token::Gt => (BinaryOp::Gt, 6),
        Token::Gte => (BinaryOp::Gte, 6),
        Token::Plus => (BinaryOp::Add, 7),
        Token::Minus => (BinaryOp::Sub, 7),
        Token::Star => (BinaryOp::Mul, 8),
        Token::Slash => (BinaryOp::Div, 8),
        Token::Percent => (BinaryOp::Rem, 8),
        _ => return None,
    };
    Some(entry)
}

/// 调用只能指向内置函数
///
/// - `sum(...)`
/// - `util.sum(...)` / `Math.round(...)`
/// - `list.filter(...)`：接收者作为第一个参数
fn resolve_call(callee: Expr, mut args: Vec<Expr>, line: u32) -> Result<Expr> {
    let name = match callee {
        Expr::Ident(name) => name,
        Expr::Member { object, property } => {
            match *object {
                Expr::Ident(ref ns) if NAMESPACES.contains(&ns.as_str()) => {}
                receiver => args.insert(0, receiver),
            }
            property
        }
        _ => {
            return Err(PayScriptError::parse(
                line,
                "only builtin functions can be called",
            ));
        }
    };

    let function = Builtin::from_name(&name).ok_or(PayScriptError::UnknownFunction(name))?;
    Ok(Expr::Call { function, args })
}
