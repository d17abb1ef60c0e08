use crate::ast::{Arg, BinaryOp, Expr, Stmt, UnaryOp};
use crate::lexer::{Token, TokenKind, tokenize};
use tickchart_core::engine::error::ScriptError;

/// # Summary
/// 递归下降解析脚本文本，生成语句列表。
///
/// # Logic
/// 1. 调用词法分析 (括号配对在此阶段完成校验)。
/// 2. 以换行或分号分隔语句，`{}` 内为语句块。
/// 3. 表达式优先级从低到高：三元、`||`、`&&`、相等、比较、加减、乘除、一元、后缀。
///
/// # Returns
/// 顶层语句列表，或首个语法错误。
pub fn parse(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        src: source,
        tokens,
        pos: 0,
    };
    parser.program()
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + ahead)
            .or_else(|| self.tokens.last())
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) -> TokenKind {
        let kind = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        kind
    }

    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.peek() == kind {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), ScriptError> {
        if self.eat(kind) {
            Ok(())
        } else {
            Err(self.error(format!("expected {}, found {:?}", what, self.peek())))
        }
    }

    fn error(&self, message: String) -> ScriptError {
        ScriptError::Syntax {
            line: self.line(),
            message,
        }
    }

    fn skip_separators(&mut self) {
        while matches!(self.peek(), TokenKind::Newline | TokenKind::Semicolon) {
            self.pos += 1;
        }
    }

    fn program(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        let mut stmts = Vec::new();
        self.skip_separators();
        while *self.peek() != TokenKind::Eof {
            stmts.push(self.statement()?);
            self.end_of_statement()?;
            self.skip_separators();
        }
        Ok(stmts)
    }

    fn end_of_statement(&mut self) -> Result<(), ScriptError> {
        match self.peek() {
            TokenKind::Newline | TokenKind::Semicolon => {
                self.pos += 1;
                Ok(())
            }
            TokenKind::Eof | TokenKind::RBrace => Ok(()),
            // 块语句之后允许直接跟下一条语句
            _ if self
                .tokens
                .get(self.pos.wrapping_sub(1))
                .is_some_and(|t| t.kind == TokenKind::RBrace) =>
            {
                Ok(())
            }
            other => Err(self.error(format!("unexpected {:?} after statement", other))),
        }
    }

    fn statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Ident(word) if word == "if" => self.if_statement(),
            TokenKind::Ident(word) if word == "for" => self.for_statement(),
            TokenKind::Ident(word) if word == "var" || word == "let" || word == "const" => {
                self.pos += 1;
                let name = match self.advance() {
                    TokenKind::Ident(name) => name,
                    other => return Err(self.error(format!("expected variable name, found {:?}", other))),
                };
                self.expect(&TokenKind::Assign, "`=`")?;
                let value = self.expression()?;
                Ok(Stmt::Assign {
                    name,
                    op: None,
                    value,
                    transient: true,
                    line,
                })
            }
            TokenKind::Ident(name) => {
                let op = match self.peek_at(1) {
                    TokenKind::Assign => Some(None),
                    TokenKind::PlusAssign => Some(Some(BinaryOp::Add)),
                    TokenKind::MinusAssign => Some(Some(BinaryOp::Sub)),
                    TokenKind::StarAssign => Some(Some(BinaryOp::Mul)),
                    TokenKind::SlashAssign => Some(Some(BinaryOp::Div)),
                    _ => None,
                };
                if let Some(op) = op {
                    self.pos += 2;
                    let value = self.expression()?;
                    return Ok(Stmt::Assign {
                        name,
                        op,
                        value,
                        transient: false,
                        line,
                    });
                }
                let step = match self.peek_at(1) {
                    TokenKind::PlusPlus => Some(BinaryOp::Add),
                    TokenKind::MinusMinus => Some(BinaryOp::Sub),
                    _ => None,
                };
                if let Some(op) = step {
                    self.pos += 2;
                    return Ok(Stmt::Assign {
                        name,
                        op: Some(op),
                        value: Expr::Number(1.0),
                        transient: false,
                        line,
                    });
                }
                let expr = self.expression()?;
                Ok(Stmt::Expr { expr, line })
            }
            _ => {
                let expr = self.expression()?;
                Ok(Stmt::Expr { expr, line })
            }
        }
    }

    fn block(&mut self) -> Result<Vec<Stmt>, ScriptError> {
        self.skip_newlines();
        if self.eat(&TokenKind::LBrace) {
            let mut stmts = Vec::new();
            self.skip_separators();
            while !matches!(self.peek(), TokenKind::RBrace | TokenKind::Eof) {
                stmts.push(self.statement()?);
                self.end_of_statement()?;
                self.skip_separators();
            }
            self.expect(&TokenKind::RBrace, "`}`")?;
            Ok(stmts)
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn skip_newlines(&mut self) {
        while *self.peek() == TokenKind::Newline {
            self.pos += 1;
        }
    }

    fn if_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        self.pos += 1;
        self.expect(&TokenKind::LParen, "`(` after `if`")?;
        let cond = self.expression()?;
        self.expect(&TokenKind::RParen, "`)`")?;
        let then = self.block()?;

        let mut lookahead = 0;
        while *self.peek_at(lookahead) == TokenKind::Newline {
            lookahead += 1;
        }
        let otherwise = match self.peek_at(lookahead) {
            TokenKind::Ident(word) if word == "else" => {
                self.pos += lookahead + 1;
                self.block()?
            }
            _ => Vec::new(),
        };

        Ok(Stmt::If {
            cond,
            then,
            otherwise,
            line,
        })
    }

    fn for_statement(&mut self) -> Result<Stmt, ScriptError> {
        let line = self.line();
        self.pos += 1;
        self.expect(&TokenKind::LParen, "`(` after `for`")?;

        let init = if *self.peek() == TokenKind::Semicolon {
            Vec::new()
        } else {
            vec![self.statement()?]
        };
        self.expect(&TokenKind::Semicolon, "`;`")?;

        let cond = if *self.peek() == TokenKind::Semicolon {
            None
        } else {
            Some(self.expression()?)
        };
        self.expect(&TokenKind::Semicolon, "`;`")?;

        let step = if *self.peek() == TokenKind::RParen {
            Vec::new()
        } else {
            vec![self.statement()?]
        };
        self.expect(&TokenKind::RParen, "`)`")?;

        let body = self.block()?;
        Ok(Stmt::For {
            init,
            cond,
            step,
            body,
            line,
        })
    }

    fn expression(&mut self) -> Result<Expr, ScriptError> {
        let cond = self.binary(0)?;
        if self.eat(&TokenKind::Question) {
            let then = self.expression()?;
            self.expect(&TokenKind::Colon, "`:` in ternary")?;
            let otherwise = self.expression()?;
            return Ok(Expr::Ternary {
                cond: Box::new(cond),
                then: Box::new(then),
                otherwise: Box::new(otherwise),
            });
        }
        Ok(cond)
    }

    fn binary(&mut self, min_prec: u8) -> Result<Expr, ScriptError> {
        let mut lhs = self.unary()?;
        while let Some((op, prec)) = binary_op(self.peek()) {
            if prec < min_prec {
                break;
            }
            self.pos += 1;
            let rhs = self.binary(prec + 1)?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, ScriptError> {
        let op = match self.peek() {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Bang => Some(UnaryOp::Not),
            TokenKind::Plus => {
                self.pos += 1;
                return self.unary();
            }
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let expr = self.unary()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ScriptError> {
        let mut expr = self.primary()?;
        loop {
            match self.peek() {
                TokenKind::LParen => {
                    let line = self.line();
                    let callee = callee_name(&expr)
                        .ok_or_else(|| self.error("expression is not callable".to_string()))?;
                    self.pos += 1;
                    let args = self.arguments()?;
                    expr = Expr::Call { callee, args, line };
                }
                TokenKind::Dot => {
                    self.pos += 1;
                    let field = match self.advance() {
                        TokenKind::Ident(field) => field,
                        other => return Err(self.error(format!("expected field name, found {:?}", other))),
                    };
                    expr = match expr {
                        Expr::Market {
                            market,
                            field: None,
                        } => Expr::Market {
                            market,
                            field: Some(field),
                        },
                        Expr::Reference { id, field: None } => Expr::Reference {
                            id,
                            field: Some(field),
                        },
                        object => Expr::Member {
                            object: Box::new(object),
                            field,
                        },
                    };
                }
                TokenKind::LBracket => {
                    self.pos += 1;
                    let index = self.expression()?;
                    self.expect(&TokenKind::RBracket, "`]`")?;
                    expr = Expr::Index {
                        target: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn arguments(&mut self) -> Result<Vec<Arg>, ScriptError> {
        let mut args = Vec::new();
        if self.eat(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            let name = match self.peek() {
                TokenKind::Ident(name) if *self.peek_at(1) == TokenKind::Assign => Some(name.clone()),
                _ => None,
            };
            if name.is_some() {
                self.pos += 2;
            }
            let start = self.tokens.get(self.pos).map_or(self.src.len(), |t| t.start);
            let value = self.expression()?;
            let end = self
                .tokens
                .get(self.pos.wrapping_sub(1))
                .map_or(start, |t| t.end.max(start));
            let raw = self.src.get(start..end).unwrap_or_default().trim().to_string();
            args.push(Arg { name, value, raw });

            if self.eat(&TokenKind::Comma) {
                continue;
            }
            self.expect(&TokenKind::RParen, "`,` or `)`")?;
            return Ok(args);
        }
    }

    fn primary(&mut self) -> Result<Expr, ScriptError> {
        match self.advance() {
            TokenKind::Number(n) => Ok(Expr::Number(n)),
            TokenKind::Str(s) => Ok(Expr::Str(s)),
            TokenKind::Ident(name) => Ok(Expr::Ident(name)),
            TokenKind::Market {
                exchange,
                pair,
                key,
            } => Ok(Expr::Market {
                market: format!("{}:{}", exchange, pair),
                field: key,
            }),
            TokenKind::Reference(id) => Ok(Expr::Reference { id, field: None }),
            TokenKind::LParen => {
                let expr = self.expression()?;
                self.expect(&TokenKind::RParen, "`)`")?;
                Ok(expr)
            }
            other => Err(self.error(format!("unexpected {:?}", other))),
        }
    }
}

fn binary_op(kind: &TokenKind) -> Option<(BinaryOp, u8)> {
    let op = match kind {
        TokenKind::Or => (BinaryOp::Or, 1),
        TokenKind::And => (BinaryOp::And, 2),
        TokenKind::Eq => (BinaryOp::Eq, 3),
        TokenKind::Ne => (BinaryOp::Ne, 3),
        TokenKind::Lt => (BinaryOp::Lt, 4),
        TokenKind::Le => (BinaryOp::Le, 4),
        TokenKind::Gt => (BinaryOp::Gt, 4),
        TokenKind::Ge => (BinaryOp::Ge, 4),
        TokenKind::Plus => (BinaryOp::Add, 5),
        TokenKind::Minus => (BinaryOp::Sub, 5),
        TokenKind::Star => (BinaryOp::Mul, 6),
        TokenKind::Slash => (BinaryOp::Div, 6),
        TokenKind::Percent => (BinaryOp::Rem, 6),
        _ => return None,
    };
    Some(op)
}

/// 只有标识符或 `Math.abs` 这类点号路径可以被调用
fn callee_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Ident(name) => Some(name.clone()),
        Expr::Member { object, field } => {
            callee_name(object).map(|base| format!("{}.{}", base, field))
        }
        _ => None,
    }
}
