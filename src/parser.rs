//! Recursive-descent parser: token stream → [`ast::Program`].
//!
//! One function per grammar production in SPEC_FULL.md §3, with standard
//! precedence climbing for `Expr` (`||` / `&&` / relational / additive /
//! multiplicative / unary).

use std::collections::HashSet;
use std::rc::Rc;

use crate::ast::*;
use crate::error::ParseError;
use crate::lexer::{Lexer, Token, TokenKind};
use crate::verbosity::Verbosity;

pub struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    verbosity: Verbosity,
}

type PResult<T> = Result<T, ParseError>;

impl Parser {
    pub fn new(tokens: Vec<Token>, verbosity: Verbosity) -> Parser {
        Parser { tokens, pos: 0, verbosity }
    }

    /// Lexes and parses `source` in one step, threading `verbosity` into both
    /// the [`Lexer`] and this parser.
    pub fn parse(source: &str, verbosity: Verbosity) -> Result<Program, crate::error::Error> {
        let _span = tracing::debug_span!("parse").entered();
        let tokens = Lexer::tokenize(source, verbosity)?;
        let mut parser = Parser::new(tokens, verbosity);
        let program = parser.program()?;
        if verbosity.is_debug() {
            tracing::debug!(classes = program.classes.len(), "parsed");
        }
        Ok(program)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek().kind
    }

    fn line(&self) -> u32 {
        self.peek().line
    }

    fn advance(&mut self) -> Token {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, what: &str) -> PResult<Token> {
        if self.peek_kind() == kind {
            Ok(self.advance())
        } else if self.peek_kind() == TokenKind::Eof {
            Err(ParseError::UnexpectedEof {
                expected: what.to_string(),
                line: self.line(),
            })
        } else {
            Err(ParseError::UnexpectedToken {
                expected: what.to_string(),
                found: self.peek().text.clone(),
                line: self.line(),
            })
        }
    }

    fn at(&self, kind: TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn eat(&mut self, kind: TokenKind) -> bool {
        if self.at(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn program(&mut self) -> PResult<Program> {
        self.expect(TokenKind::Module, "`module`")?;
        let module_name = self.expect(TokenKind::Ident, "module name")?.text;
        self.expect(TokenKind::Semi, "`;`")?;
        let mut classes = Vec::new();
        while self.at(TokenKind::Class) {
            classes.push(self.class_decl()?);
        }
        self.expect(TokenKind::Eof, "end of input")?;
        Ok(Program {
            module_name,
            classes,
        })
    }

    fn class_decl(&mut self) -> PResult<ClassDecl> {
        let line = self.line();
        self.expect(TokenKind::Class, "`class`")?;
        let name = self.expect(TokenKind::Ident, "class name")?.text;
        let parent = if self.eat(TokenKind::Extends) {
            Some(self.expect(TokenKind::Ident, "parent class name")?.text)
        } else {
            None
        };
        if self.verbosity.is_trace() {
            tracing::trace!(class = %name, parent = ?parent, "parsing class");
        }
        self.expect(TokenKind::Begin, "`begin`")?;

        let mut fields = Vec::new();
        while self.at(TokenKind::Ident) {
            fields.push(self.field_decl()?);
        }
        let mut methods = Vec::new();
        while self.at(TokenKind::Procedure) || self.at(TokenKind::Function) {
            methods.push(self.method_decl()?);
        }

        self.expect(TokenKind::End, "`end`")?;
        self.expect(TokenKind::Semi, "`;`")?;
        Ok(ClassDecl {
            name,
            parent,
            fields,
            methods,
            line,
        })
    }

    fn field_decl(&mut self) -> PResult<FieldDecl> {
        let line = self.line();
        let name = self.expect(TokenKind::Ident, "field name")?.text;
        self.expect(TokenKind::Colon, "`:`")?;
        let ty = self.type_name()?;
        self.expect(TokenKind::Semi, "`;`")?;
        Ok(FieldDecl { name, ty, line })
    }

    fn method_decl(&mut self) -> PResult<MethodDecl> {
        let line = self.line();
        let kind = if self.eat(TokenKind::Procedure) {
            MethodKind::Procedure
        } else {
            self.expect(TokenKind::Function, "`procedure` or `function`")?;
            MethodKind::Function
        };
        let name = self.expect(TokenKind::Ident, "method name")?.text;
        self.expect(TokenKind::LParen, "`(`")?;
        let mut params = Vec::new();
        if !self.at(TokenKind::RParen) {
            params.push(self.param()?);
            while self.eat(TokenKind::Comma) {
                params.push(self.param()?);
            }
        }
        self.expect(TokenKind::RParen, "`)`")?;
        let ret = if self.eat(TokenKind::Colon) {
            self.type_name()?
        } else {
            TypeName::Void
        };
        self.expect(TokenKind::Begin, "`begin`")?;
        let body = self.stmts_until(TokenKind::End)?;
        self.expect(TokenKind::End, "`end`")?;
        self.expect(TokenKind::Semi, "`;`")?;

        let mut seen = HashSet::new();
        for stmt in &body {
            if let Stmt::VarDecl { name, line, .. } = stmt {
                if !seen.insert(name.clone()) {
                    return Err(ParseError::DuplicateLocal {
                        name: name.clone(),
                        line: *line,
                    });
                }
            }
        }

        Ok(MethodDecl {
            kind,
            name,
            params,
            ret,
            body,
            line,
        })
    }

    fn param(&mut self) -> PResult<Param> {
        let name = self.expect(TokenKind::Ident, "parameter name")?.text;
        self.expect(TokenKind::Colon, "`:`")?;
        let ty = self.type_name()?;
        Ok(Param { name, ty })
    }

    fn type_name(&mut self) -> PResult<TypeName> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::KwInteger => Ok(TypeName::Integer),
            TokenKind::KwString => Ok(TypeName::Str),
            TokenKind::KwVoid => Ok(TypeName::Void),
            TokenKind::Ident => Ok(TypeName::Class(tok.text)),
            _ => Err(ParseError::UnexpectedToken {
                expected: "a type name".to_string(),
                found: tok.text,
                line: tok.line,
            }),
        }
    }

    fn stmts_until(&mut self, terminator: TokenKind) -> PResult<Vec<Stmt>> {
        let mut stmts = Vec::new();
        while !self.at(terminator) {
            stmts.push(self.stmt()?);
        }
        Ok(stmts)
    }

    fn stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        match self.peek_kind() {
            TokenKind::Var => {
                self.advance();
                let name = self.expect(TokenKind::Ident, "local name")?.text;
                self.expect(TokenKind::Colon, "`:`")?;
                let ty = self.type_name()?;
                let init = if self.eat(TokenKind::Assign) {
                    Some(self.expr()?)
                } else {
                    None
                };
                self.expect(TokenKind::Semi, "`;`")?;
                Ok(Stmt::VarDecl {
                    name,
                    ty,
                    init,
                    line,
                })
            }
            TokenKind::Write | TokenKind::WriteLn => {
                let newline = self.peek_kind() == TokenKind::WriteLn;
                self.advance();
                self.expect(TokenKind::LParen, "`(`")?;
                let value = self.expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                self.expect(TokenKind::Semi, "`;`")?;
                Ok(Stmt::Write {
                    value,
                    newline,
                    line,
                })
            }
            TokenKind::If => {
                self.advance();
                let cond = self.expr()?;
                self.expect(TokenKind::Then, "`then`")?;
                let then_branch = self.block_or_single()?;
                let else_branch = if self.eat(TokenKind::Else) {
                    self.block_or_single()?
                } else {
                    Vec::new()
                };
                Ok(Stmt::If {
                    cond,
                    then_branch,
                    else_branch,
                    line,
                })
            }
            TokenKind::While => {
                self.advance();
                let cond = self.expr()?;
                self.expect(TokenKind::Do, "`do`")?;
                let body = self.block_or_single()?;
                Ok(Stmt::While { cond, body, line })
            }
            TokenKind::Return => {
                self.advance();
                let value = if self.at(TokenKind::Semi) {
                    None
                } else {
                    Some(self.expr()?)
                };
                self.expect(TokenKind::Semi, "`;`")?;
                Ok(Stmt::Return { value, line })
            }
            TokenKind::Begin => {
                self.advance();
                let body = self.stmts_until(TokenKind::End)?;
                self.expect(TokenKind::End, "`end`")?;
                Ok(Stmt::If {
                    cond: Rc::new(Expr::Bool(true)),
                    then_branch: body,
                    else_branch: Vec::new(),
                    line,
                })
            }
            TokenKind::Ident => {
                // Either `ident := expr;` or a bare expression statement.
                let checkpoint = self.pos;
                let name = self.advance().text;
                if self.eat(TokenKind::Assign) {
                    let value = self.expr()?;
                    self.expect(TokenKind::Semi, "`;`")?;
                    Ok(Stmt::Assign {
                        target: name,
                        value,
                        line,
                    })
                } else {
                    self.pos = checkpoint;
                    let value = self.expr()?;
                    self.expect(TokenKind::Semi, "`;`")?;
                    Ok(Stmt::Expr { value, line })
                }
            }
            _ => {
                let value = self.expr()?;
                self.expect(TokenKind::Semi, "`;`")?;
                Ok(Stmt::Expr { value, line })
            }
        }
    }

    /// `'begin' Stmt* 'end'` or a single statement, used for the un-braced arms
    /// of `if`/`while` the grammar allows.
    fn block_or_single(&mut self) -> PResult<Vec<Stmt>> {
        if self.eat(TokenKind::Begin) {
            let stmts = self.stmts_until(TokenKind::End)?;
            self.expect(TokenKind::End, "`end`")?;
            Ok(stmts)
        } else {
            Ok(vec![self.stmt()?])
        }
    }

    fn expr(&mut self) -> PResult<Node<Expr>> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> PResult<Node<Expr>> {
        let mut lhs = self.and_expr()?;
        while self.eat(TokenKind::OrOr) {
            let rhs = self.and_expr()?;
            lhs = Rc::new(Expr::Binary(BinOp::Or, lhs, rhs));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> PResult<Node<Expr>> {
        let mut lhs = self.relational_expr()?;
        while self.eat(TokenKind::AndAnd) {
            let rhs = self.relational_expr()?;
            lhs = Rc::new(Expr::Binary(BinOp::And, lhs, rhs));
        }
        Ok(lhs)
    }

    fn relational_expr(&mut self) -> PResult<Node<Expr>> {
        let lhs = self.additive_expr()?;
        let op = match self.peek_kind() {
            TokenKind::Eq => BinOp::Eq,
            TokenKind::Neq => BinOp::Neq,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Leq => BinOp::Leq,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::Geq => BinOp::Geq,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.additive_expr()?;
        Ok(Rc::new(Expr::Binary(op, lhs, rhs)))
    }

    fn additive_expr(&mut self) -> PResult<Node<Expr>> {
        let mut lhs = self.multiplicative_expr()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.multiplicative_expr()?;
            lhs = Rc::new(Expr::Binary(op, lhs, rhs));
        }
        Ok(lhs)
    }

    fn multiplicative_expr(&mut self) -> PResult<Node<Expr>> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = match self.peek_kind() {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.unary_expr()?;
            lhs = Rc::new(Expr::Binary(op, lhs, rhs));
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> PResult<Node<Expr>> {
        match self.peek_kind() {
            TokenKind::Minus => {
                self.advance();
                Ok(Rc::new(Expr::Unary(UnOp::Neg, self.unary_expr()?)))
            }
            TokenKind::Bang => {
                self.advance();
                Ok(Rc::new(Expr::Unary(UnOp::Not, self.unary_expr()?)))
            }
            _ => self.postfix_expr(),
        }
    }

    fn postfix_expr(&mut self) -> PResult<Node<Expr>> {
        let mut expr = self.primary_expr()?;
        while self.eat(TokenKind::Dot) {
            let name = self.expect(TokenKind::Ident, "a field or method name")?.text;
            if self.eat(TokenKind::LParen) {
                let args = self.args()?;
                self.expect(TokenKind::RParen, "`)`")?;
                expr = Rc::new(Expr::MethodCall(expr, name, args));
            } else {
                expr = Rc::new(Expr::Dot(expr, name));
            }
        }
        Ok(expr)
    }

    fn args(&mut self) -> PResult<Vec<Node<Expr>>> {
        let mut args = Vec::new();
        if !self.at(TokenKind::RParen) {
            args.push(self.expr()?);
            while self.eat(TokenKind::Comma) {
                args.push(self.expr()?);
            }
        }
        Ok(args)
    }

    fn primary_expr(&mut self) -> PResult<Node<Expr>> {
        let tok = self.advance();
        match tok.kind {
            TokenKind::IntLit => {
                let n: i64 = tok.text.parse().map_err(|_| ParseError::UnexpectedToken {
                    expected: "a valid integer literal".to_string(),
                    found: tok.text.clone(),
                    line: tok.line,
                })?;
                Ok(Rc::new(Expr::Int(n)))
            }
            TokenKind::StringLit => Ok(Rc::new(Expr::Str(tok.text))),
            TokenKind::True => Ok(Rc::new(Expr::Bool(true))),
            TokenKind::False => Ok(Rc::new(Expr::Bool(false))),
            TokenKind::Ident => Ok(Rc::new(Expr::Id(tok.text))),
            TokenKind::New => {
                let class_name = self.expect(TokenKind::Ident, "a class name")?.text;
                self.expect(TokenKind::LParen, "`(`")?;
                let args = self.args()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(Rc::new(Expr::New(class_name, args)))
            }
            TokenKind::LParen => {
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "`)`")?;
                Ok(inner)
            }
            _ => Err(ParseError::UnexpectedToken {
                expected: "an expression".to_string(),
                found: tok.text,
                line: tok.line,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hello_world() {
        let source = r#"
            module Hello;
            class Main begin
              procedure main() begin
                writeln("hi");
              end;
            end;
        "#;
        let program = Parser::parse(source, Verbosity::default()).unwrap();
        assert_eq!(program.module_name, "Hello");
        assert_eq!(program.classes.len(), 1);
        assert_eq!(program.classes[0].methods.len(), 1);
        assert_eq!(program.classes[0].methods[0].name, "main");
    }

    #[test]
    fn parses_a_class_with_field_and_methods() {
        let source = r#"
            module M;
            class Box begin
              v: integer;
              procedure set(x: integer) begin
                v := x;
              end;
              function get(): integer begin
                return v;
              end;
            end;
        "#;
        let program = Parser::parse(source, Verbosity::default()).unwrap();
        let class = &program.classes[0];
        assert_eq!(class.fields.len(), 1);
        assert_eq!(class.methods.len(), 2);
        assert_eq!(class.methods[0].params[0].name, "x");
    }

    #[test]
    fn binary_operators_respect_precedence() {
        let source = r#"
            module M;
            class Main begin
              function f(): integer begin
                return 1 + 2 * 3;
              end;
            end;
        "#;
        let program = Parser::parse(source, Verbosity::default()).unwrap();
        let Stmt::Return { value, .. } = &program.classes[0].methods[0].body[0] else {
            panic!("expected return statement");
        };
        match &**value.as_ref().unwrap() {
            Expr::Binary(BinOp::Add, lhs, rhs) => {
                assert!(matches!(&**lhs, Expr::Int(1)));
                assert!(matches!(&**rhs, Expr::Binary(BinOp::Mul, _, _)));
            }
            other => panic!("expected a top-level add, got {other:?}"),
        }
    }

    #[test]
    fn rejects_duplicate_locals_in_one_method() {
        let source = r#"
            module M;
            class Main begin
              procedure main() begin
                var x: integer := 1;
                var x: integer := 2;
              end;
            end;
        "#;
        let err = Parser::parse(source, Verbosity::default()).unwrap_err();
        assert!(matches!(
            err,
            crate::error::Error::Parse(ParseError::DuplicateLocal { .. })
        ));
    }

    #[test]
    fn method_call_chains_parse_left_to_right() {
        let source = r#"
            module M;
            class Main begin
              procedure main() begin
                writeln(new Box().get());
              end;
            end;
        "#;
        let program = Parser::parse(source, Verbosity::default()).unwrap();
        let Stmt::Write { value, .. } = &program.classes[0].methods[0].body[0] else {
            panic!("expected write statement");
        };
        assert!(matches!(&**value, Expr::MethodCall(_, name, _) if name == "get"));
    }
}
