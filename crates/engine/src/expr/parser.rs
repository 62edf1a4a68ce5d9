//! Recursive-descent parser producing the expression AST.
//!
//! The grammar is the single-expression subset of the source dialect:
//! literals, member/index access, calls, unary and binary operators, the
//! conditional operator, and single-expression arrow functions for the
//! array combinators. Forbidden identifiers are rejected here, at compile
//! time of the expression, never at evaluation time.

use super::token::{Token, tokenize};
use super::{ExprError, ExprErrorKind};

/// Identifiers that must never appear in an authored expression.
const FORBIDDEN_IDENTIFIERS: &[&str] = &[
    "eval", "Function", "require", "import", "process", "global", "globalThis", "window", "constructor", "prototype", "__proto__",
];

/// Expression AST. One node kind per documented construct.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    NumberLiteral(f64),
    StringLiteral(String),
    BoolLiteral(bool),
    NullLiteral,
    UndefinedLiteral,
    Identifier(String),
    ArrayLiteral(Vec<Expr>),
    ObjectLiteral(Vec<(String, Expr)>),
    /// `object.property`
    Member { object: Box<Expr>, property: String },
    /// `object[index]`
    Index { object: Box<Expr>, index: Box<Expr> },
    /// `callee(args...)`
    Call { callee: Box<Expr>, arguments: Vec<Expr> },
    Unary { operator: UnaryOp, operand: Box<Expr> },
    Binary { operator: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Logical { operator: LogicalOp, left: Box<Expr>, right: Box<Expr> },
    /// `test ? consequent : alternate`
    Conditional { test: Box<Expr>, consequent: Box<Expr>, alternate: Box<Expr> },
    /// `x => body` or `(a, b) => body`
    Arrow { parameters: Vec<String>, body: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Negate,
    Plus,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    LooseEqual,
    StrictEqual,
    LooseNotEqual,
    StrictNotEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

/// Parses expression source into an AST, rejecting forbidden constructs.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err(ExprError::new(ExprErrorKind::Syntax, "empty expression", source));
    }
    let mut parser = Parser {
        tokens,
        position: 0,
        source,
    };
    let expression = parser.parse_expression()?;
    if parser.position != parser.tokens.len() {
        return Err(ExprError::new(
            ExprErrorKind::Syntax,
            format!("unexpected trailing tokens after position {}", parser.position),
            source,
        ));
    }
    Ok(expression)
}

struct Parser<'source> {
    tokens: Vec<Token>,
    position: usize,
    source: &'source str,
}

impl<'source> Parser<'source> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.position + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ExprError> {
        match self.advance() {
            Some(token) if &token == expected => Ok(()),
            Some(token) => Err(self.syntax_error(format!("expected {what}, found {token:?}"))),
            None => Err(self.syntax_error(format!("expected {what}, found end of expression"))),
        }
    }

    fn syntax_error(&self, message: impl Into<String>) -> ExprError {
        ExprError::new(ExprErrorKind::Syntax, message, self.source)
    }

    fn parse_expression(&mut self) -> Result<Expr, ExprError> {
        self.parse_conditional()
    }

    fn parse_conditional(&mut self) -> Result<Expr, ExprError> {
        let test = self.parse_logical_or()?;
        if self.peek() == Some(&Token::Question) {
            self.advance();
            let consequent = self.parse_conditional()?;
            self.expect(&Token::Colon, "':' in conditional expression")?;
            let alternate = self.parse_conditional()?;
            return Ok(Expr::Conditional {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            });
        }
        Ok(test)
    }

    fn parse_logical_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_logical_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.advance();
            let right = self.parse_logical_and()?;
            left = Expr::Logical {
                operator: LogicalOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_logical_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.advance();
            let right = self.parse_equality()?;
            left = Expr::Logical {
                operator: LogicalOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;
        loop {
            let operator = match self.peek() {
                Some(Token::EqualEqual) => BinaryOp::LooseEqual,
                Some(Token::StrictEqual) => BinaryOp::StrictEqual,
                Some(Token::NotEqual) => BinaryOp::LooseNotEqual,
                Some(Token::StrictNotEqual) => BinaryOp::StrictNotEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_comparison()?;
            left = Expr::Binary {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;
        loop {
            let operator = match self.peek() {
                Some(Token::Less) => BinaryOp::Less,
                Some(Token::LessEqual) => BinaryOp::LessEqual,
                Some(Token::Greater) => BinaryOp::Greater,
                Some(Token::GreaterEqual) => BinaryOp::GreaterEqual,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let operator = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Subtract,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;
        loop {
            let operator = match self.peek() {
                Some(Token::Star) => BinaryOp::Multiply,
                Some(Token::Slash) => BinaryOp::Divide,
                Some(Token::Percent) => BinaryOp::Modulo,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let operator = match self.peek() {
            Some(Token::Not) => Some(UnaryOp::Not),
            Some(Token::Minus) => Some(UnaryOp::Negate),
            Some(Token::Plus) => Some(UnaryOp::Plus),
            Some(Token::Typeof) => Some(UnaryOp::Typeof),
            _ => None,
        };
        if let Some(operator) = operator {
            self.advance();
            let operand = self.parse_unary()?;
            return Ok(Expr::Unary {
                operator,
                operand: Box::new(operand),
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expression = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    let property = match self.advance() {
                        Some(Token::Ident(name)) => name,
                        // Contextual keywords are valid property names.
                        Some(Token::Undefined) => "undefined".to_string(),
                        Some(other) => return Err(self.syntax_error(format!("expected property name after '.', found {other:?}"))),
                        None => return Err(self.syntax_error("expected property name after '.'")),
                    };
                    self.check_identifier(&property)?;
                    expression = Expr::Member {
                        object: Box::new(expression),
                        property,
                    };
                }
                Some(Token::LeftBracket) => {
                    self.advance();
                    let index = self.parse_expression()?;
                    self.expect(&Token::RightBracket, "']' after index expression")?;
                    expression = Expr::Index {
                        object: Box::new(expression),
                        index: Box::new(index),
                    };
                }
                Some(Token::LeftParen) => {
                    self.advance();
                    let arguments = self.parse_arguments()?;
                    expression = Expr::Call {
                        callee: Box::new(expression),
                        arguments,
                    };
                }
                _ => break,
            }
        }
        Ok(expression)
    }

    fn parse_arguments(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut arguments = Vec::new();
        if self.peek() == Some(&Token::RightParen) {
            self.advance();
            return Ok(arguments);
        }
        loop {
            arguments.push(self.parse_expression()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RightParen) => break,
                Some(other) => return Err(self.syntax_error(format!("expected ',' or ')' in arguments, found {other:?}"))),
                None => return Err(self.syntax_error("unterminated argument list")),
            }
        }
        Ok(arguments)
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        // `x => body` arrow with a bare parameter.
        if let (Some(Token::Ident(_)), Some(Token::Arrow)) = (self.peek(), self.peek_at(1)) {
            let parameter = match self.advance() {
                Some(Token::Ident(name)) => name,
                _ => unreachable!("peeked identifier"),
            };
            self.check_identifier(&parameter)?;
            self.advance(); // '=>'
            let body = self.parse_expression()?;
            return Ok(Expr::Arrow {
                parameters: vec![parameter],
                body: Box::new(body),
            });
        }

        match self.advance() {
            Some(Token::Number(number)) => Ok(Expr::NumberLiteral(number)),
            Some(Token::String(text)) => Ok(Expr::StringLiteral(text)),
            Some(Token::True) => Ok(Expr::BoolLiteral(true)),
            Some(Token::False) => Ok(Expr::BoolLiteral(false)),
            Some(Token::Null) => Ok(Expr::NullLiteral),
            Some(Token::Undefined) => Ok(Expr::UndefinedLiteral),
            Some(Token::Ident(name)) => {
                self.check_identifier(&name)?;
                Ok(Expr::Identifier(name))
            }
            Some(Token::LeftParen) => self.parse_parenthesized_or_arrow(),
            Some(Token::LeftBracket) => self.parse_array_literal(),
            Some(Token::LeftBrace) => self.parse_object_literal(),
            Some(other) => Err(self.syntax_error(format!("unexpected token {other:?}"))),
            None => Err(self.syntax_error("unexpected end of expression")),
        }
    }

    /// `( ... )` is either a parenthesized expression or an arrow parameter
    /// list; disambiguated by scanning for `=>` after the matching paren.
    fn parse_parenthesized_or_arrow(&mut self) -> Result<Expr, ExprError> {
        if self.arrow_parameters_ahead() {
            let mut parameters = Vec::new();
            if self.peek() != Some(&Token::RightParen) {
                loop {
                    match self.advance() {
                        Some(Token::Ident(name)) => {
                            self.check_identifier(&name)?;
                            parameters.push(name);
                        }
                        Some(other) => return Err(self.syntax_error(format!("expected parameter name, found {other:?}"))),
                        None => return Err(self.syntax_error("unterminated parameter list")),
                    }
                    match self.advance() {
                        Some(Token::Comma) => continue,
                        Some(Token::RightParen) => break,
                        Some(other) => return Err(self.syntax_error(format!("expected ',' or ')' in parameters, found {other:?}"))),
                        None => return Err(self.syntax_error("unterminated parameter list")),
                    }
                }
            } else {
                self.advance();
            }
            self.expect(&Token::Arrow, "'=>' after parameter list")?;
            let body = self.parse_expression()?;
            return Ok(Expr::Arrow {
                parameters,
                body: Box::new(body),
            });
        }

        let inner = self.parse_expression()?;
        self.expect(&Token::RightParen, "')' after expression")?;
        Ok(inner)
    }

    fn arrow_parameters_ahead(&self) -> bool {
        // Called with the '(' already consumed. A parameter list is a
        // (possibly empty) comma-separated identifier run, then ')' '=>'.
        let mut offset = 0usize;
        loop {
            match self.peek_at(offset) {
                Some(Token::RightParen) => {
                    return self.peek_at(offset + 1) == Some(&Token::Arrow);
                }
                Some(Token::Ident(_)) => {
                    offset += 1;
                    match self.peek_at(offset) {
                        Some(Token::Comma) => offset += 1,
                        Some(Token::RightParen) => continue,
                        _ => return false,
                    }
                }
                _ => return false,
            }
        }
    }

    fn parse_array_literal(&mut self) -> Result<Expr, ExprError> {
        let mut elements = Vec::new();
        if self.peek() == Some(&Token::RightBracket) {
            self.advance();
            return Ok(Expr::ArrayLiteral(elements));
        }
        loop {
            elements.push(self.parse_expression()?);
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RightBracket) => break,
                Some(other) => return Err(self.syntax_error(format!("expected ',' or ']' in array literal, found {other:?}"))),
                None => return Err(self.syntax_error("unterminated array literal")),
            }
        }
        Ok(Expr::ArrayLiteral(elements))
    }

    fn parse_object_literal(&mut self) -> Result<Expr, ExprError> {
        let mut entries = Vec::new();
        if self.peek() == Some(&Token::RightBrace) {
            self.advance();
            return Ok(Expr::ObjectLiteral(entries));
        }
        loop {
            let key = match self.advance() {
                Some(Token::Ident(name)) => name,
                Some(Token::String(text)) => text,
                Some(Token::Number(number)) => super::value::format_number(number),
                Some(other) => return Err(self.syntax_error(format!("expected object key, found {other:?}"))),
                None => return Err(self.syntax_error("unterminated object literal")),
            };
            self.expect(&Token::Colon, "':' after object key")?;
            let value = self.parse_expression()?;
            entries.push((key, value));
            match self.advance() {
                Some(Token::Comma) => continue,
                Some(Token::RightBrace) => break,
                Some(other) => return Err(self.syntax_error(format!("expected ',' or '}}' in object literal, found {other:?}"))),
                None => return Err(self.syntax_error("unterminated object literal")),
            }
        }
        Ok(Expr::ObjectLiteral(entries))
    }

    fn check_identifier(&self, name: &str) -> Result<(), ExprError> {
        if FORBIDDEN_IDENTIFIERS.contains(&name) {
            return Err(ExprError::new(
                ExprErrorKind::Syntax,
                format!("'{name}' is not allowed in expressions"),
                self.source,
            ));
        }
        Ok(())
    }
}
