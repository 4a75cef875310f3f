//! Query syntax tree and Pratt parser

use crate::core::value::Value;
use crate::query::lexer::{tokenize, Spanned, Token};
use crate::query::QueryError;

/// Binary operators, in no particular order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Or,
    And,
    Eq,
    NotEq,
    Matches,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Add,
    Sub,
    Mul,
    Rem,
}

impl BinaryOp {
    fn from_token(token: &Token) -> Option<BinaryOp> {
        let op = match token {
            Token::Or => BinaryOp::Or,
            Token::And => BinaryOp::And,
            Token::Eq => BinaryOp::Eq,
            Token::NotEq => BinaryOp::NotEq,
            Token::Tilde => BinaryOp::Matches,
            Token::Lt => BinaryOp::Lt,
            Token::LtEq => BinaryOp::LtEq,
            Token::Gt => BinaryOp::Gt,
            Token::GtEq => BinaryOp::GtEq,
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Percent => BinaryOp::Rem,
            _ => return None,
        };
        Some(op)
    }

    /// Left binding power, higher binds tighter
    fn binding_power(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::NotEq | BinaryOp::Matches => 3,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Rem => 6,
        }
    }
}

const PREFIX_POWER: u8 = 7;

/// One named step of a path with its index expressions
#[derive(Debug, Clone, PartialEq)]
pub struct PathPart {
    pub name: String,
    pub indexes: Vec<Expr>,
}

/// A variable path, e.g. `input/items[0]/name`
#[derive(Debug, Clone, PartialEq)]
pub struct Path {
    pub parts: Vec<PathPart>,
}

impl Path {
    pub fn root(&self) -> &str {
        self.parts.first().map(|p| p.name.as_str()).unwrap_or_default()
    }
}

/// Query expression
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Path(Path),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    source: &'a str,
    tokens: Vec<Spanned>,
    pos: usize,
}

/// Parse a query into an expression tree
pub fn parse(source: &str) -> Result<Expr, QueryError> {
    let mut parser = Parser {
        source,
        tokens: tokenize(source)?,
        pos: 0,
    };
    if parser.tokens.is_empty() {
        return Err(parser.error("empty query"));
    }
    let expr = parser.expression(0)?;
    if parser.peek().is_some() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(expr)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn peek_nth(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n).map(|s| &s.token)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|s| s.position)
            .unwrap_or(self.source.len())
    }

    fn error(&self, message: impl Into<String>) -> QueryError {
        QueryError::Parse {
            query: self.source.to_string(),
            position: self.position(),
            message: message.into(),
        }
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), QueryError> {
        if self.peek() == Some(&expected) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected {}", what)))
        }
    }

    fn expression(&mut self, min_power: u8) -> Result<Expr, QueryError> {
        let mut lhs = self.prefix()?;
        while let Some(op) = self.peek().and_then(BinaryOp::from_token) {
            let power = op.binding_power();
            if power <= min_power {
                break;
            }
            self.pos += 1;
            let rhs = self.expression(power)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn prefix(&mut self) -> Result<Expr, QueryError> {
        let Some(token) = self.advance() else {
            return Err(self.error("unexpected end of query"));
        };
        match token {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Integer(i) => Ok(Expr::Literal(Value::Integer(i))),
            Token::Decimal(d) => Ok(Expr::Literal(Value::Decimal(d))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Bang => Ok(Expr::Not(Box::new(self.expression(PREFIX_POWER)?))),
            Token::Minus => Ok(Expr::Negate(Box::new(self.expression(PREFIX_POWER)?))),
            Token::LParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if self.peek() != Some(&Token::RBracket) {
                    loop {
                        items.push(self.expression(0)?);
                        if self.peek() == Some(&Token::Comma) {
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                }
                self.expect(Token::RBracket, "']'")?;
                Ok(Expr::List(items))
            }
            Token::Slash => match self.advance() {
                Some(Token::Ident(name)) => self.path(name),
                _ => {
                    self.pos = self.pos.saturating_sub(1);
                    Err(self.error("expected a variable name after '/'"))
                }
            },
            Token::Ident(name) => self.path(name),
            _ => {
                self.pos -= 1;
                Err(self.error("unexpected token"))
            }
        }
    }

    fn path(&mut self, first: String) -> Result<Expr, QueryError> {
        let mut parts = vec![self.part(first)?];
        while self.peek() == Some(&Token::Slash) {
            let Some(Token::Ident(name)) = self.peek_nth(1).cloned() else {
                self.pos += 1;
                return Err(self.error("expected a field name after '/'"));
            };
            self.pos += 2;
            parts.push(self.part(name)?);
        }
        Ok(Expr::Path(Path { parts }))
    }

    fn part(&mut self, name: String) -> Result<PathPart, QueryError> {
        let mut indexes = Vec::new();
        while self.peek() == Some(&Token::LBracket) {
            self.pos += 1;
            indexes.push(self.expression(0)?);
            self.expect(Token::RBracket, "']'")?;
        }
        Ok(PathPart { name, indexes })
    }
}
