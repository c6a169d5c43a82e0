//! Subscription expression evaluation.
//!
//! A pull subscription carries either a tag expression (`*` or
//! `tagA||tagB||tagC`) or a SQL-like boolean over message properties. The
//! filter decides keep/drop for each decoded message before it counts
//! against the pull batch quota. Filters are stateless and deterministic;
//! any evaluation error drops the message.

use std::collections::{BTreeSet, HashMap};

use crate::error::{CoreError, CoreResult};
use crate::message::MessageExt;

/// Expression kinds the wire protocol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExpressionType {
    /// Tag-set matching.
    #[default]
    Tag,
    /// SQL-like property expression.
    Sql92,
}

impl ExpressionType {
    /// Parses the wire name; anything other than `SQL92` is treated as TAG,
    /// matching the legacy default.
    #[must_use]
    pub fn from_wire(raw: Option<&str>) -> Self {
        match raw {
            Some("SQL92") => Self::Sql92,
            _ => Self::Tag,
        }
    }

    /// The wire name.
    #[must_use]
    pub const fn as_wire(self) -> &'static str {
        match self {
            Self::Tag => "TAG",
            Self::Sql92 => "SQL92",
        }
    }
}

/// A compiled subscription filter.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MessageFilter {
    /// Matches every message (`*` or an empty tag expression).
    #[default]
    All,
    /// Matches messages whose tag equals any of the literals.
    Tags(BTreeSet<String>),
    /// Matches messages whose properties satisfy the expression.
    Sql(SqlExpr),
}

impl MessageFilter {
    /// Compiles an expression.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidFilter`] if a SQL expression fails to
    /// parse. Tag expressions never fail; unknown shapes degrade to
    /// match-all, which is what legacy clients expect.
    pub fn build(expr_type: ExpressionType, expression: &str) -> CoreResult<Self> {
        match expr_type {
            ExpressionType::Tag => Ok(Self::build_tags(expression)),
            ExpressionType::Sql92 => {
                let expr = SqlParser::new(expression).parse()?;
                Ok(Self::Sql(expr))
            }
        }
    }

    fn build_tags(expression: &str) -> Self {
        let trimmed = expression.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Self::All;
        }
        let tags: BTreeSet<String> = trimmed
            .split("||")
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(ToString::to_string)
            .collect();
        if tags.is_empty() {
            Self::All
        } else {
            Self::Tags(tags)
        }
    }

    /// Decides keep (`true`) or drop (`false`) for one decoded message.
    #[must_use]
    pub fn matches(&self, message: &MessageExt) -> bool {
        match self {
            Self::All => true,
            Self::Tags(tags) => message.tags().is_some_and(|tag| tags.contains(tag)),
            Self::Sql(expr) => expr.eval(&message.properties).unwrap_or(false),
        }
    }
}

/// Comparison operators the SQL-like dialect supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// A literal operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Str(String),
    Int(i64),
}

/// Parsed SQL-like expression tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlExpr {
    And(Box<SqlExpr>, Box<SqlExpr>),
    Or(Box<SqlExpr>, Box<SqlExpr>),
    Cmp {
        key: String,
        op: CmpOp,
        value: Literal,
    },
    IsNull {
        key: String,
        negated: bool,
    },
}

impl SqlExpr {
    /// Evaluates against a property map. `None` means the evaluation failed
    /// (missing property in a comparison, non-numeric value in an ordering
    /// comparison); the caller drops the message.
    fn eval(&self, properties: &HashMap<String, String>) -> Option<bool> {
        match self {
            Self::And(lhs, rhs) => Some(lhs.eval(properties)? && rhs.eval(properties)?),
            Self::Or(lhs, rhs) => Some(lhs.eval(properties)? || rhs.eval(properties)?),
            Self::IsNull { key, negated } => {
                let present = properties.contains_key(key);
                Some(if *negated { present } else { !present })
            }
            Self::Cmp { key, op, value } => {
                let actual = properties.get(key)?;
                match value {
                    Literal::Str(expected) => match op {
                        CmpOp::Eq => Some(actual == expected),
                        CmpOp::Ne => Some(actual != expected),
                        // Ordering on strings is not part of the dialect.
                        _ => None,
                    },
                    Literal::Int(expected) => {
                        let actual: i64 = actual.parse().ok()?;
                        Some(match op {
                            CmpOp::Eq => actual == *expected,
                            CmpOp::Ne => actual != *expected,
                            CmpOp::Gt => actual > *expected,
                            CmpOp::Ge => actual >= *expected,
                            CmpOp::Lt => actual < *expected,
                            CmpOp::Le => actual <= *expected,
                        })
                    }
                }
            }
        }
    }
}

/// Recursive-descent parser for the SQL-like dialect:
///
/// ```text
/// expr    := term (OR term)*
/// term    := factor (AND factor)*
/// factor  := '(' expr ')'
///          | ident IS [NOT] NULL
///          | ident op literal
/// op      := '=' | '<>' | '>' | '>=' | '<' | '<='
/// literal := 'string' | integer
/// ```
struct SqlParser<'a> {
    tokens: Vec<Token>,
    at: usize,
    raw: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    Op(CmpOp),
    LParen,
    RParen,
    And,
    Or,
    Is,
    Not,
    Null,
}

impl<'a> SqlParser<'a> {
    fn new(raw: &'a str) -> Self {
        Self {
            tokens: Vec::new(),
            at: 0,
            raw,
        }
    }

    fn parse(mut self) -> CoreResult<SqlExpr> {
        self.tokens = self.tokenize()?;
        let expr = self.expr()?;
        if self.at != self.tokens.len() {
            return Err(self.error("trailing tokens"));
        }
        Ok(expr)
    }

    fn error(&self, what: &str) -> CoreError {
        CoreError::InvalidFilter(format!("{what} in expression: {}", self.raw))
    }

    fn tokenize(&self) -> CoreResult<Vec<Token>> {
        let mut tokens = Vec::new();
        let mut chars = self.raw.char_indices().peekable();
        while let Some((at, c)) = chars.next() {
            match c {
                c if c.is_whitespace() => {}
                '(' => tokens.push(Token::LParen),
                ')' => tokens.push(Token::RParen),
                '=' => tokens.push(Token::Op(CmpOp::Eq)),
                '<' => match chars.peek() {
                    Some((_, '>')) => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Ne));
                    }
                    Some((_, '=')) => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Le));
                    }
                    _ => tokens.push(Token::Op(CmpOp::Lt)),
                },
                '>' => match chars.peek() {
                    Some((_, '=')) => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Ge));
                    }
                    _ => tokens.push(Token::Op(CmpOp::Gt)),
                },
                '\'' => {
                    let mut value = String::new();
                    let mut closed = false;
                    for (_, c) in chars.by_ref() {
                        if c == '\'' {
                            closed = true;
                            break;
                        }
                        value.push(c);
                    }
                    if !closed {
                        return Err(self.error("unterminated string"));
                    }
                    tokens.push(Token::Str(value));
                }
                c if c.is_ascii_digit() || c == '-' => {
                    let mut end = at + c.len_utf8();
                    while let Some(&(next, d)) = chars.peek() {
                        if d.is_ascii_digit() {
                            end = next + d.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let value: i64 = self.raw[at..end]
                        .parse()
                        .map_err(|_| self.error("bad integer"))?;
                    tokens.push(Token::Int(value));
                }
                c if c.is_alphanumeric() || c == '_' => {
                    let mut end = at + c.len_utf8();
                    while let Some(&(next, d)) = chars.peek() {
                        if d.is_alphanumeric() || d == '_' || d == '.' {
                            end = next + d.len_utf8();
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let word = &self.raw[at..end];
                    tokens.push(match word.to_ascii_uppercase().as_str() {
                        "AND" => Token::And,
                        "OR" => Token::Or,
                        "IS" => Token::Is,
                        "NOT" => Token::Not,
                        "NULL" => Token::Null,
                        _ => Token::Ident(word.to_string()),
                    });
                }
                _ => return Err(self.error("unexpected character")),
            }
        }
        if tokens.is_empty() {
            return Err(self.error("empty expression"));
        }
        Ok(tokens)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.at).cloned();
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    fn expr(&mut self) -> CoreResult<SqlExpr> {
        let mut lhs = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.term()?;
            lhs = SqlExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> CoreResult<SqlExpr> {
        let mut lhs = self.factor()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.factor()?;
            lhs = SqlExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> CoreResult<SqlExpr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                if self.next() != Some(Token::RParen) {
                    return Err(self.error("missing closing paren"));
                }
                Ok(inner)
            }
            Some(Token::Ident(key)) => match self.next() {
                Some(Token::Is) => {
                    let negated = if self.peek() == Some(&Token::Not) {
                        self.next();
                        true
                    } else {
                        false
                    };
                    if self.next() != Some(Token::Null) {
                        return Err(self.error("expected NULL"));
                    }
                    Ok(SqlExpr::IsNull { key, negated })
                }
                Some(Token::Op(op)) => {
                    let value = match self.next() {
                        Some(Token::Str(s)) => Literal::Str(s),
                        Some(Token::Int(i)) => Literal::Int(i),
                        _ => return Err(self.error("expected literal")),
                    };
                    Ok(SqlExpr::Cmp { key, op, value })
                }
                _ => Err(self.error("expected operator")),
            },
            _ => Err(self.error("expected factor")),
        }
    }
}
