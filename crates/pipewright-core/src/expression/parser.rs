//! Recursive-descent parser producing the expression AST.
//!
//! ```text
//! expr       := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | comparison
//! comparison := primary ( ( "==" | "!=" ) primary )?
//! primary    := literal | "(" expr ")" | ident "(" args ")" | ident ( "." ident )*
//! ```

use super::ExpressionError;
use super::evaluator::Value;
use super::lexer::{Spanned, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// Dotted path such as `matrix.os` or `steps.build.outputs.version`.
    Reference(Vec<String>),
    Call {
        name: String,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
}

const STATUS_FUNCTIONS: [&str; 4] = ["success", "failure", "always", "cancelled"];

impl Expr {
    /// Whether the expression calls one of the status functions anywhere.
    pub fn uses_status_function(&self) -> bool {
        match self {
            Expr::Literal(_) | Expr::Reference(_) => false,
            Expr::Call { name, args } => {
                STATUS_FUNCTIONS.contains(&name.to_ascii_lowercase().as_str())
                    || args.iter().any(Expr::uses_status_function)
            }
            Expr::Not(inner) => inner.uses_status_function(),
            Expr::Binary { left, right, .. } => {
                left.uses_status_function() || right.uses_status_function()
            }
        }
    }
}

pub fn parse(tokens: &[Spanned], source_len: usize) -> Result<Expr, ExpressionError> {
    let mut parser = Parser {
        tokens,
        position: 0,
        source_len,
    };
    if tokens.is_empty() {
        return Err(ExpressionError::Syntax {
            offset: 0,
            message: "empty expression".to_string(),
        });
    }
    let expr = parser.parse_or()?;
    if let Some(extra) = parser.peek() {
        return Err(ExpressionError::Syntax {
            offset: extra.offset,
            message: format!("unexpected {:?}", extra.token),
        });
    }
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    position: usize,
    source_len: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Spanned> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<&'a Spanned> {
        let token = self.tokens.get(self.position);
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn check(&self, token: &Token) -> bool {
        self.peek().is_some_and(|t| &t.token == token)
    }

    fn expect(&mut self, token: Token) -> Result<(), ExpressionError> {
        match self.advance() {
            Some(t) if t.token == token => Ok(()),
            Some(t) => Err(ExpressionError::Syntax {
                offset: t.offset,
                message: format!("expected {token:?}, found {:?}", t.token),
            }),
            None => Err(self.unexpected_end()),
        }
    }

    fn unexpected_end(&self) -> ExpressionError {
        ExpressionError::Syntax {
            offset: self.source_len,
            message: "unexpected end of expression".to_string(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_and()?;
        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinaryOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExpressionError> {
        let mut left = self.parse_unary()?;
        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary {
                op: BinaryOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExpressionError> {
        if self.check(&Token::Not) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExpressionError> {
        let left = self.parse_primary()?;
        let op = match self.peek().map(|t| &t.token) {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Ne) => BinaryOp::Ne,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_primary()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ExpressionError> {
        let Some(spanned) = self.advance() else {
            return Err(self.unexpected_end());
        };
        let offset = spanned.offset;
        match spanned.token.clone() {
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Number(n) => Ok(Expr::Literal(Value::Number(n))),
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if self.check(&Token::LParen) {
                    self.advance();
                    let args = self.parse_args()?;
                    return Ok(Expr::Call { name, args });
                }
                let mut path = vec![name];
                while self.check(&Token::Dot) {
                    self.advance();
                    match self.advance() {
                        Some(Spanned {
                            token: Token::Ident(segment),
                            ..
                        }) => path.push(segment.clone()),
                        Some(other) => {
                            return Err(ExpressionError::Syntax {
                                offset: other.offset,
                                message: format!("expected a name after '.', found {:?}", other.token),
                            });
                        }
                        None => return Err(self.unexpected_end()),
                    }
                }
                Ok(Expr::Reference(path))
            }
            other => Err(ExpressionError::Syntax {
                offset,
                message: format!("unexpected {other:?}"),
            }),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExpressionError> {
        let mut args = Vec::new();
        if self.check(&Token::RParen) {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.parse_or()?);
            match self.advance() {
                Some(Spanned {
                    token: Token::Comma,
                    ..
                }) => continue,
                Some(Spanned {
                    token: Token::RParen,
                    ..
                }) => return Ok(args),
                Some(other) => {
                    return Err(ExpressionError::Syntax {
                        offset: other.offset,
                        message: format!("expected ',' or ')', found {:?}", other.token),
                    });
                }
                None => return Err(self.unexpected_end()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn parse_str(source: &str) -> Result<Expr, ExpressionError> {
        parse(&tokenize(source)?, source.len())
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = parse_str("a || b && c").unwrap();
        match expr {
            Expr::Binary {
                op: BinaryOp::Or,
                right,
                ..
            } => assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. })),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_reference_path() {
        assert_eq!(
            parse_str("steps.build.outputs.version").unwrap(),
            Expr::Reference(vec![
                "steps".into(),
                "build".into(),
                "outputs".into(),
                "version".into()
            ])
        );
    }

    #[test]
    fn test_function_call_args() {
        let expr = parse_str("startsWith(ref, 'refs/tags/')").unwrap();
        assert!(matches!(expr, Expr::Call { ref name, ref args } if name == "startsWith" && args.len() == 2));
    }

    #[test]
    fn test_detects_status_functions() {
        assert!(parse_str("always()").unwrap().uses_status_function());
        assert!(parse_str("event == 'push' || failure()").unwrap().uses_status_function());
        assert!(!parse_str("event == 'push'").unwrap().uses_status_function());
    }

    #[test]
    fn test_rejects_dangling_operator() {
        assert!(parse_str("event ==").is_err());
        assert!(parse_str("(event == 'push'").is_err());
        assert!(parse_str("event 'push'").is_err());
    }
}
