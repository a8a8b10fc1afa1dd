//! Tokenizer for condition expressions.

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Str(String),
    Number(f64),
    True,
    False,
    Null,
    Dot,
    Comma,
    LParen,
    RParen,
    Eq,
    Ne,
    And,
    Or,
    Not,
}

/// A token and its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExpressionError> {
    let mut tokens = Vec::new();
    let mut chars = source.char_indices().peekable();

    while let Some(&(offset, c)) = chars.peek() {
        let token = match c {
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '.' => {
                chars.next();
                Token::Dot
            }
            ',' => {
                chars.next();
                Token::Comma
            }
            '(' => {
                chars.next();
                Token::LParen
            }
            ')' => {
                chars.next();
                Token::RParen
            }
            '=' | '!' | '&' | '|' => {
                chars.next();
                let next = chars.peek().map(|&(_, n)| n);
                match (c, next) {
                    ('=', Some('=')) => {
                        chars.next();
                        Token::Eq
                    }
                    ('!', Some('=')) => {
                        chars.next();
                        Token::Ne
                    }
                    ('&', Some('&')) => {
                        chars.next();
                        Token::And
                    }
                    ('|', Some('|')) => {
                        chars.next();
                        Token::Or
                    }
                    ('!', _) => Token::Not,
                    _ => {
                        return Err(ExpressionError::Syntax {
                            offset,
                            message: format!("unexpected character {c:?}"),
                        });
                    }
                }
            }
            '\'' | '"' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    if ch == c {
                        // '' inside a single-quoted string is an escaped quote
                        if c == '\'' && matches!(chars.peek(), Some(&(_, '\''))) {
                            chars.next();
                            value.push('\'');
                            continue;
                        }
                        closed = true;
                        break;
                    }
                    value.push(ch);
                }
                if !closed {
                    return Err(ExpressionError::Syntax {
                        offset,
                        message: "unterminated string".to_string(),
                    });
                }
                Token::Str(value)
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = text.parse::<f64>().map_err(|_| ExpressionError::Syntax {
                    offset,
                    message: format!("invalid number {text:?}"),
                })?;
                Token::Number(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' || ch == '-' {
                        ident.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match ident.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(ident),
                }
            }
            other => {
                return Err(ExpressionError::Syntax {
                    offset,
                    message: format!("unexpected character {other:?}"),
                });
            }
        };
        tokens.push(Spanned { token, offset });
    }

    Ok(tokens)
}
