//! Tokenizer for the expression dialect.

use super::{ExprError, ExprErrorKind};

/// A lexical token with its source offset (for diagnostics).
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    String(String),
    Ident(String),
    True,
    False,
    Null,
    Undefined,
    Typeof,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    LeftBrace,
    RightBrace,
    Comma,
    Colon,
    Dot,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Not,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    EqualEqual,
    StrictEqual,
    NotEqual,
    StrictNotEqual,
    AndAnd,
    OrOr,
    Arrow,
}

/// Splits expression source into tokens.
///
/// Assignment (`=` outside `==`/`=>`), statement separators, and template
/// literals are rejected here so forbidden constructs fail before any
/// evaluation happens.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut position = 0usize;

    while position < chars.len() {
        let current = chars[position];
        match current {
            character if character.is_whitespace() => position += 1,
            '(' => {
                tokens.push(Token::LeftParen);
                position += 1;
            }
            ')' => {
                tokens.push(Token::RightParen);
                position += 1;
            }
            '[' => {
                tokens.push(Token::LeftBracket);
                position += 1;
            }
            ']' => {
                tokens.push(Token::RightBracket);
                position += 1;
            }
            '{' => {
                tokens.push(Token::LeftBrace);
                position += 1;
            }
            '}' => {
                tokens.push(Token::RightBrace);
                position += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                position += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                position += 1;
            }
            '?' => {
                tokens.push(Token::Question);
                position += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                position += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                position += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                position += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                position += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                position += 1;
            }
            '.' => {
                // A leading digit after '.' is a number like `.5`.
                if chars.get(position + 1).is_some_and(|next| next.is_ascii_digit()) {
                    let (number, consumed) = lex_number(&chars[position..], source)?;
                    tokens.push(Token::Number(number));
                    position += consumed;
                } else {
                    tokens.push(Token::Dot);
                    position += 1;
                }
            }
            '!' => {
                if chars.get(position + 1) == Some(&'=') {
                    if chars.get(position + 2) == Some(&'=') {
                        tokens.push(Token::StrictNotEqual);
                        position += 3;
                    } else {
                        tokens.push(Token::NotEqual);
                        position += 2;
                    }
                } else {
                    tokens.push(Token::Not);
                    position += 1;
                }
            }
            '<' => {
                if chars.get(position + 1) == Some(&'=') {
                    tokens.push(Token::LessEqual);
                    position += 2;
                } else {
                    tokens.push(Token::Less);
                    position += 1;
                }
            }
            '>' => {
                if chars.get(position + 1) == Some(&'=') {
                    tokens.push(Token::GreaterEqual);
                    position += 2;
                } else {
                    tokens.push(Token::Greater);
                    position += 1;
                }
            }
            '=' => {
                if chars.get(position + 1) == Some(&'=') {
                    if chars.get(position + 2) == Some(&'=') {
                        tokens.push(Token::StrictEqual);
                        position += 3;
                    } else {
                        tokens.push(Token::EqualEqual);
                        position += 2;
                    }
                } else if chars.get(position + 1) == Some(&'>') {
                    tokens.push(Token::Arrow);
                    position += 2;
                } else {
                    return Err(ExprError::new(
                        ExprErrorKind::Syntax,
                        "assignment is not allowed in expressions",
                        source,
                    ));
                }
            }
            '&' => {
                if chars.get(position + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    position += 2;
                } else {
                    return Err(ExprError::new(ExprErrorKind::Syntax, "unexpected '&'", source));
                }
            }
            '|' => {
                if chars.get(position + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    position += 2;
                } else {
                    return Err(ExprError::new(ExprErrorKind::Syntax, "unexpected '|'", source));
                }
            }
            '\'' | '"' => {
                let (text, consumed) = lex_string(&chars[position..], current, source)?;
                tokens.push(Token::String(text));
                position += consumed;
            }
            '`' => {
                return Err(ExprError::new(
                    ExprErrorKind::Syntax,
                    "template literals are not allowed in expressions",
                    source,
                ));
            }
            ';' => {
                return Err(ExprError::new(
                    ExprErrorKind::Syntax,
                    "statements are not allowed; provide a single expression",
                    source,
                ));
            }
            character if character.is_ascii_digit() => {
                let (number, consumed) = lex_number(&chars[position..], source)?;
                tokens.push(Token::Number(number));
                position += consumed;
            }
            character if character.is_alphabetic() || character == '_' || character == '$' => {
                let mut end = position + 1;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_' || chars[end] == '$') {
                    end += 1;
                }
                let word: String = chars[position..end].iter().collect();
                tokens.push(keyword_or_ident(word));
                position = end;
            }
            other => {
                return Err(ExprError::new(ExprErrorKind::Syntax, format!("unexpected character '{other}'"), source));
            }
        }
    }

    Ok(tokens)
}

fn keyword_or_ident(word: String) -> Token {
    match word.as_str() {
        "true" => Token::True,
        "false" => Token::False,
        "null" => Token::Null,
        "undefined" => Token::Undefined,
        "typeof" => Token::Typeof,
        _ => Token::Ident(word),
    }
}

fn lex_number(chars: &[char], source: &str) -> Result<(f64, usize), ExprError> {
    let mut end = 0usize;
    let mut seen_dot = false;
    let mut seen_exponent = false;
    while end < chars.len() {
        let character = chars[end];
        if character.is_ascii_digit() {
            end += 1;
        } else if character == '.' && !seen_dot && !seen_exponent {
            seen_dot = true;
            end += 1;
        } else if (character == 'e' || character == 'E') && !seen_exponent && end > 0 {
            seen_exponent = true;
            end += 1;
            if chars.get(end) == Some(&'+') || chars.get(end) == Some(&'-') {
                end += 1;
            }
        } else {
            break;
        }
    }
    let literal: String = chars[..end].iter().collect();
    literal
        .parse::<f64>()
        .map(|number| (number, end))
        .map_err(|_| ExprError::new(ExprErrorKind::Syntax, format!("invalid number literal '{literal}'"), source))
}

fn lex_string(chars: &[char], quote: char, source: &str) -> Result<(String, usize), ExprError> {
    let mut text = String::new();
    let mut position = 1usize;
    while position < chars.len() {
        let character = chars[position];
        if character == quote {
            return Ok((text, position + 1));
        }
        if character == '\\' {
            position += 1;
            match chars.get(position) {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some('r') => text.push('\r'),
                Some('\\') => text.push('\\'),
                Some('\'') => text.push('\''),
                Some('"') => text.push('"'),
                Some('`') => text.push('`'),
                Some('0') => text.push('\0'),
                Some(other) => text.push(*other),
                None => break,
            }
            position += 1;
        } else {
            text.push(character);
            position += 1;
        }
    }
    Err(ExprError::new(ExprErrorKind::Syntax, "unterminated string literal", source))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_comparison_chain() {
        let tokens = tokenize("state.counter < 5 && flag === true").unwrap();
        assert!(tokens.contains(&Token::Less));
        assert!(tokens.contains(&Token::AndAnd));
        assert!(tokens.contains(&Token::StrictEqual));
    }

    #[test]
    fn rejects_assignment() {
        let error = tokenize("state.counter = 5").unwrap_err();
        assert_eq!(error.kind, ExprErrorKind::Syntax);
        assert!(error.message.contains("assignment"));
    }

    #[test]
    fn arrow_is_not_assignment() {
        let tokens = tokenize("items.map(x => x * 2)").unwrap();
        assert!(tokens.contains(&Token::Arrow));
    }

    #[test]
    fn rejects_statement_separator() {
        assert!(tokenize("1; 2").is_err());
    }

    #[test]
    fn string_escapes_are_decoded() {
        let tokens = tokenize(r#""line\nbreak""#).unwrap();
        assert_eq!(tokens, vec![Token::String("line\nbreak".into())]);
    }

    #[test]
    fn numbers_cover_decimals_and_exponents() {
        assert_eq!(tokenize("2.5").unwrap(), vec![Token::Number(2.5)]);
        assert_eq!(tokenize("1e3").unwrap(), vec![Token::Number(1000.0)]);
        assert_eq!(tokenize(".5").unwrap(), vec![Token::Number(0.5)]);
    }
}
