//! Tokenizer for the expression engine (§4.G step 2).

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LexError {
    #[error("illegal character '{0}'")]
    IllegalCharacter(char),
    #[error("unterminated string literal")]
    UnterminatedString,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    AndAnd,
    OrOr,
    Not,
    LParen,
    RParen,
    Comma,
    Dot,
    Eof,
}

pub fn tokenize(input: &str) -> Result<Vec<Token>, LexError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0usize;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '.' if !chars.get(i + 1).is_some_and(|c| c.is_ascii_digit()) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Lte);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Gte);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            '"' => {
                let (s, consumed) = read_string(&chars[i + 1..])?;
                tokens.push(Token::Str(s));
                i += consumed + 2;
            }
            c if c.is_ascii_digit() => {
                let (tok, consumed) = read_number(&chars[i..]);
                tokens.push(tok);
                i += consumed;
            }
            c if c.is_alphabetic() || c == '_' => {
                let (word, consumed) = read_word(&chars[i..]);
                let tok = match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "and" => Token::AndAnd,
                    "or" => Token::OrOr,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push(tok);
                i += consumed;
            }
            other => return Err(LexError::IllegalCharacter(other)),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

fn read_string(rest: &[char]) -> Result<(String, usize), LexError> {
    let mut s = String::new();
    let mut i = 0usize;
    loop {
        match rest.get(i) {
            None => return Err(LexError::UnterminatedString),
            Some('"') => return Ok((s, i + 1)),
            Some('\\') => {
                match rest.get(i + 1) {
                    Some('n') => s.push('\n'),
                    Some('t') => s.push('\t'),
                    Some(c) => s.push(*c),
                    None => return Err(LexError::UnterminatedString),
                }
                i += 2;
            }
            Some(c) => {
                s.push(*c);
                i += 1;
            }
        }
    }
}

fn read_number(rest: &[char]) -> (Token, usize) {
    let mut i = 0usize;
    let mut is_float = false;
    while let Some(c) = rest.get(i) {
        if c.is_ascii_digit() {
            i += 1;
        } else if *c == '.' && !is_float && rest.get(i + 1).is_some_and(|c| c.is_ascii_digit()) {
            is_float = true;
            i += 1;
        } else {
            break;
        }
    }
    let text: String = rest[..i].iter().collect();
    if is_float {
        (Token::Float(text.parse().unwrap_or(0.0)), i)
    } else {
        match text.parse::<i64>() {
            Ok(v) => (Token::Int(v), i),
            Err(_) => (Token::Float(text.parse().unwrap_or(0.0)), i),
        }
    }
}

fn read_word(rest: &[char]) -> (String, usize) {
    let mut i = 0usize;
    while let Some(c) = rest.get(i) {
        if c.is_alphanumeric() || *c == '_' {
            i += 1;
        } else {
            break;
        }
    }
    (rest[..i].iter().collect(), i)
}
