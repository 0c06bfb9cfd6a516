//! Conjunctive filters: `field op literal [and field op literal]*`.
//!
//! This is the subset the in-memory table evaluates. `PartitionKey eq` picks
//! the partition, every other clause is tested against each row (key clauses
//! with ordinal string comparison). `or` and `not` are rejected with
//! `BadRequest`.

use super::{Condition, Filter, QueryComparison, PARTITION_KEY};
use crate::entity::TableRow;
use crate::error::{Error, Result};
use crate::value::PropertyValue;
use chrono::{DateTime, Utc};
use std::iter::Peekable;
use std::str::CharIndices;
use uuid::Uuid;

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(PropertyValue),
    Open,
    Close,
}

/// Flattened conjunction of conditions
#[derive(Debug, Clone, Default)]
pub struct ConjunctiveQuery {
    conditions: Vec<Condition>,
}

impl ConjunctiveQuery {
    /// Flatten a filter tree; disjunctions are rejected
    pub fn from_filter(filter: &Filter) -> Result<Self> {
        let mut conditions = Vec::new();
        flatten(filter, &mut conditions)?;
        Ok(Self { conditions })
    }

    /// Parse filter text
    pub fn parse(text: &str) -> Result<Self> {
        Ok(Self {
            conditions: parse_conditions(text)?,
        })
    }

    /// Query matching every row
    pub fn all() -> Self {
        Self::default()
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Partition selected by a `PartitionKey eq` clause, if any
    pub fn partition(&self) -> Option<&str> {
        self.conditions.iter().find_map(|c| {
            if c.property.eq_ignore_ascii_case(PARTITION_KEY) && c.op == QueryComparison::Equal {
                c.value.as_str()
            } else {
                None
            }
        })
    }

    pub fn matches(&self, row: &TableRow) -> bool {
        self.conditions.iter().all(|c| c.matches(row))
    }
}

fn flatten(filter: &Filter, out: &mut Vec<Condition>) -> Result<()> {
    match filter {
        Filter::Condition(c) => {
            out.push(c.clone());
            Ok(())
        }
        Filter::And(a, b) => {
            flatten(a, out)?;
            flatten(b, out)
        }
        Filter::Or(_, _) => Err(Error::BadRequest(format!(
            "disjunctions are not supported by the in-memory table: {}",
            filter
        ))),
    }
}

pub(super) fn parse_conditions(text: &str) -> Result<Vec<Condition>> {
    let mut depth = 0i32;
    let mut tokens = Vec::new();
    for token in tokenize(text)? {
        match token {
            Token::Open => depth += 1,
            Token::Close => {
                depth -= 1;
                if depth < 0 {
                    return Err(Error::BadRequest(format!("unbalanced ')' in '{}'", text)));
                }
            }
            other => tokens.push(other),
        }
    }
    if depth != 0 {
        return Err(Error::BadRequest(format!("unbalanced '(' in '{}'", text)));
    }

    let mut conditions = Vec::new();
    let mut tokens = tokens.into_iter();
    loop {
        let property = match tokens.next() {
            Some(Token::Ident(name)) if is_keyword(&name, "not") => {
                return Err(Error::BadRequest("'not' is not supported".to_string()))
            }
            Some(Token::Ident(name)) => name,
            Some(other) => {
                return Err(Error::BadRequest(format!(
                    "expected a property name, found {:?}",
                    other
                )))
            }
            None if conditions.is_empty() => return Ok(conditions),
            None => return Err(Error::BadRequest("dangling 'and'".to_string())),
        };

        let op = match tokens.next() {
            Some(Token::Ident(op)) => op.parse::<QueryComparison>()?,
            _ => {
                return Err(Error::BadRequest(format!(
                    "expected a comparison after '{}'",
                    property
                )))
            }
        };

        let value = match tokens.next() {
            Some(Token::Literal(value)) => value,
            _ => {
                return Err(Error::BadRequest(format!(
                    "expected a literal after '{} {}'",
                    property, op
                )))
            }
        };

        conditions.push(Condition {
            property,
            op,
            value,
        });

        match tokens.next() {
            None => return Ok(conditions),
            Some(Token::Ident(word)) if is_keyword(&word, "and") => continue,
            Some(Token::Ident(word)) if is_keyword(&word, "or") => {
                return Err(Error::BadRequest(
                    "disjunctions are not supported by the in-memory table".to_string(),
                ))
            }
            Some(other) => {
                return Err(Error::BadRequest(format!(
                    "expected 'and', found {:?}",
                    other
                )))
            }
        }
    }
}

fn is_keyword(word: &str, keyword: &str) -> bool {
    word.eq_ignore_ascii_case(keyword)
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' {
            chars.next();
            tokens.push(Token::Open);
        } else if c == ')' {
            chars.next();
            tokens.push(Token::Close);
        } else if c == '\'' {
            chars.next();
            tokens.push(Token::Literal(PropertyValue::String(read_quoted(
                &mut chars, text,
            )?)));
        } else if c.is_ascii_digit() || c == '-' {
            tokens.push(Token::Literal(read_number(&mut chars, text, start)?));
        } else if c.is_alphabetic() || c == '_' {
            let mut end = start;
            while let Some(&(i, ch)) = chars.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    end = i + ch.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let word = &text[start..end];
            let prefixed = matches!(chars.peek(), Some(&(_, '\'')));
            let token = match word.to_ascii_lowercase().as_str() {
                "true" => Token::Literal(PropertyValue::Boolean(true)),
                "false" => Token::Literal(PropertyValue::Boolean(false)),
                "datetime" if prefixed => {
                    chars.next();
                    let raw = read_quoted(&mut chars, text)?;
                    let dt = DateTime::parse_from_rfc3339(&raw).map_err(|e| {
                        Error::BadRequest(format!("invalid datetime literal '{}': {}", raw, e))
                    })?;
                    Token::Literal(PropertyValue::DateTime(dt.with_timezone(&Utc)))
                }
                "guid" if prefixed => {
                    chars.next();
                    let raw = read_quoted(&mut chars, text)?;
                    let guid = Uuid::parse_str(&raw).map_err(|e| {
                        Error::BadRequest(format!("invalid guid literal '{}': {}", raw, e))
                    })?;
                    Token::Literal(PropertyValue::Guid(guid))
                }
                _ => Token::Ident(word.to_string()),
            };
            tokens.push(token);
        } else {
            return Err(Error::BadRequest(format!(
                "unexpected character '{}' at {} in '{}'",
                c, start, text
            )));
        }
    }

    Ok(tokens)
}

/// Read up to the closing quote; `''` is an escaped quote
fn read_quoted(chars: &mut Peekable<CharIndices<'_>>, text: &str) -> Result<String> {
    let mut out = String::new();
    while let Some((_, c)) = chars.next() {
        if c == '\'' {
            if matches!(chars.peek(), Some(&(_, '\''))) {
                chars.next();
                out.push('\'');
            } else {
                return Ok(out);
            }
        } else {
            out.push(c);
        }
    }
    Err(Error::BadRequest(format!("unterminated string in '{}'", text)))
}

fn read_number(
    chars: &mut Peekable<CharIndices<'_>>,
    text: &str,
    start: usize,
) -> Result<PropertyValue> {
    let mut end = start;
    let mut long = false;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E') {
            end = i + 1;
            chars.next();
        } else if c == 'L' {
            long = true;
            chars.next();
            break;
        } else {
            break;
        }
    }

    let raw = &text[start..end];
    let bad = || Error::BadRequest(format!("invalid numeric literal '{}'", raw));
    if long {
        raw.parse().map(PropertyValue::Int64).map_err(|_| bad())
    } else if raw.contains(['.', 'e', 'E']) {
        raw.parse().map(PropertyValue::Double).map_err(|_| bad())
    } else {
        match raw.parse::<i32>() {
            Ok(n) => Ok(PropertyValue::Int32(n)),
            Err(_) => raw.parse().map(PropertyValue::Int64).map_err(|_| bad()),
        }
    }
}
