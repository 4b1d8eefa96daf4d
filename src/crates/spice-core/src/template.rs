//! Template expression resolver
//!
//! A small path DSL for extracting values from message state, used by
//! subgraph input mappings and reusable standalone:
//!
//! ```text
//! {{data.customer.name}}          dotted traversal
//! {{data.items[0].id}}            list indexing
//! {{data["a.b"]}}                 quoted key (flat keys containing dots)
//! {{metadata.tenantId}}           metadata scope
//! {{data.count:int}}              trailing cast
//! ```
//!
//! Scope is `data` or `metadata`; casts are `int`, `long`, `double`,
//! `bool`, `any`, and `string` (the default). Missing values resolve to
//! `Null`; casting a present value to an incompatible type is an error.

use crate::error::{Result, SpiceError};
use crate::message::Message;
use crate::value::Value;

/// Scope a template expression reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateScope {
    Data,
    Metadata,
}

/// One step of a template path
#[derive(Debug, Clone, PartialEq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Requested output type of an expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TemplateCast {
    Int,
    Long,
    Double,
    Bool,
    /// Pass the value through unchanged
    Any,
    /// Render the value as a string (default)
    #[default]
    String,
}

impl TemplateCast {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "int" => Ok(Self::Int),
            "long" => Ok(Self::Long),
            "double" => Ok(Self::Double),
            "bool" => Ok(Self::Bool),
            "any" => Ok(Self::Any),
            "string" => Ok(Self::String),
            other => Err(SpiceError::Validation(format!(
                "unknown template cast ':{}'",
                other
            ))),
        }
    }
}

/// A parsed `{{scope.path}}[:cast]` expression
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateExpression {
    pub scope: TemplateScope,
    pub segments: Vec<PathSegment>,
    pub cast: TemplateCast,
}

impl TemplateExpression {
    /// Parse an expression of the form `{{scope.path}}` with optional cast
    pub fn parse(text: &str) -> Result<Self> {
        let trimmed = text.trim();
        let inner = trimmed
            .strip_prefix("{{")
            .and_then(|rest| rest.strip_suffix("}}"))
            .ok_or_else(|| {
                SpiceError::Validation(format!("template must be wrapped in {{{{...}}}}: {}", text))
            })?
            .trim();

        let mut parser = Parser::new(inner);
        let scope_name = parser.read_identifier()?;
        let scope = match scope_name.as_str() {
            "data" => TemplateScope::Data,
            "metadata" => TemplateScope::Metadata,
            other => {
                return Err(SpiceError::Validation(format!(
                    "template scope must be 'data' or 'metadata', got '{}'",
                    other
                )))
            }
        };

        let mut segments = Vec::new();
        let mut cast = TemplateCast::default();
        loop {
            match parser.peek() {
                None => break,
                Some('.') => {
                    parser.advance();
                    if parser.peek() == Some('"') {
                        segments.push(PathSegment::Key(parser.read_quoted()?));
                    } else {
                        segments.push(PathSegment::Key(parser.read_identifier()?));
                    }
                }
                Some('[') => {
                    parser.advance();
                    if parser.peek() == Some('"') {
                        let key = parser.read_quoted()?;
                        parser.expect(']')?;
                        segments.push(PathSegment::Key(key));
                    } else {
                        let index = parser.read_index()?;
                        parser.expect(']')?;
                        segments.push(PathSegment::Index(index));
                    }
                }
                Some(':') => {
                    parser.advance();
                    let name = parser.read_identifier()?;
                    if parser.peek().is_some() {
                        return Err(SpiceError::Validation(format!(
                            "trailing characters after cast in template: {}",
                            text
                        )));
                    }
                    cast = TemplateCast::parse(&name)?;
                    break;
                }
                Some(other) => {
                    return Err(SpiceError::Validation(format!(
                        "unexpected character '{}' in template: {}",
                        other, text
                    )))
                }
            }
        }

        if segments.is_empty() {
            return Err(SpiceError::Validation(format!(
                "template path must name at least one key: {}",
                text
            )));
        }

        Ok(Self {
            scope,
            segments,
            cast,
        })
    }

    /// Resolve against a message; missing values yield `Null`
    pub fn resolve(&self, message: &Message) -> Result<Value> {
        let map = match self.scope {
            TemplateScope::Data => &message.data,
            TemplateScope::Metadata => &message.metadata,
        };

        let mut current: Option<&Value> = match &self.segments[0] {
            PathSegment::Key(key) => map.get(key),
            PathSegment::Index(_) => None,
        };
        for segment in &self.segments[1..] {
            current = match (current, segment) {
                (Some(value), PathSegment::Key(key)) => value.get_key(key),
                (Some(value), PathSegment::Index(index)) => value.get_index(*index),
                (None, _) => None,
            };
        }

        match current {
            None => Ok(Value::Null),
            Some(value) => apply_cast(value, self.cast),
        }
    }
}

/// Parse and resolve in one step
pub fn resolve_template(text: &str, message: &Message) -> Result<Value> {
    TemplateExpression::parse(text)?.resolve(message)
}

fn apply_cast(value: &Value, cast: TemplateCast) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let incompatible = |want: &str| {
        SpiceError::Validation(format!("cannot cast {:?} to {}", value, want))
    };
    match cast {
        TemplateCast::Any => Ok(value.clone()),
        TemplateCast::String => Ok(match value {
            Value::String(s) => Value::String(s.clone()),
            Value::Bool(b) => Value::String(b.to_string()),
            Value::Int(i) => Value::String(i.to_string()),
            Value::Long(l) => Value::String(l.to_string()),
            Value::Double(d) => Value::String(d.to_string()),
            other => Value::String(crate::value::canonical_json(other)),
        }),
        TemplateCast::Int => match value {
            Value::Int(i) => Ok(Value::Int(*i)),
            Value::Long(l) => i32::try_from(*l)
                .map(Value::Int)
                .map_err(|_| incompatible("int")),
            Value::String(s) => s.parse::<i32>().map(Value::Int).map_err(|_| incompatible("int")),
            _ => Err(incompatible("int")),
        },
        TemplateCast::Long => match value {
            Value::Int(i) => Ok(Value::Long(*i as i64)),
            Value::Long(l) => Ok(Value::Long(*l)),
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|_| incompatible("long")),
            _ => Err(incompatible("long")),
        },
        TemplateCast::Double => match value {
            Value::Int(i) => Ok(Value::Double(*i as f64)),
            Value::Long(l) => Ok(Value::Double(*l as f64)),
            Value::Double(d) => Ok(Value::Double(*d)),
            Value::String(s) => s
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|_| incompatible("double")),
            _ => Err(incompatible("double")),
        },
        TemplateCast::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::String(s) => match s.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(incompatible("bool")),
            },
            _ => Err(incompatible("bool")),
        },
    }
}

struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<char> {
        self.chars.next()
    }

    fn expect(&mut self, expected: char) -> Result<()> {
        match self.advance() {
            Some(c) if c == expected => Ok(()),
            other => Err(SpiceError::Validation(format!(
                "expected '{}' in template, got {:?}",
                expected, other
            ))),
        }
    }

    fn read_identifier(&mut self) -> Result<String> {
        let mut ident = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '-' {
                ident.push(c);
                self.advance();
            } else {
                break;
            }
        }
        if ident.is_empty() {
            return Err(SpiceError::Validation(
                "empty identifier in template".to_string(),
            ));
        }
        Ok(ident)
    }

    fn read_quoted(&mut self) -> Result<String> {
        self.expect('"')?;
        let mut key = String::new();
        loop {
            match self.advance() {
                Some('"') => return Ok(key),
                Some(c) => key.push(c),
                None => {
                    return Err(SpiceError::Validation(
                        "unterminated quoted key in template".to_string(),
                    ))
                }
            }
        }
    }

    fn read_index(&mut self) -> Result<usize> {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                self.advance();
            } else {
                break;
            }
        }
        digits
            .parse::<usize>()
            .map_err(|_| SpiceError::Validation("invalid list index in template".to_string()))
    }
}
