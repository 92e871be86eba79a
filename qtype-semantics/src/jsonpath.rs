//! ABOUTME: Conservative JSONPath subset used by field extraction
//! ABOUTME: Supports root, dot/bracket fields, indices, wildcard, and equality filters

use qtype_core::Value;
use std::fmt;

/// One path segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// `.name` or `["name"]`
    Field(String),
    /// `[3]`
    Index(usize),
    /// `[*]`
    Wildcard,
    /// `[?(@.field == literal)]`
    Filter { field: String, equals: Value },
}

/// A parsed JSONPath expression.
///
/// The accepted dialect is deliberately small: `$` root, dot fields,
/// bracketed fields and indices, `[*]` over arrays, and equality filters
/// with string, number, or boolean literals. Anything else is a parse error.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonPath {
    segments: Vec<Segment>,
    source: String,
}

impl JsonPath {
    /// Parse a path expression.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let trimmed = expr.trim();
        let mut rest = trimmed
            .strip_prefix('$')
            .ok_or_else(|| format!("path must start with '$': '{trimmed}'"))?;
        let mut segments = Vec::new();

        while !rest.is_empty() {
            if let Some(after) = rest.strip_prefix('.') {
                let end = after
                    .find(['.', '['])
                    .unwrap_or(after.len());
                let name = &after[..end];
                if name.is_empty() {
                    return Err(format!("empty field segment in '{trimmed}'"));
                }
                segments.push(Segment::Field(name.to_string()));
                rest = &after[end..];
            } else if let Some(after) = rest.strip_prefix('[') {
                let close = after
                    .find(']')
                    .ok_or_else(|| format!("unterminated bracket in '{trimmed}'"))?;
                let inner = &after[..close];
                segments.push(parse_bracket(inner, trimmed)?);
                rest = &after[close + 1..];
            } else {
                return Err(format!("unexpected character at '{rest}'"));
            }
        }

        Ok(Self {
            segments,
            source: trimmed.to_string(),
        })
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Evaluate against a value. Wildcards and filters fan results out; the
    /// overall result is `None` when nothing matches, the single value when
    /// one matches, or a list when several do.
    #[must_use]
    pub fn evaluate(&self, root: &Value) -> Option<Value> {
        let mut current = vec![root.clone()];
        for segment in &self.segments {
            let mut next = Vec::new();
            for value in &current {
                apply_segment(segment, value, &mut next);
            }
            if next.is_empty() {
                return None;
            }
            current = next;
        }
        match current.len() {
            1 => current.pop(),
            _ => Some(Value::List(current)),
        }
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn apply_segment(segment: &Segment, value: &Value, out: &mut Vec<Value>) {
    match segment {
        Segment::Field(name) => {
            if let Some(object) = value.as_object() {
                if let Some(found) = object.get(name) {
                    out.push(found.clone());
                }
            }
        }
        Segment::Index(index) => {
            if let Some(items) = value.as_list() {
                if let Some(found) = items.get(*index) {
                    out.push(found.clone());
                }
            }
        }
        Segment::Wildcard => {
            if let Some(items) = value.as_list() {
                out.extend(items.iter().cloned());
            }
        }
        Segment::Filter { field, equals } => {
            if let Some(items) = value.as_list() {
                for item in items {
                    let matches = item
                        .as_object()
                        .and_then(|object| object.get(field))
                        .is_some_and(|candidate| candidate == equals);
                    if matches {
                        out.push(item.clone());
                    }
                }
            }
        }
    }
}

fn parse_bracket(inner: &str, whole: &str) -> Result<Segment, String> {
    let inner = inner.trim();
    if inner == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Ok(index) = inner.parse::<usize>() {
        return Ok(Segment::Index(index));
    }
    if (inner.starts_with('"') && inner.ends_with('"') && inner.len() >= 2)
        || (inner.starts_with('\'') && inner.ends_with('\'') && inner.len() >= 2)
    {
        return Ok(Segment::Field(inner[1..inner.len() - 1].to_string()));
    }
    if let Some(filter) = inner.strip_prefix("?(").and_then(|s| s.strip_suffix(')')) {
        return parse_filter(filter, whole);
    }
    Err(format!("unsupported bracket segment '[{inner}]' in '{whole}'"))
}

fn parse_filter(filter: &str, whole: &str) -> Result<Segment, String> {
    let (lhs, rhs) = filter
        .split_once("==")
        .ok_or_else(|| format!("filters support equality only: '{whole}'"))?;
    let field = lhs
        .trim()
        .strip_prefix("@.")
        .ok_or_else(|| format!("filter left side must be '@.field': '{whole}'"))?
        .to_string();
    let rhs = rhs.trim();
    let equals = if (rhs.starts_with('"') && rhs.ends_with('"') && rhs.len() >= 2)
        || (rhs.starts_with('\'') && rhs.ends_with('\'') && rhs.len() >= 2)
    {
        Value::Text(rhs[1..rhs.len() - 1].to_string())
    } else if rhs == "true" || rhs == "false" {
        Value::Bool(rhs == "true")
    } else if let Ok(int) = rhs.parse::<i64>() {
        Value::Int(int)
    } else if let Ok(float) = rhs.parse::<f64>() {
        Value::Float(float)
    } else {
        return Err(format!("unsupported filter literal '{rhs}' in '{whole}'"));
    };
    Ok(Segment::Filter { field, equals })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sample() -> Value {
        Value::Object(BTreeMap::from([
            (
                "blocks".to_string(),
                Value::List(vec![
                    Value::Object(BTreeMap::from([
                        ("type".to_string(), Value::from("text")),
                        ("content".to_string(), Value::from("hello")),
                    ])),
                    Value::Object(BTreeMap::from([
                        ("type".to_string(), Value::from("thinking")),
                        ("content".to_string(), Value::from("hmm")),
                    ])),
                ]),
            ),
            ("role".to_string(), Value::from("user")),
        ]))
    }

    #[test]
    fn dot_and_bracket_fields() {
        let value = sample();
        assert_eq!(
            JsonPath::parse("$.role").unwrap().evaluate(&value),
            Some(Value::from("user"))
        );
        assert_eq!(
            JsonPath::parse(r#"$["role"]"#).unwrap().evaluate(&value),
            Some(Value::from("user"))
        );
    }

    #[test]
    fn index_and_wildcard() {
        let value = sample();
        assert_eq!(
            JsonPath::parse("$.blocks[0].content").unwrap().evaluate(&value),
            Some(Value::from("hello"))
        );
        let contents = JsonPath::parse("$.blocks[*].content")
            .unwrap()
            .evaluate(&value)
            .unwrap();
        assert_eq!(
            contents,
            Value::List(vec![Value::from("hello"), Value::from("hmm")])
        );
    }

    #[test]
    fn equality_filter() {
        let value = sample();
        let text_block = JsonPath::parse(r#"$.blocks[?(@.type == "text")].content"#)
            .unwrap()
            .evaluate(&value);
        assert_eq!(text_block, Some(Value::from("hello")));
    }

    #[test]
    fn missing_path_is_none() {
        assert_eq!(
            JsonPath::parse("$.nope").unwrap().evaluate(&sample()),
            None
        );
    }

    #[test]
    fn rejects_unsupported_dialect() {
        assert!(JsonPath::parse("$..deep").is_err());
        assert!(JsonPath::parse("$[1:3]").is_err());
        assert!(JsonPath::parse("blocks").is_err());
        assert!(JsonPath::parse("$[?(@.a > 1)]").is_err());
    }
}
