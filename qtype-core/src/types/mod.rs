//! ABOUTME: Scalar and composite type model for QType documents
//! ABOUTME: Provides `PrimitiveKind`, `TypeRef` normalization, and runtime `Value`

pub mod chat;
pub mod domain;
pub mod rag;
mod value;

pub use value::Value;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of primitive kinds a variable may carry.
///
/// Wire names are the lowercase snake_case forms used in documents
/// (`text`, `citation_url`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Text,
    Int,
    Float,
    Boolean,
    Bytes,
    Date,
    Time,
    Datetime,
    File,
    Image,
    Audio,
    Video,
    Thinking,
    CitationDocument,
    CitationUrl,
}

impl PrimitiveKind {
    /// All kinds, in declaration order.
    pub const ALL: [PrimitiveKind; 15] = [
        Self::Text,
        Self::Int,
        Self::Float,
        Self::Boolean,
        Self::Bytes,
        Self::Date,
        Self::Time,
        Self::Datetime,
        Self::File,
        Self::Image,
        Self::Audio,
        Self::Video,
        Self::Thinking,
        Self::CitationDocument,
        Self::CitationUrl,
    ];

    /// Wire name of the kind.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Bytes => "bytes",
            Self::Date => "date",
            Self::Time => "time",
            Self::Datetime => "datetime",
            Self::File => "file",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Thinking => "thinking",
            Self::CitationDocument => "citation_document",
            Self::CitationUrl => "citation_url",
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PrimitiveKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or(())
    }
}

/// Normalized reference to a type.
///
/// Documents write types in three surface forms (`text`, `text?`,
/// `list[text]`, arbitrarily nested); `TypeRef::parse` rewrites them into
/// this normalized tree so every downstream layer shares one representation.
///
/// # Examples
///
/// ```
/// use qtype_core::types::{PrimitiveKind, TypeRef};
///
/// let ty = TypeRef::parse("list[text?]").unwrap();
/// assert_eq!(
///     ty,
///     TypeRef::List(Box::new(TypeRef::Optional(Box::new(TypeRef::Primitive(
///         PrimitiveKind::Text
///     )))))
/// );
/// assert_eq!(ty.to_string(), "list[text?]");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeRef {
    Primitive(PrimitiveKind),
    /// Named custom type, resolved by the linker.
    Custom(String),
    List(Box<TypeRef>),
    Optional(Box<TypeRef>),
}

impl TypeRef {
    /// Shorthand for a primitive type reference.
    #[must_use]
    pub fn primitive(kind: PrimitiveKind) -> Self {
        Self::Primitive(kind)
    }

    /// Shorthand for `list[inner]`.
    #[must_use]
    pub fn list(inner: TypeRef) -> Self {
        Self::List(Box::new(inner))
    }

    /// Shorthand for `inner?`. Collapses `T??` to `T?`.
    #[must_use]
    pub fn optional(inner: TypeRef) -> Self {
        match inner {
            Self::Optional(_) => inner,
            other => Self::Optional(Box::new(other)),
        }
    }

    /// Parse a surface type expression.
    ///
    /// Accepted forms: a primitive name, a custom type id, `list[T]`, and a
    /// trailing `?` on any of those. Custom ids must start with a letter or
    /// underscore and contain only word characters, `.` and `-`.
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty type expression".to_string());
        }
        if let Some(inner) = expr.strip_suffix('?') {
            return Ok(Self::optional(Self::parse(inner)?));
        }
        if let Some(rest) = expr.strip_prefix("list[") {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| format!("unterminated list type: '{expr}'"))?;
            return Ok(Self::list(Self::parse(inner)?));
        }
        if let Ok(kind) = PrimitiveKind::from_str(expr) {
            return Ok(Self::Primitive(kind));
        }
        let valid_custom = expr
            .chars()
            .enumerate()
            .all(|(i, c)| {
                if i == 0 {
                    c.is_ascii_alphabetic() || c == '_'
                } else {
                    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')
                }
            });
        if valid_custom {
            Ok(Self::Custom(expr.to_string()))
        } else {
            Err(format!("malformed type expression: '{expr}'"))
        }
    }

    /// Whether the outermost form is optional.
    #[must_use]
    pub fn is_optional(&self) -> bool {
        matches!(self, Self::Optional(_))
    }

    /// The type with one level of optionality removed.
    #[must_use]
    pub fn required(&self) -> &TypeRef {
        match self {
            Self::Optional(inner) => inner,
            other => other,
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(kind) => write!(f, "{kind}"),
            Self::Custom(name) => f.write_str(name),
            Self::List(inner) => write!(f, "list[{inner}]"),
            Self::Optional(inner) => write!(f, "{inner}?"),
        }
    }
}

impl Serialize for TypeRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TypeRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_primitive_names() {
        for kind in PrimitiveKind::ALL {
            assert_eq!(
                TypeRef::parse(kind.name()).unwrap(),
                TypeRef::Primitive(kind)
            );
        }
    }

    #[test]
    fn parses_nested_forms() {
        assert_eq!(
            TypeRef::parse("list[list[int]]").unwrap(),
            TypeRef::list(TypeRef::list(TypeRef::primitive(PrimitiveKind::Int)))
        );
        assert_eq!(
            TypeRef::parse("Person?").unwrap(),
            TypeRef::optional(TypeRef::Custom("Person".to_string()))
        );
    }

    #[test]
    fn double_optional_collapses() {
        assert_eq!(
            TypeRef::parse("text??").unwrap(),
            TypeRef::optional(TypeRef::primitive(PrimitiveKind::Text))
        );
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(TypeRef::parse("list[text").is_err());
        assert!(TypeRef::parse("").is_err());
        assert!(TypeRef::parse("9lives").is_err());
        assert!(TypeRef::parse("a b").is_err());
    }

    proptest! {
        /// Display then parse restores the normalized tree.
        #[test]
        fn display_parse_round_trip(depth in 0usize..4, kind_idx in 0usize..15) {
            let mut ty = TypeRef::Primitive(PrimitiveKind::ALL[kind_idx]);
            for level in 0..depth {
                ty = if level % 2 == 0 { TypeRef::list(ty) } else { TypeRef::optional(ty) };
            }
            let rendered = ty.to_string();
            prop_assert_eq!(TypeRef::parse(&rendered).unwrap(), ty);
        }
    }
}
