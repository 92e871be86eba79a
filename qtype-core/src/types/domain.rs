//! Built-in domain types exposed to documents as object custom types.
//!
//! Documents may reference `ChatMessage`, `Embedding`, and friends by name
//! without declaring them; the checker folds these shapes into the custom
//! type table of every application.

use super::{PrimitiveKind, TypeRef};
use std::sync::LazyLock;

/// One field of a built-in object shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainField {
    pub name: &'static str,
    pub ty: TypeRef,
    pub required: bool,
}

impl DomainField {
    fn required(name: &'static str, ty: TypeRef) -> Self {
        Self {
            name,
            ty,
            required: true,
        }
    }

    fn optional(name: &'static str, ty: TypeRef) -> Self {
        Self {
            name,
            ty: TypeRef::optional(ty),
            required: false,
        }
    }
}

/// A built-in object custom type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainTypeDef {
    pub name: &'static str,
    pub fields: Vec<DomainField>,
}

fn text() -> TypeRef {
    TypeRef::primitive(PrimitiveKind::Text)
}

fn int() -> TypeRef {
    TypeRef::primitive(PrimitiveKind::Int)
}

fn float() -> TypeRef {
    TypeRef::primitive(PrimitiveKind::Float)
}

fn metadata() -> TypeRef {
    TypeRef::Custom("Metadata".to_string())
}

static DOMAIN_TYPES: LazyLock<Vec<DomainTypeDef>> = LazyLock::new(|| {
    vec![
        // Open object shape: no required fields, so any object or custom
        // type is structurally assignable to it. Carries the arbitrary
        // structured metadata the retrieval types hold.
        DomainTypeDef {
            name: "Metadata",
            fields: vec![],
        },
        DomainTypeDef {
            name: "ChatContent",
            fields: vec![
                DomainField::required("type", text()),
                DomainField::required("content", text()),
                DomainField::optional("mime_type", text()),
            ],
        },
        DomainTypeDef {
            name: "ChatMessage",
            fields: vec![
                DomainField::required("role", text()),
                DomainField::required(
                    "blocks",
                    TypeRef::list(TypeRef::Custom("ChatContent".to_string())),
                ),
            ],
        },
        DomainTypeDef {
            name: "Embedding",
            fields: vec![
                DomainField::required("vector", TypeRef::list(float())),
                DomainField::optional("source_text", text()),
                DomainField::optional("metadata", metadata()),
            ],
        },
        DomainTypeDef {
            name: "RAGDocument",
            fields: vec![
                DomainField::required("id", text()),
                DomainField::required("content", text()),
                DomainField::optional("metadata", metadata()),
            ],
        },
        DomainTypeDef {
            name: "RAGChunk",
            fields: vec![
                DomainField::required("id", text()),
                DomainField::required("document_id", text()),
                DomainField::required("content", text()),
                DomainField::required("chunk_index", int()),
                DomainField::optional("embedding", TypeRef::list(float())),
                DomainField::optional("metadata", metadata()),
            ],
        },
        DomainTypeDef {
            name: "RAGSearchResult",
            fields: vec![
                DomainField::required("chunk", TypeRef::Custom("RAGChunk".to_string())),
                DomainField::required("score", float()),
            ],
        },
        DomainTypeDef {
            name: "AggregateStats",
            fields: vec![
                DomainField::required("num_successful", int()),
                DomainField::required("num_failed", int()),
                DomainField::required("num_total", int()),
            ],
        },
    ]
});

/// The built-in domain type shapes, in dependency order.
#[must_use]
pub fn builtin_domain_types() -> &'static [DomainTypeDef] {
    &DOMAIN_TYPES
}

/// Look up a built-in domain type by name.
#[must_use]
pub fn domain_type(name: &str) -> Option<&'static DomainTypeDef> {
    DOMAIN_TYPES.iter().find(|def| def.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_message_shape_is_registered() {
        let def = domain_type("ChatMessage").unwrap();
        assert!(def.fields.iter().any(|f| f.name == "role"));
        assert!(def.fields.iter().any(|f| f.name == "blocks"));
    }

    #[test]
    fn unknown_name_is_none() {
        assert!(domain_type("NotAType").is_none());
    }

    #[test]
    fn metadata_slots_use_the_open_object_shape() {
        assert!(domain_type("Metadata").unwrap().fields.is_empty());
        for name in ["Embedding", "RAGDocument", "RAGChunk"] {
            let field = domain_type(name)
                .unwrap()
                .fields
                .iter()
                .find(|f| f.name == "metadata")
                .unwrap();
            assert_eq!(field.ty, TypeRef::optional(metadata()));
        }
    }
}
