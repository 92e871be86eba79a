//! ABOUTME: Cross-entity reference slots in the document model
//! ABOUTME: Captures the three surface forms; the linker canonicalizes to ids

use serde::{Deserialize, Serialize};

/// A reference slot accepting three surface forms:
///
/// ```yaml
/// model: gpt4                  # plain id
/// model: { ref: gpt4 }         # explicit ref map
/// model: { type: Model, id: inline_gpt4, provider: openai }   # inline entity
/// ```
///
/// The parser preserves which form was used; after linking, every slot is
/// the `Id` form and inline entities have been hoisted into the application
/// tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reference<T> {
    Ref {
        #[serde(rename = "ref")]
        target: String,
    },
    Id(String),
    Inline(Box<T>),
}

impl<T> Reference<T> {
    /// The referenced id, if this slot is already an id form.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Id(id) => Some(id),
            Self::Ref { target } => Some(target),
            Self::Inline(_) => None,
        }
    }

    /// The id after linking. Panics in debug builds if an inline entity
    /// survived the linker.
    #[must_use]
    pub fn linked_id(&self) -> &str {
        self.id().expect("reference not canonicalized by linker")
    }

    /// The inline entity, if this slot embeds one.
    #[must_use]
    pub fn inline(&self) -> Option<&T> {
        match self {
            Self::Inline(entity) => Some(entity),
            _ => None,
        }
    }

    /// Take the inline entity out, replacing the slot with `id`.
    pub fn hoist(&mut self, id: String) -> Option<T> {
        if matches!(self, Self::Inline(_)) {
            let prior = std::mem::replace(self, Self::Id(id));
            match prior {
                Self::Inline(entity) => Some(*entity),
                _ => unreachable!(),
            }
        } else {
            None
        }
    }

    /// Canonicalize an explicit ref map to the id form.
    pub fn canonicalize(&mut self) {
        if let Self::Ref { target } = self {
            let id = std::mem::take(target);
            *self = Self::Id(id);
        }
    }
}
