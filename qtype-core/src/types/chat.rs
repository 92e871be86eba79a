//! ABOUTME: Chat message domain types shared by flows and model providers
//! ABOUTME: Provides `ChatMessage`, `ChatContent` blocks, and `MessageRole`

use super::{PrimitiveKind, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
    Function,
    Developer,
    Model,
    Chatbot,
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
            Self::Function => "function",
            Self::Developer => "developer",
            Self::Model => "model",
            Self::Chatbot => "chatbot",
        };
        f.write_str(name)
    }
}

/// One content block inside a chat message.
///
/// The `kind` names the primitive carried by `content`; citation kinds use
/// structured object content (`CitationUrl`/`CitationDocument` sub-shapes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatContent {
    #[serde(rename = "type")]
    pub kind: PrimitiveKind,
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ChatContent {
    /// Plain text block.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: PrimitiveKind::Text,
            content: Value::Text(content.into()),
            mime_type: None,
        }
    }

    /// Model reasoning block.
    #[must_use]
    pub fn thinking(content: impl Into<String>) -> Self {
        Self {
            kind: PrimitiveKind::Thinking,
            content: Value::Text(content.into()),
            mime_type: None,
        }
    }

    /// URL citation block.
    #[must_use]
    pub fn citation_url(url: impl Into<String>, title: Option<String>) -> Self {
        let mut object = std::collections::BTreeMap::from([(
            "url".to_string(),
            Value::Text(url.into()),
        )]);
        if let Some(title) = title {
            object.insert("title".to_string(), Value::Text(title));
        }
        Self {
            kind: PrimitiveKind::CitationUrl,
            content: Value::Object(object),
            mime_type: None,
        }
    }

    /// Document citation block referencing an indexed chunk.
    #[must_use]
    pub fn citation_document(document_id: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        let object = std::collections::BTreeMap::from([
            ("document_id".to_string(), Value::Text(document_id.into())),
            ("chunk_id".to_string(), Value::Text(chunk_id.into())),
        ]);
        Self {
            kind: PrimitiveKind::CitationDocument,
            content: Value::Object(object),
            mime_type: None,
        }
    }
}

/// A chat message: a role plus ordered content blocks.
///
/// # Examples
///
/// ```
/// use qtype_core::types::chat::{ChatMessage, MessageRole};
///
/// let msg = ChatMessage::user("What is 2+2?");
/// assert_eq!(msg.role, MessageRole::User);
/// assert_eq!(msg.text(), "What is 2+2?");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub blocks: Vec<ChatContent>,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: MessageRole, blocks: Vec<ChatContent>) -> Self {
        Self { role, blocks }
    }

    /// Single-text-block user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![ChatContent::text(content)])
    }

    /// Single-text-block assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![ChatContent::text(content)])
    }

    /// Single-text-block system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, vec![ChatContent::text(content)])
    }

    /// Concatenated text of every text block.
    #[must_use]
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter(|block| block.kind == PrimitiveKind::Text)
            .filter_map(|block| block.content.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// All citation blocks, in order.
    #[must_use]
    pub fn citations(&self) -> Vec<&ChatContent> {
        self.blocks
            .iter()
            .filter(|block| {
                matches!(
                    block.kind,
                    PrimitiveKind::CitationDocument | PrimitiveKind::CitationUrl
                )
            })
            .collect()
    }

    /// Rough token estimate used for memory budgeting: one token per four
    /// characters of rendered content, minimum one per block.
    #[must_use]
    pub fn estimate_tokens(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| (block.content.render().len() / 4).max(1))
            .sum()
    }
}
