//! ABOUTME: Core error taxonomy, type model, and runtime interfaces for QType
//! ABOUTME: Foundation layer shared by the DSL, semantics, and runtime crates

pub mod error;
pub mod logging;
pub mod types;

pub mod traits {
    pub mod index;
    pub mod model;
    pub mod secret;
    pub mod telemetry;
    pub mod tool;
}

// Re-export commonly used types
pub use error::{codes, Diagnostic, QTypeError, Result, Severity, SourceLocation};
pub use types::{PrimitiveKind, TypeRef, Value};
pub use types::chat::{ChatContent, ChatMessage, MessageRole};
pub use types::rag::{AggregateStats, Embedding, RagChunk, RagDocument, RagSearchResult};
