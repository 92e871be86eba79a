//! ABOUTME: Model provider interface consumed by the interpreter
//! ABOUTME: Providers stream token deltas and a final message; embedding models return vectors

use crate::error::Result;
use crate::types::chat::ChatMessage;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Tool schema exposed to a model during an agent turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the tool's parameters.
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One completion request.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// Provider-facing model identifier.
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    /// Opaque inference parameters (temperature, max_tokens, ...).
    pub params: serde_json::Value,
    /// Tools the model may call; empty for plain inference.
    pub tools: Vec<ToolSpec>,
}

/// Terminal state of a completion.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionOutcome {
    pub message: ChatMessage,
    /// Tool invocations the model asked for instead of (or before) finishing.
    pub tool_calls: Vec<ToolCallRequest>,
}

/// Incremental completion events, in provider emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum CompletionEvent {
    TextDelta(String),
    ReasoningStart,
    ReasoningDelta(String),
    ReasoningEnd,
    ToolCallStart { call_id: String, name: String },
    ToolCallDelta { call_id: String, fragment: String },
    ToolCallEnd { call_id: String },
    Finished(CompletionOutcome),
}

/// Stream of completion events. Ends after the `Finished` event.
pub type CompletionStream = BoxStream<'static, Result<CompletionEvent>>;

/// Abstract model provider.
///
/// Implementations live outside the core; the interpreter only dispatches
/// through this interface. Errors classified as `QTypeError::Transient` are
/// retried per the step retry policy.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Issue a completion and stream the result.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionStream>;

    /// Embed a batch of texts. `dimensions` constrains the output width when
    /// the provider supports it.
    async fn embed(&self, texts: Vec<String>, dimensions: Option<usize>)
        -> Result<Vec<Vec<f32>>>;
}
