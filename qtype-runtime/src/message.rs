//! ABOUTME: FlowMessage, the transport capsule threaded through executors
//! ABOUTME: Immutable record; producers derive new capsules copy-on-write

use qtype_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Error record riding inside a failed message.
///
/// A failed message short-circuits every downstream step: executors forward
/// it unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageError {
    pub code: String,
    pub message: String,
    /// Step that recorded the failure.
    pub step_id: Option<String>,
}

/// Auxiliary per-message information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub trace_id: String,
    pub span_id: String,
    /// Step currently (or last) processing the message.
    pub step_id: Option<String>,
    pub status: Option<String>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            trace_id: Uuid::new_v4().to_string(),
            span_id: Uuid::new_v4().to_string(),
            step_id: None,
            status: None,
        }
    }
}

/// The immutable capsule of typed variables flowing between executors.
///
/// The variable map is shared behind `Arc`; writing derives a new capsule
/// and leaves the original untouched, so concurrent consumers never observe
/// partial writes. A message accumulates variables across steps and never
/// drops them while its flow scope lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMessage {
    session_id: String,
    variables: Arc<BTreeMap<String, Value>>,
    error: Option<MessageError>,
    metadata: MessageMetadata,
}

impl FlowMessage {
    #[must_use]
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            variables: Arc::new(BTreeMap::new()),
            error: None,
            metadata: MessageMetadata::default(),
        }
    }

    #[must_use]
    pub fn with_variables(session_id: impl Into<String>, variables: BTreeMap<String, Value>) -> Self {
        Self {
            session_id: session_id.into(),
            variables: Arc::new(variables),
            error: None,
            metadata: MessageMetadata::default(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Value> {
        self.variables.get(id)
    }

    #[must_use]
    pub fn error(&self) -> Option<&MessageError> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    /// Derive a capsule with one variable set.
    #[must_use]
    pub fn with_variable(&self, id: impl Into<String>, value: Value) -> Self {
        let mut next = self.clone();
        Arc::make_mut(&mut next.variables).insert(id.into(), value);
        next
    }

    /// Derive a capsule with several variables set.
    #[must_use]
    pub fn with_set(&self, entries: impl IntoIterator<Item = (String, Value)>) -> Self {
        let mut next = self.clone();
        let vars = Arc::make_mut(&mut next.variables);
        for (id, value) in entries {
            vars.insert(id, value);
        }
        next
    }

    /// Derive a capsule restricted to the given variables (sub-flow entry).
    #[must_use]
    pub fn restricted(&self, keep: &[String]) -> Self {
        let mut next = self.clone();
        let vars = Arc::make_mut(&mut next.variables);
        vars.retain(|id, _| keep.contains(id));
        next
    }

    /// Derive a failed capsule. Variables are preserved.
    #[must_use]
    pub fn failed(&self, code: &str, message: impl Into<String>, step_id: Option<&str>) -> Self {
        let mut next = self.clone();
        next.error = Some(MessageError {
            code: code.to_string(),
            message: message.into(),
            step_id: step_id.map(ToString::to_string),
        });
        next
    }

    /// Derive a capsule annotated with the current step.
    #[must_use]
    pub fn at_step(&self, step_id: &str) -> Self {
        let mut next = self.clone();
        next.metadata.step_id = Some(step_id.to_string());
        next
    }

    /// Derive a capsule with a human-readable status note.
    #[must_use]
    pub fn with_status(&self, status: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.metadata.status = Some(status.into());
        next
    }
}
