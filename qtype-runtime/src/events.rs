//! ABOUTME: Secondary streaming event channel for conversational flows
//! ABOUTME: Broadcast fan-out, independent of FlowMessage transport

use crate::message::MessageMetadata;
use serde::Serialize;
use tokio::sync::broadcast;

/// Streaming events, emitted in a fixed order within each step:
/// `start-step → (reasoning)* → (text)* → (tool)* → finish-step`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    StartStep {
        step_id: String,
    },
    TextStart {
        step_id: String,
    },
    TextDelta {
        step_id: String,
        delta: String,
    },
    ReasoningStart {
        step_id: String,
    },
    ReasoningDelta {
        step_id: String,
        delta: String,
    },
    ReasoningEnd {
        step_id: String,
    },
    ToolInputStart {
        step_id: String,
        call_id: String,
        tool_name: String,
    },
    ToolInputDelta {
        step_id: String,
        call_id: String,
        delta: String,
    },
    ToolInputEnd {
        step_id: String,
        call_id: String,
    },
    ToolOutputAvailable {
        step_id: String,
        call_id: String,
        output: serde_json::Value,
    },
    ToolOutputError {
        step_id: String,
        call_id: String,
        error: String,
    },
    MessageMetadata {
        metadata: MessageMetadata,
    },
    FinishStep {
        step_id: String,
    },
    Finish,
    Error {
        code: String,
        message: String,
    },
}

/// Broadcast hub for stream events.
///
/// Subscribers consume independently of the FlowMessage pipeline; a hub with
/// no subscribers drops events silently.
#[derive(Debug, Clone)]
pub struct EventHub {
    tx: broadcast::Sender<StreamEvent>,
}

impl EventHub {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: StreamEvent) {
        // No receivers is fine; one-shot invocations rarely subscribe.
        let _ = self.tx.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_kebab_tags() {
        let event = StreamEvent::TextDelta {
            step_id: "ask".to_string(),
            delta: "4".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "text-delta");

        let finish = StreamEvent::FinishStep {
            step_id: "ask".to_string(),
        };
        assert_eq!(serde_json::to_value(&finish).unwrap()["type"], "finish-step");
    }

    #[tokio::test]
    async fn hub_fans_out_to_subscribers() {
        let hub = EventHub::default();
        let mut rx_a = hub.subscribe();
        let mut rx_b = hub.subscribe();
        hub.emit(StreamEvent::Finish);
        assert_eq!(rx_a.recv().await.unwrap(), StreamEvent::Finish);
        assert_eq!(rx_b.recv().await.unwrap(), StreamEvent::Finish);
    }
}
