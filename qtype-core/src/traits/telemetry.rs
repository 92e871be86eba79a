//! ABOUTME: Telemetry sink interface and the default tracing-backed sink
//! ABOUTME: At most one sink per application; multiplexing is the host's concern

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle to an open span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanHandle(pub u64);

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

/// Abstract telemetry sink.
///
/// The interpreter opens a span per flow run and per step dispatch and
/// records streaming milestones as events.
pub trait TelemetrySink: Send + Sync {
    fn start_span(&self, name: &str, attrs: &[(&str, String)]) -> SpanHandle;
    fn record_event(&self, handle: SpanHandle, name: &str, attrs: &[(&str, String)]);
    fn end_span(&self, handle: SpanHandle, status: SpanStatus);
}

/// Default sink that forwards to `tracing`.
#[derive(Debug, Default)]
pub struct TracingSink {
    next_id: AtomicU64,
    spans: Mutex<HashMap<u64, String>>,
}

impl TracingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetrySink for TracingSink {
    fn start_span(&self, name: &str, attrs: &[(&str, String)]) -> SpanHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.spans.lock().insert(id, name.to_string());
        tracing::debug!(span = name, ?attrs, "span started");
        SpanHandle(id)
    }

    fn record_event(&self, handle: SpanHandle, name: &str, attrs: &[(&str, String)]) {
        let spans = self.spans.lock();
        let span = spans.get(&handle.0).map_or("unknown", String::as_str);
        tracing::debug!(span, event = name, ?attrs, "span event");
    }

    fn end_span(&self, handle: SpanHandle, status: SpanStatus) {
        if let Some(span) = self.spans.lock().remove(&handle.0) {
            tracing::debug!(span = %span, ok = matches!(status, SpanStatus::Ok), "span ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_sink_hands_out_unique_handles() {
        let sink = TracingSink::new();
        let a = sink.start_span("flow.run", &[("flow", "f1".to_string())]);
        let b = sink.start_span("step.execute", &[]);
        assert_ne!(a, b);
        sink.record_event(a, "text-start", &[]);
        sink.end_span(a, SpanStatus::Ok);
        sink.end_span(b, SpanStatus::Error);
    }
}
