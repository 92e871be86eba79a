//! ABOUTME: Per-run execution context shared by every executor
//! ABOUTME: Carries the IR, clients, memory, events, options, and cancellation

use crate::clients::ClientCache;
use crate::events::EventHub;
use crate::memory::MemoryStore;
use crate::message::FlowMessage;
use crate::options::RuntimeOptions;
use parking_lot::Mutex;
use qtype_core::traits::secret::{NoSecretResolver, SecretResolver};
use qtype_core::traits::telemetry::{TelemetrySink, TracingSink};
use qtype_core::QTypeError;
use qtype_semantics::SemanticIr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything an executor needs beyond its own step config.
///
/// The IR is immutable and shared by reference; the memory store is the only
/// mutable shared state. One context exists per flow run.
pub struct RunContext {
    pub ir: Arc<SemanticIr>,
    pub clients: Arc<ClientCache>,
    pub memory: Arc<MemoryStore>,
    pub events: EventHub,
    pub options: RuntimeOptions,
    pub cancel: CancellationToken,
    pub secrets: Arc<dyn SecretResolver>,
    pub telemetry: Arc<dyn TelemetrySink>,
    /// Capsule that seeded the run; fan-in steps fall back to it when their
    /// input stream is empty.
    seed: Mutex<FlowMessage>,
    /// First fatal error; set once, aborts the whole flow.
    fatal: Mutex<Option<QTypeError>>,
}

impl RunContext {
    #[must_use]
    pub fn new(
        ir: Arc<SemanticIr>,
        clients: Arc<ClientCache>,
        memory: Arc<MemoryStore>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            ir,
            clients,
            memory,
            events: EventHub::default(),
            options,
            cancel: CancellationToken::new(),
            secrets: Arc::new(NoSecretResolver),
            telemetry: Arc::new(TracingSink::new()),
            seed: Mutex::new(FlowMessage::new("unseeded")),
            fatal: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = secrets;
        self
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: EventHub) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn set_seed(&self, seed: FlowMessage) {
        *self.seed.lock() = seed;
    }

    #[must_use]
    pub fn seed(&self) -> FlowMessage {
        self.seed.lock().clone()
    }

    /// Record a fatal error and tear the whole run down.
    pub fn abort(&self, error: QTypeError) {
        let mut slot = self.fatal.lock();
        if slot.is_none() {
            *slot = Some(error);
        }
        drop(slot);
        self.cancel.cancel();
    }

    #[must_use]
    pub fn take_fatal(&self) -> Option<QTypeError> {
        self.fatal.lock().take()
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
