//! ABOUTME: FlowRunner: assembles executor chains and drives them to completion
//! ABOUTME: Handles seeding, session persistence, timeouts, cancellation, and events

use crate::clients::{ClientCache, ProviderFactory};
use crate::context::RunContext;
use crate::events::{EventHub, StreamEvent};
use crate::executor::FlowStream;
use crate::factory::ExecutorFactory;
use crate::memory::MemoryStore;
use crate::message::FlowMessage;
use crate::options::RuntimeOptions;
use crate::transport::bounded_bridge;
use dashmap::DashMap;
use futures::{stream, StreamExt};
use qtype_core::traits::secret::{NoSecretResolver, SecretResolver};
use qtype_core::traits::telemetry::{SpanStatus, TelemetrySink, TracingSink};
use qtype_core::{QTypeError, Result, Value};
use qtype_semantics::{FlowIr, SemanticIr};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// External collaborators a runner needs.
pub struct RunnerDeps {
    pub providers: Arc<dyn ProviderFactory>,
    pub options: RuntimeOptions,
    pub secrets: Arc<dyn SecretResolver>,
    pub telemetry: Arc<dyn TelemetrySink>,
}

impl RunnerDeps {
    /// Deps with default secret resolution and tracing telemetry.
    #[must_use]
    pub fn new(providers: Arc<dyn ProviderFactory>) -> Self {
        Self {
            providers,
            options: RuntimeOptions::default(),
            secrets: Arc::new(NoSecretResolver),
            telemetry: Arc::new(TracingSink::new()),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: RuntimeOptions) -> Self {
        self.options = options;
        self
    }
}

/// Executes one flow of an application.
///
/// The runner is long-lived: memory and conversational session state persist
/// across calls, so successive turns with the same session id see prior
/// history.
pub struct FlowRunner {
    ir: Arc<SemanticIr>,
    flow: Arc<FlowIr>,
    factory: ExecutorFactory,
    deps: RunnerDeps,
    clients: Arc<ClientCache>,
    memory: Arc<MemoryStore>,
    events: EventHub,
    cancel: CancellationToken,
    /// Persisted `session_inputs` per session id.
    session_state: DashMap<String, BTreeMap<String, Value>>,
}

impl FlowRunner {
    pub fn new(ir: Arc<SemanticIr>, flow_id: &str, deps: RunnerDeps) -> Result<Self> {
        let flow = ir
            .flow(flow_id)
            .cloned()
            .ok_or_else(|| QTypeError::fatal(format!("no flow '{flow_id}' in application")))?;
        let clients = Arc::new(ClientCache::new(
            Arc::clone(&deps.providers),
            deps.options.client_ttl(),
        ));
        Ok(Self {
            ir,
            flow,
            factory: ExecutorFactory::standard(),
            deps,
            clients,
            memory: Arc::new(MemoryStore::new()),
            events: EventHub::default(),
            cancel: CancellationToken::new(),
            session_state: DashMap::new(),
        })
    }

    /// Replace the executor registry (hosts adding custom step variants).
    pub fn set_factory(&mut self, factory: ExecutorFactory) {
        self.factory = factory;
    }

    /// Subscribe to the secondary streaming event channel.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<StreamEvent> {
        self.events.subscribe()
    }

    /// Handle that cancels in-flight runs.
    #[must_use]
    pub fn cancel_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The memory store, exposed for tests and embedding hosts.
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryStore> {
        &self.memory
    }

    /// One-shot invocation with a fresh session identity.
    pub async fn run(&self, inputs: BTreeMap<String, Value>) -> Result<Vec<FlowMessage>> {
        let session_id = Uuid::new_v4().to_string();
        self.run_session(&session_id, inputs).await
    }

    /// Conversational invocation: session state and memory persist across
    /// calls with the same session id.
    #[instrument(skip_all, fields(flow = %self.flow.id, session = session_id))]
    pub async fn run_session(
        &self,
        session_id: &str,
        mut inputs: BTreeMap<String, Value>,
    ) -> Result<Vec<FlowMessage>> {
        // Saved session inputs fill slots the caller left empty this turn.
        if let Some(saved) = self.session_state.get(session_id) {
            for (id, value) in saved.iter() {
                inputs.entry(id.clone()).or_insert_with(|| value.clone());
            }
        }

        let seed = FlowMessage::with_variables(session_id, inputs);
        let ctx = Arc::new(
            RunContext::new(
                Arc::clone(&self.ir),
                Arc::clone(&self.clients),
                Arc::clone(&self.memory),
                self.deps.options.clone(),
            )
            .with_secrets(Arc::clone(&self.deps.secrets))
            .with_telemetry(Arc::clone(&self.deps.telemetry))
            .with_events(self.events.clone())
            .with_cancel(self.cancel.child_token()),
        );
        ctx.set_seed(seed.clone());

        let span = ctx.telemetry.start_span(
            "flow.run",
            &[
                ("flow", self.flow.id.clone()),
                ("session", session_id.to_string()),
            ],
        );
        info!(steps = self.flow.steps.len(), "flow run starting");

        let results = self.drive(&ctx, seed).await;

        match &results {
            Ok(messages) => {
                debug!(messages = messages.len(), "flow run finished");
                ctx.telemetry.end_span(span, SpanStatus::Ok);
                self.events.emit(StreamEvent::Finish);
            }
            Err(err) => {
                ctx.telemetry.end_span(span, SpanStatus::Error);
                self.events.emit(StreamEvent::Error {
                    code: error_code(err).to_string(),
                    message: err.to_string(),
                });
            }
        }

        if let Ok(messages) = &results {
            self.persist_session(session_id, messages);
        }
        results
    }

    async fn drive(&self, ctx: &Arc<RunContext>, seed: FlowMessage) -> Result<Vec<FlowMessage>> {
        let mut stream: FlowStream = stream::iter(vec![seed]).boxed();
        for step in &self.flow.steps {
            let executor = self.factory.build(step)?;
            stream = executor.execute(stream, Arc::clone(ctx));
            stream = bounded_bridge(
                stream,
                ctx.options.buffer_for(step.concurrency),
                ctx.cancel.clone(),
            );
        }

        let collect = stream.collect::<Vec<FlowMessage>>();
        let messages = match ctx.options.flow_timeout_ms {
            Some(deadline) => {
                match tokio::time::timeout(Duration::from_millis(deadline), collect).await {
                    Ok(messages) => messages,
                    Err(_) => {
                        ctx.cancel.cancel();
                        return Err(QTypeError::Cancelled);
                    }
                }
            }
            None => collect.await,
        };

        if let Some(fatal) = ctx.take_fatal() {
            return Err(fatal);
        }
        if ctx.cancel.is_cancelled() {
            return Err(QTypeError::Cancelled);
        }
        Ok(messages)
    }

    fn persist_session(&self, session_id: &str, messages: &[FlowMessage]) {
        if self.flow.session_inputs.is_empty() {
            return;
        }
        let Some(last) = messages.iter().rev().find(|m| !m.is_failed()) else {
            return;
        };
        let mut saved = BTreeMap::new();
        for session_input in &self.flow.session_inputs {
            if let Some(value) = last.get(&session_input.id) {
                saved.insert(session_input.id.clone(), value.clone());
            }
        }
        if !saved.is_empty() {
            self.session_state.insert(session_id.to_string(), saved);
        }
    }
}

fn error_code(err: &QTypeError) -> &'static str {
    match err {
        QTypeError::Cancelled => qtype_core::codes::CANCELLED,
        QTypeError::Fatal { .. } => qtype_core::codes::FATAL_RUNTIME_ERROR,
        _ => "RuntimeError",
    }
}
