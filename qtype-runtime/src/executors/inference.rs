//! ABOUTME: LLM inference and agent executors
//! ABOUTME: Streams provider tokens as events, drives the tool-call cycle, commits memory

use crate::context::RunContext;
use crate::events::StreamEvent;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::executors::tool::invoke_tool;
use crate::message::FlowMessage;
use crate::retry::retry_transient;
use futures::StreamExt;
use qtype_core::traits::model::{
    CompletionEvent, CompletionOutcome, CompletionRequest, ToolCallRequest, ToolSpec,
};
use qtype_core::types::chat::{ChatContent, ChatMessage, MessageRole};
use qtype_core::{codes, PrimitiveKind, QTypeError, Result, TypeRef, Value};
use qtype_semantics::{MemoryIr, ModelIr, StepIr, ToolIr};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct InferenceExecutor {
    step: Arc<StepIr>,
    model: Arc<ModelIr>,
    memory: Option<Arc<MemoryIr>>,
    system_message: Option<String>,
    tools: Vec<Arc<ToolIr>>,
    max_iterations: Option<usize>,
}

impl InferenceExecutor {
    #[must_use]
    pub fn inference(
        step: Arc<StepIr>,
        model: Arc<ModelIr>,
        memory: Option<Arc<MemoryIr>>,
        system_message: Option<String>,
    ) -> Self {
        Self {
            step,
            model,
            memory,
            system_message,
            tools: Vec::new(),
            max_iterations: None,
        }
    }

    #[must_use]
    pub fn agent(
        step: Arc<StepIr>,
        model: Arc<ModelIr>,
        memory: Option<Arc<MemoryIr>>,
        system_message: Option<String>,
        tools: Vec<Arc<ToolIr>>,
        max_iterations: Option<usize>,
    ) -> Self {
        Self {
            step,
            model,
            memory,
            system_message,
            tools,
            max_iterations,
        }
    }

    /// Interpret input variables as chat turns: ChatMessage values pass
    /// through, everything else joins a single user text turn.
    fn user_turn(&self, message: &FlowMessage) -> Vec<ChatMessage> {
        let mut turns = Vec::new();
        let mut text_parts = Vec::new();
        for input in &self.step.inputs {
            let Some(value) = message.get(&input.id) else {
                continue;
            };
            if let Ok(chat) = value.to_deserialize::<ChatMessage>() {
                if !chat.blocks.is_empty() {
                    turns.push(chat);
                    continue;
                }
            }
            if !value.is_null() {
                text_parts.push(value.render());
            }
        }
        if !text_parts.is_empty() {
            turns.push(ChatMessage::user(text_parts.join("\n")));
        }
        turns
    }

    fn tool_specs(&self) -> Vec<ToolSpec> {
        self.tools
            .iter()
            .map(|tool| ToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: parameter_schema(tool),
            })
            .collect()
    }

    async fn complete_once(
        &self,
        ctx: &RunContext,
        messages: Vec<ChatMessage>,
    ) -> Result<CompletionOutcome> {
        let provider = ctx.clients.model(&self.model)?;
        let request = CompletionRequest {
            model_id: self.model.provider_model_id.clone(),
            messages,
            params: serde_json::Value::Object(self.model.inference_params.clone()),
            tools: self.tool_specs(),
        };

        let mut stream = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            provider.complete(request.clone())
        })
        .await?;

        let step_id = self.step.id.clone();
        let mut text_started = false;
        loop {
            let event = tokio::select! {
                () = ctx.cancel.cancelled() => return Err(QTypeError::Cancelled),
                event = stream.next() => event,
            };
            let Some(event) = event else {
                return Err(QTypeError::message_failure(
                    codes::PROVIDER_ERROR,
                    "provider stream ended without a final message",
                ));
            };
            match event? {
                CompletionEvent::TextDelta(delta) => {
                    if !text_started {
                        text_started = true;
                        ctx.events.emit(StreamEvent::TextStart {
                            step_id: step_id.clone(),
                        });
                    }
                    ctx.events.emit(StreamEvent::TextDelta {
                        step_id: step_id.clone(),
                        delta,
                    });
                }
                CompletionEvent::ReasoningStart => {
                    ctx.events.emit(StreamEvent::ReasoningStart {
                        step_id: step_id.clone(),
                    });
                }
                CompletionEvent::ReasoningDelta(delta) => {
                    ctx.events.emit(StreamEvent::ReasoningDelta {
                        step_id: step_id.clone(),
                        delta,
                    });
                }
                CompletionEvent::ReasoningEnd => {
                    ctx.events.emit(StreamEvent::ReasoningEnd {
                        step_id: step_id.clone(),
                    });
                }
                CompletionEvent::ToolCallStart { call_id, name } => {
                    ctx.events.emit(StreamEvent::ToolInputStart {
                        step_id: step_id.clone(),
                        call_id,
                        tool_name: name,
                    });
                }
                CompletionEvent::ToolCallDelta { call_id, fragment } => {
                    ctx.events.emit(StreamEvent::ToolInputDelta {
                        step_id: step_id.clone(),
                        call_id,
                        delta: fragment,
                    });
                }
                CompletionEvent::ToolCallEnd { call_id } => {
                    ctx.events.emit(StreamEvent::ToolInputEnd {
                        step_id: step_id.clone(),
                        call_id,
                    });
                }
                CompletionEvent::Finished(outcome) => return Ok(outcome),
            }
        }
    }

    async fn dispatch_tool_call(
        &self,
        ctx: &RunContext,
        call: &ToolCallRequest,
    ) -> ChatMessage {
        let step_id = self.step.id.clone();
        let tool = self.tools.iter().find(|t| t.name() == call.name);
        let result = match tool {
            Some(tool) => invoke_tool(tool, call.arguments.clone(), ctx).await,
            None => Err(QTypeError::message_failure(
                codes::TOOL_ERROR,
                format!("model requested unknown tool '{}'", call.name),
            )),
        };
        match result {
            Ok(output) => {
                ctx.events.emit(StreamEvent::ToolOutputAvailable {
                    step_id,
                    call_id: call.call_id.clone(),
                    output: output.clone(),
                });
                ChatMessage::new(MessageRole::Tool, vec![ChatContent::text(output.to_string())])
            }
            Err(err) => {
                warn!(tool = %call.name, error = %err, "tool call failed");
                ctx.events.emit(StreamEvent::ToolOutputError {
                    step_id,
                    call_id: call.call_id.clone(),
                    error: err.to_string(),
                });
                ChatMessage::new(
                    MessageRole::Tool,
                    vec![ChatContent::text(format!("tool error: {err}"))],
                )
            }
        }
    }

    async fn run_one(&self, ctx: Arc<RunContext>, message: FlowMessage) -> FlowMessage {
        let user_turn = self.user_turn(&message);

        let mut messages = Vec::new();
        if let Some(system) = &self.system_message {
            messages.push(ChatMessage::system(system.clone()));
        }
        if let Some(memory) = &self.memory {
            messages.extend(ctx.memory.context(message.session_id(), memory));
        }
        messages.extend(user_turn.clone());

        let bound = if self.tools.is_empty() {
            1
        } else {
            self.max_iterations
                .unwrap_or(ctx.options.agent_max_iterations)
                .max(1)
        };

        let mut final_message: Option<ChatMessage> = None;
        for iteration in 0..bound {
            match self.complete_once(&ctx, messages.clone()).await {
                Ok(outcome) => {
                    if outcome.tool_calls.is_empty() {
                        final_message = Some(outcome.message);
                        break;
                    }
                    debug!(
                        step = %self.step.id,
                        iteration,
                        calls = outcome.tool_calls.len(),
                        "agent tool-call round"
                    );
                    messages.push(outcome.message);
                    for call in &outcome.tool_calls {
                        let tool_result = self.dispatch_tool_call(&ctx, call).await;
                        messages.push(tool_result);
                    }
                }
                Err(QTypeError::Cancelled) => {
                    return message.failed(codes::CANCELLED, "run cancelled", Some(&self.step.id));
                }
                Err(err) => {
                    return message.failed(
                        codes::PROVIDER_ERROR,
                        format!("model call failed: {err}"),
                        Some(&self.step.id),
                    );
                }
            }
        }

        let Some(response) = final_message else {
            let error = QTypeError::fatal(format!(
                "agent '{}' exhausted its {bound} tool-call rounds",
                self.step.id
            ));
            ctx.abort(error);
            return message.failed(
                codes::AGENT_LOOP_EXHAUSTED,
                format!("no final answer after {bound} rounds"),
                Some(&self.step.id),
            );
        };

        if let Some(memory) = &self.memory {
            for turn in &user_turn {
                ctx.memory.append(message.session_id(), memory, turn);
            }
            ctx.memory.append(message.session_id(), memory, &response);
        }

        match self.step.outputs.first() {
            Some(output) => {
                let value = if wants_chat_message(&output.ty) {
                    Value::from_serialize(&response)
                } else {
                    Value::Text(response.text())
                };
                message.with_variable(output.id.clone(), value)
            }
            None => message,
        }
    }
}

impl StepExecutor for InferenceExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { this.run_one(ctx, message).await }
        })
    }
}

fn wants_chat_message(ty: &TypeRef) -> bool {
    match ty {
        TypeRef::Custom(name) => name == "ChatMessage",
        TypeRef::Optional(inner) => wants_chat_message(inner),
        _ => false,
    }
}

/// JSON schema of a tool's parameters, derived from its declared inputs.
fn parameter_schema(tool: &ToolIr) -> serde_json::Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for (name, ty) in tool.inputs() {
        properties.insert(
            name.clone(),
            serde_json::json!({ "type": json_type(ty.required()) }),
        );
        if !ty.is_optional() {
            required.push(serde_json::Value::String(name.clone()));
        }
    }
    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn json_type(ty: &TypeRef) -> &'static str {
    match ty {
        TypeRef::Primitive(PrimitiveKind::Int) => "integer",
        TypeRef::Primitive(PrimitiveKind::Float) => "number",
        TypeRef::Primitive(PrimitiveKind::Boolean) => "boolean",
        TypeRef::List(_) => "array",
        TypeRef::Custom(_) => "object",
        _ => "string",
    }
}
