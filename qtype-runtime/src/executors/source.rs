//! ABOUTME: Source executors: file rows, SQL rows, and document readers
//! ABOUTME: Heads of a stream; the upstream seed only donates session identity

use crate::context::RunContext;
use crate::events::StreamEvent;
use crate::executor::{FlowStream, StepExecutor};
use crate::message::FlowMessage;
use crate::retry::retry_transient;
use futures::{stream, StreamExt};
use qtype_core::{codes, PrimitiveKind, TypeRef, Value};
use qtype_semantics::{StepIr, VariableIr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Coerce a raw text cell to the declared primitive type.
fn coerce_cell(raw: &str, ty: &TypeRef) -> Value {
    match ty.required() {
        TypeRef::Primitive(PrimitiveKind::Int) => raw
            .trim()
            .parse::<i64>()
            .map_or_else(|_| Value::Text(raw.to_string()), Value::Int),
        TypeRef::Primitive(PrimitiveKind::Float) => raw
            .trim()
            .parse::<f64>()
            .map_or_else(|_| Value::Text(raw.to_string()), Value::Float),
        TypeRef::Primitive(PrimitiveKind::Boolean) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::Text(raw.to_string()),
        },
        _ => Value::Text(raw.to_string()),
    }
}

/// Emit one message per row of a delimited file.
pub struct FileSourceExecutor {
    step: Arc<StepIr>,
    path: PathBuf,
}

impl FileSourceExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, path: PathBuf) -> Self {
        Self { step, path }
    }

    fn read_rows(&self, template: &FlowMessage) -> Vec<FlowMessage> {
        let mut reader = match csv::Reader::from_path(&self.path) {
            Ok(reader) => reader,
            Err(err) => {
                return vec![template.failed(
                    codes::LOADER_IO,
                    format!("cannot read '{}': {err}", self.path.display()),
                    Some(&self.step.id),
                )]
            }
        };
        let headers: Vec<String> = reader
            .headers()
            .map(|h| h.iter().map(ToString::to_string).collect())
            .unwrap_or_default();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(err) => {
                    rows.push(template.failed(
                        codes::DECODE_ERROR,
                        format!("bad row in '{}': {err}", self.path.display()),
                        Some(&self.step.id),
                    ));
                    continue;
                }
            };
            let mut message = template.clone();
            for output in &self.step.outputs {
                let cell = headers
                    .iter()
                    .position(|h| h == &output.id)
                    .and_then(|idx| record.get(idx));
                match cell {
                    Some(raw) => {
                        message =
                            message.with_variable(output.id.clone(), coerce_cell(raw, &output.ty));
                    }
                    None => {
                        message = message.failed(
                            codes::DECODE_ERROR,
                            format!("column '{}' missing in '{}'", output.id, self.path.display()),
                            Some(&self.step.id),
                        );
                        break;
                    }
                }
            }
            rows.push(message);
        }
        debug!(file = %self.path.display(), rows = rows.len(), "file source read");
        rows
    }
}

impl StepExecutor for FileSourceExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        input
            .take(1)
            .flat_map(move |template| {
                let this = Arc::clone(&self);
                let ctx = Arc::clone(&ctx);
                ctx.events.emit(StreamEvent::StartStep {
                    step_id: this.step.id.clone(),
                });
                let rows = if template.is_failed() {
                    vec![template]
                } else {
                    this.read_rows(&template)
                };
                ctx.events.emit(StreamEvent::FinishStep {
                    step_id: this.step.id.clone(),
                });
                stream::iter(rows)
            })
            .boxed()
    }
}

/// Emit one message per row of a SQL query.
pub struct SqlSourceExecutor {
    step: Arc<StepIr>,
    connection: String,
    query: String,
}

impl SqlSourceExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, connection: String, query: String) -> Self {
        Self {
            step,
            connection,
            query,
        }
    }

    async fn rows(&self, ctx: &RunContext, template: &FlowMessage) -> Vec<FlowMessage> {
        let client = match ctx.clients.sql_client(&self.connection) {
            Ok(client) => client,
            Err(err) => {
                return vec![template.failed(
                    codes::TOOL_ERROR,
                    format!("no SQL client: {err}"),
                    Some(&self.step.id),
                )]
            }
        };
        let rows = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            client.query(&self.query)
        })
        .await;
        match rows {
            Ok(rows) => rows
                .into_iter()
                .map(|row| {
                    let mut message = template.clone();
                    for output in &self.step.outputs {
                        let value = row.get(&output.id).cloned().unwrap_or(Value::Null);
                        message = message.with_variable(output.id.clone(), value);
                    }
                    message
                })
                .collect(),
            Err(err) => vec![template.failed(
                codes::TOOL_ERROR,
                format!("query failed: {err}"),
                Some(&self.step.id),
            )],
        }
    }
}

impl StepExecutor for SqlSourceExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        input
            .take(1)
            .then(move |template| {
                let this = Arc::clone(&self);
                let ctx = Arc::clone(&ctx);
                async move {
                    if template.is_failed() {
                        return stream::iter(vec![template]);
                    }
                    ctx.events.emit(StreamEvent::StartStep {
                        step_id: this.step.id.clone(),
                    });
                    let rows = this.rows(&ctx, &template).await;
                    ctx.events.emit(StreamEvent::FinishStep {
                        step_id: this.step.id.clone(),
                    });
                    stream::iter(rows)
                }
            })
            .flatten()
            .boxed()
    }
}

/// Emit one message per document from a host-resolved reader.
pub struct DocumentSourceExecutor {
    step: Arc<StepIr>,
    reader_module: String,
    args: serde_json::Value,
}

impl DocumentSourceExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, reader_module: String, args: serde_json::Value) -> Self {
        Self {
            step,
            reader_module,
            args,
        }
    }
}

impl StepExecutor for DocumentSourceExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        input
            .take(1)
            .then(move |template| {
                let this = Arc::clone(&self);
                let ctx = Arc::clone(&ctx);
                async move {
                    if template.is_failed() {
                        return stream::iter(vec![template]);
                    }
                    ctx.events.emit(StreamEvent::StartStep {
                        step_id: this.step.id.clone(),
                    });
                    let reader = match ctx.clients.document_reader(&this.reader_module) {
                        Ok(reader) => reader,
                        Err(err) => {
                            return stream::iter(vec![template.failed(
                                codes::TOOL_ERROR,
                                format!("no document reader: {err}"),
                                Some(&this.step.id),
                            )])
                        }
                    };
                    let docs = match reader.read(this.args.clone()).await {
                        Ok(stream) => stream.collect::<Vec<_>>().await,
                        Err(err) => {
                            return stream::iter(vec![template.failed(
                                codes::TOOL_ERROR,
                                format!("reader failed: {err}"),
                                Some(&this.step.id),
                            )])
                        }
                    };
                    let messages: Vec<FlowMessage> = docs
                        .into_iter()
                        .map(|doc| match doc {
                            Ok(doc) => bind_document(&template, &this.step.outputs, &doc),
                            Err(err) => template.failed(
                                codes::TOOL_ERROR,
                                format!("reader item failed: {err}"),
                                Some(&this.step.id),
                            ),
                        })
                        .collect();
                    ctx.events.emit(StreamEvent::FinishStep {
                        step_id: this.step.id.clone(),
                    });
                    stream::iter(messages)
                }
            })
            .flatten()
            .boxed()
    }
}

fn bind_document(
    template: &FlowMessage,
    outputs: &[Arc<VariableIr>],
    doc: &qtype_core::RagDocument,
) -> FlowMessage {
    match outputs.first() {
        Some(output) => template.with_variable(output.id.clone(), Value::from_serialize(doc)),
        None => template.clone(),
    }
}
