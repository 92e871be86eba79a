//! ABOUTME: Index-backed executors: vector search, document search, batched upsert
//! ABOUTME: All external calls go through the index client interfaces with retry

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use crate::retry::retry_transient;
use futures::{stream, StreamExt};
use qtype_core::{codes, QTypeError, RagChunk, Result, Value};
use qtype_semantics::{IndexIr, StepIr};
use std::sync::Arc;
use tracing::debug;

/// Nearest-neighbor search; text queries embed through the index's model.
pub struct VectorSearchExecutor {
    step: Arc<StepIr>,
    index: Arc<IndexIr>,
    top_k: usize,
    score_threshold: Option<f32>,
}

impl VectorSearchExecutor {
    #[must_use]
    pub fn new(
        step: Arc<StepIr>,
        index: Arc<IndexIr>,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Self {
        Self {
            step,
            index,
            top_k,
            score_threshold,
        }
    }

    async fn query_vector_for(&self, ctx: &RunContext, value: &Value) -> Result<Vec<f32>> {
        // Accept a raw vector, an Embedding object, or text to embed.
        if let Some(items) = value.as_list() {
            let mut vector = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::Float(f) => vector.push(*f as f32),
                    Value::Int(i) => vector.push(*i as f32),
                    _ => {
                        return Err(QTypeError::message_failure(
                            codes::INDEX_ERROR,
                            "query vector contains non-numeric entries",
                        ))
                    }
                }
            }
            return Ok(vector);
        }
        if let Some(object) = value.as_object() {
            if let Some(vector) = object.get("vector") {
                return Box::pin(self.query_vector_for(ctx, vector)).await;
            }
        }
        let text = value.render();
        let IndexIr::Vector {
            embedding_model, ..
        } = self.index.as_ref()
        else {
            return Err(QTypeError::message_failure(
                codes::INDEX_ERROR,
                "vector search requires a vector index",
            ));
        };
        let provider = ctx.clients.model(embedding_model)?;
        let dims = embedding_model.dimensions;
        let mut vectors = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            provider.embed(vec![text.clone()], dims)
        })
        .await?;
        vectors
            .pop()
            .ok_or_else(|| QTypeError::message_failure(codes::INDEX_ERROR, "empty embedding"))
    }

    async fn search(&self, ctx: &RunContext, message: FlowMessage) -> FlowMessage {
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return message;
        };
        let Some(value) = message.get(&input.id).cloned() else {
            return message.failed(
                codes::INDEX_ERROR,
                format!("input variable '{}' has no value", input.id),
                Some(&self.step.id),
            );
        };
        let vector = match self.query_vector_for(ctx, &value).await {
            Ok(vector) => vector,
            Err(err) => {
                return message.failed(
                    codes::INDEX_ERROR,
                    format!("query embedding failed: {err}"),
                    Some(&self.step.id),
                )
            }
        };
        let client = match ctx.clients.vector_index(&self.index) {
            Ok(client) => client,
            Err(err) => {
                return message.failed(
                    codes::INDEX_ERROR,
                    format!("no index client: {err}"),
                    Some(&self.step.id),
                )
            }
        };
        let results = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            client.query_vector(vector.clone(), self.top_k, self.score_threshold, None)
        })
        .await;
        match results {
            Ok(results) => {
                debug!(step = %self.step.id, hits = results.len(), "vector search");
                message.with_variable(output.id.clone(), Value::from_serialize(&results))
            }
            Err(err) => message.failed(
                codes::INDEX_ERROR,
                format!("vector query failed: {err}"),
                Some(&self.step.id),
            ),
        }
    }
}

impl StepExecutor for VectorSearchExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { this.search(&ctx, message).await }
        })
    }
}

/// Full-text search against a document index.
pub struct DocumentSearchExecutor {
    step: Arc<StepIr>,
    index: Arc<IndexIr>,
    max_results: usize,
    search_fields: Option<Vec<String>>,
    filters: Option<serde_json::Value>,
}

impl DocumentSearchExecutor {
    #[must_use]
    pub fn new(
        step: Arc<StepIr>,
        index: Arc<IndexIr>,
        max_results: usize,
        search_fields: Option<Vec<String>>,
        filters: Option<serde_json::Value>,
    ) -> Self {
        Self {
            step,
            index,
            max_results,
            search_fields,
            filters,
        }
    }

    async fn search(&self, ctx: &RunContext, message: FlowMessage) -> FlowMessage {
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return message;
        };
        let query = message.get(&input.id).map(Value::render).unwrap_or_default();
        let client = match ctx.clients.document_index(&self.index) {
            Ok(client) => client,
            Err(err) => {
                return message.failed(
                    codes::INDEX_ERROR,
                    format!("no index client: {err}"),
                    Some(&self.step.id),
                )
            }
        };
        let results = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            client.query_text(
                &query,
                self.max_results,
                self.search_fields.clone(),
                self.filters.clone(),
            )
        })
        .await;
        match results {
            Ok(results) => message.with_variable(output.id.clone(), Value::from_serialize(&results)),
            Err(err) => message.failed(
                codes::INDEX_ERROR,
                format!("text query failed: {err}"),
                Some(&self.step.id),
            ),
        }
    }
}

impl StepExecutor for DocumentSearchExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { this.search(&ctx, message).await }
        })
    }
}

/// Batched writes into an index. Sink with passthrough outputs.
pub struct IndexUpsertExecutor {
    step: Arc<StepIr>,
    index: Arc<IndexIr>,
}

impl IndexUpsertExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, index: Arc<IndexIr>) -> Self {
        Self { step, index }
    }

    async fn upsert_batch(&self, ctx: &RunContext, batch: Vec<FlowMessage>) -> Vec<FlowMessage> {
        let Some(input) = self.step.inputs.first() else {
            return batch;
        };
        let mut items: Vec<(usize, RagChunk)> = Vec::new();
        for (position, message) in batch.iter().enumerate() {
            if message.is_failed() {
                continue;
            }
            if let Some(value) = message.get(&input.id) {
                if let Ok(chunk) = value.to_deserialize::<RagChunk>() {
                    items.push((position, chunk));
                }
            }
        }
        if items.is_empty() {
            return batch;
        }

        let chunks: Vec<RagChunk> = items.iter().map(|(_, c)| c.clone()).collect();
        let written = match self.index.as_ref() {
            IndexIr::Vector { .. } => match ctx.clients.vector_index(&self.index) {
                Ok(client) => {
                    retry_transient(&ctx.options.retry, &ctx.cancel, || {
                        client.upsert(chunks.clone())
                    })
                    .await
                }
                Err(err) => Err(err),
            },
            IndexIr::Document { .. } => match ctx.clients.document_index(&self.index) {
                Ok(client) => {
                    retry_transient(&ctx.options.retry, &ctx.cancel, || {
                        client.upsert(chunks.clone())
                    })
                    .await
                }
                Err(err) => Err(err),
            },
        };

        match written {
            Ok(count) => {
                debug!(step = %self.step.id, written = count, "index upsert");
                batch
            }
            Err(err) => {
                let failed_positions: Vec<usize> = items.iter().map(|(p, _)| *p).collect();
                batch
                    .into_iter()
                    .enumerate()
                    .map(|(position, message)| {
                        if failed_positions.contains(&position) {
                            message.failed(
                                codes::INDEX_ERROR,
                                format!("upsert failed: {err}"),
                                Some(&self.step.id),
                            )
                        } else {
                            message
                        }
                    })
                    .collect()
            }
        }
    }
}

impl StepExecutor for IndexUpsertExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let batch_size = self
            .step
            .batch_size
            .unwrap_or(ctx.options.default_batch_size)
            .max(1);
        input
            .chunks(batch_size)
            .then(move |batch| {
                let this = Arc::clone(&self);
                let ctx = Arc::clone(&ctx);
                async move { stream::iter(this.upsert_batch(&ctx, batch).await) }
            })
            .flatten()
            .boxed()
    }
}
