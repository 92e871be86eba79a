//! Batched chunk embedding through an embedding model.

use crate::context::RunContext;
use crate::executor::{FlowStream, StepExecutor};
use crate::message::FlowMessage;
use crate::retry::retry_transient;
use futures::{stream, StreamExt};
use qtype_core::{codes, RagChunk, Value};
use qtype_semantics::{ModelIr, StepIr};
use std::sync::Arc;
use tracing::debug;

pub struct DocumentEmbedderExecutor {
    step: Arc<StepIr>,
    model: Arc<ModelIr>,
}

impl DocumentEmbedderExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, model: Arc<ModelIr>) -> Self {
        Self { step, model }
    }

    /// Embed one accumulated batch with a single provider call, then re-emit
    /// per input in input order.
    async fn embed_batch(&self, ctx: &RunContext, batch: Vec<FlowMessage>) -> Vec<FlowMessage> {
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return batch;
        };

        // Failed messages ride along untouched; only live ones embed.
        let mut chunks: Vec<(usize, RagChunk)> = Vec::new();
        for (position, message) in batch.iter().enumerate() {
            if message.is_failed() {
                continue;
            }
            match message.get(&input.id).map(Value::to_json) {
                Some(json) => match serde_json::from_value::<RagChunk>(json) {
                    Ok(chunk) => chunks.push((position, chunk)),
                    Err(_) => {}
                },
                None => {}
            }
        }
        if chunks.is_empty() {
            return batch;
        }

        let provider = match ctx.clients.model(&self.model) {
            Ok(provider) => provider,
            Err(err) => {
                return batch
                    .into_iter()
                    .map(|m| {
                        if m.is_failed() {
                            m
                        } else {
                            m.failed(
                                codes::PROVIDER_ERROR,
                                format!("no embedding provider: {err}"),
                                Some(&self.step.id),
                            )
                        }
                    })
                    .collect()
            }
        };

        let texts: Vec<String> = chunks.iter().map(|(_, c)| c.content.clone()).collect();
        let dims = self.model.dimensions;
        let embedded = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            provider.embed(texts.clone(), dims)
        })
        .await;

        match embedded {
            Ok(vectors) => {
                debug!(step = %self.step.id, batch = chunks.len(), "batch embedded");
                let mut updated = batch;
                for ((position, chunk), vector) in chunks.into_iter().zip(vectors) {
                    let chunk = chunk.with_embedding(vector);
                    updated[position] = updated[position]
                        .with_variable(output.id.clone(), Value::from_serialize(&chunk));
                }
                updated
            }
            Err(err) => batch
                .into_iter()
                .map(|m| {
                    if m.is_failed() {
                        m
                    } else {
                        m.failed(
                            codes::PROVIDER_ERROR,
                            format!("embedding failed: {err}"),
                            Some(&self.step.id),
                        )
                    }
                })
                .collect(),
        }
    }
}

impl StepExecutor for DocumentEmbedderExecutor {
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
                async move { stream::iter(this.embed_batch(&ctx, batch).await) }
            })
            .flatten()
            .boxed()
    }
}
