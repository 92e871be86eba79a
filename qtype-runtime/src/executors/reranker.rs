//! Embedding-based re-scoring of search results.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use crate::retry::retry_transient;
use qtype_core::{codes, RagSearchResult, Value};
use qtype_semantics::{ModelIr, StepIr};
use std::sync::Arc;

pub struct RerankerExecutor {
    step: Arc<StepIr>,
    model: Arc<ModelIr>,
    top_n: usize,
}

impl RerankerExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, model: Arc<ModelIr>, top_n: usize) -> Self {
        Self { step, model, top_n }
    }

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() || a.is_empty() {
            return 0.0;
        }
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm_a == 0.0 || norm_b == 0.0 {
            0.0
        } else {
            dot / (norm_a * norm_b)
        }
    }

    /// Re-score by embedding the query next to every candidate and ranking
    /// on cosine similarity.
    async fn rerank(&self, ctx: &RunContext, message: FlowMessage) -> FlowMessage {
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return message;
        };
        let results: Vec<RagSearchResult> = match message.get(&input.id).map(Value::to_json) {
            Some(json) => match serde_json::from_value(json) {
                Ok(results) => results,
                Err(err) => {
                    return message.failed(
                        codes::INDEX_ERROR,
                        format!("'{}' is not a result list: {err}", input.id),
                        Some(&self.step.id),
                    )
                }
            },
            None => Vec::new(),
        };
        if results.is_empty() {
            return message.with_variable(output.id.clone(), Value::List(Vec::new()));
        }

        // Optional second input carries the query text.
        let query = self
            .step
            .inputs
            .get(1)
            .and_then(|var| message.get(&var.id))
            .map(Value::render)
            .unwrap_or_default();

        let provider = match ctx.clients.model(&self.model) {
            Ok(provider) => provider,
            Err(err) => {
                return message.failed(
                    codes::PROVIDER_ERROR,
                    format!("no reranker model: {err}"),
                    Some(&self.step.id),
                )
            }
        };
        let mut texts = vec![query];
        texts.extend(results.iter().map(|r| r.chunk.content.clone()));
        let dims = self.model.dimensions;
        let vectors = retry_transient(&ctx.options.retry, &ctx.cancel, || {
            provider.embed(texts.clone(), dims)
        })
        .await;
        let vectors = match vectors {
            Ok(vectors) if vectors.len() == texts.len() => vectors,
            Ok(_) => {
                return message.failed(
                    codes::PROVIDER_ERROR,
                    "reranker returned the wrong number of vectors",
                    Some(&self.step.id),
                )
            }
            Err(err) => {
                return message.failed(
                    codes::PROVIDER_ERROR,
                    format!("rerank embedding failed: {err}"),
                    Some(&self.step.id),
                )
            }
        };

        let query_vector = &vectors[0];
        let mut rescored: Vec<RagSearchResult> = results
            .into_iter()
            .zip(vectors[1..].iter())
            .map(|(mut result, vector)| {
                result.score = Self::cosine(query_vector, vector);
                result
            })
            .collect();
        rescored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        rescored.truncate(self.top_n);

        message.with_variable(output.id.clone(), Value::from_serialize(&rescored))
    }
}

impl StepExecutor for RerankerExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { this.rerank(&ctx, message).await }
        })
    }
}
