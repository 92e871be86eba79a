//! Shared test doubles: a programmable model provider, an in-memory vector
//! index, and helpers that compile YAML documents to a Semantic IR.
#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use qtype_core::traits::index::{DocumentIndexClient, VectorIndexClient};
use qtype_core::traits::model::{
    CompletionEvent, CompletionOutcome, CompletionRequest, CompletionStream, ModelProvider,
};
use qtype_core::traits::tool::{DocumentReader, NativeFunction};
use qtype_core::types::chat::ChatMessage;
use qtype_core::{QTypeError, RagChunk, RagDocument, RagSearchResult, Result};
use qtype_runtime::ProviderFactory;
use qtype_semantics::{IndexIr, ModelIr, SemanticIr};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Compile a YAML document end to end.
pub fn compile(text: &str) -> Arc<SemanticIr> {
    let loaded = qtype_dsl::loader::DocumentLoader::new()
        .load_str(text, Path::new("test.qtype.yaml"))
        .expect("load");
    let app = qtype_dsl::parse(&loaded).expect("parse");
    let linked = qtype_dsl::link(app, &loaded.source_map).expect("link");
    qtype_semantics::check(&linked).expect("check").ir.into()
}

/// What the stub model does with one completion request.
pub type Responder =
    Arc<dyn Fn(&CompletionRequest) -> CompletionOutcome + Send + Sync + 'static>;

/// Deterministic toy embedding: character histogram folded into `dims`.
pub fn toy_embedding(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dims.max(1)];
    for (position, ch) in text.chars().enumerate() {
        let bucket = (ch as usize + position) % vector.len();
        vector[bucket] += 1.0;
    }
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }
    vector
}

/// A programmable model provider.
pub struct StubModel {
    responder: Responder,
    /// Delay before the final event, for cancellation tests.
    pub delay: Option<Duration>,
    pub dims: usize,
}

impl StubModel {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            delay: None,
            dims: 8,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Responder that always answers with fixed text.
    pub fn fixed(text: &str) -> Responder {
        let text = text.to_string();
        Arc::new(move |_request| CompletionOutcome {
            message: ChatMessage::assistant(text.clone()),
            tool_calls: Vec::new(),
        })
    }
}

#[async_trait]
impl ModelProvider for StubModel {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionStream> {
        let outcome = (self.responder)(&request);
        let delay = self.delay;
        let text = outcome.message.text();

        let mut events: Vec<Result<CompletionEvent>> = Vec::new();
        if !text.is_empty() && outcome.tool_calls.is_empty() {
            let midpoint = text.len() / 2;
            let split = text
                .char_indices()
                .map(|(i, _)| i)
                .find(|&i| i >= midpoint)
                .unwrap_or(0);
            events.push(Ok(CompletionEvent::TextDelta(text[..split].to_string())));
            events.push(Ok(CompletionEvent::TextDelta(text[split..].to_string())));
        }
        events.push(Ok(CompletionEvent::Finished(outcome)));

        let stream: CompletionStream = match delay {
            Some(delay) => futures::stream::once(async move {
                tokio::time::sleep(delay).await;
            })
            .flat_map(move |()| futures::stream::iter(events.clone()))
            .boxed(),
            None => futures::stream::iter(events).boxed(),
        };
        Ok(stream)
    }

    async fn embed(&self, texts: Vec<String>, dims: Option<usize>) -> Result<Vec<Vec<f32>>> {
        let dims = dims.unwrap_or(self.dims);
        Ok(texts.iter().map(|t| toy_embedding(t, dims)).collect())
    }
}

/// In-memory vector index shared by ingestion and query flows.
#[derive(Default)]
pub struct StubVectorIndex {
    chunks: Mutex<Vec<RagChunk>>,
}

impl StubVectorIndex {
    pub fn len(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn chunk_ids(&self) -> Vec<String> {
        self.chunks.lock().iter().map(|c| c.id.clone()).collect()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl VectorIndexClient for StubVectorIndex {
    async fn upsert(&self, items: Vec<RagChunk>) -> Result<usize> {
        let mut chunks = self.chunks.lock();
        let count = items.len();
        for item in items {
            chunks.retain(|existing| existing.id != item.id);
            chunks.push(item);
        }
        Ok(count)
    }

    async fn query_vector(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        score_threshold: Option<f32>,
        _filters: Option<serde_json::Value>,
    ) -> Result<Vec<RagSearchResult>> {
        let chunks = self.chunks.lock();
        let mut scored: Vec<RagSearchResult> = chunks
            .iter()
            .filter_map(|chunk| {
                let embedding = chunk.embedding.as_ref()?;
                let score = cosine(&vector, embedding);
                if let Some(threshold) = score_threshold {
                    if score < threshold {
                        return None;
                    }
                }
                Some(RagSearchResult {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);
        Ok(scored)
    }
}

#[async_trait]
impl DocumentIndexClient for StubVectorIndex {
    async fn upsert(&self, items: Vec<RagChunk>) -> Result<usize> {
        VectorIndexClient::upsert(self, items).await
    }

    async fn query_text(
        &self,
        query: &str,
        max_results: usize,
        _search_fields: Option<Vec<String>>,
        _filters: Option<serde_json::Value>,
    ) -> Result<Vec<RagSearchResult>> {
        let chunks = self.chunks.lock();
        let mut hits: Vec<RagSearchResult> = chunks
            .iter()
            .filter(|chunk| chunk.content.contains(query))
            .map(|chunk| RagSearchResult {
                chunk: chunk.clone(),
                score: 1.0,
            })
            .collect();
        hits.truncate(max_results);
        Ok(hits)
    }
}

/// Document reader yielding a fixed document set.
pub struct StubReader {
    pub docs: Vec<RagDocument>,
}

#[async_trait]
impl DocumentReader for StubReader {
    async fn read(
        &self,
        _args: serde_json::Value,
    ) -> Result<BoxStream<'static, Result<RagDocument>>> {
        let docs: Vec<Result<RagDocument>> = self.docs.iter().cloned().map(Ok).collect();
        Ok(futures::stream::iter(docs).boxed())
    }
}

/// Native function stub registry.
pub struct StubFunction<F>(pub F);

#[async_trait]
impl<F> NativeFunction for StubFunction<F>
where
    F: Fn(serde_json::Value) -> Result<serde_json::Value> + Send + Sync,
{
    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value> {
        (self.0)(args)
    }
}

/// Provider factory wiring every stub together.
pub struct StubProviders {
    pub responder: Responder,
    pub delay: Option<Duration>,
    pub dims: usize,
    pub index: Arc<StubVectorIndex>,
    pub readers: HashMap<String, Vec<RagDocument>>,
    pub functions: HashMap<String, Arc<dyn NativeFunction>>,
}

impl StubProviders {
    pub fn new(responder: Responder) -> Self {
        Self {
            responder,
            delay: None,
            dims: 8,
            index: Arc::new(StubVectorIndex::default()),
            readers: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    pub fn fixed(text: &str) -> Self {
        Self::new(StubModel::fixed(text))
    }
}

impl ProviderFactory for StubProviders {
    fn model(&self, model: &ModelIr) -> Result<Arc<dyn ModelProvider>> {
        let mut stub = StubModel::new(Arc::clone(&self.responder));
        stub.dims = model.dimensions.unwrap_or(self.dims);
        if let Some(delay) = self.delay {
            stub = stub.with_delay(delay);
        }
        Ok(Arc::new(stub))
    }

    fn vector_index(&self, _index: &IndexIr) -> Result<Arc<dyn VectorIndexClient>> {
        Ok(Arc::clone(&self.index) as Arc<dyn VectorIndexClient>)
    }

    fn document_index(&self, _index: &IndexIr) -> Result<Arc<dyn DocumentIndexClient>> {
        Ok(Arc::clone(&self.index) as Arc<dyn DocumentIndexClient>)
    }

    fn native_function(
        &self,
        module_path: &str,
        function_name: &str,
    ) -> Result<Arc<dyn NativeFunction>> {
        let key = format!("{module_path}.{function_name}");
        self.functions
            .get(&key)
            .cloned()
            .ok_or_else(|| QTypeError::fatal(format!("no stub function '{key}'")))
    }

    fn document_reader(&self, reader_module: &str) -> Result<Arc<dyn DocumentReader>> {
        let docs = self
            .readers
            .get(reader_module)
            .cloned()
            .ok_or_else(|| QTypeError::fatal(format!("no stub reader '{reader_module}'")))?;
        Ok(Arc::new(StubReader { docs }))
    }
}
