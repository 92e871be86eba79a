//! Sliding-window document chunking, one message per chunk.

use crate::context::RunContext;
use crate::executor::{FlowStream, StepExecutor};
use crate::message::FlowMessage;
use futures::{stream, StreamExt};
use qtype_core::{codes, RagChunk, RagDocument, Value};
use qtype_semantics::StepIr;
use std::sync::Arc;
use tracing::debug;

// Rough token estimate used across chunk sizing: four characters per token.
const CHARS_PER_TOKEN: usize = 4;

pub struct DocumentSplitterExecutor {
    step: Arc<StepIr>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl DocumentSplitterExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            step,
            chunk_size,
            chunk_overlap,
        }
    }

    /// Sliding window over character boundaries; every chunk retains the
    /// parent document id.
    fn split(&self, doc: &RagDocument) -> Vec<RagChunk> {
        let chars: Vec<char> = doc.content.chars().collect();
        if chars.is_empty() {
            return Vec::new();
        }
        let window = (self.chunk_size * CHARS_PER_TOKEN).max(1);
        let overlap = (self.chunk_overlap * CHARS_PER_TOKEN).min(window.saturating_sub(1));
        let stride = (window - overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0;
        let mut index = 0;
        while start < chars.len() {
            let end = (start + window).min(chars.len());
            let content: String = chars[start..end].iter().collect();
            let mut chunk = RagChunk::new(doc.id.clone(), index, content);
            chunk.metadata = doc.metadata.clone();
            chunks.push(chunk);
            if end == chars.len() {
                break;
            }
            start += stride;
            index += 1;
        }
        chunks
    }

    fn expand(&self, message: FlowMessage) -> Vec<FlowMessage> {
        if message.is_failed() {
            return vec![message];
        }
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return vec![message];
        };
        let Some(value) = message.get(&input.id) else {
            return vec![message.failed(
                codes::DECODE_ERROR,
                format!("input variable '{}' has no value", input.id),
                Some(&self.step.id),
            )];
        };
        let doc: RagDocument = match value.to_deserialize() {
            Ok(doc) => doc,
            Err(err) => {
                return vec![message.failed(
                    codes::DECODE_ERROR,
                    format!("'{}' is not a document: {err}", input.id),
                    Some(&self.step.id),
                )]
            }
        };
        let chunks = self.split(&doc);
        debug!(step = %self.step.id, doc = %doc.id, chunks = chunks.len(), "document split");
        chunks
            .into_iter()
            .map(|chunk| message.with_variable(output.id.clone(), Value::from_serialize(&chunk)))
            .collect()
    }
}

impl StepExecutor for DocumentSplitterExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, _ctx: Arc<RunContext>) -> FlowStream {
        input
            .flat_map(move |message| {
                let this = Arc::clone(&self);
                stream::iter(this.expand(message))
            })
            .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtype_dsl::document::steps::StepCardinality;
    use qtype_semantics::{StepKindIr, StreamCardinality};

    fn step() -> Arc<StepIr> {
        Arc::new(StepIr {
            id: "split".to_string(),
            kind: StepKindIr::DocumentSplitter {
                splitter_name: "sliding_window".to_string(),
                chunk_size: 8,
                chunk_overlap: 2,
            },
            inputs: vec![],
            outputs: vec![],
            cardinality: StepCardinality::OneToMany,
            input_stream: StreamCardinality::One,
            concurrency: None,
            batch_size: None,
        })
    }

    #[test]
    fn chunks_overlap_and_cover_the_document() {
        let executor = DocumentSplitterExecutor::new(step(), 8, 2);
        let doc = RagDocument::new("d1", "x".repeat(100));
        let chunks = executor.split(&doc);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].document_id, "d1");
        assert_eq!(chunks[0].chunk_index, 0);
        let covered: usize = chunks.iter().map(|c| c.content.len()).sum();
        assert!(covered >= 100);
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        let executor = DocumentSplitterExecutor::new(step(), 8, 2);
        assert!(executor.split(&RagDocument::new("d1", "")).is_empty());
    }
}
