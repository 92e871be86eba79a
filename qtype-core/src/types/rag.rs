//! ABOUTME: Retrieval domain types for document ingestion and search
//! ABOUTME: Provides `RagDocument`, `RagChunk`, `RagSearchResult`, `Embedding`, and `AggregateStats`

use serde::{Deserialize, Serialize};

/// A source document entering an ingestion flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagDocument {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RagDocument {
    #[must_use]
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A chunk split from a parent document.
///
/// Retains the parent document id so downstream citation blocks can point
/// back at the source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagChunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    /// Position of the chunk within its parent document.
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl RagChunk {
    #[must_use]
    pub fn new(
        document_id: impl Into<String>,
        chunk_index: usize,
        content: impl Into<String>,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            id: format!("{document_id}#{chunk_index}"),
            document_id,
            content: content.into(),
            chunk_index,
            embedding: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// A scored search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RagSearchResult {
    pub chunk: RagChunk,
    pub score: f32,
}

/// An embedding vector with its source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub vector: Vec<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Embedding {
    #[must_use]
    pub fn new(vector: Vec<f32>) -> Self {
        Self {
            vector,
            source_text: None,
            metadata: None,
        }
    }

    /// Dimensionality of the vector.
    #[must_use]
    pub fn dimensions(&self) -> usize {
        self.vector.len()
    }
}

/// Terminal statistics emitted by an aggregating step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateStats {
    pub num_successful: usize,
    pub num_failed: usize,
    pub num_total: usize,
}

impl AggregateStats {
    /// Record one message outcome.
    pub fn record(&mut self, failed: bool) {
        self.num_total += 1;
        if failed {
            self.num_failed += 1;
        } else {
            self.num_successful += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_id_embeds_parent_and_index() {
        let chunk = RagChunk::new("doc-7", 3, "body");
        assert_eq!(chunk.id, "doc-7#3");
        assert_eq!(chunk.document_id, "doc-7");
    }

    #[test]
    fn stats_count_outcomes() {
        let mut stats = AggregateStats::default();
        stats.record(false);
        stats.record(false);
        stats.record(true);
        assert_eq!(stats.num_successful, 2);
        assert_eq!(stats.num_failed, 1);
        assert_eq!(stats.num_total, 3);
    }
}
