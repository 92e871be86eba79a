//! ABOUTME: Vector and document index interfaces
//! ABOUTME: Store client implementations live outside the core

use crate::error::Result;
use crate::types::rag::{RagChunk, RagSearchResult};
use async_trait::async_trait;

/// Client for a vector store.
#[async_trait]
pub trait VectorIndexClient: Send + Sync {
    /// Insert or replace chunks. Chunks carry their embeddings.
    /// Returns the number of items written.
    async fn upsert(&self, items: Vec<RagChunk>) -> Result<usize>;

    /// Nearest-neighbor query.
    async fn query_vector(
        &self,
        vector: Vec<f32>,
        top_k: usize,
        score_threshold: Option<f32>,
        filters: Option<serde_json::Value>,
    ) -> Result<Vec<RagSearchResult>>;
}

/// Client for a text/document store.
#[async_trait]
pub trait DocumentIndexClient: Send + Sync {
    /// Insert or replace chunks by id.
    async fn upsert(&self, items: Vec<RagChunk>) -> Result<usize>;

    /// Full-text query.
    async fn query_text(
        &self,
        query: &str,
        max_results: usize,
        search_fields: Option<Vec<String>>,
        filters: Option<serde_json::Value>,
    ) -> Result<Vec<RagSearchResult>>;
}
