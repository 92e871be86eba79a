//! ABOUTME: Native function, SQL, and document reader interfaces
//! ABOUTME: Resolved callables handed to the interpreter by the embedding host

use crate::error::Result;
use crate::types::rag::RagDocument;
use crate::types::Value;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeMap;

/// A resolved native function tool.
///
/// The host resolves `module_path`/`function_name` to one of these; the
/// interpreter validates arguments against the tool's declared inputs before
/// dispatch.
#[async_trait]
pub trait NativeFunction: Send + Sync {
    async fn invoke(&self, args: serde_json::Value) -> Result<serde_json::Value>;
}

/// A resolved document reader backing a `DocumentSource` step.
#[async_trait]
pub trait DocumentReader: Send + Sync {
    /// Stream documents produced by the reader.
    async fn read(&self, args: serde_json::Value) -> Result<BoxStream<'static, Result<RagDocument>>>;
}

/// A SQL connection backing a `SQLSource` step.
///
/// Rows come back as column-name keyed value maps.
#[async_trait]
pub trait SqlClient: Send + Sync {
    async fn query(&self, query: &str) -> Result<Vec<BTreeMap<String, Value>>>;
}
