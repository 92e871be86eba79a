//! ABOUTME: Provider factory seam and id-keyed client cache with TTL
//! ABOUTME: Model/index/tool clients are external; the cache amortizes construction

use dashmap::DashMap;
use qtype_core::traits::index::{DocumentIndexClient, VectorIndexClient};
use qtype_core::traits::model::ModelProvider;
use qtype_core::traits::tool::{DocumentReader, NativeFunction, SqlClient};
use qtype_core::{QTypeError, Result};
use qtype_semantics::{IndexIr, ModelIr};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Host-supplied construction of concrete clients.
///
/// The interpreter never talks to a provider SDK directly; everything goes
/// through the interfaces in `qtype-core`. Every method may be called from
/// multiple executors concurrently.
pub trait ProviderFactory: Send + Sync {
    fn model(&self, model: &ModelIr) -> Result<Arc<dyn ModelProvider>>;

    fn vector_index(&self, index: &IndexIr) -> Result<Arc<dyn VectorIndexClient>>;

    fn document_index(&self, index: &IndexIr) -> Result<Arc<dyn DocumentIndexClient>>;

    fn native_function(
        &self,
        module_path: &str,
        function_name: &str,
    ) -> Result<Arc<dyn NativeFunction>> {
        Err(QTypeError::fatal(format!(
            "no native function registered for {module_path}.{function_name}"
        )))
    }

    fn document_reader(&self, reader_module: &str) -> Result<Arc<dyn DocumentReader>> {
        Err(QTypeError::fatal(format!(
            "no document reader registered for '{reader_module}'"
        )))
    }

    fn sql_client(&self, connection: &str) -> Result<Arc<dyn SqlClient>> {
        Err(QTypeError::fatal(format!(
            "no SQL client registered for '{connection}'"
        )))
    }
}

struct CachedEntry<T: ?Sized> {
    client: Arc<T>,
    last_used: Instant,
}

/// Client cache keyed by entity id.
///
/// Entries expire `ttl` after last use; expiry is lazy, checked on access.
/// Concurrent requests for one id may race construction; the cache keeps
/// whichever lands last, which is harmless since clients are stateless
/// handles.
pub struct ClientCache {
    factory: Arc<dyn ProviderFactory>,
    ttl: Duration,
    models: DashMap<String, CachedEntry<dyn ModelProvider>>,
    vector_indexes: DashMap<String, CachedEntry<dyn VectorIndexClient>>,
    document_indexes: DashMap<String, CachedEntry<dyn DocumentIndexClient>>,
}

impl ClientCache {
    #[must_use]
    pub fn new(factory: Arc<dyn ProviderFactory>, ttl: Duration) -> Self {
        Self {
            factory,
            ttl,
            models: DashMap::new(),
            vector_indexes: DashMap::new(),
            document_indexes: DashMap::new(),
        }
    }

    pub fn model(&self, model: &ModelIr) -> Result<Arc<dyn ModelProvider>> {
        if let Some(mut entry) = self.models.get_mut(&model.id) {
            if entry.last_used.elapsed() < self.ttl {
                entry.last_used = Instant::now();
                return Ok(Arc::clone(&entry.client));
            }
        }
        let client = self.factory.model(model)?;
        self.models.insert(
            model.id.clone(),
            CachedEntry {
                client: Arc::clone(&client),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    pub fn vector_index(&self, index: &IndexIr) -> Result<Arc<dyn VectorIndexClient>> {
        if let Some(mut entry) = self.vector_indexes.get_mut(index.id()) {
            if entry.last_used.elapsed() < self.ttl {
                entry.last_used = Instant::now();
                return Ok(Arc::clone(&entry.client));
            }
        }
        let client = self.factory.vector_index(index)?;
        self.vector_indexes.insert(
            index.id().to_string(),
            CachedEntry {
                client: Arc::clone(&client),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    pub fn document_index(&self, index: &IndexIr) -> Result<Arc<dyn DocumentIndexClient>> {
        if let Some(mut entry) = self.document_indexes.get_mut(index.id()) {
            if entry.last_used.elapsed() < self.ttl {
                entry.last_used = Instant::now();
                return Ok(Arc::clone(&entry.client));
            }
        }
        let client = self.factory.document_index(index)?;
        self.document_indexes.insert(
            index.id().to_string(),
            CachedEntry {
                client: Arc::clone(&client),
                last_used: Instant::now(),
            },
        );
        Ok(client)
    }

    pub fn native_function(
        &self,
        module_path: &str,
        function_name: &str,
    ) -> Result<Arc<dyn NativeFunction>> {
        self.factory.native_function(module_path, function_name)
    }

    pub fn document_reader(&self, reader_module: &str) -> Result<Arc<dyn DocumentReader>> {
        self.factory.document_reader(reader_module)
    }

    pub fn sql_client(&self, connection: &str) -> Result<Arc<dyn SqlClient>> {
        self.factory.sql_client(connection)
    }
}
