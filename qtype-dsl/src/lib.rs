//! ABOUTME: Document processing front half of QType
//! ABOUTME: Loader (YAML + env + includes), typed document model, parser, and linker

pub mod document;
pub mod linker;
pub mod loader;
pub mod parser;
pub mod reference;
pub mod schema;
pub mod source_map;

pub use document::Application;
pub use linker::{link, LinkedDocument, SymbolTable};
pub use loader::{DocumentLoader, LoadedDocument};
pub use parser::parse;
pub use reference::Reference;
pub use source_map::SourceMap;

use qtype_core::Result;
use std::path::Path;

/// Load, parse, and link a document in one call.
///
/// Convenience entry point for hosts that do not need the intermediate
/// artifacts; each stage is also available on its own.
pub fn load_document(path: &Path) -> Result<LinkedDocument> {
    let loaded = DocumentLoader::new().load(path)?;
    let app = parse(&loaded).map_err(qtype_core::QTypeError::Parser)?;
    link(app, &loaded.source_map).map_err(qtype_core::QTypeError::Link)
}
