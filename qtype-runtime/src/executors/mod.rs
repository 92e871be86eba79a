//! ABOUTME: Per-step executors implementing the stream contract
//! ABOUTME: One module per concern; the factory wires tags to constructors

pub mod condition;
pub mod construct;
pub mod decoder;
pub mod echo;
pub mod embedder;
pub mod extractor;
pub mod fanout;
pub mod index_ops;
pub mod inference;
pub mod invoke_flow;
pub mod reranker;
pub mod source;
pub mod splitter;
pub mod template;
pub mod tool;
