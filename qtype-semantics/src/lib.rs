//! ABOUTME: Semantic analysis for QType documents
//! ABOUTME: Enforces flow invariants and produces the immutable Semantic IR

pub mod checker;
pub mod ir;
pub mod jsonpath;

pub use checker::{check, Checked};
pub use ir::{
    CustomTypeIr, FlowIr, FlowSignature, IndexIr, MemoryIr, ModelIr, SemanticIr, StepIr,
    StepKindIr, StreamCardinality, ToolIr, VariableIr,
};
pub use jsonpath::JsonPath;
