//! ABOUTME: Immutable Semantic IR consumed by the interpreter
//! ABOUTME: Entities are deduplicated behind Arc; references are owning pointers

use crate::jsonpath::JsonPath;
use indexmap::IndexMap;
use qtype_dsl::document::steps::{DecoderFormat, Reduction, StepCardinality};
use qtype_dsl::document::{AuthProviderDef, FlowInterface, TelemetrySinkDef};
use qtype_core::TypeRef;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Effective stream cardinality at a step's input edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamCardinality {
    /// Exactly one capsule flows through the edge per invocation.
    One,
    /// The edge carries a fan-out stream.
    Many,
}

/// A resolved model. Generative and embedding variants share one record;
/// `dimensions` is present only for embedding models.
#[derive(Debug, Clone)]
pub struct ModelIr {
    pub id: String,
    pub provider: String,
    pub provider_model_id: String,
    pub inference_params: serde_json::Map<String, serde_json::Value>,
    pub auth: Option<Arc<AuthProviderDef>>,
    pub dimensions: Option<usize>,
}

/// A resolved memory configuration.
#[derive(Debug, Clone)]
pub struct MemoryIr {
    pub id: String,
    pub token_limit: usize,
    pub chat_history_token_ratio: f64,
    pub token_flush_size: usize,
}

/// A resolved tool.
#[derive(Debug, Clone)]
pub enum ToolIr {
    Api {
        id: String,
        name: String,
        description: String,
        inputs: IndexMap<String, TypeRef>,
        outputs: IndexMap<String, TypeRef>,
        endpoint: String,
        method: String,
        headers: IndexMap<String, String>,
        auth: Option<Arc<AuthProviderDef>>,
    },
    Function {
        id: String,
        name: String,
        description: String,
        inputs: IndexMap<String, TypeRef>,
        outputs: IndexMap<String, TypeRef>,
        module_path: String,
        function_name: String,
    },
}

impl ToolIr {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Api { id, .. } | Self::Function { id, .. } => id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Api { name, .. } | Self::Function { name, .. } => name,
        }
    }

    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::Api { description, .. } | Self::Function { description, .. } => description,
        }
    }

    #[must_use]
    pub fn inputs(&self) -> &IndexMap<String, TypeRef> {
        match self {
            Self::Api { inputs, .. } | Self::Function { inputs, .. } => inputs,
        }
    }

    #[must_use]
    pub fn outputs(&self) -> &IndexMap<String, TypeRef> {
        match self {
            Self::Api { outputs, .. } | Self::Function { outputs, .. } => outputs,
        }
    }
}

/// A resolved index.
#[derive(Debug, Clone)]
pub enum IndexIr {
    Vector {
        id: String,
        name: String,
        embedding_model: Arc<ModelIr>,
        auth: Option<Arc<AuthProviderDef>>,
        args: serde_json::Map<String, serde_json::Value>,
    },
    Document {
        id: String,
        name: String,
        auth: Option<Arc<AuthProviderDef>>,
        args: serde_json::Map<String, serde_json::Value>,
    },
}

impl IndexIr {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Vector { id, .. } | Self::Document { id, .. } => id,
        }
    }
}

/// A resolved custom type.
#[derive(Debug, Clone)]
pub enum CustomTypeIr {
    Object {
        id: String,
        fields: IndexMap<String, TypeRef>,
    },
    Array {
        id: String,
        element: TypeRef,
    },
}

impl CustomTypeIr {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Object { id, .. } | Self::Array { id, .. } => id,
        }
    }
}

/// A resolved flow variable. The type has the `optional` flag folded in.
#[derive(Debug, Clone)]
pub struct VariableIr {
    pub id: String,
    pub ty: TypeRef,
    pub ui_hint: Option<String>,
}

/// Variant-specific step configuration.
#[derive(Debug, Clone)]
pub enum StepKindIr {
    LlmInference {
        model: Arc<ModelIr>,
        memory: Option<Arc<MemoryIr>>,
        system_message: Option<String>,
    },
    Agent {
        model: Arc<ModelIr>,
        memory: Option<Arc<MemoryIr>>,
        system_message: Option<String>,
        tools: Vec<Arc<ToolIr>>,
        max_iterations: Option<usize>,
    },
    PromptTemplate {
        template: String,
    },
    InvokeTool {
        tool: Arc<ToolIr>,
        input_bindings: BTreeMap<String, String>,
        output_bindings: BTreeMap<String, String>,
    },
    InvokeFlow {
        flow: Arc<FlowIr>,
        input_bindings: BTreeMap<String, String>,
        output_bindings: BTreeMap<String, String>,
    },
    Condition {
        equals: Arc<VariableIr>,
        then: Arc<StepIr>,
        otherwise: Option<Arc<StepIr>>,
    },
    FileSource {
        path: PathBuf,
    },
    SqlSource {
        connection: String,
        query: String,
        auth: Option<Arc<AuthProviderDef>>,
    },
    DocumentSource {
        reader_module: String,
        args: serde_json::Value,
        loader_args: Option<serde_json::Value>,
    },
    DocumentSplitter {
        splitter_name: String,
        chunk_size: usize,
        chunk_overlap: usize,
    },
    DocumentEmbedder {
        model: Arc<ModelIr>,
    },
    VectorSearch {
        index: Arc<IndexIr>,
        top_k: usize,
        score_threshold: Option<f32>,
    },
    DocumentSearch {
        index: Arc<IndexIr>,
        max_results: usize,
        search_fields: Option<Vec<String>>,
        filters: Option<serde_json::Value>,
    },
    IndexUpsert {
        index: Arc<IndexIr>,
    },
    Reranker {
        model: Arc<ModelIr>,
        top_n: usize,
    },
    Aggregate {
        reductions: BTreeMap<String, Reduction>,
    },
    Explode,
    Collect,
    FieldExtractor {
        path: JsonPath,
    },
    Construct {
        ty: Arc<CustomTypeIr>,
        field_bindings: BTreeMap<String, String>,
    },
    Decoder {
        format: DecoderFormat,
        schema: Option<serde_json::Value>,
        strict_mode: bool,
        fallback: Option<serde_json::Value>,
        delimiter: char,
        has_headers: bool,
        pattern: Option<String>,
    },
    Echo {
        delay_ms: Option<u64>,
    },
}

/// A fully resolved step.
#[derive(Debug, Clone)]
pub struct StepIr {
    pub id: String,
    pub kind: StepKindIr,
    pub inputs: Vec<Arc<VariableIr>>,
    pub outputs: Vec<Arc<VariableIr>>,
    pub cardinality: StepCardinality,
    /// Effective stream cardinality at the step's input edge.
    pub input_stream: StreamCardinality,
    pub concurrency: Option<usize>,
    pub batch_size: Option<usize>,
}

impl StepIr {
    /// Tag used by the executor registry.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match &self.kind {
            StepKindIr::LlmInference { .. } => "LLMInference",
            StepKindIr::Agent { .. } => "Agent",
            StepKindIr::PromptTemplate { .. } => "PromptTemplate",
            StepKindIr::InvokeTool { .. } => "InvokeTool",
            StepKindIr::InvokeFlow { .. } => "InvokeFlow",
            StepKindIr::Condition { .. } => "Condition",
            StepKindIr::FileSource { .. } => "FileSource",
            StepKindIr::SqlSource { .. } => "SQLSource",
            StepKindIr::DocumentSource { .. } => "DocumentSource",
            StepKindIr::DocumentSplitter { .. } => "DocumentSplitter",
            StepKindIr::DocumentEmbedder { .. } => "DocumentEmbedder",
            StepKindIr::VectorSearch { .. } => "VectorSearch",
            StepKindIr::DocumentSearch { .. } => "DocumentSearch",
            StepKindIr::IndexUpsert { .. } => "IndexUpsert",
            StepKindIr::Reranker { .. } => "Reranker",
            StepKindIr::Aggregate { .. } => "Aggregate",
            StepKindIr::Explode => "Explode",
            StepKindIr::Collect => "Collect",
            StepKindIr::FieldExtractor { .. } => "FieldExtractor",
            StepKindIr::Construct { .. } => "Construct",
            StepKindIr::Decoder { .. } => "Decoder",
            StepKindIr::Echo { .. } => "Echo",
        }
    }
}

/// A fully resolved flow with steps in topological order.
#[derive(Debug, Clone)]
pub struct FlowIr {
    pub id: String,
    pub description: Option<String>,
    pub interface: FlowInterface,
    pub variables: BTreeMap<String, Arc<VariableIr>>,
    pub inputs: Vec<Arc<VariableIr>>,
    pub outputs: Vec<Arc<VariableIr>>,
    pub session_inputs: Vec<Arc<VariableIr>>,
    pub steps: Vec<Arc<StepIr>>,
    /// True for conversational flows whose inference steps use a memory.
    pub stateful: bool,
}

impl FlowIr {
    #[must_use]
    pub fn variable(&self, id: &str) -> Option<&Arc<VariableIr>> {
        self.variables.get(id)
    }
}

/// Signature of a flow, for host introspection.
#[derive(Debug, Clone)]
pub struct FlowSignature {
    pub id: String,
    pub interface: FlowInterface,
    pub inputs: Vec<(String, TypeRef)>,
    pub outputs: Vec<(String, TypeRef)>,
}

/// The immutable, fully resolved application.
///
/// Shared by reference across every executor; the interpreter never writes
/// to IR nodes. Entities exist exactly once — every reference inside steps
/// points at the same `Arc` as the application tables.
#[derive(Debug, Clone)]
pub struct SemanticIr {
    pub app_id: String,
    pub description: Option<String>,
    pub types: BTreeMap<String, Arc<CustomTypeIr>>,
    pub models: BTreeMap<String, Arc<ModelIr>>,
    pub memories: BTreeMap<String, Arc<MemoryIr>>,
    pub auths: BTreeMap<String, Arc<AuthProviderDef>>,
    pub tools: BTreeMap<String, Arc<ToolIr>>,
    pub indexes: BTreeMap<String, Arc<IndexIr>>,
    pub telemetry: Option<TelemetrySinkDef>,
    pub flows: BTreeMap<String, Arc<FlowIr>>,
}

impl SemanticIr {
    #[must_use]
    pub fn flow(&self, id: &str) -> Option<&Arc<FlowIr>> {
        self.flows.get(id)
    }

    /// Signatures of every flow, for embedding hosts.
    #[must_use]
    pub fn flow_signatures(&self) -> Vec<FlowSignature> {
        self.flows
            .values()
            .map(|flow| FlowSignature {
                id: flow.id.clone(),
                interface: flow.interface,
                inputs: flow
                    .inputs
                    .iter()
                    .map(|v| (v.id.clone(), v.ty.clone()))
                    .collect(),
                outputs: flow
                    .outputs
                    .iter()
                    .map(|v| (v.id.clone(), v.ty.clone()))
                    .collect(),
            })
            .collect()
    }
}
