//! ABOUTME: Polymorphic step definitions discriminated by `type`
//! ABOUTME: Closed set of variants with shared id/inputs/outputs contract

use crate::document::{AuthProviderDef, FlowDef, IndexDef, MemoryDef, ModelDef, ToolDef};
use crate::reference::Reference;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Stream-cardinality class of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepCardinality {
    /// 0 → N; origin of a stream.
    Source,
    /// 1 → 1.
    OneToOne,
    /// 1 → N; opens fan-out.
    OneToMany,
    /// N → 1; terminates fan-out.
    ManyToOne,
}

/// Fields shared by every step variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepCommon {
    pub id: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Maximum in-flight messages inside the executor; runtime default 5.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    /// Batch accumulation size for batch-capable steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

impl StepCommon {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Language-model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmInferenceStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub model: Reference<ModelDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Reference<MemoryDef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_message: Option<String>,
}

/// LLM call with tools exposed and the tool-call cycle handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStep {
    #[serde(flatten)]
    pub inference: LlmInferenceStep,
    #[serde(default)]
    pub tools: Vec<Reference<ToolDef>>,
    /// Tool-call round bound; runtime default 8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
}

/// Placeholder substitution producing a prompt string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplateStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub template: String,
}

/// Explicit tool invocation with parameter bindings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeToolStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub tool: Reference<ToolDef>,
    /// Tool parameter name → flow variable id.
    #[serde(default)]
    pub input_bindings: BTreeMap<String, String>,
    /// Tool output name → flow variable id.
    #[serde(default)]
    pub output_bindings: BTreeMap<String, String>,
}

/// Run another flow as a sub-pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeFlowStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub flow: Reference<FlowDef>,
    /// Inner flow input id → outer flow variable id.
    #[serde(default)]
    pub input_bindings: BTreeMap<String, String>,
    /// Inner flow output id → outer flow variable id.
    #[serde(default)]
    pub output_bindings: BTreeMap<String, String>,
}

/// Route a message between two inline steps on value equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionStep {
    #[serde(flatten)]
    pub common: StepCommon,
    /// Variable whose value is compared against the step input.
    pub equals: String,
    pub then: Box<StepDef>,
    #[serde(default, rename = "else", skip_serializing_if = "Option::is_none")]
    pub otherwise: Option<Box<StepDef>>,
}

/// Emit one message per row of a tabular file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSourceStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub path: PathBuf,
}

/// Emit one message per row of a SQL query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlSourceStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub connection: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
}

/// Emit one message per document from a host-resolved reader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSourceStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub reader_module: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loader_args: Option<serde_json::Value>,
}

/// Split one document into overlapping chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSplitterStep {
    #[serde(flatten)]
    pub common: StepCommon,
    #[serde(default = "DocumentSplitterStep::default_splitter_name")]
    pub splitter_name: String,
    #[serde(default = "DocumentSplitterStep::default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "DocumentSplitterStep::default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl DocumentSplitterStep {
    fn default_splitter_name() -> String {
        "sliding_window".to_string()
    }

    fn default_chunk_size() -> usize {
        512
    }

    fn default_chunk_overlap() -> usize {
        50
    }
}

/// Attach embeddings to chunks via an embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentEmbedderStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub model: Reference<ModelDef>,
}

/// Nearest-neighbor query against a vector index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSearchStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub index: Reference<IndexDef>,
    #[serde(default = "VectorSearchStep::default_top_k")]
    pub default_top_k: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score_threshold: Option<f32>,
}

impl VectorSearchStep {
    fn default_top_k() -> usize {
        5
    }
}

/// Full-text query against a document index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSearchStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub index: Reference<IndexDef>,
    #[serde(default = "DocumentSearchStep::default_max_results")]
    pub max_results: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<serde_json::Value>,
}

impl DocumentSearchStep {
    fn default_max_results() -> usize {
        10
    }
}

/// Write chunks into an index, batched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexUpsertStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub index: Reference<IndexDef>,
}

/// Re-score search results with a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankerStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub model: Reference<ModelDef>,
    pub top_n: usize,
}

/// Reduction applied by an aggregate step in addition to its stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReductionOp {
    Count,
    Sum,
    Collect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reduction {
    pub op: ReductionOp,
    /// Input variable the reduction reads.
    pub over: String,
}

/// Consume the whole stream, emit one stats capsule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateStep {
    #[serde(flatten)]
    pub common: StepCommon,
    /// Output variable id → reduction, beyond the implicit stats output.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub reductions: BTreeMap<String, Reduction>,
}

/// Fan a list variable out into one message per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplodeStep {
    #[serde(flatten)]
    pub common: StepCommon,
}

/// Fan messages back in, gathering a scalar into a list variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectStep {
    #[serde(flatten)]
    pub common: StepCommon,
}

/// Project a value out of a structured variable with a JSONPath.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldExtractorStep {
    #[serde(flatten)]
    pub common: StepCommon,
    pub json_path: String,
}

/// Build a custom-typed value from named inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructStep {
    #[serde(flatten)]
    pub common: StepCommon,
    /// Custom type to build.
    pub custom_type: String,
    /// Field name → input variable id; unlisted fields bind to the input of
    /// the same name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_bindings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderFormat {
    #[default]
    Json,
    Xml,
    Csv,
    Custom,
}

/// Parse a text variable into structured form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderStep {
    #[serde(flatten)]
    pub common: StepCommon,
    #[serde(default)]
    pub format: DecoderFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default)]
    pub strict_mode: bool,
    /// Value substituted when lenient decoding fails outright.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<serde_json::Value>,
    /// csv only: field delimiter.
    #[serde(default = "DecoderStep::default_delimiter")]
    pub delimiter: char,
    /// csv only: first row is a header.
    #[serde(default = "DecoderStep::default_has_headers")]
    pub has_headers: bool,
    /// custom only: regex with named capture groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl DecoderStep {
    fn default_delimiter() -> char {
        ','
    }

    fn default_has_headers() -> bool {
        true
    }
}

/// Identity step; forwards inputs as outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoStep {
    #[serde(flatten)]
    pub common: StepCommon,
    /// Artificial per-message delay, used to exercise cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

/// Closed set of step variants, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StepDef {
    LLMInference(LlmInferenceStep),
    Agent(AgentStep),
    PromptTemplate(PromptTemplateStep),
    InvokeTool(InvokeToolStep),
    InvokeFlow(InvokeFlowStep),
    Condition(ConditionStep),
    FileSource(FileSourceStep),
    SQLSource(SqlSourceStep),
    DocumentSource(DocumentSourceStep),
    DocumentSplitter(DocumentSplitterStep),
    DocumentEmbedder(DocumentEmbedderStep),
    VectorSearch(VectorSearchStep),
    DocumentSearch(DocumentSearchStep),
    IndexUpsert(IndexUpsertStep),
    Reranker(RerankerStep),
    Aggregate(AggregateStep),
    Explode(ExplodeStep),
    Collect(CollectStep),
    FieldExtractor(FieldExtractorStep),
    Construct(ConstructStep),
    Decoder(DecoderStep),
    Echo(EchoStep),
}

impl StepDef {
    /// Shared fields of the step.
    #[must_use]
    pub fn common(&self) -> &StepCommon {
        match self {
            Self::LLMInference(s) => &s.common,
            Self::Agent(s) => &s.inference.common,
            Self::PromptTemplate(s) => &s.common,
            Self::InvokeTool(s) => &s.common,
            Self::InvokeFlow(s) => &s.common,
            Self::Condition(s) => &s.common,
            Self::FileSource(s) => &s.common,
            Self::SQLSource(s) => &s.common,
            Self::DocumentSource(s) => &s.common,
            Self::DocumentSplitter(s) => &s.common,
            Self::DocumentEmbedder(s) => &s.common,
            Self::VectorSearch(s) => &s.common,
            Self::DocumentSearch(s) => &s.common,
            Self::IndexUpsert(s) => &s.common,
            Self::Reranker(s) => &s.common,
            Self::Aggregate(s) => &s.common,
            Self::Explode(s) => &s.common,
            Self::Collect(s) => &s.common,
            Self::FieldExtractor(s) => &s.common,
            Self::Construct(s) => &s.common,
            Self::Decoder(s) => &s.common,
            Self::Echo(s) => &s.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut StepCommon {
        match self {
            Self::LLMInference(s) => &mut s.common,
            Self::Agent(s) => &mut s.inference.common,
            Self::PromptTemplate(s) => &mut s.common,
            Self::InvokeTool(s) => &mut s.common,
            Self::InvokeFlow(s) => &mut s.common,
            Self::Condition(s) => &mut s.common,
            Self::FileSource(s) => &mut s.common,
            Self::SQLSource(s) => &mut s.common,
            Self::DocumentSource(s) => &mut s.common,
            Self::DocumentSplitter(s) => &mut s.common,
            Self::DocumentEmbedder(s) => &mut s.common,
            Self::VectorSearch(s) => &mut s.common,
            Self::DocumentSearch(s) => &mut s.common,
            Self::IndexUpsert(s) => &mut s.common,
            Self::Reranker(s) => &mut s.common,
            Self::Aggregate(s) => &mut s.common,
            Self::Explode(s) => &mut s.common,
            Self::Collect(s) => &mut s.common,
            Self::FieldExtractor(s) => &mut s.common,
            Self::Construct(s) => &mut s.common,
            Self::Decoder(s) => &mut s.common,
            Self::Echo(s) => &mut s.common,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.common().id
    }

    /// The discriminator tag, as written in documents.
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::LLMInference(_) => "LLMInference",
            Self::Agent(_) => "Agent",
            Self::PromptTemplate(_) => "PromptTemplate",
            Self::InvokeTool(_) => "InvokeTool",
            Self::InvokeFlow(_) => "InvokeFlow",
            Self::Condition(_) => "Condition",
            Self::FileSource(_) => "FileSource",
            Self::SQLSource(_) => "SQLSource",
            Self::DocumentSource(_) => "DocumentSource",
            Self::DocumentSplitter(_) => "DocumentSplitter",
            Self::DocumentEmbedder(_) => "DocumentEmbedder",
            Self::VectorSearch(_) => "VectorSearch",
            Self::DocumentSearch(_) => "DocumentSearch",
            Self::IndexUpsert(_) => "IndexUpsert",
            Self::Reranker(_) => "Reranker",
            Self::Aggregate(_) => "Aggregate",
            Self::Explode(_) => "Explode",
            Self::Collect(_) => "Collect",
            Self::FieldExtractor(_) => "FieldExtractor",
            Self::Construct(_) => "Construct",
            Self::Decoder(_) => "Decoder",
            Self::Echo(_) => "Echo",
        }
    }

    /// Stream-cardinality class of the variant.
    #[must_use]
    pub fn cardinality(&self) -> StepCardinality {
        match self {
            Self::FileSource(_) | Self::SQLSource(_) | Self::DocumentSource(_) => {
                StepCardinality::Source
            }
            Self::DocumentSplitter(_) | Self::Explode(_) => StepCardinality::OneToMany,
            Self::Aggregate(_) | Self::Collect(_) => StepCardinality::ManyToOne,
            _ => StepCardinality::OneToOne,
        }
    }

    /// Whether the step only causes side effects.
    #[must_use]
    pub fn is_sink(&self) -> bool {
        matches!(self, Self::IndexUpsert(_))
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_discriminators_parse() {
        let yaml = r"
type: PromptTemplate
id: make_prompt
inputs: [text, lang]
outputs: [make_prompt.prompt]
template: Translate '{text}' to {lang}
";
        let step: StepDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(step.id(), "make_prompt");
        assert_eq!(step.tag(), "PromptTemplate");
        assert_eq!(step.cardinality(), StepCardinality::OneToOne);
    }

    #[test]
    fn unknown_discriminator_is_rejected() {
        let err = serde_yaml::from_str::<StepDef>("type: Frobnicate\nid: x\n").unwrap_err();
        assert!(err.to_string().contains("unknown variant"));
    }

    #[test]
    fn condition_nests_inline_steps() {
        let yaml = r"
type: Condition
id: route
inputs: [answer]
equals: expected
then:
  type: Echo
  id: route.then
  inputs: [answer]
  outputs: [answer]
";
        let step: StepDef = serde_yaml::from_str(yaml).unwrap();
        match step {
            StepDef::Condition(cond) => {
                assert_eq!(cond.then.id(), "route.then");
                assert!(cond.otherwise.is_none());
            }
            other => panic!("unexpected step: {}", other.tag()),
        }
    }

    #[test]
    fn cardinality_classes() {
        let source: StepDef =
            serde_yaml::from_str("type: FileSource\nid: rows\npath: data.csv\n").unwrap();
        assert_eq!(source.cardinality(), StepCardinality::Source);

        let aggregate: StepDef = serde_yaml::from_str("type: Aggregate\nid: agg\n").unwrap();
        assert_eq!(aggregate.cardinality(), StepCardinality::ManyToOne);

        let explode: StepDef = serde_yaml::from_str("type: Explode\nid: fan\n").unwrap();
        assert_eq!(explode.cardinality(), StepCardinality::OneToMany);
    }
}
