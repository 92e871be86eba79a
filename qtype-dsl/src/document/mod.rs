//! ABOUTME: Typed document model for QType applications
//! ABOUTME: Discriminated entity variants with defaults materialized at parse time

pub mod steps;

pub use steps::{StepCardinality, StepCommon, StepDef};

use crate::reference::Reference;
use indexmap::IndexMap;
use qtype_core::traits::secret::SecretValue;
use qtype_core::TypeRef;
use serde::{Deserialize, Serialize};

/// Root container of a QType document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Application {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Other documents merged into this one's entity space, typically pulled
    /// in with `!include`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<Application>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<CustomTypeDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<VariableDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<ModelDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub memories: Vec<MemoryDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub auths: Vec<AuthProviderDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetrySinkDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub flows: Vec<FlowDef>,
}

/// A typed slot carrying a single value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableDef {
    pub id: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_hint: Option<String>,
}

impl VariableDef {
    #[must_use]
    pub fn new(id: impl Into<String>, ty: TypeRef) -> Self {
        Self {
            id: id.into(),
            ty,
            optional: false,
            ui_hint: None,
        }
    }

    /// Declared type with the `optional` flag folded in.
    #[must_use]
    pub fn effective_type(&self) -> TypeRef {
        if self.optional {
            TypeRef::optional(self.ty.clone())
        } else {
            self.ty.clone()
        }
    }
}

/// Model variants, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ModelDef {
    Model(GenerativeModelDef),
    EmbeddingModel(EmbeddingModelDef),
}

impl ModelDef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Model(m) => &m.id,
            Self::EmbeddingModel(m) => &m.id,
        }
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Model(m) => &m.provider,
            Self::EmbeddingModel(m) => &m.provider,
        }
    }

    /// Identifier sent to the provider, falling back to the entity id.
    #[must_use]
    pub fn provider_model_id(&self) -> &str {
        let (explicit, id) = match self {
            Self::Model(m) => (m.provider_model_id.as_deref(), m.id.as_str()),
            Self::EmbeddingModel(m) => (m.provider_model_id.as_deref(), m.id.as_str()),
        };
        explicit.unwrap_or(id)
    }

    #[must_use]
    pub fn auth(&self) -> Option<&Reference<AuthProviderDef>> {
        match self {
            Self::Model(m) => m.auth.as_ref(),
            Self::EmbeddingModel(m) => m.auth.as_ref(),
        }
    }

    pub fn auth_mut(&mut self) -> Option<&mut Reference<AuthProviderDef>> {
        match self {
            Self::Model(m) => m.auth.as_mut(),
            Self::EmbeddingModel(m) => m.auth.as_mut(),
        }
    }

    /// Embedding width, for embedding models.
    #[must_use]
    pub fn dimensions(&self) -> Option<usize> {
        match self {
            Self::Model(_) => None,
            Self::EmbeddingModel(m) => Some(m.dimensions),
        }
    }
}

/// A generative (chat/completion) model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerativeModelDef {
    #[serde(default)]
    pub id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_model_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub inference_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
}

/// An embedding model; adds the vector width.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModelDef {
    #[serde(default)]
    pub id: String,
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_model_id: Option<String>,
    pub dimensions: usize,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub inference_params: serde_json::Map<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
}

/// Per-session chat history store with token budgeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryDef {
    #[serde(default)]
    pub id: String,
    #[serde(default = "MemoryDef::default_token_limit")]
    pub token_limit: usize,
    #[serde(default = "MemoryDef::default_chat_history_token_ratio")]
    pub chat_history_token_ratio: f64,
    #[serde(default = "MemoryDef::default_token_flush_size")]
    pub token_flush_size: usize,
}

impl MemoryDef {
    fn default_token_limit() -> usize {
        100_000
    }

    fn default_chat_history_token_ratio() -> f64 {
        0.7
    }

    fn default_token_flush_size() -> usize {
        3000
    }
}

impl Default for MemoryDef {
    fn default() -> Self {
        Self {
            id: String::new(),
            token_limit: Self::default_token_limit(),
            chat_history_token_ratio: Self::default_chat_history_token_ratio(),
            token_flush_size: Self::default_token_flush_size(),
        }
    }
}

/// Authorization provider variants, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthProviderDef {
    ApiKey {
        #[serde(default)]
        id: String,
        api_key: SecretValue,
        /// Header carrying the key; defaults to `Authorization`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
    },
    Bearer {
        #[serde(default)]
        id: String,
        token: SecretValue,
    },
    Oauth2 {
        #[serde(default)]
        id: String,
        client_id: SecretValue,
        client_secret: SecretValue,
        token_url: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
    },
    Aws {
        #[serde(default)]
        id: String,
        access_key_id: SecretValue,
        secret_access_key: SecretValue,
        region: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<SecretValue>,
    },
}

impl AuthProviderDef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::ApiKey { id, .. }
            | Self::Bearer { id, .. }
            | Self::Oauth2 { id, .. }
            | Self::Aws { id, .. } => id,
        }
    }
}

/// Tool variants, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolDef {
    Api(ApiToolDef),
    Function(FunctionToolDef),
}

impl ToolDef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Api(t) => &t.id,
            Self::Function(t) => &t.id,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Api(t) => &t.name,
            Self::Function(t) => &t.name,
        }
    }

    #[must_use]
    pub fn description(&self) -> &str {
        match self {
            Self::Api(t) => &t.description,
            Self::Function(t) => &t.description,
        }
    }

    #[must_use]
    pub fn inputs(&self) -> &IndexMap<String, TypeRef> {
        match self {
            Self::Api(t) => &t.inputs,
            Self::Function(t) => &t.inputs,
        }
    }

    #[must_use]
    pub fn outputs(&self) -> &IndexMap<String, TypeRef> {
        match self {
            Self::Api(t) => &t.outputs,
            Self::Function(t) => &t.outputs,
        }
    }
}

/// An HTTP-backed tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiToolDef {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: IndexMap<String, TypeRef>,
    #[serde(default)]
    pub outputs: IndexMap<String, TypeRef>,
    pub endpoint: String,
    #[serde(default = "ApiToolDef::default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub headers: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
}

impl ApiToolDef {
    fn default_method() -> String {
        "POST".to_string()
    }
}

/// A tool backed by a host-resolved native function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionToolDef {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: IndexMap<String, TypeRef>,
    #[serde(default)]
    pub outputs: IndexMap<String, TypeRef>,
    pub module_path: String,
    pub function_name: String,
}

/// Index variants, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexDef {
    Vector(VectorIndexDef),
    Document(DocumentIndexDef),
}

impl IndexDef {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Vector(i) => &i.id,
            Self::Document(i) => &i.id,
        }
    }

    #[must_use]
    pub fn auth(&self) -> Option<&Reference<AuthProviderDef>> {
        match self {
            Self::Vector(i) => i.auth.as_ref(),
            Self::Document(i) => i.auth.as_ref(),
        }
    }

    pub fn auth_mut(&mut self) -> Option<&mut Reference<AuthProviderDef>> {
        match self {
            Self::Vector(i) => i.auth.as_mut(),
            Self::Document(i) => i.auth.as_mut(),
        }
    }
}

/// A vector store index. Requires the embedding model that produced its
/// vectors so dimension agreement can be checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexDef {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub embedding_model: Reference<ModelDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// A text/document store index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentIndexDef {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Custom type definitions: object (ordered fields) or array (element type).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomTypeDef {
    pub id: String,
    #[serde(flatten)]
    pub shape: CustomTypeShape,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CustomTypeShape {
    Object { fields: IndexMap<String, TypeRef> },
    Array { element: TypeRef },
}

/// Telemetry sink endpoint; at most one per application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySinkDef {
    pub id: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<Reference<AuthProviderDef>>,
}

/// Hosting contract of a flow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowInterface {
    #[default]
    Complete,
    Conversational,
}

/// An ordered set of steps with declared inputs and outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub interface: FlowInterface,
    #[serde(default)]
    pub variables: Vec<VariableDef>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Variables persisted across conversational turns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub session_inputs: Vec<String>,
    #[serde(default)]
    pub steps: Vec<StepDef>,
}

impl FlowDef {
    /// Declared variable by id.
    #[must_use]
    pub fn variable(&self, id: &str) -> Option<&VariableDef> {
        self.variables.iter().find(|v| v.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtype_core::PrimitiveKind;

    #[test]
    fn model_discriminator_round_trip() {
        let yaml = "type: Model\nid: gpt4\nprovider: openai\n";
        let model: ModelDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(model.id(), "gpt4");
        assert_eq!(model.provider_model_id(), "gpt4");
        assert!(model.dimensions().is_none());
    }

    #[test]
    fn embedding_model_requires_dimensions() {
        let yaml = "type: EmbeddingModel\nid: embedder\nprovider: openai\ndimensions: 1536\n";
        let model: ModelDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(model.dimensions(), Some(1536));
        assert!(serde_yaml::from_str::<ModelDef>(
            "type: EmbeddingModel\nid: embedder\nprovider: openai\n"
        )
        .is_err());
    }

    #[test]
    fn memory_defaults_fill_in() {
        let memory: MemoryDef = serde_yaml::from_str("id: chat_memory\n").unwrap();
        assert_eq!(memory.token_limit, 100_000);
        assert!((memory.chat_history_token_ratio - 0.7).abs() < f64::EPSILON);
        assert_eq!(memory.token_flush_size, 3000);
    }

    #[test]
    fn custom_type_shapes() {
        let object: CustomTypeDef =
            serde_yaml::from_str("id: Person\nfields:\n  name: text\n  age: int\n").unwrap();
        match &object.shape {
            CustomTypeShape::Object { fields } => {
                assert_eq!(
                    fields.get("age"),
                    Some(&TypeRef::primitive(PrimitiveKind::Int))
                );
            }
            CustomTypeShape::Array { .. } => panic!("expected object shape"),
        }

        let array: CustomTypeDef = serde_yaml::from_str("id: People\nelement: Person\n").unwrap();
        assert!(matches!(array.shape, CustomTypeShape::Array { .. }));
    }

    #[test]
    fn auth_variants_accept_secret_forms() {
        let yaml = "type: api_key\nid: main_auth\napi_key:\n  secret_name: prod/key\n";
        let auth: AuthProviderDef = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(auth.id(), "main_auth");
    }
}
