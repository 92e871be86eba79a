//! ABOUTME: Reference linker for parsed documents
//! ABOUTME: Hoists inline entities, canonicalizes refs, and validates every slot

use crate::document::steps::StepDef;
use crate::document::{
    Application, AuthProviderDef, FlowDef, IndexDef, MemoryDef, ModelDef, ToolDef,
};
use crate::reference::Reference;
use crate::source_map::SourceMap;
use qtype_core::{codes, Diagnostic};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Kind of a globally identified entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Model,
    Memory,
    Auth,
    Tool,
    Index,
    Flow,
    CustomType,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Model => "model",
            Self::Memory => "memory",
            Self::Auth => "auth provider",
            Self::Tool => "tool",
            Self::Index => "index",
            Self::Flow => "flow",
            Self::CustomType => "custom type",
        };
        f.write_str(name)
    }
}

/// Global id → kind table built by the linker.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    kinds: BTreeMap<String, EntityKind>,
}

impl SymbolTable {
    #[must_use]
    pub fn kind_of(&self, id: &str) -> Option<EntityKind> {
        self.kinds.get(id).copied()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.kinds.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn declare(&mut self, id: &str, kind: EntityKind, diags: &mut Vec<Diagnostic>) {
        if self.kinds.insert(id.to_string(), kind).is_some() {
            diags.push(Diagnostic::new(
                codes::DUPLICATE_ID,
                format!("entity id '{id}' is declared more than once"),
            ));
        }
    }
}

/// A parsed document with every reference canonicalized to an id and every
/// inline entity hoisted into the application tables.
#[derive(Debug, Clone)]
pub struct LinkedDocument {
    pub app: Application,
    pub symbols: SymbolTable,
}

impl LinkedDocument {
    #[must_use]
    pub fn model(&self, id: &str) -> Option<&ModelDef> {
        self.app.models.iter().find(|m| m.id() == id)
    }

    #[must_use]
    pub fn memory(&self, id: &str) -> Option<&MemoryDef> {
        self.app.memories.iter().find(|m| m.id == id)
    }

    #[must_use]
    pub fn auth(&self, id: &str) -> Option<&AuthProviderDef> {
        self.app.auths.iter().find(|a| a.id() == id)
    }

    #[must_use]
    pub fn tool(&self, id: &str) -> Option<&ToolDef> {
        self.app.tools.iter().find(|t| t.id() == id)
    }

    #[must_use]
    pub fn index(&self, id: &str) -> Option<&IndexDef> {
        self.app.indexes.iter().find(|i| i.id() == id)
    }

    #[must_use]
    pub fn flow(&self, id: &str) -> Option<&FlowDef> {
        self.app.flows.iter().find(|f| f.id == id)
    }

    #[must_use]
    pub fn custom_type(&self, id: &str) -> Option<&crate::document::CustomTypeDef> {
        self.app.types.iter().find(|t| t.id == id)
    }
}

/// Link a parsed application.
///
/// Referenced documents are merged into one entity space first; inline
/// entities are then hoisted (synthesizing `<parent>.<slot>` ids where
/// absent) until the tables are closed, and finally every reference slot is
/// checked against the symbol table.
pub fn link(mut app: Application, source_map: &SourceMap) -> Result<LinkedDocument, Vec<Diagnostic>> {
    let mut diags = Vec::new();

    merge_references(&mut app);
    hoist_inline_entities(&mut app);

    let mut symbols = SymbolTable::default();
    for ty in &app.types {
        symbols.declare(&ty.id, EntityKind::CustomType, &mut diags);
    }
    for model in &app.models {
        symbols.declare(model.id(), EntityKind::Model, &mut diags);
    }
    for memory in &app.memories {
        symbols.declare(&memory.id, EntityKind::Memory, &mut diags);
    }
    for auth in &app.auths {
        symbols.declare(auth.id(), EntityKind::Auth, &mut diags);
    }
    for tool in &app.tools {
        symbols.declare(tool.id(), EntityKind::Tool, &mut diags);
    }
    for index in &app.indexes {
        symbols.declare(index.id(), EntityKind::Index, &mut diags);
    }
    for flow in &app.flows {
        symbols.declare(&flow.id, EntityKind::Flow, &mut diags);
    }

    check_references(&app, &symbols, source_map, &mut diags);

    if diags.iter().any(|d| !d.is_warning()) {
        return Err(diags);
    }
    debug!(entities = symbols.len(), "document linked");
    Ok(LinkedDocument { app, symbols })
}

// Flatten `references` into the root tables, depth first.
fn merge_references(app: &mut Application) {
    let references = std::mem::take(&mut app.references);
    for mut referenced in references {
        merge_references(&mut referenced);
        app.types.extend(referenced.types);
        app.variables.extend(referenced.variables);
        app.models.extend(referenced.models);
        app.memories.extend(referenced.memories);
        app.auths.extend(referenced.auths);
        app.tools.extend(referenced.tools);
        app.indexes.extend(referenced.indexes);
        app.flows.extend(referenced.flows);
        if app.telemetry.is_none() {
            app.telemetry = referenced.telemetry;
        }
    }
}

// Hoisting may itself uncover nested inline entities (an inline model with
// an inline auth), so the pass repeats until a fixpoint.
fn hoist_inline_entities(app: &mut Application) {
    loop {
        let mut pending = Hoisted::default();

        for model in &mut app.models {
            let owner = model.id().to_string();
            if let Some(slot) = model.auth_mut() {
                hoist_auth(slot, &owner, &mut pending);
            }
        }
        for index in &mut app.indexes {
            let owner = index.id().to_string();
            if let Some(slot) = index.auth_mut() {
                hoist_auth(slot, &owner, &mut pending);
            }
            if let IndexDef::Vector(vector) = index {
                hoist_model(&mut vector.embedding_model, &owner, "embedding_model", &mut pending);
            }
        }
        for tool in &mut app.tools {
            if let ToolDef::Api(api) = tool {
                let owner = api.id.clone();
                if let Some(slot) = api.auth.as_mut() {
                    hoist_auth(slot, &owner, &mut pending);
                }
            }
        }
        if let Some(telemetry) = app.telemetry.as_mut() {
            let owner = telemetry.id.clone();
            if let Some(slot) = telemetry.auth.as_mut() {
                hoist_auth(slot, &owner, &mut pending);
            }
        }
        for flow in &mut app.flows {
            for step in &mut flow.steps {
                hoist_step_refs(step, &mut pending);
            }
        }

        if pending.is_empty() {
            break;
        }
        pending.drain_into(app);
    }
}

#[derive(Default)]
struct Hoisted {
    models: Vec<ModelDef>,
    memories: Vec<MemoryDef>,
    auths: Vec<AuthProviderDef>,
    tools: Vec<ToolDef>,
    indexes: Vec<IndexDef>,
    flows: Vec<FlowDef>,
}

impl Hoisted {
    fn is_empty(&self) -> bool {
        self.models.is_empty()
            && self.memories.is_empty()
            && self.auths.is_empty()
            && self.tools.is_empty()
            && self.indexes.is_empty()
            && self.flows.is_empty()
    }

    fn drain_into(self, app: &mut Application) {
        app.models.extend(self.models);
        app.memories.extend(self.memories);
        app.auths.extend(self.auths);
        app.tools.extend(self.tools);
        app.indexes.extend(self.indexes);
        app.flows.extend(self.flows);
    }
}

fn synthesized_id(current: &str, owner: &str, slot: &str) -> String {
    if current.is_empty() {
        format!("{owner}.{slot}")
    } else {
        current.to_string()
    }
}

fn hoist_auth(slot: &mut Reference<AuthProviderDef>, owner: &str, pending: &mut Hoisted) {
    slot.canonicalize();
    if let Some(inline) = slot.inline() {
        let id = synthesized_id(inline.id(), owner, "auth");
        if let Some(mut auth) = slot.hoist(id.clone()) {
            set_auth_id(&mut auth, id);
            pending.auths.push(auth);
        }
    }
}

fn set_auth_id(auth: &mut AuthProviderDef, new_id: String) {
    match auth {
        AuthProviderDef::ApiKey { id, .. }
        | AuthProviderDef::Bearer { id, .. }
        | AuthProviderDef::Oauth2 { id, .. }
        | AuthProviderDef::Aws { id, .. } => *id = new_id,
    }
}

fn hoist_model(
    slot: &mut Reference<ModelDef>,
    owner: &str,
    slot_name: &str,
    pending: &mut Hoisted,
) {
    slot.canonicalize();
    if let Some(inline) = slot.inline() {
        let id = synthesized_id(inline.id(), owner, slot_name);
        if let Some(mut model) = slot.hoist(id.clone()) {
            match &mut model {
                ModelDef::Model(m) => m.id = id,
                ModelDef::EmbeddingModel(m) => m.id = id,
            }
            pending.models.push(model);
        }
    }
}

fn hoist_step_refs(step: &mut StepDef, pending: &mut Hoisted) {
    let owner = step.id().to_string();
    match step {
        StepDef::LLMInference(inference) => {
            hoist_inference_refs(inference, &owner, pending);
        }
        StepDef::Agent(agent) => {
            hoist_inference_refs(&mut agent.inference, &owner, pending);
            for (index, slot) in agent.tools.iter_mut().enumerate() {
                slot.canonicalize();
                if let Some(inline) = slot.inline() {
                    let id = synthesized_id(inline.id(), &owner, &format!("tools.{index}"));
                    if let Some(mut tool) = slot.hoist(id.clone()) {
                        set_tool_id(&mut tool, id);
                        pending.tools.push(tool);
                    }
                }
            }
        }
        StepDef::InvokeTool(invoke) => {
            invoke.tool.canonicalize();
            if let Some(inline) = invoke.tool.inline() {
                let id = synthesized_id(inline.id(), &owner, "tool");
                if let Some(mut tool) = invoke.tool.hoist(id.clone()) {
                    set_tool_id(&mut tool, id);
                    pending.tools.push(tool);
                }
            }
        }
        StepDef::InvokeFlow(invoke) => {
            invoke.flow.canonicalize();
            if let Some(inline) = invoke.flow.inline() {
                let id = synthesized_id(&inline.id, &owner, "flow");
                if let Some(mut flow) = invoke.flow.hoist(id.clone()) {
                    flow.id = id;
                    pending.flows.push(flow);
                }
            }
        }
        StepDef::Condition(condition) => {
            hoist_step_refs(&mut condition.then, pending);
            if let Some(otherwise) = condition.otherwise.as_mut() {
                hoist_step_refs(otherwise, pending);
            }
        }
        StepDef::SQLSource(sql) => {
            if let Some(slot) = sql.auth.as_mut() {
                hoist_auth(slot, &owner, pending);
            }
        }
        StepDef::DocumentEmbedder(embedder) => {
            hoist_model(&mut embedder.model, &owner, "model", pending);
        }
        StepDef::Reranker(reranker) => {
            hoist_model(&mut reranker.model, &owner, "model", pending);
        }
        StepDef::VectorSearch(search) => {
            hoist_index(&mut search.index, &owner, pending);
        }
        StepDef::DocumentSearch(search) => {
            hoist_index(&mut search.index, &owner, pending);
        }
        StepDef::IndexUpsert(upsert) => {
            hoist_index(&mut upsert.index, &owner, pending);
        }
        _ => {}
    }
}

fn hoist_inference_refs(
    inference: &mut crate::document::steps::LlmInferenceStep,
    owner: &str,
    pending: &mut Hoisted,
) {
    hoist_model(&mut inference.model, owner, "model", pending);
    if let Some(slot) = inference.memory.as_mut() {
        slot.canonicalize();
        if let Some(inline) = slot.inline() {
            let id = synthesized_id(&inline.id, owner, "memory");
            if let Some(mut memory) = slot.hoist(id.clone()) {
                memory.id = id;
                pending.memories.push(memory);
            }
        }
    }
}

fn set_tool_id(tool: &mut ToolDef, new_id: String) {
    match tool {
        ToolDef::Api(t) => t.id = new_id,
        ToolDef::Function(t) => t.id = new_id,
    }
}

fn hoist_index(slot: &mut Reference<IndexDef>, owner: &str, pending: &mut Hoisted) {
    slot.canonicalize();
    if let Some(inline) = slot.inline() {
        let id = synthesized_id(inline.id(), owner, "index");
        if let Some(mut index) = slot.hoist(id.clone()) {
            match &mut index {
                IndexDef::Vector(i) => i.id = id,
                IndexDef::Document(i) => i.id = id,
            }
            pending.indexes.push(index);
        }
    }
}

struct RefCheck<'a> {
    symbols: &'a SymbolTable,
    source_map: &'a SourceMap,
    diags: &'a mut Vec<Diagnostic>,
}

impl RefCheck<'_> {
    fn expect(&mut self, id: &str, expected: EntityKind, path: &str) {
        match self.symbols.kind_of(id) {
            None => self.diags.push(
                Diagnostic::new(
                    codes::REF_UNRESOLVED,
                    format!("reference '{id}' does not resolve to any entity"),
                )
                .with_location_opt(self.source_map.resolve(path)),
            ),
            Some(kind) if kind != expected => self.diags.push(
                Diagnostic::new(
                    codes::REF_KIND_MISMATCH,
                    format!("reference '{id}' resolves to a {kind}, expected a {expected}"),
                )
                .with_location_opt(self.source_map.resolve(path)),
            ),
            Some(_) => {}
        }
    }
}

fn check_references(
    app: &Application,
    symbols: &SymbolTable,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
) {
    let mut check = RefCheck {
        symbols,
        source_map,
        diags,
    };

    for (i, model) in app.models.iter().enumerate() {
        if let Some(slot) = model.auth() {
            if let Some(id) = slot.id() {
                check.expect(id, EntityKind::Auth, &format!("models/{i}/auth"));
            }
        }
    }
    for (i, index) in app.indexes.iter().enumerate() {
        if let Some(slot) = index.auth() {
            if let Some(id) = slot.id() {
                check.expect(id, EntityKind::Auth, &format!("indexes/{i}/auth"));
            }
        }
        if let IndexDef::Vector(vector) = index {
            if let Some(id) = vector.embedding_model.id() {
                check.expect(id, EntityKind::Model, &format!("indexes/{i}/embedding_model"));
            }
        }
    }
    for (i, tool) in app.tools.iter().enumerate() {
        if let ToolDef::Api(api) = tool {
            if let Some(slot) = &api.auth {
                if let Some(id) = slot.id() {
                    check.expect(id, EntityKind::Auth, &format!("tools/{i}/auth"));
                }
            }
        }
    }
    if let Some(telemetry) = &app.telemetry {
        if let Some(slot) = &telemetry.auth {
            if let Some(id) = slot.id() {
                check.expect(id, EntityKind::Auth, "telemetry/auth");
            }
        }
    }
    for (f, flow) in app.flows.iter().enumerate() {
        for (s, step) in flow.steps.iter().enumerate() {
            check_step_references(step, &format!("flows/{f}/steps/{s}"), &mut check);
        }
    }
}

fn check_step_references(step: &StepDef, path: &str, check: &mut RefCheck<'_>) {
    match step {
        StepDef::LLMInference(inference) => {
            check_inference_refs(inference, path, check);
        }
        StepDef::Agent(agent) => {
            check_inference_refs(&agent.inference, path, check);
            for (i, slot) in agent.tools.iter().enumerate() {
                if let Some(id) = slot.id() {
                    check.expect(id, EntityKind::Tool, &format!("{path}/tools/{i}"));
                }
            }
        }
        StepDef::InvokeTool(invoke) => {
            if let Some(id) = invoke.tool.id() {
                check.expect(id, EntityKind::Tool, &format!("{path}/tool"));
            }
        }
        StepDef::InvokeFlow(invoke) => {
            if let Some(id) = invoke.flow.id() {
                check.expect(id, EntityKind::Flow, &format!("{path}/flow"));
            }
        }
        StepDef::Condition(condition) => {
            check_step_references(&condition.then, &format!("{path}/then"), check);
            if let Some(otherwise) = &condition.otherwise {
                check_step_references(otherwise, &format!("{path}/else"), check);
            }
        }
        StepDef::SQLSource(sql) => {
            if let Some(slot) = &sql.auth {
                if let Some(id) = slot.id() {
                    check.expect(id, EntityKind::Auth, &format!("{path}/auth"));
                }
            }
        }
        StepDef::DocumentEmbedder(embedder) => {
            if let Some(id) = embedder.model.id() {
                check.expect(id, EntityKind::Model, &format!("{path}/model"));
            }
        }
        StepDef::Reranker(reranker) => {
            if let Some(id) = reranker.model.id() {
                check.expect(id, EntityKind::Model, &format!("{path}/model"));
            }
        }
        StepDef::VectorSearch(search) => {
            if let Some(id) = search.index.id() {
                check.expect(id, EntityKind::Index, &format!("{path}/index"));
            }
        }
        StepDef::DocumentSearch(search) => {
            if let Some(id) = search.index.id() {
                check.expect(id, EntityKind::Index, &format!("{path}/index"));
            }
        }
        StepDef::IndexUpsert(upsert) => {
            if let Some(id) = upsert.index.id() {
                check.expect(id, EntityKind::Index, &format!("{path}/index"));
            }
        }
        _ => {}
    }
}

fn check_inference_refs(
    inference: &crate::document::steps::LlmInferenceStep,
    path: &str,
    check: &mut RefCheck<'_>,
) {
    if let Some(id) = inference.model.id() {
        check.expect(id, EntityKind::Model, &format!("{path}/model"));
    }
    if let Some(slot) = &inference.memory {
        if let Some(id) = slot.id() {
            check.expect(id, EntityKind::Memory, &format!("{path}/memory"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DocumentLoader;
    use crate::parser::parse;
    use std::path::Path;

    fn link_text(text: &str) -> Result<LinkedDocument, Vec<Diagnostic>> {
        let loaded = DocumentLoader::new()
            .load_str(text, Path::new("test.qtype.yaml"))
            .expect("load");
        let app = parse(&loaded).expect("parse");
        link(app, &loaded.source_map)
    }

    #[test]
    fn resolves_plain_and_ref_forms() {
        let text = r"
id: app
models:
  - type: Model
    id: gpt4
    provider: openai
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    steps:
      - type: LLMInference
        id: ask
        model: { ref: gpt4 }
        inputs: [question]
";
        let linked = link_text(text).unwrap();
        assert_eq!(linked.symbols.kind_of("gpt4"), Some(EntityKind::Model));
        match &linked.app.flows[0].steps[0] {
            StepDef::LLMInference(step) => assert_eq!(step.model.id(), Some("gpt4")),
            other => panic!("unexpected step {}", other.tag()),
        }
    }

    #[test]
    fn hoists_inline_model_with_synthesized_visibility() {
        let text = r"
id: app
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    steps:
      - type: LLMInference
        id: ask
        model:
          type: Model
          id: inline_gpt4
          provider: openai
        inputs: [question]
";
        let linked = link_text(text).unwrap();
        assert!(linked.model("inline_gpt4").is_some());
        match &linked.app.flows[0].steps[0] {
            StepDef::LLMInference(step) => assert_eq!(step.model.id(), Some("inline_gpt4")),
            other => panic!("unexpected step {}", other.tag()),
        }
    }

    #[test]
    fn unresolved_reference_is_reported() {
        let text = r"
id: app
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    steps:
      - type: LLMInference
        id: ask
        model: missing_model
        inputs: [question]
";
        let errs = link_text(text).unwrap_err();
        assert!(errs.iter().any(|d| d.code == codes::REF_UNRESOLVED));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let text = r"
id: app
memories:
  - id: chat_memory
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    steps:
      - type: LLMInference
        id: ask
        model: chat_memory
        inputs: [question]
";
        let errs = link_text(text).unwrap_err();
        assert!(errs.iter().any(|d| d.code == codes::REF_KIND_MISMATCH));
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let text = r"
id: app
models:
  - type: Model
    id: shared
    provider: openai
memories:
  - id: shared
";
        let errs = link_text(text).unwrap_err();
        assert!(errs.iter().any(|d| d.code == codes::DUPLICATE_ID));
    }

    #[test]
    fn referenced_documents_share_one_symbol_space() {
        let text = r"
id: app
references:
  - id: shared_lib
    models:
      - type: Model
        id: gpt4
        provider: openai
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        inputs: [question]
";
        let linked = link_text(text).unwrap();
        assert!(linked.model("gpt4").is_some());
    }
}
