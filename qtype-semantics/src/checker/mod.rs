//! ABOUTME: Semantic checker entry point
//! ABOUTME: Validates a linked document and produces the Semantic IR

mod flow;
pub mod types;

use crate::ir::{FlowIr, IndexIr, MemoryIr, ModelIr, SemanticIr, ToolIr};
use flow::{EntityTables, FlowAnalyzer};
use qtype_core::{codes, Diagnostic};
use qtype_dsl::document::steps::StepDef;
use qtype_dsl::document::{FlowDef, IndexDef, ModelDef, ToolDef};
use qtype_dsl::LinkedDocument;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::debug;
use types::TypeTable;

/// Result of a successful check: the IR plus non-fatal warnings.
#[derive(Debug, Clone)]
pub struct Checked {
    pub ir: SemanticIr,
    pub warnings: Vec<Diagnostic>,
}

/// Enforce every semantic invariant and build the immutable IR.
///
/// Diagnostics are collected across all flows; the function fails only when
/// at least one error-severity diagnostic was recorded.
pub fn check(doc: &LinkedDocument) -> Result<Checked, Vec<Diagnostic>> {
    let mut diags = Vec::new();
    let mut warnings = Vec::new();

    let type_table = TypeTable::build(&doc.app, &mut diags);
    let entities = build_entities(doc, &mut diags);

    let flow_order = flow_build_order(&doc.app.flows, &mut diags);

    let mut flows: BTreeMap<String, Arc<FlowIr>> = BTreeMap::new();
    for flow_id in &flow_order {
        let Some(def) = doc.app.flows.iter().find(|f| &f.id == flow_id) else {
            continue;
        };
        let mut analyzer = FlowAnalyzer {
            types: &type_table,
            entities: &entities,
            flows: &flows,
            diags: &mut diags,
            warnings: &mut warnings,
        };
        if let Some(ir) = analyzer.analyze(def) {
            flows.insert(ir.id.clone(), Arc::new(ir));
        }
    }

    if diags.iter().any(|d| !d.is_warning()) {
        diags.extend(warnings);
        return Err(diags);
    }

    debug!(flows = flows.len(), "semantic check passed");
    Ok(Checked {
        ir: SemanticIr {
            app_id: doc.app.id.clone(),
            description: doc.app.description.clone(),
            types: type_table.all().clone(),
            models: entities.models,
            memories: entities.memories,
            auths: entities.auths,
            tools: entities.tools,
            indexes: entities.indexes,
            telemetry: doc.app.telemetry.clone(),
            flows,
        },
        warnings,
    })
}

fn build_entities(doc: &LinkedDocument, diags: &mut Vec<Diagnostic>) -> EntityTables {
    let auths: BTreeMap<String, Arc<qtype_dsl::document::AuthProviderDef>> = doc
        .app
        .auths
        .iter()
        .map(|auth| (auth.id().to_string(), Arc::new(auth.clone())))
        .collect();

    let mut models = BTreeMap::new();
    for model in &doc.app.models {
        let auth = model
            .auth()
            .and_then(|slot| slot.id())
            .and_then(|id| auths.get(id).cloned());
        let ir = match model {
            ModelDef::Model(m) => ModelIr {
                id: m.id.clone(),
                provider: m.provider.clone(),
                provider_model_id: model.provider_model_id().to_string(),
                inference_params: m.inference_params.clone(),
                auth,
                dimensions: None,
            },
            ModelDef::EmbeddingModel(m) => ModelIr {
                id: m.id.clone(),
                provider: m.provider.clone(),
                provider_model_id: model.provider_model_id().to_string(),
                inference_params: m.inference_params.clone(),
                auth,
                dimensions: Some(m.dimensions),
            },
        };
        models.insert(ir.id.clone(), Arc::new(ir));
    }

    let memories: BTreeMap<String, Arc<MemoryIr>> = doc
        .app
        .memories
        .iter()
        .map(|memory| {
            (
                memory.id.clone(),
                Arc::new(MemoryIr {
                    id: memory.id.clone(),
                    token_limit: memory.token_limit,
                    chat_history_token_ratio: memory.chat_history_token_ratio,
                    token_flush_size: memory.token_flush_size,
                }),
            )
        })
        .collect();

    let mut tools = BTreeMap::new();
    for tool in &doc.app.tools {
        let ir = match tool {
            ToolDef::Api(api) => ToolIr::Api {
                id: api.id.clone(),
                name: api.name.clone(),
                description: api.description.clone(),
                inputs: api.inputs.clone(),
                outputs: api.outputs.clone(),
                endpoint: api.endpoint.clone(),
                method: api.method.to_ascii_uppercase(),
                headers: api.headers.clone(),
                auth: api
                    .auth
                    .as_ref()
                    .and_then(|slot| slot.id())
                    .and_then(|id| auths.get(id).cloned()),
            },
            ToolDef::Function(function) => ToolIr::Function {
                id: function.id.clone(),
                name: function.name.clone(),
                description: function.description.clone(),
                inputs: function.inputs.clone(),
                outputs: function.outputs.clone(),
                module_path: function.module_path.clone(),
                function_name: function.function_name.clone(),
            },
        };
        tools.insert(ir.id().to_string(), Arc::new(ir));
    }

    let mut indexes = BTreeMap::new();
    for index in &doc.app.indexes {
        let auth = index
            .auth()
            .and_then(|slot| slot.id())
            .and_then(|id| auths.get(id).cloned());
        let ir = match index {
            IndexDef::Vector(vector) => {
                let model_id = vector.embedding_model.id().unwrap_or_default();
                let Some(embedding_model) = models.get(model_id).cloned() else {
                    diags.push(Diagnostic::new(
                        codes::REF_UNRESOLVED,
                        format!("index '{}' references unknown model '{model_id}'", vector.id),
                    ));
                    continue;
                };
                if embedding_model.dimensions.is_none() {
                    diags.push(Diagnostic::new(
                        codes::REF_KIND_MISMATCH,
                        format!(
                            "index '{}' must reference an EmbeddingModel, '{model_id}' is generative",
                            vector.id
                        ),
                    ));
                }
                IndexIr::Vector {
                    id: vector.id.clone(),
                    name: vector.name.clone(),
                    embedding_model,
                    auth,
                    args: vector.args.clone(),
                }
            }
            IndexDef::Document(document) => IndexIr::Document {
                id: document.id.clone(),
                name: document.name.clone(),
                auth,
                args: document.args.clone(),
            },
        };
        indexes.insert(ir.id().to_string(), Arc::new(ir));
    }

    EntityTables {
        models,
        memories,
        auths,
        tools,
        indexes,
    }
}

/// Order flows so invoked flows build before their invokers; reject
/// recursion (including self-invocation).
fn flow_build_order(flows: &[FlowDef], diags: &mut Vec<Diagnostic>) -> Vec<String> {
    let mut invoked: HashMap<&str, Vec<String>> = HashMap::new();
    for flow in flows {
        let mut targets = Vec::new();
        for step in &flow.steps {
            collect_invocations(step, &mut targets);
        }
        invoked.insert(flow.id.as_str(), targets);
    }

    let mut order = Vec::new();
    let mut done: HashSet<String> = HashSet::new();
    let mut in_progress: Vec<String> = Vec::new();

    fn visit(
        id: &str,
        invoked: &HashMap<&str, Vec<String>>,
        done: &mut HashSet<String>,
        in_progress: &mut Vec<String>,
        order: &mut Vec<String>,
        diags: &mut Vec<Diagnostic>,
    ) {
        if done.contains(id) {
            return;
        }
        if in_progress.iter().any(|p| p == id) {
            let chain = in_progress.join(" -> ");
            diags.push(Diagnostic::new(
                codes::FLOW_RECURSIVE,
                format!("flow invocation cycle: {chain} -> {id}"),
            ));
            return;
        }
        in_progress.push(id.to_string());
        if let Some(targets) = invoked.get(id) {
            for target in targets {
                if invoked.contains_key(target.as_str()) {
                    visit(target, invoked, done, in_progress, order, diags);
                }
            }
        }
        in_progress.pop();
        if done.insert(id.to_string()) {
            order.push(id.to_string());
        }
    }

    for flow in flows {
        visit(
            &flow.id,
            &invoked,
            &mut done,
            &mut in_progress,
            &mut order,
            diags,
        );
    }
    order
}

fn collect_invocations(step: &StepDef, targets: &mut Vec<String>) {
    match step {
        StepDef::InvokeFlow(invoke) => {
            if let Some(id) = invoke.flow.id() {
                targets.push(id.to_string());
            }
        }
        StepDef::Condition(condition) => {
            collect_invocations(&condition.then, targets);
            if let Some(otherwise) = &condition.otherwise {
                collect_invocations(otherwise, targets);
            }
        }
        _ => {}
    }
}
