//! ABOUTME: Parser from the raw YAML tree into the typed document model
//! ABOUTME: Aggregates all field errors per document instead of short-circuiting

use crate::document::steps::{DecoderFormat, StepDef};
use crate::document::{Application, FlowDef, VariableDef};
use crate::loader::LoadedDocument;
use crate::source_map::SourceMap;
use qtype_core::{codes, Diagnostic, PrimitiveKind, TypeRef};
use serde_yaml::Value;
use tracing::debug;

/// Parse a loaded document into a typed `Application`.
///
/// Every section and every list element is deserialized independently, so a
/// document with five bad steps reports five diagnostics in one pass.
/// Defaults (autocreated outputs, implied variables) are materialized here
/// so downstream layers never consult them.
pub fn parse(loaded: &LoadedDocument) -> Result<Application, Vec<Diagnostic>> {
    let mut diags = Vec::new();
    let mut app = parse_application(&loaded.root, "", &loaded.source_map, &mut diags);

    if let Some(app) = app.as_mut() {
        validate_fields(app, "", &loaded.source_map, &mut diags);
    }

    if diags.iter().any(|d| !d.is_warning()) {
        return Err(diags);
    }
    let mut app = app.ok_or_else(Vec::new)?;
    apply_defaults(&mut app);
    debug!(app = %app.id, flows = app.flows.len(), "document parsed");
    Ok(app)
}

fn parse_application(
    value: &Value,
    prefix: &str,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
) -> Option<Application> {
    let Value::Mapping(mapping) = value else {
        diags.push(
            Diagnostic::new(codes::FIELD_INVALID, "document root must be a mapping")
                .with_location_opt(source_map.resolve(prefix)),
        );
        return None;
    };

    let mut app = Application {
        id: mapping
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        description: mapping
            .get("description")
            .and_then(Value::as_str)
            .map(ToString::to_string),
        ..Application::default()
    };
    if app.id.is_empty() {
        diags.push(
            Diagnostic::new(codes::FIELD_INVALID, "application is missing an 'id'")
                .with_location_opt(source_map.resolve(prefix)),
        );
    }

    parse_section(mapping, "types", prefix, source_map, diags, &mut app.types);
    parse_section(
        mapping,
        "variables",
        prefix,
        source_map,
        diags,
        &mut app.variables,
    );
    parse_section(mapping, "models", prefix, source_map, diags, &mut app.models);
    parse_section(
        mapping,
        "memories",
        prefix,
        source_map,
        diags,
        &mut app.memories,
    );
    parse_section(mapping, "auths", prefix, source_map, diags, &mut app.auths);
    parse_section(mapping, "tools", prefix, source_map, diags, &mut app.tools);
    parse_section(
        mapping,
        "indexes",
        prefix,
        source_map,
        diags,
        &mut app.indexes,
    );

    if let Some(telemetry) = mapping.get("telemetry") {
        let path = join(prefix, "telemetry");
        match serde_yaml::from_value(telemetry.clone()) {
            Ok(sink) => app.telemetry = Some(sink),
            Err(err) => diags.push(classify(&err, &path, source_map)),
        }
    }

    if let Some(Value::Sequence(flows)) = mapping.get("flows") {
        for (index, flow_value) in flows.iter().enumerate() {
            let path = join(prefix, &format!("flows/{index}"));
            if let Some(flow) = parse_flow(flow_value, &path, source_map, diags) {
                app.flows.push(flow);
            }
        }
    }

    if let Some(Value::Sequence(references)) = mapping.get("references") {
        for (index, reference) in references.iter().enumerate() {
            let path = join(prefix, &format!("references/{index}"));
            if let Some(referenced) = parse_application(reference, &path, source_map, diags) {
                app.references.push(referenced);
            }
        }
    }

    Some(app)
}

fn parse_section<T: serde::de::DeserializeOwned>(
    mapping: &serde_yaml::Mapping,
    section: &str,
    prefix: &str,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
    out: &mut Vec<T>,
) {
    let Some(value) = mapping.get(section) else {
        return;
    };
    let Value::Sequence(items) = value else {
        diags.push(
            Diagnostic::new(
                codes::FIELD_INVALID,
                format!("'{section}' must be a sequence"),
            )
            .with_location_opt(source_map.resolve(&join(prefix, section))),
        );
        return;
    };
    for (index, item) in items.iter().enumerate() {
        let path = join(prefix, &format!("{section}/{index}"));
        match serde_yaml::from_value(item.clone()) {
            Ok(parsed) => out.push(parsed),
            Err(err) => diags.push(classify(&err, &path, source_map)),
        }
    }
}

// Flows are parsed scaffold-first so each step yields its own diagnostic.
fn parse_flow(
    value: &Value,
    path: &str,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
) -> Option<FlowDef> {
    let Value::Mapping(mapping) = value else {
        diags.push(
            Diagnostic::new(codes::FIELD_INVALID, "flow must be a mapping")
                .with_location_opt(source_map.resolve(path)),
        );
        return None;
    };

    let mut scaffold = mapping.clone();
    scaffold.remove("steps");
    let mut flow: FlowDef = match serde_yaml::from_value(Value::Mapping(scaffold)) {
        Ok(flow) => flow,
        Err(err) => {
            diags.push(classify(&err, path, source_map));
            return None;
        }
    };

    if let Some(Value::Sequence(steps)) = mapping.get("steps") {
        for (index, step_value) in steps.iter().enumerate() {
            let step_path = format!("{path}/steps/{index}");
            check_memory_slot(step_value, &step_path, source_map, diags);
            match serde_yaml::from_value::<StepDef>(step_value.clone()) {
                Ok(step) => flow.steps.push(step),
                Err(err) => diags.push(classify(&err, &step_path, source_map)),
            }
        }
    }

    Some(flow)
}

// Memory slots are only meaningful on inference steps; serde would silently
// drop the key elsewhere, so the raw tree is checked before deserializing.
fn check_memory_slot(
    step_value: &Value,
    path: &str,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
) {
    let Value::Mapping(mapping) = step_value else {
        return;
    };
    if mapping.get("memory").is_none() {
        return;
    }
    let tag = mapping.get("type").and_then(Value::as_str).unwrap_or("");
    if !matches!(tag, "LLMInference" | "Agent") {
        diags.push(
            Diagnostic::new(
                codes::MEMORY_NOT_ALLOWED,
                format!("step type '{tag}' cannot reference a memory"),
            )
            .with_location_opt(source_map.resolve(&format!("{path}/memory"))),
        );
    }
}

fn classify(err: &serde_yaml::Error, path: &str, source_map: &SourceMap) -> Diagnostic {
    let message = err.to_string();
    let code = if message.contains("unknown variant") {
        codes::UNKNOWN_VARIANT
    } else if message.contains("missing field `type`") || message.contains("internally tagged") {
        codes::DISCRIMINATOR_MISSING
    } else {
        codes::FIELD_INVALID
    };
    Diagnostic::new(code, format!("{path}: {message}"))
        .with_location_opt(source_map.resolve(path))
}

fn join(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        rest.to_string()
    } else {
        format!("{prefix}/{rest}")
    }
}

fn field_error(
    path: &str,
    source_map: &SourceMap,
    message: impl Into<String>,
) -> Diagnostic {
    Diagnostic::new(codes::FIELD_INVALID, message).with_location_opt(source_map.resolve(path))
}

/// Range and shape checks serde cannot express.
fn validate_fields(
    app: &Application,
    prefix: &str,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
) {
    for (index, memory) in app.memories.iter().enumerate() {
        let path = join(prefix, &format!("memories/{index}"));
        if memory.id.is_empty() {
            diags.push(field_error(&path, source_map, "memory id must not be empty"));
        }
        if memory.token_limit == 0 {
            diags.push(field_error(&path, source_map, "token_limit must be positive"));
        }
        if memory.token_flush_size == 0 {
            diags.push(field_error(&path, source_map, "token_flush_size must be positive"));
        }
        if memory.chat_history_token_ratio <= 0.0 || memory.chat_history_token_ratio > 1.0 {
            diags.push(field_error(
                &path,
                source_map,
                "chat_history_token_ratio must be in (0, 1]",
            ));
        }
    }

    for (index, model) in app.models.iter().enumerate() {
        let path = join(prefix, &format!("models/{index}"));
        if model.id().is_empty() {
            diags.push(field_error(&path, source_map, "model id must not be empty"));
        }
        if model.dimensions() == Some(0) {
            diags.push(field_error(&path, source_map, "dimensions must be positive"));
        }
    }

    for (index, auth) in app.auths.iter().enumerate() {
        let path = join(prefix, &format!("auths/{index}"));
        if auth.id().is_empty() {
            diags.push(field_error(&path, source_map, "auth provider id must not be empty"));
        }
    }

    for (index, index_def) in app.indexes.iter().enumerate() {
        let path = join(prefix, &format!("indexes/{index}"));
        if index_def.id().is_empty() {
            diags.push(field_error(&path, source_map, "index id must not be empty"));
        }
    }

    for (index, tool) in app.tools.iter().enumerate() {
        let path = join(prefix, &format!("tools/{index}"));
        if tool.id().is_empty() {
            diags.push(field_error(&path, source_map, "tool id must not be empty"));
        }
        if let crate::document::ToolDef::Api(api) = tool {
            const METHODS: [&str; 6] = ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"];
            if !METHODS.contains(&api.method.to_ascii_uppercase().as_str()) {
                diags.push(field_error(
                    &format!("{path}/method"),
                    source_map,
                    format!("unsupported HTTP method '{}'", api.method),
                ));
            }
            if api.endpoint.is_empty() {
                diags.push(field_error(&path, source_map, "endpoint must not be empty"));
            }
        }
    }

    for (flow_index, flow) in app.flows.iter().enumerate() {
        let flow_path = join(prefix, &format!("flows/{flow_index}"));
        if flow.id.is_empty() {
            diags.push(field_error(&flow_path, source_map, "flow id must not be empty"));
        }
        for (step_index, step) in flow.steps.iter().enumerate() {
            let path = format!("{flow_path}/steps/{step_index}");
            validate_step(step, &path, source_map, diags);
        }
    }

    for (index, referenced) in app.references.iter().enumerate() {
        let path = join(prefix, &format!("references/{index}"));
        validate_fields(referenced, &path, source_map, diags);
    }
}

fn validate_step(
    step: &StepDef,
    path: &str,
    source_map: &SourceMap,
    diags: &mut Vec<Diagnostic>,
) {
    let common = step.common();
    if common.id.is_empty() {
        diags.push(field_error(path, source_map, "step id must not be empty"));
    }
    if common.concurrency == Some(0) {
        diags.push(field_error(path, source_map, "concurrency must be positive"));
    }
    if common.batch_size == Some(0) {
        diags.push(field_error(path, source_map, "batch_size must be positive"));
    }

    match step {
        StepDef::PromptTemplate(template) => {
            if template.template.is_empty() {
                diags.push(field_error(path, source_map, "template must not be empty"));
            }
            if common.outputs.len() > 1 {
                diags.push(field_error(
                    path,
                    source_map,
                    "a prompt template declares exactly one output",
                ));
            }
        }
        StepDef::DocumentSplitter(splitter) => {
            if splitter.chunk_size == 0 {
                diags.push(field_error(path, source_map, "chunk_size must be positive"));
            }
            if splitter.chunk_overlap >= splitter.chunk_size {
                diags.push(field_error(
                    path,
                    source_map,
                    "chunk_overlap must be smaller than chunk_size",
                ));
            }
        }
        StepDef::VectorSearch(search) => {
            if search.default_top_k == 0 {
                diags.push(field_error(path, source_map, "default_top_k must be positive"));
            }
        }
        StepDef::DocumentSearch(search) => {
            if search.max_results == 0 {
                diags.push(field_error(path, source_map, "max_results must be positive"));
            }
        }
        StepDef::Reranker(reranker) => {
            if reranker.top_n == 0 {
                diags.push(field_error(path, source_map, "top_n must be positive"));
            }
        }
        StepDef::Agent(agent) => {
            if agent.max_iterations == Some(0) {
                diags.push(field_error(path, source_map, "max_iterations must be positive"));
            }
        }
        StepDef::Decoder(decoder) => {
            if decoder.format == DecoderFormat::Custom {
                match &decoder.pattern {
                    None => diags.push(field_error(
                        path,
                        source_map,
                        "custom decoder requires a 'pattern'",
                    )),
                    Some(pattern) => {
                        if let Err(err) = regex::Regex::new(pattern) {
                            diags.push(field_error(
                                &format!("{path}/pattern"),
                                source_map,
                                format!("invalid pattern: {err}"),
                            ));
                        }
                    }
                }
            }
        }
        StepDef::Condition(condition) => {
            validate_step(&condition.then, &format!("{path}/then"), source_map, diags);
            if let Some(otherwise) = &condition.otherwise {
                validate_step(otherwise, &format!("{path}/else"), source_map, diags);
            }
        }
        _ => {}
    }
}

/// Materialize autocreated outputs and their implied variables.
fn apply_defaults(app: &mut Application) {
    for flow in &mut app.flows {
        let mut implied: Vec<VariableDef> = Vec::new();
        for step in &mut flow.steps {
            default_step_outputs(step, &mut implied);
        }
        for variable in implied {
            if flow.variable(&variable.id).is_none() {
                flow.variables.push(variable);
            }
        }
    }
    for referenced in &mut app.references {
        apply_defaults(referenced);
    }
}

fn default_step_outputs(step: &mut StepDef, implied: &mut Vec<VariableDef>) {
    let id = step.id().to_string();
    match step {
        StepDef::LLMInference(_) | StepDef::Agent(_) => {
            if step.common().outputs.is_empty() {
                let var = format!("{id}.response");
                step.common_mut().outputs.push(var.clone());
                implied.push(VariableDef::new(
                    var,
                    TypeRef::primitive(PrimitiveKind::Text),
                ));
            }
        }
        StepDef::PromptTemplate(_) => {
            if step.common().outputs.is_empty() {
                let var = format!("{id}.prompt");
                step.common_mut().outputs.push(var.clone());
                implied.push(VariableDef::new(
                    var,
                    TypeRef::primitive(PrimitiveKind::Text),
                ));
            }
        }
        StepDef::Aggregate(_) => {
            if step.common().outputs.is_empty() {
                let var = format!("{id}.stats");
                step.common_mut().outputs.push(var.clone());
                implied.push(VariableDef::new(
                    var,
                    TypeRef::Custom("AggregateStats".to_string()),
                ));
            }
        }
        StepDef::Condition(condition) => {
            default_step_outputs(&mut condition.then, implied);
            if let Some(otherwise) = condition.otherwise.as_mut() {
                default_step_outputs(otherwise, implied);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::DocumentLoader;
    use std::path::Path;

    fn parse_text(text: &str) -> Result<Application, Vec<Diagnostic>> {
        let loaded = DocumentLoader::new()
            .load_str(text, Path::new("test.qtype.yaml"))
            .expect("load");
        parse(&loaded)
    }

    #[test]
    fn parses_minimal_application() {
        let app = parse_text("id: hello\n").unwrap();
        assert_eq!(app.id, "hello");
        assert!(app.flows.is_empty());
    }

    #[test]
    fn collects_errors_across_sections() {
        let text = r"
id: app
models:
  - type: Wrong
    id: m1
memories:
  - id: mem
    chat_history_token_ratio: 3.0
";
        let errs = parse_text(text).unwrap_err();
        assert!(errs.iter().any(|d| d.code == codes::UNKNOWN_VARIANT));
        assert!(errs.iter().any(|d| d.code == codes::FIELD_INVALID));
    }

    #[test]
    fn autocreates_inference_output() {
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
    outputs: [ask.response]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        inputs: [question]
";
        let app = parse_text(text).unwrap();
        let flow = &app.flows[0];
        assert_eq!(flow.steps[0].common().outputs, vec!["ask.response"]);
        assert!(flow.variable("ask.response").is_some());
    }

    #[test]
    fn memory_on_non_inference_step_is_rejected() {
        let text = r"
id: app
flows:
  - id: main
    steps:
      - type: Echo
        id: fwd
        memory: mem
";
        let errs = parse_text(text).unwrap_err();
        assert!(errs.iter().any(|d| d.code == codes::MEMORY_NOT_ALLOWED));
    }

    #[test]
    fn diagnostics_carry_locations() {
        let text = "id: app\nmodels:\n  - type: Nope\n    id: m\n";
        let errs = parse_text(text).unwrap_err();
        let diag = errs.iter().find(|d| d.code == codes::UNKNOWN_VARIANT).unwrap();
        let loc = diag.location.as_ref().expect("location");
        assert_eq!(loc.line, 3);
    }
}
