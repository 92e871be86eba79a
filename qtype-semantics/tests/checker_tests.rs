//! Checker integration tests: boundary behaviors over full documents.

use qtype_core::{codes, Diagnostic};
use qtype_dsl::loader::DocumentLoader;
use qtype_semantics::{check, Checked, StepKindIr, StreamCardinality};
use std::path::Path;

fn check_text(text: &str) -> Result<Checked, Vec<Diagnostic>> {
    let loaded = DocumentLoader::new()
        .load_str(text, Path::new("test.qtype.yaml"))
        .expect("load");
    let app = qtype_dsl::parse(&loaded).expect("parse");
    let linked = qtype_dsl::link(app, &loaded.source_map).expect("link");
    check(&linked)
}

const HELLO_WORLD: &str = r"
id: hello
models:
  - type: Model
    id: gpt4
    provider: openai
flows:
  - id: main
    variables:
      - id: question
        type: text
      - id: answer
        type: text
    inputs: [question]
    outputs: [answer]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        system_message: You are a helpful assistant.
        inputs: [question]
        outputs: [answer]
";

#[test]
fn hello_world_checks_clean() {
    let checked = check_text(HELLO_WORLD).unwrap();
    let flow = checked.ir.flow("main").unwrap();
    assert_eq!(flow.steps.len(), 1);
    assert!(checked.warnings.is_empty());
}

#[test]
fn ir_deduplicates_entities() {
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
      - id: a
        type: text
      - id: b
        type: text
    inputs: [question]
    outputs: [b]
    steps:
      - type: LLMInference
        id: first
        model: gpt4
        inputs: [question]
        outputs: [a]
      - type: LLMInference
        id: second
        model: gpt4
        inputs: [a]
        outputs: [b]
";
    let checked = check_text(text).unwrap();
    let flow = checked.ir.flow("main").unwrap();
    let models: Vec<_> = flow
        .steps
        .iter()
        .filter_map(|s| match &s.kind {
            StepKindIr::LlmInference { model, .. } => Some(model),
            _ => None,
        })
        .collect();
    assert_eq!(models.len(), 2);
    assert!(std::sync::Arc::ptr_eq(models[0], models[1]));
    assert!(std::sync::Arc::ptr_eq(
        models[0],
        checked.ir.models.get("gpt4").unwrap()
    ));
}

#[test]
fn conversational_flow_without_chat_input_fails() {
    let text = r"
id: app
models:
  - type: Model
    id: gpt4
    provider: openai
flows:
  - id: chat
    interface: conversational
    variables:
      - id: question
        type: text
      - id: answer
        type: ChatMessage
    inputs: [question]
    outputs: [answer]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        inputs: [question]
        outputs: [answer]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs.iter().any(|d| d.code == codes::INTERFACE_CONSTRAINT));
}

#[test]
fn unproduced_variable_fails() {
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
      - id: phantom
        type: text
      - id: answer
        type: text
    inputs: [question]
    outputs: [answer]
    steps:
      - type: LLMInference
        id: ask
        model: gpt4
        inputs: [phantom]
        outputs: [answer]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs.iter().any(|d| d.code == codes::VARIABLE_UNPRODUCED));
}

#[test]
fn cyclic_flow_fails() {
    let text = r"
id: app
flows:
  - id: main
    variables:
      - id: a
        type: text
      - id: b
        type: text
    inputs: []
    outputs: [b]
    steps:
      - type: Echo
        id: one
        inputs: [b]
        outputs: [a]
      - type: Echo
        id: two
        inputs: [a]
        outputs: [b]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs.iter().any(|d| d.code == codes::FLOW_CYCLIC));
}

#[test]
fn dimension_mismatch_fails() {
    let text = r"
id: app
models:
  - type: EmbeddingModel
    id: small_embedder
    provider: openai
    dimensions: 384
  - type: EmbeddingModel
    id: big_embedder
    provider: openai
    dimensions: 1536
indexes:
  - type: vector
    id: store
    name: store
    embedding_model: big_embedder
flows:
  - id: ingest
    variables:
      - id: doc
        type: RAGDocument
      - id: chunk
        type: RAGChunk
      - id: embedded
        type: RAGChunk
    inputs: [doc]
    outputs: []
    steps:
      - type: DocumentSplitter
        id: split
        inputs: [doc]
        outputs: [chunk]
      - type: DocumentEmbedder
        id: embed
        model: small_embedder
        inputs: [chunk]
        outputs: [embedded]
      - type: IndexUpsert
        id: upsert
        index: store
        inputs: [embedded]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs.iter().any(|d| d.code == codes::DIMENSION_MISMATCH));
}

#[test]
fn template_placeholder_must_be_bound() {
    let text = r"
id: app
flows:
  - id: main
    variables:
      - id: text_in
        type: text
    inputs: [text_in]
    outputs: [make.prompt]
    steps:
      - type: PromptTemplate
        id: make
        template: Translate '{text_in}' to {lang}
        inputs: [text_in]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs
        .iter()
        .any(|d| d.code == codes::TEMPLATE_PLACEHOLDER_UNBOUND));
}

#[test]
fn recursive_flow_invocation_fails() {
    let text = r"
id: app
flows:
  - id: outer
    variables:
      - id: x
        type: text
      - id: y
        type: text
    inputs: [x]
    outputs: [y]
    steps:
      - type: InvokeFlow
        id: call_inner
        flow: inner
        input_bindings: { a: x }
        output_bindings: { b: y }
  - id: inner
    variables:
      - id: a
        type: text
      - id: b
        type: text
    inputs: [a]
    outputs: [b]
    steps:
      - type: InvokeFlow
        id: call_outer
        flow: outer
        input_bindings: { x: a }
        output_bindings: { y: b }
";
    let errs = check_text(text).unwrap_err();
    assert!(errs.iter().any(|d| d.code == codes::FLOW_RECURSIVE));
}

#[test]
fn condition_branch_shapes_must_match() {
    let text = r"
id: app
flows:
  - id: main
    variables:
      - id: answer
        type: text
      - id: expected
        type: text
      - id: out_a
        type: text
      - id: out_b
        type: text
    inputs: [answer, expected]
    outputs: [out_a]
    steps:
      - type: Condition
        id: route
        inputs: [answer]
        equals: expected
        then:
          type: Echo
          id: route.then
          inputs: [answer]
          outputs: [answer]
        else:
          type: Echo
          id: route.else
          inputs: [expected]
          outputs: [expected]
      - type: Echo
        id: tail
        inputs: [answer]
        outputs: [out_a]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs
        .iter()
        .any(|d| d.code == codes::CONDITION_BRANCH_MISMATCH));
}

#[test]
fn cardinality_propagates_through_fanout() {
    let text = r"
id: app
flows:
  - id: pipeline
    variables:
      - id: doc
        type: RAGDocument
      - id: chunk
        type: RAGChunk
      - id: chunks
        type: list[RAGChunk]
    inputs: [doc]
    outputs: [chunks]
    steps:
      - type: DocumentSplitter
        id: split
        inputs: [doc]
        outputs: [chunk]
      - type: Collect
        id: gather
        inputs: [chunk]
        outputs: [chunks]
";
    let checked = check_text(text).unwrap();
    let flow = checked.ir.flow("pipeline").unwrap();
    let split = flow.steps.iter().find(|s| s.id == "split").unwrap();
    let gather = flow.steps.iter().find(|s| s.id == "gather").unwrap();
    assert_eq!(split.input_stream, StreamCardinality::One);
    assert_eq!(gather.input_stream, StreamCardinality::Many);
}

#[test]
fn type_mismatch_on_edge_fails() {
    let text = r"
id: app
flows:
  - id: main
    variables:
      - id: doc
        type: RAGDocument
      - id: wrong
        type: int
    inputs: [doc]
    outputs: [wrong]
    steps:
      - type: DocumentSplitter
        id: split
        inputs: [doc]
        outputs: [wrong]
";
    let errs = check_text(text).unwrap_err();
    assert!(errs.iter().any(|d| d.code == codes::TYPE_MISMATCH));
}

#[test]
fn unreachable_step_is_a_warning_only() {
    let text = r"
id: app
flows:
  - id: main
    variables:
      - id: question
        type: text
      - id: answer
        type: text
      - id: scratch
        type: text
    inputs: [question]
    outputs: [answer]
    steps:
      - type: Echo
        id: fwd
        inputs: [question]
        outputs: [answer]
      - type: Echo
        id: dead_end
        inputs: [question]
        outputs: [scratch]
";
    let checked = check_text(text).unwrap();
    assert!(checked
        .warnings
        .iter()
        .any(|d| d.code == codes::STEP_UNREACHABLE));
}
