//! Filesystem-level loader tests: includes, raw embedding, cycles, and the
//! dump round-trip law.

use qtype_core::{codes, QTypeError};
use qtype_dsl::loader::DocumentLoader;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn include_splices_subtree() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "models.yaml",
        "- type: Model\n  id: gpt4\n  provider: openai\n",
    );
    let main = write(
        dir.path(),
        "app.qtype.yaml",
        "id: app\nmodels: !include models.yaml\n",
    );

    let doc = DocumentLoader::new().load(&main).unwrap();
    let models = doc.root.get("models").unwrap().as_sequence().unwrap();
    assert_eq!(models.len(), 1);
    assert_eq!(
        models[0].get("id").and_then(serde_yaml::Value::as_str),
        Some("gpt4")
    );
}

#[test]
fn include_raw_embeds_text_verbatim() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "prompt.txt", "You are ${NOT_EXPANDED}.\nLine 2.\n");
    let main = write(
        dir.path(),
        "app.qtype.yaml",
        "id: app\nsystem: !include_raw prompt.txt\n",
    );

    let doc = DocumentLoader::new().load(&main).unwrap();
    let system = doc.root.get("system").unwrap().as_str().unwrap();
    assert!(system.contains("${NOT_EXPANDED}"));
    assert!(system.contains("Line 2."));
}

#[test]
fn transitive_includes_compose() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "inner.yaml", "value: 42\n");
    write(dir.path(), "middle.yaml", "nested: !include inner.yaml\n");
    let main = write(dir.path(), "app.qtype.yaml", "id: app\npart: !include middle.yaml\n");

    let doc = DocumentLoader::new().load(&main).unwrap();
    let value = doc
        .root
        .get("part")
        .and_then(|p| p.get("nested"))
        .and_then(|n| n.get("value"));
    assert_eq!(value.and_then(serde_yaml::Value::as_u64), Some(42));
}

#[test]
fn include_cycle_is_detected() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "a.yaml", "b: !include b.yaml\n");
    write(dir.path(), "b.yaml", "a: !include a.yaml\n");
    let main = write(dir.path(), "app.qtype.yaml", "id: app\npart: !include a.yaml\n");

    let err = DocumentLoader::new().load(&main).unwrap_err();
    match err {
        QTypeError::Loader(diag) => assert_eq!(diag.code, codes::INCLUDE_CYCLE),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn missing_include_reports_io_error() {
    let dir = TempDir::new().unwrap();
    let main = write(
        dir.path(),
        "app.qtype.yaml",
        "id: app\npart: !include nope.yaml\n",
    );

    let err = DocumentLoader::new().load(&main).unwrap_err();
    match err {
        QTypeError::Loader(diag) => assert_eq!(diag.code, codes::LOADER_IO),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn env_expansion_applies_before_decode() {
    let dir = TempDir::new().unwrap();
    std::env::set_var("QTYPE_LOADER_TEST_PROVIDER", "openai");
    let main = write(
        dir.path(),
        "app.qtype.yaml",
        "id: app\nprovider: ${QTYPE_LOADER_TEST_PROVIDER}\nregion: ${QTYPE_LOADER_TEST_MISSING:-us-east-1}\n",
    );

    let doc = DocumentLoader::new().load(&main).unwrap();
    assert_eq!(
        doc.root.get("provider").and_then(serde_yaml::Value::as_str),
        Some("openai")
    );
    assert_eq!(
        doc.root.get("region").and_then(serde_yaml::Value::as_str),
        Some("us-east-1")
    );
}

// Dumping the loaded tree and re-reading it restores the same tree
// (comments and anchors excepted).
#[test]
fn dump_round_trip_restores_tree() {
    let dir = TempDir::new().unwrap();
    let main = write(
        dir.path(),
        "app.qtype.yaml",
        r"
id: app
flows:
  - id: main
    variables:
      - id: question
        type: text
    inputs: [question]
    steps:
      - type: Echo
        id: fwd
        inputs: [question]
        outputs: [question]
",
    );

    let doc = DocumentLoader::new().load(&main).unwrap();
    let dumped = serde_yaml::to_string(&doc.root).unwrap();
    let reparsed: serde_yaml::Value = serde_yaml::from_str(&dumped).unwrap();
    assert_eq!(reparsed, doc.root);
}

#[test]
fn source_map_spans_included_files() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "models.yaml",
        "- type: Model\n  id: gpt4\n  provider: openai\n",
    );
    let main = write(
        dir.path(),
        "app.qtype.yaml",
        "id: app\nmodels: !include models.yaml\n",
    );

    let doc = DocumentLoader::new().load(&main).unwrap();
    let loc = doc.source_map.resolve("models/0/id").unwrap();
    assert!(loc.file.ends_with("models.yaml"));
    assert_eq!(loc.line, 2);
}
