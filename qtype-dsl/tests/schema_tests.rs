//! The exported document schema must accept representative documents and
//! reject structural garbage.

use qtype_dsl::schema::document_schema;

fn validate(doc: serde_json::Value) -> bool {
    let schema = document_schema();
    let compiled = jsonschema::JSONSchema::compile(&schema).expect("schema compiles");
    compiled.is_valid(&doc)
}

#[test]
fn accepts_a_representative_document() {
    let doc = serde_json::json!({
        "id": "support_bot",
        "models": [
            { "type": "Model", "id": "gpt4", "provider": "openai" },
            { "type": "EmbeddingModel", "id": "embedder", "provider": "openai", "dimensions": 1536 }
        ],
        "memories": [
            { "id": "chat_memory", "token_limit": 50000 }
        ],
        "auths": [
            { "type": "api_key", "id": "main", "api_key": { "secret_name": "prod/llm" } }
        ],
        "indexes": [
            { "type": "vector", "id": "store", "name": "store", "embedding_model": "embedder" }
        ],
        "flows": [
            {
                "id": "main",
                "interface": "conversational",
                "variables": [
                    { "id": "chat_in", "type": "ChatMessage" },
                    { "id": "reply", "type": "ChatMessage" }
                ],
                "inputs": ["chat_in"],
                "outputs": ["reply"],
                "steps": [
                    {
                        "type": "LLMInference",
                        "id": "ask",
                        "model": "gpt4",
                        "inputs": ["chat_in"],
                        "outputs": ["reply"]
                    }
                ]
            }
        ]
    });
    assert!(validate(doc));
}

#[test]
fn rejects_unknown_step_tags_and_bad_shapes() {
    assert!(!validate(serde_json::json!({
        "id": "bad",
        "flows": [{ "id": "f", "steps": [{ "type": "Frobnicate", "id": "x" }] }]
    })));
    assert!(!validate(serde_json::json!({ "flows": [] })));
    assert!(!validate(serde_json::json!({
        "id": "bad",
        "memories": [{ "id": "m", "chat_history_token_ratio": 2.0 }]
    })));
}
