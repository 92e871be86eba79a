//! ABOUTME: Machine-checkable JSON schema for QType documents
//! ABOUTME: Hand-maintained against the document model; tests keep it in sync

use serde_json::{json, Value};

const STEP_TAGS: [&str; 22] = [
    "LLMInference",
    "Agent",
    "PromptTemplate",
    "InvokeTool",
    "InvokeFlow",
    "Condition",
    "FileSource",
    "SQLSource",
    "DocumentSource",
    "DocumentSplitter",
    "DocumentEmbedder",
    "VectorSearch",
    "DocumentSearch",
    "IndexUpsert",
    "Reranker",
    "Aggregate",
    "Explode",
    "Collect",
    "FieldExtractor",
    "Construct",
    "Decoder",
    "Echo",
];

/// Derive the document schema from the parser's variant tags and field
/// metadata.
///
/// The schema is intentionally permissive below the discriminator level:
/// per-variant field validation is the parser's job, the schema guards the
/// document skeleton and the closed tag sets.
#[must_use]
pub fn document_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "QType application document",
        "type": "object",
        "required": ["id"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "description": { "type": "string" },
            "references": { "type": "array", "items": { "$ref": "#" } },
            "types": { "type": "array", "items": { "$ref": "#/definitions/custom_type" } },
            "variables": { "type": "array", "items": { "$ref": "#/definitions/variable" } },
            "models": { "type": "array", "items": { "$ref": "#/definitions/model" } },
            "memories": { "type": "array", "items": { "$ref": "#/definitions/memory" } },
            "auths": { "type": "array", "items": { "$ref": "#/definitions/auth" } },
            "tools": { "type": "array", "items": { "$ref": "#/definitions/tool" } },
            "indexes": { "type": "array", "items": { "$ref": "#/definitions/index" } },
            "telemetry": { "type": "object" },
            "flows": { "type": "array", "items": { "$ref": "#/definitions/flow" } }
        },
        "definitions": {
            "type_ref": {
                "type": "string",
                "pattern": r"^(list\[)*[A-Za-z_][A-Za-z0-9_.\-]*\??(\])*\??$"
            },
            "reference": {
                "oneOf": [
                    { "type": "string", "minLength": 1 },
                    {
                        "type": "object",
                        "required": ["ref"],
                        "properties": { "ref": { "type": "string" } }
                    },
                    { "type": "object", "required": ["type"] }
                ]
            },
            "secret_value": {
                "oneOf": [
                    { "type": "string" },
                    {
                        "type": "object",
                        "required": ["secret_name"],
                        "properties": {
                            "secret_name": { "type": "string" },
                            "key": { "type": "string" }
                        }
                    }
                ]
            },
            "variable": {
                "type": "object",
                "required": ["id", "type"],
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "type": { "$ref": "#/definitions/type_ref" },
                    "optional": { "type": "boolean" },
                    "ui_hint": { "type": "string" }
                }
            },
            "custom_type": {
                "type": "object",
                "required": ["id"],
                "properties": { "id": { "type": "string" } },
                "oneOf": [
                    { "required": ["fields"] },
                    { "required": ["element"] }
                ]
            },
            "model": {
                "type": "object",
                "required": ["type", "provider"],
                "properties": {
                    "type": { "enum": ["Model", "EmbeddingModel"] },
                    "id": { "type": "string" },
                    "provider": { "type": "string" },
                    "provider_model_id": { "type": "string" },
                    "dimensions": { "type": "integer", "minimum": 1 },
                    "inference_params": { "type": "object" },
                    "auth": { "$ref": "#/definitions/reference" }
                }
            },
            "memory": {
                "type": "object",
                "required": ["id"],
                "properties": {
                    "id": { "type": "string" },
                    "token_limit": { "type": "integer", "minimum": 1 },
                    "chat_history_token_ratio": {
                        "type": "number",
                        "exclusiveMinimum": 0,
                        "maximum": 1
                    },
                    "token_flush_size": { "type": "integer", "minimum": 1 }
                }
            },
            "auth": {
                "type": "object",
                "required": ["type"],
                "properties": {
                    "type": { "enum": ["api_key", "bearer", "oauth2", "aws"] },
                    "id": { "type": "string" }
                }
            },
            "tool": {
                "type": "object",
                "required": ["type", "name"],
                "properties": {
                    "type": { "enum": ["api", "function"] },
                    "id": { "type": "string" },
                    "name": { "type": "string" },
                    "description": { "type": "string" },
                    "inputs": { "type": "object" },
                    "outputs": { "type": "object" }
                }
            },
            "index": {
                "type": "object",
                "required": ["type", "name"],
                "properties": {
                    "type": { "enum": ["vector", "document"] },
                    "id": { "type": "string" },
                    "name": { "type": "string" },
                    "embedding_model": { "$ref": "#/definitions/reference" },
                    "auth": { "$ref": "#/definitions/reference" },
                    "args": { "type": "object" }
                }
            },
            "step": {
                "type": "object",
                "required": ["type", "id"],
                "properties": {
                    "type": { "enum": STEP_TAGS },
                    "id": { "type": "string", "minLength": 1 },
                    "inputs": { "type": "array", "items": { "type": "string" } },
                    "outputs": { "type": "array", "items": { "type": "string" } },
                    "concurrency": { "type": "integer", "minimum": 1 },
                    "batch_size": { "type": "integer", "minimum": 1 }
                }
            },
            "flow": {
                "type": "object",
                "required": ["id"],
                "properties": {
                    "id": { "type": "string", "minLength": 1 },
                    "description": { "type": "string" },
                    "interface": { "enum": ["complete", "conversational"] },
                    "variables": { "type": "array", "items": { "$ref": "#/definitions/variable" } },
                    "inputs": { "type": "array", "items": { "type": "string" } },
                    "outputs": { "type": "array", "items": { "type": "string" } },
                    "session_inputs": { "type": "array", "items": { "type": "string" } },
                    "steps": { "type": "array", "items": { "$ref": "#/definitions/step" } }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_well_formed() {
        let schema = document_schema();
        assert!(schema.get("definitions").is_some());
        let tags = schema["definitions"]["step"]["properties"]["type"]["enum"]
            .as_array()
            .unwrap();
        assert_eq!(tags.len(), STEP_TAGS.len());
    }
}
