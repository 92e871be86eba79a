//! ABOUTME: Secret reference shape and pluggable resolution interface
//! ABOUTME: The core never bakes in a secret backend

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Pointer to an externally stored credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretReference {
    /// Identifier or ARN of the secret.
    pub secret_name: String,
    /// Field to extract when the secret is a JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// A field accepting either a literal string or a secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SecretValue {
    Reference(SecretReference),
    Literal(String),
}

impl SecretValue {
    /// Resolve to plaintext, consulting the resolver only for references.
    pub async fn resolve(&self, resolver: &dyn SecretResolver) -> Result<String> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Reference(reference) => resolver.resolve(reference).await,
        }
    }
}

/// Backend that turns secret references into plaintext at runtime.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    async fn resolve(&self, reference: &SecretReference) -> Result<String>;
}

/// Resolver that rejects every reference.
///
/// Default when the host wires no backend; documents using only literal
/// secrets still work.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecretResolver;

#[async_trait]
impl SecretResolver for NoSecretResolver {
    async fn resolve(&self, reference: &SecretReference) -> Result<String> {
        Err(crate::error::QTypeError::fatal(format!(
            "no secret resolver configured, cannot resolve '{}'",
            reference.secret_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untagged_forms_deserialize() {
        let literal: SecretValue = serde_json::from_str("\"sk-plain\"").unwrap();
        assert_eq!(literal, SecretValue::Literal("sk-plain".to_string()));

        let reference: SecretValue =
            serde_json::from_str(r#"{"secret_name": "prod/llm", "key": "api_key"}"#).unwrap();
        assert_eq!(
            reference,
            SecretValue::Reference(SecretReference {
                secret_name: "prod/llm".to_string(),
                key: Some("api_key".to_string()),
            })
        );
    }

    #[tokio::test]
    async fn literal_resolves_without_backend() {
        let value = SecretValue::Literal("token".to_string());
        assert_eq!(value.resolve(&NoSecretResolver).await.unwrap(), "token");
        let reference = SecretValue::Reference(SecretReference {
            secret_name: "x".to_string(),
            key: None,
        });
        assert!(reference.resolve(&NoSecretResolver).await.is_err());
    }
}
