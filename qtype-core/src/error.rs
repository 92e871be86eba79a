//! ABOUTME: Error types and diagnostics for QType
//! ABOUTME: Provides the QTypeError taxonomy, stable diagnostic codes, and source locations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Stable diagnostic codes.
///
/// Every diagnostic a user can see carries one of these codes; hosts key
/// documentation and test assertions on them, so the set is closed and the
/// strings never change.
pub mod codes {
    // Loader
    pub const ENV_VAR_UNRESOLVED: &str = "EnvVarUnresolved";
    pub const INCLUDE_CYCLE: &str = "IncludeCycle";
    pub const LOADER_IO: &str = "LoaderIo";
    pub const YAML_DECODE: &str = "YamlDecode";

    // Parser
    pub const UNKNOWN_VARIANT: &str = "UnknownVariant";
    pub const DISCRIMINATOR_MISSING: &str = "DiscriminatorMissing";
    pub const FIELD_INVALID: &str = "FieldInvalid";

    // Linker
    pub const REF_UNRESOLVED: &str = "RefUnresolved";
    pub const REF_KIND_MISMATCH: &str = "RefKindMismatch";
    pub const DUPLICATE_ID: &str = "DuplicateId";

    // Checker
    pub const FLOW_CYCLIC: &str = "FlowCyclic";
    pub const STEP_UNREACHABLE: &str = "StepUnreachable";
    pub const TYPE_MISMATCH: &str = "TypeMismatch";
    pub const TYPE_UNKNOWN: &str = "TypeUnknown";
    pub const VARIABLE_UNDECLARED: &str = "VariableUndeclared";
    pub const VARIABLE_UNPRODUCED: &str = "VariableUnproduced";
    pub const TEMPLATE_PLACEHOLDER_UNBOUND: &str = "TemplatePlaceholderUnbound";
    pub const INTERFACE_CONSTRAINT: &str = "InterfaceConstraint";
    pub const DIMENSION_MISMATCH: &str = "DimensionMismatch";
    pub const MEMORY_NOT_ALLOWED: &str = "MemoryNotAllowed";
    pub const CONDITION_BRANCH_MISMATCH: &str = "ConditionBranchMismatch";
    pub const FLOW_RECURSIVE: &str = "FlowRecursive";

    // Runtime
    pub const TEMPLATE_ERROR: &str = "TemplateError";
    pub const DECODE_ERROR: &str = "DecodeError";
    pub const TOOL_ERROR: &str = "ToolError";
    pub const EXTRACTION_ERROR: &str = "ExtractionError";
    pub const CONSTRUCT_ERROR: &str = "ConstructError";
    pub const AGENT_LOOP_EXHAUSTED: &str = "AgentLoopExhausted";
    pub const PROVIDER_ERROR: &str = "ProviderError";
    pub const INDEX_ERROR: &str = "IndexError";
    pub const FATAL_RUNTIME_ERROR: &str = "FatalRuntimeError";
    pub const CANCELLED: &str = "Cancelled";
}

/// Position of a document node, derived from the loader's source map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: usize,
    pub col: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.col)
    }
}

/// Severity of a diagnostic. Warnings never abort a load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Error,
    Warning,
}

/// A single user-visible problem with a stable code and optional location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub severity: Severity,
    pub location: Option<SourceLocation>,
}

impl Diagnostic {
    #[must_use]
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Error,
            location: None,
        }
    }

    #[must_use]
    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            severity: Severity::Warning,
            location: None,
        }
    }

    #[must_use]
    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    #[must_use]
    pub fn with_location(mut self, location: SourceLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Attach a location only when one is known.
    #[must_use]
    pub fn with_location_opt(mut self, location: Option<SourceLocation>) -> Self {
        self.location = location;
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} [{}] at {}", self.message, self.code, loc),
            None => write!(f, "{} [{}]", self.message, self.code),
        }
    }
}

fn join_diagnostics(diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error taxonomy for all QType operations.
///
/// The first four variants abort before execution and carry the collected
/// diagnostics from their layer. `Transient` is retried locally,
/// `MessageFailure` rides inside a `FlowMessage`, and `Fatal`/`Cancelled`
/// unwind the whole flow.
#[derive(Debug, Clone, Error)]
pub enum QTypeError {
    #[error("document load failed: {0}")]
    Loader(Diagnostic),

    #[error("document parse failed: {}", join_diagnostics(.0))]
    Parser(Vec<Diagnostic>),

    #[error("reference resolution failed: {}", join_diagnostics(.0))]
    Link(Vec<Diagnostic>),

    #[error("semantic check failed: {}", join_diagnostics(.0))]
    Checker(Vec<Diagnostic>),

    #[error("transient error: {message}")]
    Transient { message: String },

    #[error("{code}: {message}")]
    MessageFailure { code: String, message: String },

    #[error("fatal runtime error: {message}")]
    Fatal { message: String },

    #[error("cancelled")]
    Cancelled,
}

impl QTypeError {
    /// Build a transient (retryable) error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Build a message-level failure with a stable code.
    pub fn message_failure(code: &str, message: impl Into<String>) -> Self {
        Self::MessageFailure {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Build a fatal error that aborts the flow.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    /// Whether the error should be retried per the step retry policy.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// All diagnostics carried by a load-time error, empty for runtime errors.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        match self {
            Self::Loader(d) => vec![d.clone()],
            Self::Parser(ds) | Self::Link(ds) | Self::Checker(ds) => ds.clone(),
            _ => Vec::new(),
        }
    }
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, QTypeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display_includes_code_and_location() {
        let diag = Diagnostic::new(codes::ENV_VAR_UNRESOLVED, "variable HOME_X not set")
            .with_location(SourceLocation {
                file: PathBuf::from("app.qtype.yaml"),
                line: 12,
                col: 3,
            });
        let rendered = diag.to_string();
        assert!(rendered.contains("EnvVarUnresolved"));
        assert!(rendered.contains("app.qtype.yaml:12:3"));
    }

    #[test]
    fn transient_classification() {
        assert!(QTypeError::transient("rate limited").is_transient());
        assert!(!QTypeError::fatal("boom").is_transient());
        assert!(!QTypeError::Cancelled.is_transient());
    }

    #[test]
    fn load_errors_expose_diagnostics() {
        let err = QTypeError::Parser(vec![
            Diagnostic::new(codes::UNKNOWN_VARIANT, "unknown step type 'Frobnicate'"),
            Diagnostic::new(codes::FIELD_INVALID, "token_limit must be positive"),
        ]);
        assert_eq!(err.diagnostics().len(), 2);
        assert!(QTypeError::Cancelled.diagnostics().is_empty());
    }
}
