//! ABOUTME: Document loader with environment substitution and file inclusion
//! ABOUTME: Turns a file path into a raw YAML tree plus a source map

use crate::source_map::{scan_locations, SourceMap};
use qtype_core::{codes, Diagnostic, QTypeError, Result, SourceLocation};
use regex::Regex;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::debug;

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern")
});

const INCLUDE_TAG: &str = "!include";
const INCLUDE_RAW_TAG: &str = "!include_raw";

/// A raw decoded document: the YAML tree after environment substitution and
/// include resolution, plus locations for diagnostics.
#[derive(Debug, Clone)]
pub struct LoadedDocument {
    pub path: PathBuf,
    pub root: Value,
    pub source_map: SourceMap,
}

/// Loads QType documents from the filesystem.
#[derive(Debug, Default)]
pub struct DocumentLoader {
    // Include stack for cycle detection, outermost first.
    include_stack: Vec<PathBuf>,
}

impl DocumentLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a document from a file.
    pub fn load(&mut self, path: &Path) -> Result<LoadedDocument> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            QTypeError::Loader(
                Diagnostic::new(
                    codes::LOADER_IO,
                    format!("failed to read '{}': {err}", path.display()),
                )
                .with_location(file_start(path)),
            )
        })?;
        self.load_str(&text, path)
    }

    /// Load a document from text, resolving includes relative to `path`.
    pub fn load_str(&mut self, text: &str, path: &Path) -> Result<LoadedDocument> {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        if self.include_stack.contains(&canonical) {
            let chain = self
                .include_stack
                .iter()
                .chain(std::iter::once(&canonical))
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(QTypeError::Loader(
                Diagnostic::new(codes::INCLUDE_CYCLE, format!("include cycle: {chain}"))
                    .with_location(file_start(path)),
            ));
        }
        self.include_stack.push(canonical);
        let result = self.load_str_inner(text, path);
        self.include_stack.pop();
        result
    }

    fn load_str_inner(&mut self, text: &str, path: &Path) -> Result<LoadedDocument> {
        debug!(file = %path.display(), "loading document");
        let expanded = expand_env(text, path).map_err(QTypeError::Loader)?;
        let mut source_map = scan_locations(&expanded, path);

        let root: Value = serde_yaml::from_str(&expanded).map_err(|err| {
            let location = err.location().map_or_else(
                || file_start(path),
                |loc| SourceLocation {
                    file: path.to_path_buf(),
                    line: loc.line(),
                    col: loc.column(),
                },
            );
            QTypeError::Loader(
                Diagnostic::new(codes::YAML_DECODE, format!("invalid YAML: {err}"))
                    .with_location(location),
            )
        })?;

        let base_dir = path.parent().map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let root = self
            .resolve_includes(root, &base_dir, path, "", &mut source_map)
            .map_err(QTypeError::Loader)?;

        Ok(LoadedDocument {
            path: path.to_path_buf(),
            root,
            source_map,
        })
    }

    fn resolve_includes(
        &mut self,
        value: Value,
        base_dir: &Path,
        file: &Path,
        node_path: &str,
        source_map: &mut SourceMap,
    ) -> std::result::Result<Value, Diagnostic> {
        match value {
            Value::Tagged(tagged) => {
                let tag = tagged.tag.to_string();
                match tag.as_str() {
                    INCLUDE_TAG => {
                        let target = include_target(&tagged.value, file, node_path, source_map)?;
                        let target = base_dir.join(target);
                        let included = self
                            .load(&target)
                            .map_err(|err| flatten_loader_error(err, file, node_path, source_map))?;
                        source_map.merge_under(node_path, included.source_map);
                        Ok(included.root)
                    }
                    INCLUDE_RAW_TAG => {
                        let target = include_target(&tagged.value, file, node_path, source_map)?;
                        let target = base_dir.join(target);
                        let raw = std::fs::read_to_string(&target).map_err(|err| {
                            Diagnostic::new(
                                codes::LOADER_IO,
                                format!("failed to read '{}': {err}", target.display()),
                            )
                            .with_location_opt(source_map.resolve(node_path))
                        })?;
                        Ok(Value::String(raw))
                    }
                    _ => {
                        // Unknown tags pass through untouched; the parser
                        // rejects them if they land somewhere meaningful.
                        let inner = self.resolve_includes(
                            tagged.value,
                            base_dir,
                            file,
                            node_path,
                            source_map,
                        )?;
                        Ok(Value::Tagged(Box::new(serde_yaml::value::TaggedValue {
                            tag: tagged.tag,
                            value: inner,
                        })))
                    }
                }
            }
            Value::Mapping(mapping) => {
                let mut resolved = serde_yaml::Mapping::with_capacity(mapping.len());
                for (key, entry) in mapping {
                    let child_path = match key.as_str() {
                        Some(name) if node_path.is_empty() => name.to_string(),
                        Some(name) => format!("{node_path}/{name}"),
                        None => node_path.to_string(),
                    };
                    let entry =
                        self.resolve_includes(entry, base_dir, file, &child_path, source_map)?;
                    resolved.insert(key, entry);
                }
                Ok(Value::Mapping(resolved))
            }
            Value::Sequence(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let child_path = if node_path.is_empty() {
                        index.to_string()
                    } else {
                        format!("{node_path}/{index}")
                    };
                    resolved.push(self.resolve_includes(
                        item, base_dir, file, &child_path, source_map,
                    )?);
                }
                Ok(Value::Sequence(resolved))
            }
            scalar => Ok(scalar),
        }
    }
}

fn include_target(
    value: &Value,
    file: &Path,
    node_path: &str,
    source_map: &SourceMap,
) -> std::result::Result<PathBuf, Diagnostic> {
    value.as_str().map(PathBuf::from).ok_or_else(|| {
        Diagnostic::new(
            codes::YAML_DECODE,
            format!(
                "include directive in '{}' must carry a relative path string",
                file.display()
            ),
        )
        .with_location_opt(source_map.resolve(node_path))
    })
}

// Include errors keep their own diagnostics; only the location fallback is
// rewritten to the including node.
fn flatten_loader_error(
    err: QTypeError,
    _file: &Path,
    node_path: &str,
    source_map: &SourceMap,
) -> Diagnostic {
    match err {
        QTypeError::Loader(mut diag) => {
            if diag.location.is_none() {
                diag.location = source_map.resolve(node_path);
            }
            diag
        }
        other => Diagnostic::new(codes::LOADER_IO, other.to_string()),
    }
}

fn file_start(path: &Path) -> SourceLocation {
    SourceLocation {
        file: path.to_path_buf(),
        line: 1,
        col: 1,
    }
}

/// Expand `${VAR}` and `${VAR:-default}` from the process environment.
///
/// Runs on raw text before YAML decoding, so substitution works anywhere in
/// the document including inside block scalars.
fn expand_env(text: &str, path: &Path) -> std::result::Result<String, Diagnostic> {
    let mut failure: Option<Diagnostic> = None;
    let expanded = ENV_VAR.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(value) => value,
            Err(_) => match caps.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    if failure.is_none() {
                        let offset = caps.get(0).map_or(0, |m| m.start());
                        let (line, col) = offset_to_line_col(text, offset);
                        failure = Some(
                            Diagnostic::new(
                                codes::ENV_VAR_UNRESOLVED,
                                format!("environment variable '{name}' is not set and has no default"),
                            )
                            .with_location(SourceLocation {
                                file: path.to_path_buf(),
                                line,
                                col,
                            }),
                        );
                    }
                    String::new()
                }
            },
        }
    });
    match failure {
        Some(diag) => Err(diag),
        None => Ok(expanded.into_owned()),
    }
}

fn offset_to_line_col(text: &str, offset: usize) -> (usize, usize) {
    let prefix = &text[..offset];
    let line = prefix.bytes().filter(|&b| b == b'\n').count() + 1;
    let col = prefix.rfind('\n').map_or(offset + 1, |nl| offset - nl);
    (line, col)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_env_with_default() {
        let text = "key: ${QTYPE_TEST_UNSET_VAR:-fallback}\n";
        let expanded = expand_env(text, Path::new("t.yaml")).unwrap();
        assert_eq!(expanded, "key: fallback\n");
    }

    #[test]
    fn unresolved_env_reports_position() {
        let text = "a: 1\nkey: ${QTYPE_DEFINITELY_UNSET_VAR}\n";
        let diag = expand_env(text, Path::new("t.yaml")).unwrap_err();
        assert_eq!(diag.code, codes::ENV_VAR_UNRESOLVED);
        let loc = diag.location.unwrap();
        assert_eq!(loc.line, 2);
        assert_eq!(loc.col, 6);
    }

    #[test]
    fn load_str_decodes_tree() {
        let mut loader = DocumentLoader::new();
        let doc = loader
            .load_str("id: app\nflows: []\n", Path::new("app.qtype.yaml"))
            .unwrap();
        assert_eq!(doc.root.get("id").and_then(Value::as_str), Some("app"));
        assert!(doc.source_map.get("flows").is_some());
    }

    #[test]
    fn yaml_error_carries_location() {
        let mut loader = DocumentLoader::new();
        let err = loader
            .load_str("id: [unclosed\n", Path::new("bad.yaml"))
            .unwrap_err();
        match err {
            QTypeError::Loader(diag) => assert_eq!(diag.code, codes::YAML_DECODE),
            other => panic!("unexpected error: {other}"),
        }
    }
}
