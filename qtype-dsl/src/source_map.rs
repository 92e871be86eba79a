//! ABOUTME: Source map from document node paths to file positions
//! ABOUTME: Built by a YAML-aware line scan during loading

use qtype_core::SourceLocation;
use std::collections::HashMap;
use std::path::Path;

/// Node-path keyed location table.
///
/// Paths are slash-joined: `flows/0/steps/2/model`. Lookups fall back to the
/// nearest recorded ancestor, so a diagnostic for a deeply nested scalar
/// still points at the owning key.
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    entries: HashMap<String, SourceLocation>,
}

impl SourceMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: String, location: SourceLocation) {
        self.entries.insert(path, location);
    }

    /// Merge another map under a path prefix (used for included files).
    pub fn merge_under(&mut self, prefix: &str, other: SourceMap) {
        for (path, location) in other.entries {
            let merged = if path.is_empty() {
                prefix.to_string()
            } else {
                format!("{prefix}/{path}")
            };
            self.entries.entry(merged).or_insert(location);
        }
    }

    /// Exact lookup.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&SourceLocation> {
        self.entries.get(path)
    }

    /// Lookup with ancestor fallback.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<SourceLocation> {
        let mut current = path;
        loop {
            if let Some(location) = self.entries.get(current) {
                return Some(location.clone());
            }
            match current.rfind('/') {
                Some(idx) => current = &current[..idx],
                None => return self.entries.get("").cloned(),
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug)]
enum Segment {
    Key(String),
    Index(usize),
}

struct StackEntry {
    indent: usize,
    segment: Segment,
}

/// Scan YAML text and record a location per mapping key and sequence item.
///
/// This is an outline scan, not a full parse: flow-style collections on one
/// line resolve to their owning key, and block scalars (`|`, `>`) are
/// skipped wholesale.
#[must_use]
pub fn scan_locations(text: &str, file: &Path) -> SourceMap {
    let mut map = SourceMap::new();
    map.insert(
        String::new(),
        SourceLocation {
            file: file.to_path_buf(),
            line: 1,
            col: 1,
        },
    );

    let mut stack: Vec<StackEntry> = Vec::new();
    // Indent of a key whose value is a block scalar; deeper lines are content.
    let mut block_scalar_indent: Option<usize> = None;

    for (line_no, raw_line) in text.lines().enumerate() {
        let line_no = line_no + 1;
        let indent = raw_line.len() - raw_line.trim_start_matches(' ').len();
        let content = &raw_line[indent..];
        if content.is_empty() || content.starts_with('#') {
            continue;
        }
        if let Some(scalar_indent) = block_scalar_indent {
            if indent > scalar_indent {
                continue;
            }
            block_scalar_indent = None;
        }

        let mut indent = indent;
        let mut content = content;
        let mut col = indent + 1;

        // A line may open a sequence item and a mapping key at once: `- id: x`.
        while let Some(rest) = content.strip_prefix("- ").or_else(|| {
            (content == "-").then_some("")
        }) {
            pop_for_sequence(&mut stack, indent);
            next_index(&mut stack, indent);
            record(&mut map, &stack, file, line_no, col);
            indent += 2;
            col += 2;
            content = rest;
            if content.is_empty() {
                break;
            }
        }

        if let Some((key, rest)) = split_key(content) {
            pop_for_key(&mut stack, indent);
            stack.push(StackEntry {
                indent,
                segment: Segment::Key(key.to_string()),
            });
            record(&mut map, &stack, file, line_no, col);
            let value = rest.trim();
            if value == "|" || value == ">" || value.starts_with("|-")
                || value.starts_with("|+") || value.starts_with(">-") || value.starts_with(">+")
            {
                block_scalar_indent = Some(indent);
            }
        }
    }

    map
}

fn split_key(content: &str) -> Option<(&str, &str)> {
    let colon = content.find(':')?;
    let key = &content[..colon];
    let rest = &content[colon + 1..];
    if !rest.is_empty() && !rest.starts_with(' ') {
        return None;
    }
    let trimmed = key.trim().trim_matches('"').trim_matches('\'');
    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return None;
    }
    Some((trimmed, rest))
}

// Keys deeper than the dash belong to a previous item; a key or index at
// the dash's own indent is the sequence owner and stays.
fn pop_for_sequence(stack: &mut Vec<StackEntry>, indent: usize) {
    while let Some(top) = stack.last() {
        if top.indent > indent {
            stack.pop();
        } else {
            break;
        }
    }
}

fn next_index(stack: &mut Vec<StackEntry>, indent: usize) {
    if let Some(top) = stack.last_mut() {
        if top.indent == indent {
            if let Segment::Index(n) = &mut top.segment {
                *n += 1;
                return;
            }
        }
    }
    stack.push(StackEntry {
        indent,
        segment: Segment::Index(0),
    });
}

fn pop_for_key(stack: &mut Vec<StackEntry>, indent: usize) {
    while let Some(top) = stack.last() {
        if top.indent >= indent {
            stack.pop();
        } else {
            break;
        }
    }
}

fn record(map: &mut SourceMap, stack: &[StackEntry], file: &Path, line: usize, col: usize) {
    let path = stack
        .iter()
        .map(|entry| match &entry.segment {
            Segment::Key(key) => key.clone(),
            Segment::Index(index) => index.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/");
    map.insert(
        path,
        SourceLocation {
            file: file.to_path_buf(),
            line,
            col,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn scan(text: &str) -> SourceMap {
        scan_locations(text, &PathBuf::from("test.yaml"))
    }

    #[test]
    fn records_top_level_keys() {
        let map = scan("id: app\nmodels:\n  - id: gpt4\n");
        assert_eq!(map.get("id").unwrap().line, 1);
        assert_eq!(map.get("models").unwrap().line, 2);
        assert_eq!(map.get("models/0").unwrap().line, 3);
        assert_eq!(map.get("models/0/id").unwrap().line, 3);
    }

    #[test]
    fn tracks_sequence_siblings() {
        let text = "steps:\n  - id: a\n    template: x\n  - id: b\n";
        let map = scan(text);
        assert_eq!(map.get("steps/0/id").unwrap().line, 2);
        assert_eq!(map.get("steps/0/template").unwrap().line, 3);
        assert_eq!(map.get("steps/1/id").unwrap().line, 4);
    }

    #[test]
    fn sequence_at_parent_indent() {
        let text = "flows:\n- id: f1\n- id: f2\n";
        let map = scan(text);
        assert_eq!(map.get("flows/0/id").unwrap().line, 2);
        assert_eq!(map.get("flows/1/id").unwrap().line, 3);
    }

    #[test]
    fn block_scalars_do_not_leak_keys() {
        let text = "template: |\n  fake: key\nnext: 1\n";
        let map = scan(text);
        assert!(map.get("fake").is_none());
        assert_eq!(map.get("next").unwrap().line, 3);
    }

    #[test]
    fn resolve_falls_back_to_ancestor() {
        let map = scan("models:\n  - id: gpt4\n");
        let loc = map.resolve("models/0/provider/nested").unwrap();
        assert_eq!(loc.line, 2);
    }
}
