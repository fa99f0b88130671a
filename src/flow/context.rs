//! Accumulated per-node outputs and template resolution.
//!
//! Outputs are keyed by node id, with the run's top-level input under the
//! reserved `input` key. The map is append-only during a run in the sense
//! that nothing is ever removed; loop re-entry overwrites a node's slot
//! idempotently.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Reserved key holding the run's top-level input.
pub const INPUT_KEY: &str = "input";

#[derive(Debug, Error)]
pub enum ContextError {
    /// A `{{path}}` reference (or dotted path) did not resolve. Always names
    /// the missing path; blanks are never substituted silently.
    #[error("unresolved reference '{0}'")]
    UnresolvedPath(String),

    #[error("unterminated '{{{{' placeholder in template: {0}")]
    UnterminatedPlaceholder(String),
}

/// Concurrent store of node outputs for one execution.
#[derive(Debug, Clone, Default)]
pub struct ContextStore {
    data: Arc<DashMap<String, Value>>,
}

impl ContextStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: Value) -> Self {
        let store = Self::new();
        store.data.insert(INPUT_KEY.to_string(), input);
        store
    }

    /// Records a node's output. Idempotent overwrite.
    pub fn record_output(&self, node_id: &str, value: Value) {
        self.data.insert(node_id.to_string(), value);
    }

    pub fn output(&self, node_id: &str) -> Option<Value> {
        self.data.get(node_id).map(|v| v.clone())
    }

    pub fn input(&self) -> Value {
        self.output(INPUT_KEY).unwrap_or(Value::Null)
    }

    /// Stable snapshot of the whole context, for checkpoints.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.data
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn restore(snapshot: BTreeMap<String, Value>) -> Self {
        let store = Self::new();
        for (key, value) in snapshot {
            store.data.insert(key, value);
        }
        store
    }

    /// Node outputs only (snapshot minus the reserved input slot).
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        let mut snapshot = self.snapshot();
        snapshot.remove(INPUT_KEY);
        snapshot
    }

    /// The context as a single JSON object, for expression scopes.
    pub fn as_value(&self) -> Value {
        Value::Object(self.outputs().into_iter().collect())
    }

    /// Resolves a dotted path rooted at a node id (or `input`), e.g.
    /// `n1.output.field` or `n1.items[2].name`.
    pub fn resolve_path(&self, path: &str) -> Result<Value, ContextError> {
        let mut segments = split_path(path);
        if segments.is_empty() {
            return Err(ContextError::UnresolvedPath(path.to_string()));
        }
        let root = segments.remove(0);
        let root_value = match &root {
            PathSegment::Key(key) => self.output(key),
            PathSegment::Index(_) => None,
        };
        let mut current = match root_value {
            Some(value) => value,
            None => return Err(ContextError::UnresolvedPath(path.to_string())),
        };

        for segment in segments {
            let next = match (&segment, &current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key).cloned(),
                (PathSegment::Index(idx), Value::Array(items)) => items.get(*idx).cloned(),
                _ => None,
            };
            current = match next {
                Some(value) => value,
                None => return Err(ContextError::UnresolvedPath(path.to_string())),
            };
        }

        Ok(current)
    }

    /// Replaces every `{{path}}` occurrence in the text. Fails fast on the
    /// first unresolved path.
    pub fn resolve_template(&self, text: &str) -> Result<String, ContextError> {
        let mut result = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or_else(|| ContextError::UnterminatedPlaceholder(text.to_string()))?;
            let path = after[..end].trim();
            let value = self.resolve_path(path)?;
            result.push_str(&render_value(&value));
            rest = &after[end + 2..];
        }

        result.push_str(rest);
        Ok(result)
    }

    /// Resolves templates inside a JSON value. A string that is exactly one
    /// placeholder keeps the referenced value's type; mixed strings render
    /// as text. Objects and arrays are walked recursively.
    pub fn resolve_template_value(&self, value: &Value) -> Result<Value, ContextError> {
        match value {
            Value::String(text) => {
                let trimmed = text.trim();
                if trimmed.starts_with("{{")
                    && trimmed.ends_with("}}")
                    && !trimmed[2..trimmed.len() - 2].contains("{{")
                {
                    let path = trimmed[2..trimmed.len() - 2].trim();
                    self.resolve_path(path)
                } else {
                    Ok(Value::String(self.resolve_template(text)?))
                }
            }
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_template_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, item) in map {
                    resolved.insert(key.clone(), self.resolve_template_value(item)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }
}

enum PathSegment {
    Key(String),
    Index(usize),
}

fn split_path(path: &str) -> Vec<PathSegment> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let mut rest = part;
        while let Some(bracket) = rest.find('[') {
            if bracket > 0 {
                segments.push(PathSegment::Key(rest[..bracket].to_string()));
            }
            let after = &rest[bracket + 1..];
            match after.find(']') {
                Some(close) => {
                    match after[..close].parse::<usize>() {
                        Ok(idx) => segments.push(PathSegment::Index(idx)),
                        // A non-numeric index is treated as a key lookup.
                        Err(_) => segments.push(PathSegment::Key(after[..close].to_string())),
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    segments.push(PathSegment::Key(rest.to_string()));
                    rest = "";
                }
            }
        }
        if !rest.is_empty() {
            segments.push(PathSegment::Key(rest.to_string()));
        }
    }
    segments
}

/// Renders a resolved value into template text: strings verbatim, everything
/// else as compact JSON.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn resolves_nested_path_to_string() {
        let ctx = ContextStore::new();
        ctx.record_output("n1", json!({"output": {"x": 5}}));

        assert_eq!(ctx.resolve_template("{{n1.output.x}}").unwrap(), "5");
        assert_eq!(
            ctx.resolve_template("value is {{n1.output.x}}!").unwrap(),
            "value is 5!"
        );
    }

    #[test]
    fn missing_path_fails_with_the_path_name() {
        let ctx = ContextStore::new();
        ctx.record_output("n1", json!({"output": {"x": 5}}));

        match ctx.resolve_template("{{missing.output.x}}") {
            Err(ContextError::UnresolvedPath(path)) => {
                assert_eq!(path, "missing.output.x");
            }
            other => panic!("expected unresolved path, got {:?}", other),
        }
    }

    #[test]
    fn array_indexing_resolves() {
        let ctx = ContextStore::new();
        ctx.record_output("n1", json!({"items": [{"name": "a"}, {"name": "b"}]}));

        assert_eq!(ctx.resolve_template("{{n1.items[1].name}}").unwrap(), "b");
        assert!(ctx.resolve_template("{{n1.items[9].name}}").is_err());
    }

    #[test]
    fn whole_placeholder_keeps_value_type() {
        let ctx = ContextStore::with_input(json!({"count": 3}));
        ctx.record_output("n1", json!({"list": [1, 2]}));

        let resolved = ctx
            .resolve_template_value(&json!({
                "n": "{{input.count}}",
                "items": "{{n1.list}}",
                "text": "count={{input.count}}"
            }))
            .unwrap();
        assert_eq!(resolved, json!({"n": 3, "items": [1, 2], "text": "count=3"}));
    }

    #[test]
    fn record_output_is_idempotent_overwrite() {
        let ctx = ContextStore::new();
        ctx.record_output("n1", json!(1));
        ctx.record_output("n1", json!(2));
        assert_eq!(ctx.output("n1").unwrap(), json!(2));
    }

    #[test]
    fn snapshot_round_trips() {
        let ctx = ContextStore::with_input(json!({"a": 1}));
        ctx.record_output("n1", json!("done"));

        let restored = ContextStore::restore(ctx.snapshot());
        assert_eq!(restored.input(), json!({"a": 1}));
        assert_eq!(restored.output("n1").unwrap(), json!("done"));
    }

    #[test]
    fn unterminated_placeholder_is_rejected() {
        let ctx = ContextStore::new();
        assert!(matches!(
            ctx.resolve_template("hello {{n1.x"),
            Err(ContextError::UnterminatedPlaceholder(_))
        ));
    }
}
