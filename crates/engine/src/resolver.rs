//! `${step.path}` variable substitution.
//!
//! A parameter string is split into literal text and references. A string
//! that is exactly one reference takes the referenced value as-is (type
//! preserved); references embedded in text are interpolated, strings
//! verbatim and everything else as compact JSON.
//!
//! Paths walk objects by key and arrays by index; both `items.0.name` and
//! `items[0].name` are accepted. A `${` without a closing `}` is plain text.

use serde_json::{Map, Value};

use crate::error::MissingInputError;
use crate::state::ExecutionState;

/// A parsed `${root.seg.seg}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    pub root: String,
    pub segments: Vec<String>,
    raw: String,
}

impl VarPath {
    /// Parse the text between `${` and `}`. Returns `None` for an empty or
    /// malformed reference.
    pub fn parse(text: &str) -> Option<Self> {
        let raw = text.trim();
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut chars = raw.chars();

        while let Some(c) = chars.next() {
            match c {
                '.' => parts.push(std::mem::take(&mut current)),
                '[' => {
                    if !current.is_empty() {
                        parts.push(std::mem::take(&mut current));
                    }
                    let index: String = chars.by_ref().take_while(|&c| c != ']').collect();
                    let index = index.trim();
                    if index.is_empty() || index.parse::<usize>().is_err() {
                        return None;
                    }
                    parts.push(index.to_string());
                    // `a[0].b`: swallow the dot that follows a bracket.
                    let rest = chars.as_str();
                    if let Some(stripped) = rest.strip_prefix('.') {
                        chars = stripped.chars();
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }

        if parts.is_empty() || parts.iter().any(|p| p.trim().is_empty()) {
            return None;
        }

        let root = parts.remove(0);
        Some(Self {
            root,
            segments: parts,
            raw: raw.to_string(),
        })
    }

    /// The reference as written, without delimiters.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Walk this path against `state`.
    pub fn lookup<'s>(&self, state: &'s ExecutionState) -> Result<&'s Value, MissingInputError> {
        let missing = |path: String| MissingInputError {
            step_id: self.root.clone(),
            reference: self.raw.clone(),
            path,
        };

        let mut value = state.lookup(&self.root).ok_or_else(|| missing(String::new()))?;

        for (depth, segment) in self.segments.iter().enumerate() {
            let next = match value {
                Value::Object(map) => map.get(segment),
                Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            };
            value = next.ok_or_else(|| missing(self.segments[depth..].join(".")))?;
        }

        Ok(value)
    }
}

/// One piece of a parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Piece {
    Text(String),
    Var(VarPath),
}

/// A string split into text and references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pieces: Vec<Piece>,
}

impl Template {
    pub fn parse(input: &str) -> Self {
        let mut pieces = Vec::new();
        let mut text = String::new();
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            let after = &rest[start + 2..];
            let Some(end) = after.find('}') else {
                break;
            };
            match VarPath::parse(&after[..end]) {
                Some(var) => {
                    text.push_str(&rest[..start]);
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    pieces.push(Piece::Var(var));
                }
                None => text.push_str(&rest[..start + 2 + end + 1]),
            }
            rest = &after[end + 1..];
        }

        text.push_str(rest);
        if !text.is_empty() {
            pieces.push(Piece::Text(text));
        }

        Self { pieces }
    }

    pub fn has_references(&self) -> bool {
        self.pieces.iter().any(|p| matches!(p, Piece::Var(_)))
    }

    pub fn references(&self) -> impl Iterator<Item = &VarPath> {
        self.pieces.iter().filter_map(|p| match p {
            Piece::Var(v) => Some(v),
            Piece::Text(_) => None,
        })
    }

    /// Substitute every reference.
    pub fn render(&self, state: &ExecutionState) -> Result<Value, MissingInputError> {
        match self.pieces.as_slice() {
            [] => Ok(Value::String(String::new())),
            [Piece::Var(var)] => var.lookup(state).cloned(),
            pieces => {
                let mut out = String::new();
                for piece in pieces {
                    match piece {
                        Piece::Text(t) => out.push_str(t),
                        Piece::Var(var) => match var.lookup(state)? {
                            Value::String(s) => out.push_str(s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

/// Resolve every reference in a step's parameters.
pub fn resolve_parameters(
    parameters: &Map<String, Value>,
    state: &ExecutionState,
) -> Result<Value, MissingInputError> {
    let mut resolved = Map::with_capacity(parameters.len());
    for (key, value) in parameters {
        resolved.insert(key.clone(), resolve_value(value, state)?);
    }
    Ok(Value::Object(resolved))
}

/// Resolve references anywhere inside `value`, recursing through arrays and
/// objects. Non-string leaves are cloned.
pub fn resolve_value(value: &Value, state: &ExecutionState) -> Result<Value, MissingInputError> {
    match value {
        Value::String(s) if s.contains("${") => Template::parse(s).render(state),
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, state))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => resolve_parameters(map, state),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Node, WorkflowDefinition};
    use crate::state::{StepRecord, StepStatus};
    use serde_json::json;
    use uuid::Uuid;

    fn state_with(outputs: Value) -> ExecutionState {
        let def = WorkflowDefinition::new("wf", vec![Node::trigger("t")], vec![]);
        let mut state = ExecutionState::new(Uuid::new_v4(), &def, Map::new());
        if let Value::Object(map) = outputs {
            for (step, output) in map {
                state.apply_step(
                    &step,
                    StepRecord {
                        status: StepStatus::Completed,
                        output: Some(output),
                        error: None,
                        attempts: 1,
                    },
                );
            }
        }
        state
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn whole_reference_preserves_type() {
        let state = state_with(json!({
            "step1": { "data": { "nested": [1, 2, 3] } },
            "step2": { "count": 7 }
        }));

        let out = resolve_parameters(
            &params(json!({ "a": "${step1.data.nested}", "b": "${step2}", "c": 42 })),
            &state,
        )
        .unwrap();

        assert_eq!(out, json!({ "a": [1, 2, 3], "b": { "count": 7 }, "c": 42 }));
    }

    #[test]
    fn embedded_references_interpolate() {
        let state = state_with(json!({ "user": { "name": "Ada", "age": 36, "tags": ["x"] } }));
        let out = resolve_value(
            &json!("Hi ${user.name} (${ user.age }) ${user.tags}"),
            &state,
        )
        .unwrap();
        assert_eq!(out, json!("Hi Ada (36) [\"x\"]"));
    }

    #[test]
    fn recurses_through_nested_containers() {
        let state = state_with(json!({ "a": { "id": 5 } }));
        let out = resolve_value(
            &json!({ "list": [{ "ref": "${a.id}" }, "plain"], "deep": { "x": ["${a}"] } }),
            &state,
        )
        .unwrap();
        assert_eq!(out, json!({ "list": [{ "ref": 5 }, "plain"], "deep": { "x": [{ "id": 5 }] } }));
    }

    #[test]
    fn array_indices_in_both_syntaxes() {
        let state = state_with(json!({ "s": { "items": [{ "n": "first" }, { "n": "second" }] } }));
        assert_eq!(resolve_value(&json!("${s.items.1.n}"), &state).unwrap(), json!("second"));
        assert_eq!(resolve_value(&json!("${s.items[0].n}"), &state).unwrap(), json!("first"));
    }

    #[test]
    fn missing_step_is_named() {
        let state = state_with(json!({}));
        let err = resolve_parameters(&params(json!({ "x": "${missing.output}" })), &state)
            .unwrap_err();
        assert_eq!(err.step_id, "missing");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn missing_key_along_path_is_reported() {
        let state = state_with(json!({ "a": { "b": {} } }));
        let err = resolve_value(&json!("${a.b.c.d}"), &state).unwrap_err();
        assert_eq!(err.step_id, "a");
        assert_eq!(err.path, "c.d");

        let err = resolve_value(&json!("${a.b[3]}"), &state).unwrap_err();
        assert_eq!(err.path, "3");
    }

    #[test]
    fn resolution_is_idempotent() {
        let state = state_with(json!({ "a": { "v": [1, { "w": true }] } }));
        let p = params(json!({ "x": "${a.v}", "y": "n=${a.v[0]}", "z": ["${a}"] }));
        let first = resolve_parameters(&p, &state).unwrap();
        let second = resolve_parameters(&p, &state).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn unterminated_and_empty_references_are_text() {
        let state = state_with(json!({}));
        assert_eq!(resolve_value(&json!("cost: ${"), &state).unwrap(), json!("cost: ${"));
        assert_eq!(resolve_value(&json!("${} left"), &state).unwrap(), json!("${} left"));
    }

    #[test]
    fn inputs_are_addressable() {
        let mut state = state_with(json!({}));
        state.inputs.insert("form".into(), json!({ "email": "a@b.c" }));
        assert_eq!(resolve_value(&json!("${form.email}"), &state).unwrap(), json!("a@b.c"));
    }

    #[test]
    fn var_path_parsing() {
        let p = VarPath::parse(" a.b[2].c ").unwrap();
        assert_eq!(p.root, "a");
        assert_eq!(p.segments, vec!["b", "2", "c"]);
        assert_eq!(p.as_str(), "a.b[2].c");
        assert!(VarPath::parse("a..b").is_none());
        assert!(VarPath::parse("a[x]").is_none());
        assert!(VarPath::parse("").is_none());
    }
}
