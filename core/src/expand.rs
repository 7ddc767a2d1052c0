//! Placeholder expansion.
//!
//! Task payloads may reference variables as `${name}` and prior task results
//! as `${from.task:TASK_ID[.path]}`. The path grammar supports dot access,
//! `[index]`, `[?(@.field op literal)]` predicates, and a trailing
//! `.length()` applied after resolution.
//!
//! A string that consists of exactly one placeholder resolves to the original
//! typed value; placeholders embedded in longer strings JSON-stringify
//! non-string values in place.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::errors::{ExpandError, ExpandResult};
use crate::expression::compare_values;
use crate::runstate::RunState;
use crate::variables::Variable;

const TASK_REF_PREFIX: &str = "from.task:";

/// Everything a placeholder can resolve against: the run variable store
/// snapshot, an optional overlay of loop-local bindings, and prior task
/// snapshots.
pub struct ExpansionScope<'a> {
    variables: &'a HashMap<String, Variable>,
    locals: Option<&'a HashMap<String, Variable>>,
    run_state: &'a RunState,
}

impl<'a> ExpansionScope<'a> {
    pub fn new(variables: &'a HashMap<String, Variable>, run_state: &'a RunState) -> Self {
        Self {
            variables,
            locals: None,
            run_state,
        }
    }

    pub fn with_locals(mut self, locals: &'a HashMap<String, Variable>) -> Self {
        self.locals = Some(locals);
        self
    }

    fn lookup(&self, name: &str) -> Option<&Variable> {
        self.locals
            .and_then(|locals| locals.get(name))
            .or_else(|| self.variables.get(name))
    }

    /// Flattened name→value view, for handing to the expression evaluator.
    pub fn value_map(&self) -> HashMap<String, Value> {
        let mut map: HashMap<String, Value> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.value.clone()))
            .collect();
        if let Some(locals) = self.locals {
            for (k, v) in locals {
                map.insert(k.clone(), v.value.clone());
            }
        }
        map
    }
}

/// Expand every placeholder in a JSON value, walking maps, arrays and
/// strings.
pub fn expand_value(value: &Value, scope: &ExpansionScope<'_>) -> ExpandResult<Value> {
    match value {
        Value::String(s) => expand_string(s, scope),
        Value::Array(items) => {
            let expanded: Result<Vec<Value>, _> =
                items.iter().map(|item| expand_value(item, scope)).collect();
            Ok(Value::Array(expanded?))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), expand_value(item, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Expand a payload map in place, returning a new map.
pub fn expand_payload(
    payload: &Map<String, Value>,
    scope: &ExpansionScope<'_>,
) -> ExpandResult<Map<String, Value>> {
    let mut out = Map::new();
    for (key, value) in payload {
        out.insert(key.clone(), expand_value(value, scope)?);
    }
    Ok(out)
}

/// Expand placeholders in a single string.
pub fn expand_string(input: &str, scope: &ExpansionScope<'_>) -> ExpandResult<Value> {
    let Some(first) = find_placeholder(input, 0) else {
        return Ok(Value::String(input.to_string()));
    };

    // Whole-string placeholder keeps the resolved value's type.
    if first.0 == 0 && first.1 == input.len() {
        let token = &input[2..input.len() - 1];
        return resolve_token(token, scope);
    }

    let mut out = String::new();
    let mut cursor = 0;
    let mut next = Some(first);
    while let Some((start, end)) = next {
        out.push_str(&input[cursor..start]);
        let token = &input[start + 2..end - 1];
        let resolved = resolve_token(token, scope)?;
        match resolved {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        cursor = end;
        next = find_placeholder(input, cursor);
    }
    out.push_str(&input[cursor..]);
    Ok(Value::String(out))
}

/// Find the next `${...}` span, returning (start, end-exclusive).
fn find_placeholder(input: &str, from: usize) -> Option<(usize, usize)> {
    let start = input[from..].find("${")? + from;
    let end = input[start..].find('}')? + start;
    Some((start, end + 1))
}

fn resolve_token(token: &str, scope: &ExpansionScope<'_>) -> ExpandResult<Value> {
    if let Some(rest) = token.strip_prefix(TASK_REF_PREFIX) {
        resolve_task_ref(rest, scope)
    } else {
        scope
            .lookup(token)
            .map(|variable| variable.value.clone())
            .ok_or_else(|| ExpandError::UnknownReference(token.to_string()))
    }
}

/// Resolve `from.task:TASK_ID[.path]`. A bare reference yields the task's
/// result value; a path is applied to the full snapshot object, so
/// `.result`, `.status` and `.duration_seconds` are all addressable.
fn resolve_task_ref(rest: &str, scope: &ExpansionScope<'_>) -> ExpandResult<Value> {
    let split = rest
        .find(['.', '['])
        .map(|i| (&rest[..i], &rest[i..]))
        .unwrap_or((rest, ""));
    let (task_id, path) = split;

    let snapshot = scope
        .run_state
        .snapshot(task_id)
        .ok_or_else(|| ExpandError::UnresolvedTaskResult(task_id.to_string()))?;

    if path.is_empty() {
        return snapshot
            .result
            .clone()
            .ok_or_else(|| ExpandError::UnresolvedTaskResult(task_id.to_string()));
    }

    let base = serde_json::to_value(&snapshot).map_err(|e| ExpandError::InvalidPath {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    apply_path(&base, path)
}

#[derive(Debug, PartialEq)]
enum Segment {
    Field(String),
    Index(usize),
    Filter {
        field: String,
        op: String,
        literal: Value,
    },
    Length,
}

fn apply_path(base: &Value, path: &str) -> ExpandResult<Value> {
    let segments = parse_path(path)?;
    let mut current = base.clone();

    for segment in segments {
        current = match segment {
            Segment::Field(name) => match &current {
                Value::Object(map) => {
                    map.get(&name).cloned().ok_or_else(|| ExpandError::InvalidPath {
                        path: path.to_string(),
                        message: format!("missing field '{name}'"),
                    })?
                }
                _ => {
                    return Err(ExpandError::InvalidPath {
                        path: path.to_string(),
                        message: format!("cannot access field '{name}' on non-object"),
                    })
                }
            },
            Segment::Index(index) => match &current {
                Value::Array(items) => {
                    items.get(index).cloned().ok_or_else(|| ExpandError::InvalidPath {
                        path: path.to_string(),
                        message: format!("index {index} out of bounds"),
                    })?
                }
                _ => {
                    return Err(ExpandError::InvalidPath {
                        path: path.to_string(),
                        message: format!("cannot index non-array with [{index}]"),
                    })
                }
            },
            Segment::Filter { field, op, literal } => match &current {
                Value::Array(items) => items
                    .iter()
                    .find(|item| {
                        item.get(&field)
                            .map(|candidate| {
                                compare_values(candidate, &op, &literal).unwrap_or(false)
                            })
                            .unwrap_or(false)
                    })
                    .cloned()
                    .ok_or_else(|| ExpandError::InvalidPath {
                        path: path.to_string(),
                        message: "no element matches predicate".to_string(),
                    })?,
                _ => {
                    return Err(ExpandError::InvalidPath {
                        path: path.to_string(),
                        message: "predicate applied to non-array".to_string(),
                    })
                }
            },
            Segment::Length => {
                let length = match &current {
                    Value::Array(items) => items.len(),
                    Value::String(s) => s.chars().count(),
                    Value::Object(map) => map.len(),
                    _ => {
                        return Err(ExpandError::InvalidPath {
                            path: path.to_string(),
                            message: "length() applied to scalar".to_string(),
                        })
                    }
                };
                Value::Number(length.into())
            }
        };
    }

    Ok(current)
}

fn parse_path(path: &str) -> ExpandResult<Vec<Segment>> {
    let bad = |message: String| ExpandError::InvalidPath {
        path: path.to_string(),
        message,
    };

    let mut segments = Vec::new();
    let bytes = path.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        match bytes[pos] {
            b'.' => {
                pos += 1;
                let start = pos;
                while pos < bytes.len() && bytes[pos] != b'.' && bytes[pos] != b'[' {
                    pos += 1;
                }
                let name = &path[start..pos];
                if name == "length()" {
                    segments.push(Segment::Length);
                } else if name.is_empty() {
                    return Err(bad("empty path segment".to_string()));
                } else {
                    segments.push(Segment::Field(name.to_string()));
                }
            }
            b'[' => {
                let end = path[pos..]
                    .find(']')
                    .map(|i| i + pos)
                    .ok_or_else(|| bad("unterminated '['".to_string()))?;
                let inner = &path[pos + 1..end];
                if let Some(predicate) = inner.strip_prefix("?(").and_then(|s| s.strip_suffix(')'))
                {
                    segments.push(parse_predicate(predicate, path)?);
                } else {
                    let index: usize = inner
                        .trim()
                        .parse()
                        .map_err(|_| bad(format!("invalid index '{inner}'")))?;
                    segments.push(Segment::Index(index));
                }
                pos = end + 1;
            }
            other => {
                return Err(bad(format!(
                    "unexpected character '{}' in path",
                    other as char
                )))
            }
        }
    }

    // length() only makes sense as the final resolution step.
    if let Some(i) = segments.iter().position(|s| *s == Segment::Length) {
        if i != segments.len() - 1 {
            return Err(bad("length() must be the last segment".to_string()));
        }
    }

    Ok(segments)
}

/// Parse `@.field op literal`.
fn parse_predicate(predicate: &str, path: &str) -> ExpandResult<Segment> {
    let bad = |message: String| ExpandError::InvalidPath {
        path: path.to_string(),
        message,
    };

    let rest = predicate
        .trim()
        .strip_prefix("@.")
        .ok_or_else(|| bad("predicate must start with '@.'".to_string()))?;

    for op in ["==", "!=", "<=", ">=", "<", ">"] {
        if let Some(split) = rest.find(op) {
            let field = rest[..split].trim().to_string();
            let literal_text = rest[split + op.len()..].trim();
            if field.is_empty() {
                return Err(bad("predicate field is empty".to_string()));
            }
            let literal = parse_literal(literal_text)
                .ok_or_else(|| bad(format!("invalid literal '{literal_text}'")))?;
            return Ok(Segment::Filter {
                field,
                op: op.to_string(),
                literal,
            });
        }
    }
    Err(bad(format!("no operator in predicate '{predicate}'")))
}

fn parse_literal(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if (trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2)
        || (trimmed.starts_with('\'') && trimmed.ends_with('\'') && trimmed.len() >= 2)
    {
        return Some(Value::String(trimmed[1..trimmed.len() - 1].to_string()));
    }
    match trimmed {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "null" => return Some(Value::Null),
        _ => {}
    }
    trimmed
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
}
