//! Typed variable storage for a single run.
//!
//! Variables are mutable across tasks within a run and destroyed at run end.
//! Secret values expand to their raw form during execution but render as
//! `<secret>` at every serialisation boundary (artifacts, events). Proxy
//! variables carry a scheme-to-endpoint map and expand into multiple
//! environment assignments when consumed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Placeholder rendered in place of secret values.
pub const SECRET_MASK: &str = "<secret>";

/// The type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    String,
    Number,
    Bool,
    Json,
    Proxy,
    Secret,
}

/// A single named, typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: VariableKind,

    pub value: Value,
}

impl Variable {
    pub fn new(name: impl Into<String>, kind: VariableKind, value: Value) -> Self {
        Self {
            name: name.into(),
            kind,
            value,
        }
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, VariableKind::String, Value::String(value.into()))
    }

    pub fn json(name: impl Into<String>, value: Value) -> Self {
        Self::new(name, VariableKind::Json, value)
    }

    pub fn is_secret(&self) -> bool {
        self.kind == VariableKind::Secret
    }

    /// Coerce the stored value to match the declared kind. String inputs are
    /// parsed for number/bool/json kinds so placeholder-expanded values keep
    /// their declared type.
    pub fn coerced(mut self) -> Result<Self, String> {
        self.value = match (self.kind, self.value) {
            (VariableKind::Number, Value::String(s)) => {
                let parsed: f64 = s
                    .parse()
                    .map_err(|_| format!("variable '{}' is not a number: {s:?}", self.name))?;
                serde_json::Number::from_f64(parsed)
                    .map(Value::Number)
                    .ok_or_else(|| format!("variable '{}' is not a finite number", self.name))?
            }
            (VariableKind::Bool, Value::String(s)) => {
                let parsed: bool = s
                    .parse()
                    .map_err(|_| format!("variable '{}' is not a bool: {s:?}", self.name))?;
                Value::Bool(parsed)
            }
            (VariableKind::Json, Value::String(s)) => serde_json::from_str(&s)
                .map_err(|e| format!("variable '{}' is not valid JSON: {e}", self.name))?,
            (_, value) => value,
        };
        Ok(self)
    }
}

/// Run-scoped mutable variable store.
///
/// Writes are serialised under the lock; reads take a consistent snapshot.
/// During PARALLEL composites child actions share the same store.
#[derive(Debug, Default)]
pub struct VariableStore {
    inner: RwLock<HashMap<String, Variable>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, variable: Variable) {
        self.inner.write().insert(variable.name.clone(), variable);
    }

    pub fn get(&self, name: &str) -> Option<Variable> {
        self.inner.read().get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<Variable> {
        self.inner.write().remove(name)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Consistent snapshot of the whole store.
    pub fn snapshot(&self) -> HashMap<String, Variable> {
        self.inner.read().clone()
    }

    /// Raw string forms of all secret values, for masking.
    pub fn secret_values(&self) -> Vec<String> {
        self.inner
            .read()
            .values()
            .filter(|v| v.is_secret())
            .filter_map(|v| match &v.value {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// Replace every occurrence of a secret value inside `value` with the
    /// mask. Masking happens at the serialisation boundary only, so actions
    /// still consume the real values.
    pub fn mask_value(&self, value: &Value) -> Value {
        let secrets = self.secret_values();
        if secrets.is_empty() {
            return value.clone();
        }
        mask_with(value, &secrets)
    }

    /// Variable snapshot rendered for the per-task environment artifact:
    /// secrets masked, proxies expanded into environment assignments.
    pub fn environment_snapshot(&self) -> Map<String, Value> {
        let mut out = Map::new();
        let guard = self.inner.read();
        let mut entries: Vec<(&String, &Variable)> = guard.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));

        for (name, variable) in entries {
            match variable.kind {
                VariableKind::Secret => {
                    out.insert(name.clone(), Value::String(SECRET_MASK.to_string()));
                }
                VariableKind::Proxy => {
                    for (key, endpoint) in proxy_assignments(&variable.value) {
                        out.insert(key, Value::String(endpoint));
                    }
                }
                _ => {
                    out.insert(name.clone(), variable.value.clone());
                }
            }
        }
        out
    }
}

fn mask_with(value: &Value, secrets: &[String]) -> Value {
    match value {
        Value::String(s) => {
            let mut masked = s.clone();
            for secret in secrets {
                if masked.contains(secret.as_str()) {
                    masked = masked.replace(secret.as_str(), SECRET_MASK);
                }
            }
            Value::String(masked)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| mask_with(v, secrets)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), mask_with(v, secrets)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Expand a proxy value (`{"http": endpoint, "https": endpoint, "no_proxy":
/// hosts}`) into the environment assignments consumers expect, upper and
/// lower case forms both.
fn proxy_assignments(value: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = value else {
        return Vec::new();
    };

    let mut out = Vec::new();
    for (scheme, endpoint) in map {
        let Value::String(endpoint) = endpoint else {
            continue;
        };
        let upper = if scheme.eq_ignore_ascii_case("no_proxy") {
            "NO_PROXY".to_string()
        } else {
            format!("{}_PROXY", scheme.to_uppercase())
        };
        out.push((upper.clone(), endpoint.clone()));
        out.push((upper.to_lowercase(), endpoint.clone()));
    }
    out
}
