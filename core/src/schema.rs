//! Flow-file JSON schema.
//!
//! The combined schema is assembled once process-wide from the base flow
//! schema plus every registered action's fragment. Fragments land under
//! `definitions.task.allOf`, conditioned on the task's `action` value.

use jsonschema::Validator;
use once_cell::sync::OnceCell;
use serde_json::{json, Value};

use crate::errors::{LoadError, LoadResult};
use crate::registry::ActionRegistry;

static COMBINED: OnceCell<SchemaSet> = OnceCell::new();

struct SchemaSet {
    schema: Value,
    validator: Validator,
}

/// Base schema for the flow-file format, before action fragments.
pub fn base_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "FlowK flow definition",
        "type": "object",
        "required": ["id", "tasks"],
        "properties": {
            "id": {"type": "string", "minLength": 1},
            "description": {"type": "string"},
            "imports": {"type": "array", "items": {"type": "string"}},
            "on_error_flow": {"type": "string"},
            "finally_flow": {"type": "string"},
            "finally_task": {"type": "string"},
            "tasks": {
                "type": "array",
                "items": {"$ref": "#/definitions/task"}
            }
        },
        "definitions": {
            "task": {
                "type": "object",
                "required": ["action"],
                "properties": {
                    "id": {"type": "string"},
                    "description": {"type": "string"},
                    "action": {"type": "string", "minLength": 1},
                    "tasks": {
                        "type": "array",
                        "items": {"$ref": "#/definitions/task"}
                    }
                },
                "allOf": []
            }
        }
    })
}

/// Assemble the combined schema for a registry's action set.
pub fn build_combined_schema(registry: &ActionRegistry) -> Value {
    let mut schema = base_schema();

    let conditions: Vec<Value> = registry
        .schema_fragments()
        .into_iter()
        .map(|(name, fragment)| {
            json!({
                "if": {"properties": {"action": {"const": name}}},
                "then": fragment
            })
        })
        .collect();

    if let Some(all_of) = schema
        .pointer_mut("/definitions/task/allOf")
        .and_then(Value::as_array_mut)
    {
        all_of.extend(conditions);
    }
    schema
}

fn schema_set(registry: &ActionRegistry) -> LoadResult<&'static SchemaSet> {
    COMBINED.get_or_try_init(|| {
        let schema = build_combined_schema(registry);
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| LoadError::Invalid(format!("combined schema does not compile: {e}")))?;
        Ok(SchemaSet { schema, validator })
    })
}

/// The combined schema document, computed on first use.
pub fn combined_schema(registry: &ActionRegistry) -> LoadResult<&'static Value> {
    Ok(&schema_set(registry)?.schema)
}

/// Validate a flow document, returning every violation with its instance
/// path.
pub fn validate(instance: &Value, registry: &ActionRegistry) -> LoadResult<Vec<String>> {
    let set = schema_set(registry)?;
    let output = set.validator.apply(instance).basic();
    match output {
        jsonschema::BasicOutput::Valid(_) => Ok(Vec::new()),
        jsonschema::BasicOutput::Invalid(errors) => Ok(errors
            .iter()
            .map(|e| format!("{} at {}", e.error_description(), e.instance_location()))
            .collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::register_builtin_actions;

    fn registry() -> ActionRegistry {
        let mut registry = ActionRegistry::new();
        register_builtin_actions(&mut registry).unwrap();
        registry
    }

    #[test]
    fn test_base_schema_accepts_minimal_flow() {
        let registry = registry();
        let violations = validate(
            &json!({"id": "f1", "tasks": [{"id": "a", "action": "PRINT", "entries": []}]}),
            &registry,
        )
        .unwrap();
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn test_missing_id_is_violation() {
        let registry = registry();
        let violations = validate(&json!({"tasks": []}), &registry).unwrap();
        assert!(!violations.is_empty());
    }

    #[test]
    fn test_action_fragment_enforced() {
        let registry = registry();
        // SLEEP requires a numeric `seconds`.
        let violations = validate(
            &json!({"id": "f1", "tasks": [{"id": "a", "action": "SLEEP"}]}),
            &registry,
        )
        .unwrap();
        assert!(!violations.is_empty());

        let violations = validate(
            &json!({"id": "f1", "tasks": [{"id": "a", "action": "SLEEP", "seconds": 1}]}),
            &registry,
        )
        .unwrap();
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn test_combined_schema_contains_fragments() {
        let registry = registry();
        let schema = combined_schema(&registry).unwrap();
        let all_of = schema
            .pointer("/definitions/task/allOf")
            .and_then(Value::as_array)
            .unwrap();
        assert!(all_of.len() >= 2);
    }
}
