//! PRINT action: render entries to the log and the event stream.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::{EngineError, EngineResult};
use crate::registry::{Action, ActionContext, ActionOutcome};

#[derive(Debug, Deserialize)]
struct PrintPayload {
    entries: Vec<PrintEntry>,
}

#[derive(Debug, Deserialize)]
struct PrintEntry {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    value: Option<Value>,
    #[serde(default)]
    variable: Option<String>,
}

pub struct PrintAction;

#[async_trait]
impl Action for PrintAction {
    fn name(&self) -> &str {
        "PRINT"
    }

    async fn execute(&self, payload: &Value, ctx: &ActionContext) -> EngineResult<ActionOutcome> {
        let payload: PrintPayload =
            serde_json::from_value(payload.clone()).map_err(|e| EngineError::PayloadInvalid {
                task_id: String::new(),
                message: format!("PRINT payload: {e}"),
            })?;

        let mut lines = Vec::with_capacity(payload.entries.len());
        for entry in &payload.entries {
            let line = render_entry(entry, ctx)?;
            ctx.logger.log(&line);
            lines.push(Value::String(line));
        }

        Ok(ActionOutcome::value(Value::Array(lines)))
    }

    fn schema_fragment(&self) -> Option<Value> {
        Some(json!({
            "required": ["entries"],
            "properties": {
                "entries": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "message": {"type": "string"},
                            "variable": {"type": "string"}
                        }
                    }
                }
            }
        }))
    }
}

fn render_entry(entry: &PrintEntry, ctx: &ActionContext) -> EngineResult<String> {
    if let Some(message) = &entry.message {
        return Ok(message.clone());
    }
    if let Some(value) = &entry.value {
        return Ok(render_value(value));
    }
    if let Some(name) = &entry.variable {
        let variable = ctx
            .variables
            .get(name)
            .ok_or_else(|| EngineError::PayloadInvalid {
                task_id: String::new(),
                message: format!("PRINT references unknown variable '{name}'"),
            })?;
        return Ok(format!("{}={}", name, render_value(&variable.value)));
    }
    Err(EngineError::PayloadInvalid {
        task_id: String::new(),
        message: "PRINT entry needs one of message, value, variable".to_string(),
    })
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
