//! SLEEP action: cancellation-aware timer.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::errors::{EngineError, EngineResult};
use crate::registry::{Action, ActionContext, ActionOutcome};

#[derive(Debug, Deserialize)]
struct SleepPayload {
    seconds: f64,
}

pub struct SleepAction;

#[async_trait]
impl Action for SleepAction {
    fn name(&self) -> &str {
        "SLEEP"
    }

    async fn execute(&self, payload: &Value, ctx: &ActionContext) -> EngineResult<ActionOutcome> {
        let payload: SleepPayload =
            serde_json::from_value(payload.clone()).map_err(|e| EngineError::PayloadInvalid {
                task_id: String::new(),
                message: format!("SLEEP payload: {e}"),
            })?;

        if !payload.seconds.is_finite() || payload.seconds < 0.0 {
            return Err(EngineError::PayloadInvalid {
                task_id: String::new(),
                message: format!("SLEEP seconds must be non-negative, got {}", payload.seconds),
            });
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(payload.seconds)) => {}
            _ = ctx.cancel.cancelled() => return Err(EngineError::Cancelled),
        }

        Ok(ActionOutcome::value(json!(payload.seconds)))
    }

    fn schema_fragment(&self) -> Option<Value> {
        Some(json!({
            "required": ["seconds"],
            "properties": {
                "seconds": {"type": "number", "minimum": 0}
            }
        }))
    }
}
