//! Per-run record of task execution state.
//!
//! The engine is the single writer; observers and the server adapter read
//! snapshot copies. The runner keeps the `RunState` alive across successive
//! invocations on the same flow so a later run can resume from a previously
//! completed task.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// Tag describing the shape of a task result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Json,
    Bool,
    String,
    Number,
    #[default]
    None,
}

impl ResultType {
    /// Infer the tag from a JSON value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ResultType::None,
            Value::Bool(_) => ResultType::Bool,
            Value::Number(_) => ResultType::Number,
            Value::String(_) => ResultType::String,
            Value::Array(_) | Value::Object(_) => ResultType::Json,
        }
    }
}

/// Run-time view of a single task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub id: String,

    pub status: TaskStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub duration_seconds: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    #[serde(default)]
    pub result_type: ResultType,

    /// Payload with placeholders expanded, as executed. Secrets are masked
    /// before this snapshot reaches artifacts or events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskSnapshot {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Pending,
            success: None,
            started_at: None,
            finished_at: None,
            duration_seconds: 0.0,
            result: None,
            result_type: ResultType::None,
            payload: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self, result: Value, result_type: ResultType) {
        self.finish();
        self.status = TaskStatus::Completed;
        self.success = Some(true);
        self.result_type = result_type;
        self.result = Some(result);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.finish();
        self.status = TaskStatus::Failed;
        self.success = Some(false);
        self.error = Some(error.into());
    }

    pub fn mark_skipped(&mut self) {
        self.status = TaskStatus::Skipped;
    }

    fn finish(&mut self) {
        let now = Utc::now();
        if let Some(started) = self.started_at {
            self.duration_seconds = (now - started).num_milliseconds() as f64 / 1000.0;
        }
        self.finished_at = Some(now);
    }
}

/// All task snapshots for a single execution, keyed by task id, plus the
/// order in which tasks entered scheduling.
#[derive(Debug, Default)]
pub struct RunState {
    snapshots: DashMap<String, TaskSnapshot>,
    order: Mutex<Vec<String>>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a snapshot transition. First sight of a task id appends it to
    /// the execution order.
    pub fn record(&self, snapshot: TaskSnapshot) {
        let id = snapshot.id.clone();
        let new = !self.snapshots.contains_key(&id);
        self.snapshots.insert(id.clone(), snapshot);
        if new {
            self.order.lock().push(id);
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<TaskSnapshot> {
        self.snapshots.get(id).map(|s| s.clone())
    }

    /// Whether at least one snapshot has been recorded.
    pub fn has_data(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// Snapshot copies in execution order.
    pub fn all(&self) -> Vec<TaskSnapshot> {
        self.order
            .lock()
            .iter()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.snapshot(id)
            .map(|s| s.status == TaskStatus::Completed)
            .unwrap_or(false)
    }

    /// Drop a single snapshot (used when a resumed run re-executes a task).
    pub fn forget(&self, id: &str) {
        self.snapshots.remove(id);
        self.order.lock().retain(|existing| existing != id);
    }
}
