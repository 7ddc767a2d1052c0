//! Flow definition data model.
//!
//! A `Definition` is the validated, import-spliced form of a flow file. It is
//! produced by the loader and stays immutable for the duration of a run. Every
//! task remembers which source file contributed it via `flow_id`, which is how
//! `on_error_flow` and `finally_flow` hooks are targeted after splicing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;

/// Reserved action name for the parallel composite.
pub const ACTION_PARALLEL: &str = "PARALLEL";
/// Reserved action name for the loop composite.
pub const ACTION_FOR: &str = "FOR";
/// Reserved action name for variable assignment tasks.
pub const ACTION_VARIABLES: &str = "VARIABLES";
/// Reserved action name for expression evaluation tasks.
pub const ACTION_EVALUATE: &str = "EVALUATE";

/// Actions handled by the engine itself rather than the registry.
pub const ENGINE_ACTIONS: &[&str] = &[
    ACTION_PARALLEL,
    ACTION_FOR,
    ACTION_VARIABLES,
    ACTION_EVALUATE,
];

/// A single unit of work inside a flow.
///
/// Everything beyond the fixed fields is treated as the action's opaque
/// payload; each action deserialises and validates its own shape on entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Empty only for composite children, which get synthetic ids.
    #[serde(default)]
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub action: String,

    /// Id of the source definition that contributed this task.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub flow_id: String,

    /// Remaining task fields, passed through to the action untouched apart
    /// from placeholder expansion.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Task {
    /// Whether this task is a composite (PARALLEL or FOR).
    pub fn is_composite(&self) -> bool {
        let action = self.action.to_uppercase();
        action == ACTION_PARALLEL || action == ACTION_FOR
    }

    /// Child tasks of a composite, with missing ids synthesised as
    /// `<parent>-parallel-N` / `<parent>-for-N`.
    pub fn children(&self) -> Vec<Task> {
        let Some(Value::Array(items)) = self.payload.get("tasks") else {
            return Vec::new();
        };

        let kind = if self.action.eq_ignore_ascii_case(ACTION_FOR) {
            "for"
        } else {
            "parallel"
        };

        items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                let mut child: Task = serde_json::from_value(item.clone()).ok()?;
                if child.id.is_empty() {
                    child.id = format!("{}-{}-{}", self.id, kind, index);
                }
                if child.flow_id.is_empty() {
                    child.flow_id = self.flow_id.clone();
                }
                Some(child)
            })
            .collect()
    }

    /// Payload view without the child task list. Composite children expand
    /// their own placeholders at execution time, so the parent must not
    /// expand them eagerly.
    pub fn payload_without_children(&self) -> Map<String, Value> {
        let mut map = self.payload.clone();
        map.remove("tasks");
        map
    }
}

/// A validated, import-spliced flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    pub id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,

    #[serde(default)]
    pub tasks: Vec<Task>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error_flow: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finally_flow: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finally_task: Option<String>,
}

impl Definition {
    /// All definition ids contributing tasks to this flow (the root id plus
    /// every imported flow id).
    pub fn flow_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self.tasks.iter().map(|t| t.flow_id.clone()).collect();
        ids.insert(self.id.clone());
        ids
    }

    /// Find a top-level task by id.
    pub fn find_task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Index of a top-level task by id.
    pub fn task_index(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Tasks contributed by a given source definition, in order.
    pub fn tasks_for_flow(&self, flow_id: &str) -> Vec<Task> {
        self.tasks
            .iter()
            .filter(|t| t.flow_id == flow_id)
            .cloned()
            .collect()
    }

    /// Whether any top-level composite contains a child with the given id.
    pub fn contains_subtask(&self, subtask_id: &str) -> bool {
        self.tasks
            .iter()
            .filter(|t| t.is_composite())
            .any(|t| t.children().iter().any(|c| c.id == subtask_id))
    }
}
