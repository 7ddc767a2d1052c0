//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};

use flowk_core::{Definition, RunOptions};

/// Body of `POST /api/run`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub begin_from_task: Option<String>,
    pub task_id: Option<String>,
    pub flow_id: Option<String>,
    pub subtask_id: Option<String>,
    pub resume_from_task_id: Option<String>,
}

impl RunRequest {
    pub fn into_options(self) -> RunOptions {
        RunOptions {
            begin_from: none_if_empty(self.begin_from_task),
            run_task: none_if_empty(self.task_id),
            run_subtask: none_if_empty(self.subtask_id),
            run_flow: none_if_empty(self.flow_id),
            resume_from: none_if_empty(self.resume_from_task_id),
        }
    }
}

fn none_if_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

/// Body of `POST /api/run/stop-at`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StopAtRequest {
    pub task_id: Option<String>,
}

/// Summary view of the active definition served by `GET /api/flow`.
#[derive(Debug, Clone, Serialize)]
pub struct FlowSummary {
    pub id: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error_flow: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finally_flow: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finally_task: Option<String>,

    pub tasks: Vec<TaskSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,

    pub action: String,
    pub flow_id: String,
}

impl FlowSummary {
    pub fn from_definition(definition: &Definition) -> Self {
        Self {
            id: definition.id.clone(),
            description: definition.description.clone(),
            on_error_flow: definition.on_error_flow.clone(),
            finally_flow: definition.finally_flow.clone(),
            finally_task: definition.finally_task.clone(),
            tasks: definition
                .tasks
                .iter()
                .map(|task| TaskSummary {
                    id: task.id.clone(),
                    description: task.description.clone(),
                    action: task.action.clone(),
                    flow_id: task.flow_id.clone(),
                })
                .collect(),
        }
    }
}
