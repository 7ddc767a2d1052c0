//! Task scheduler.
//!
//! Drives a definition's tasks in order: expands payloads, dispatches to the
//! registry or to the engine-handled actions (VARIABLES, EVALUATE, PARALLEL,
//! FOR), records snapshots on every transition, emits artifacts, publishes
//! lifecycle events, and honours control directives and stop requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactWriter;
use crate::composites;
use crate::control::{StopAtTask, StopSignal};
use crate::definition::{
    Definition, Task, ACTION_EVALUATE, ACTION_FOR, ACTION_PARALLEL, ACTION_VARIABLES,
};
use crate::errors::{EngineError, EngineResult, RunnerError};
use crate::events::{EventKind, FlowEvent, FlowObserver};
use crate::expand::{expand_payload, ExpansionScope};
use crate::expression::{truthy, ExpressionEvaluator};
use crate::registry::{ActionContext, ActionOutcome, ActionRegistry, Directive, TaskLogger};
use crate::runstate::{RunState, TaskSnapshot};
use crate::variables::{Variable, VariableStore};

/// Scoped execution filters for a single run. At most one may be set.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Skip tasks until this id is reached, then execute normally.
    pub begin_from: Option<String>,
    /// Execute only the top-level task with this id.
    pub run_task: Option<String>,
    /// Execute only the composite child with this id.
    pub run_subtask: Option<String>,
    /// Execute only tasks contributed by this flow id.
    pub run_flow: Option<String>,
    /// Re-execute from this task id using retained run state.
    pub resume_from: Option<String>,
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), RunnerError> {
        let set = [
            self.begin_from.is_some(),
            self.run_task.is_some(),
            self.run_subtask.is_some(),
            self.run_flow.is_some(),
            self.resume_from.is_some(),
        ]
        .iter()
        .filter(|&&s| s)
        .count();

        if set > 1 {
            return Err(RunnerError::FilterConflict(
                "begin-from-task, run-task, run-subtask, run-flow and resume are mutually exclusive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-subtree execution context threaded through composite recursion.
#[derive(Clone)]
pub(crate) struct ExecScope {
    /// Root flow id, used for events and artifact paths.
    pub flow_id: String,
    pub cancel: CancellationToken,
    /// When set, composites execute only the child with this id.
    pub subtask_filter: Option<String>,
    /// Loop-variable overlay; shadows the store during expansion.
    pub locals: Option<HashMap<String, Variable>>,
}

/// Control-flow outcome of one task.
pub(crate) struct TaskFlow {
    pub directive: Option<Directive>,
}

const DEFAULT_MAX_ITERATIONS: u64 = 1000;

/// The task scheduler bound to one run's state. Cloning is cheap; all state
/// is shared, which is how PARALLEL children carry the engine across spawns.
#[derive(Clone)]
pub struct Engine {
    registry: Arc<ActionRegistry>,
    observer: Arc<dyn FlowObserver>,
    run_state: Arc<RunState>,
    variables: Arc<VariableStore>,
    artifacts: ArtifactWriter,
    stop: StopSignal,
    stop_at: StopAtTask,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(
        registry: Arc<ActionRegistry>,
        observer: Arc<dyn FlowObserver>,
        run_state: Arc<RunState>,
        variables: Arc<VariableStore>,
        artifacts: ArtifactWriter,
    ) -> Self {
        Self {
            registry,
            observer,
            run_state,
            variables,
            artifacts,
            stop: StopSignal::new(),
            stop_at: StopAtTask::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_stop_at(mut self, stop_at: StopAtTask) -> Self {
        self.stop_at = stop_at;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_state(&self) -> &RunState {
        &self.run_state
    }

    pub fn variables(&self) -> &VariableStore {
        &self.variables
    }

    /// Execute a definition under the given options, running error and
    /// finally hooks as required. Returns the first non-hook error.
    pub async fn run(&self, definition: &Definition, options: &RunOptions) -> EngineResult<()> {
        info!(flow_id = %definition.id, "flow started");
        self.publish(FlowEvent::new(EventKind::FlowStarted, &definition.id));

        let mut outcome = self.run_main(definition, options).await;

        if let Err(error) = &outcome {
            if error.is_failure() {
                if let Some(hook_flow) = &definition.on_error_flow {
                    warn!(flow_id = %definition.id, "running on_error_flow '{hook_flow}' after: {error}");
                    if let Err(hook_error) = self.run_hook_flow(definition, hook_flow).await {
                        // The first failure wins over hook failures.
                        warn!("on_error_flow '{hook_flow}' failed: {hook_error}");
                    }
                }
            }
        }

        let finally_outcome = self.run_finally(definition).await;
        match (&outcome, finally_outcome) {
            (Ok(()), Err(finally_error)) => outcome = Err(finally_error),
            (Err(error), Err(finally_error)) => {
                warn!("finally hook failed after earlier error '{error}': {finally_error}");
            }
            _ => {}
        }

        match &outcome {
            Ok(()) => {
                info!(flow_id = %definition.id, "flow finished");
                self.publish(
                    FlowEvent::new(EventKind::FlowFinished, &definition.id)
                        .with_message("completed"),
                );
            }
            Err(error) => {
                warn!(flow_id = %definition.id, "flow finished with error: {error}");
                self.publish(
                    FlowEvent::new(EventKind::FlowFinished, &definition.id)
                        .with_error(error.to_string()),
                );
            }
        }
        outcome
    }

    async fn run_main(&self, definition: &Definition, options: &RunOptions) -> EngineResult<()> {
        // Resume re-enters the same run state; prior snapshots of skipped
        // tasks stay untouched. begin_from records fresh skip snapshots.
        let mut waiting_for = options
            .begin_from
            .clone()
            .or_else(|| options.resume_from.clone());
        let record_skips = options.resume_from.is_none();

        let mut index = 0;
        while index < definition.tasks.len() {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let task = &definition.tasks[index];
            if self.should_skip(task, options, &mut waiting_for) {
                debug!(task_id = %task.id, "skipping task");
                if record_skips && self.run_state.snapshot(&task.id).is_none() {
                    let mut snapshot = TaskSnapshot::pending(&task.id);
                    snapshot.mark_skipped();
                    self.run_state.record(snapshot);
                }
                index += 1;
                continue;
            }

            let scope = ExecScope {
                flow_id: definition.id.clone(),
                cancel: self.cancel.clone(),
                subtask_filter: options.run_subtask.clone(),
                locals: None,
            };
            let flow = self.execute_task(task.clone(), scope).await?;

            if self.stop_at.matches(&task.id) {
                info!(task_id = %task.id, "stop-at target completed, requesting stop");
                self.stop.request();
            }
            if self.stop.is_requested() {
                info!(flow_id = %definition.id, "stop requested, ending run");
                return Err(EngineError::Stopped);
            }

            if let Some(directive) = flow.directive {
                if directive.exit {
                    info!(task_id = %task.id, "exit directive, ending flow");
                    return Ok(());
                }
                if directive.break_loop {
                    // Outside a composite there is nothing narrower to break
                    // out of than the flow itself.
                    info!(task_id = %task.id, "break directive at top level, ending flow");
                    return Ok(());
                }
                if let Some(target) = directive.jump {
                    let Some(target_index) = definition.task_index(&target) else {
                        return Err(EngineError::InvalidDirective(format!(
                            "jump target '{target}' not found"
                        )));
                    };
                    debug!(task_id = %task.id, "jump to '{target}'");
                    index = target_index;
                    continue;
                }
            }

            index += 1;
        }
        Ok(())
    }

    fn should_skip(
        &self,
        task: &Task,
        options: &RunOptions,
        waiting_for: &mut Option<String>,
    ) -> bool {
        if let Some(target) = waiting_for {
            if task.id == *target {
                *waiting_for = None;
                return false;
            }
            return true;
        }
        if let Some(run_task) = &options.run_task {
            return task.id != *run_task;
        }
        if let Some(run_flow) = &options.run_flow {
            return task.flow_id != *run_flow;
        }
        if let Some(subtask) = &options.run_subtask {
            return !(task.is_composite() && task.children().iter().any(|c| c.id == *subtask));
        }
        false
    }

    /// Run the tasks contributed by a hook flow, sequentially. Directives do
    /// not escape the hook.
    async fn run_hook_flow(&self, definition: &Definition, flow_id: &str) -> EngineResult<()> {
        for task in definition.tasks_for_flow(flow_id) {
            let scope = ExecScope {
                flow_id: definition.id.clone(),
                cancel: self.cancel.clone(),
                subtask_filter: None,
                locals: None,
            };
            let flow = self.execute_task(task, scope).await?;
            if let Some(directive) = flow.directive {
                if directive.exit || directive.break_loop {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_finally(&self, definition: &Definition) -> EngineResult<()> {
        if let Some(flow_id) = &definition.finally_flow {
            info!(flow_id = %definition.id, "running finally_flow '{flow_id}'");
            self.run_hook_flow(definition, flow_id).await?;
        }
        if let Some(task_id) = &definition.finally_task {
            let Some(task) = definition.find_task(task_id) else {
                warn!("finally_task '{task_id}' not found, skipping");
                return Ok(());
            };
            info!(flow_id = %definition.id, "running finally_task '{task_id}'");
            let scope = ExecScope {
                flow_id: definition.id.clone(),
                cancel: self.cancel.clone(),
                subtask_filter: None,
                locals: None,
            };
            self.execute_task(task.clone(), scope).await?;
        }
        Ok(())
    }

    /// Execute one task, recording snapshots and publishing events. Boxed so
    /// composites can recurse.
    pub(crate) fn execute_task(
        &self,
        task: Task,
        scope: ExecScope,
    ) -> BoxFuture<'_, EngineResult<TaskFlow>> {
        Box::pin(self.execute_task_impl(task, scope))
    }

    async fn execute_task_impl(&self, task: Task, scope: ExecScope) -> EngineResult<TaskFlow> {
        let mut snapshot = TaskSnapshot::pending(&task.id);
        self.run_state.record(snapshot.clone());
        snapshot.mark_running();
        self.run_state.record(snapshot.clone());
        self.publish(
            FlowEvent::new(EventKind::TaskStarted, &scope.flow_id).with_task(snapshot.clone()),
        );

        let environment = self.variables.environment_snapshot();
        if let Err(error) = self
            .artifacts
            .write_environment(&scope.flow_id, &task.id, &environment)
            .await
        {
            warn!(task_id = %task.id, "failed to write environment artifact: {error}");
        }

        // Composite children expand at their own execution time; expanding
        // them here would resolve loop variables and sibling results too
        // early.
        let raw_payload = if task.is_composite() {
            task.payload_without_children()
        } else {
            task.payload.clone()
        };

        let variables_snapshot = self.variables.snapshot();
        let expansion = {
            let mut expansion_scope =
                ExpansionScope::new(&variables_snapshot, &self.run_state);
            if let Some(locals) = &scope.locals {
                expansion_scope = expansion_scope.with_locals(locals);
            }
            expand_payload(&raw_payload, &expansion_scope)
        };

        let expanded = match expansion {
            Ok(expanded) => expanded,
            Err(source) => {
                let error = EngineError::Expand {
                    task_id: task.id.clone(),
                    source,
                };
                return self.fail_task(snapshot, &scope, error).await;
            }
        };
        snapshot.payload = Some(
            self.variables
                .mask_value(&Value::Object(expanded.clone())),
        );

        let dispatch = match task.action.to_uppercase().as_str() {
            ACTION_VARIABLES => self.apply_variables(&task, &expanded),
            ACTION_EVALUATE => self.evaluate_task(&task, &expanded, &scope),
            ACTION_PARALLEL => composites::run_parallel(self, &task, &expanded, &scope).await,
            ACTION_FOR => composites::run_for(self, &task, &expanded, &scope).await,
            _ => self.run_leaf(&task, &expanded, &scope).await,
        };

        match dispatch {
            Ok(outcome) => {
                snapshot.mark_completed(outcome.value.clone(), outcome.result_type);
                self.run_state.record(snapshot.clone());

                if expanded
                    .get("register")
                    .and_then(Value::as_bool)
                    .unwrap_or(false)
                {
                    self.variables
                        .set(Variable::json(task.id.clone(), outcome.value.clone()));
                }

                let masked = self.masked_snapshot(&snapshot);
                if let Err(error) = self.artifacts.write_task_log(&scope.flow_id, &masked).await {
                    warn!(task_id = %task.id, "failed to write task artifact: {error}");
                }
                self.publish(
                    FlowEvent::new(EventKind::TaskCompleted, &scope.flow_id).with_task(masked),
                );
                Ok(TaskFlow {
                    directive: outcome.directive,
                })
            }
            Err(error) => self.fail_task(snapshot, &scope, error).await,
        }
    }

    async fn fail_task(
        &self,
        mut snapshot: TaskSnapshot,
        scope: &ExecScope,
        error: EngineError,
    ) -> EngineResult<TaskFlow> {
        snapshot.mark_failed(error.to_string());
        self.run_state.record(snapshot.clone());

        let masked = self.masked_snapshot(&snapshot);
        if let Err(artifact_error) = self.artifacts.write_task_log(&scope.flow_id, &masked).await {
            warn!(task_id = %snapshot.id, "failed to write task artifact: {artifact_error}");
        }
        let error_text = masked.error.clone().unwrap_or_else(|| error.to_string());
        self.publish(
            FlowEvent::new(EventKind::TaskFailed, &scope.flow_id)
                .with_task(masked)
                .with_error(error_text),
        );
        Err(error)
    }

    fn apply_variables(&self, task: &Task, payload: &Map<String, Value>) -> EngineResult<ActionOutcome> {
        let entries = payload
            .get("variables")
            .cloned()
            .ok_or_else(|| EngineError::PayloadInvalid {
                task_id: task.id.clone(),
                message: "VARIABLES requires a 'variables' list".to_string(),
            })?;
        let entries: Vec<Variable> =
            serde_json::from_value(entries).map_err(|e| EngineError::PayloadInvalid {
                task_id: task.id.clone(),
                message: format!("VARIABLES entries: {e}"),
            })?;

        let mut applied = Vec::with_capacity(entries.len());
        for entry in entries {
            let variable = entry.coerced().map_err(|message| EngineError::PayloadInvalid {
                task_id: task.id.clone(),
                message,
            })?;
            applied.push(Value::String(variable.name.clone()));
            self.variables.set(variable);
        }
        Ok(ActionOutcome::value(json!({ "applied": applied })))
    }

    fn evaluate_task(
        &self,
        task: &Task,
        payload: &Map<String, Value>,
        scope: &ExecScope,
    ) -> EngineResult<ActionOutcome> {
        let expression = payload
            .get("expression")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::PayloadInvalid {
                task_id: task.id.clone(),
                message: "EVALUATE requires an 'expression' string".to_string(),
            })?;

        let mut values: HashMap<String, Value> = self
            .variables
            .snapshot()
            .into_iter()
            .map(|(name, variable)| (name, variable.value))
            .collect();
        if let Some(locals) = &scope.locals {
            for (name, variable) in locals {
                values.insert(name.clone(), variable.value.clone());
            }
        }

        let result = ExpressionEvaluator::new(&values)
            .evaluate(expression)
            .map_err(|e| EngineError::ActionFailed {
                task_id: task.id.clone(),
                message: e.to_string(),
            })?;

        if let Some(name) = payload.get("variable").and_then(Value::as_str) {
            self.variables.set(Variable::json(name, result.clone()));
        }

        // The boolean outcome selects an optional directive branch.
        let branch = if truthy(&result) {
            payload.get("then")
        } else {
            payload.get("else")
        };
        let directive = branch
            .map(Directive::parse)
            .transpose()
            .map_err(EngineError::InvalidDirective)?;

        let mut outcome = ActionOutcome::value(result);
        if let Some(directive) = directive {
            outcome = outcome.with_directive(directive);
        }
        Ok(outcome)
    }

    async fn run_leaf(
        &self,
        task: &Task,
        payload: &Map<String, Value>,
        scope: &ExecScope,
    ) -> EngineResult<ActionOutcome> {
        let action = self
            .registry
            .lookup(&task.action)
            .ok_or_else(|| EngineError::UnknownAction(task.action.clone()))?;

        let mut variables = self.variables.snapshot();
        if let Some(locals) = &scope.locals {
            for (name, variable) in locals {
                variables.insert(name.clone(), variable.clone());
            }
        }

        let ctx = ActionContext {
            variables,
            log_dir: self.artifacts.task_dir(&scope.flow_id, &task.id),
            cancel: scope.cancel.child_token(),
            logger: TaskLogger::new(self.observer.clone(), &scope.flow_id, &task.id)
                .with_secrets(self.variables.secret_values()),
        };

        let payload_value = Value::Object(payload.clone());
        let timeout_seconds = payload.get("timeout_seconds").and_then(Value::as_f64);

        let result = match timeout_seconds {
            Some(seconds) if seconds > 0.0 => {
                match tokio::time::timeout(
                    Duration::from_secs_f64(seconds),
                    action.execute(&payload_value, &ctx),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(EngineError::Timeout {
                            task_id: task.id.clone(),
                            seconds,
                        })
                    }
                }
            }
            _ => action.execute(&payload_value, &ctx).await,
        };

        result.map_err(|error| match error {
            EngineError::Cancelled | EngineError::Stopped | EngineError::Timeout { .. } => error,
            EngineError::PayloadInvalid { message, .. } => EngineError::PayloadInvalid {
                task_id: task.id.clone(),
                message,
            },
            other => EngineError::ActionFailed {
                task_id: task.id.clone(),
                message: other.to_string(),
            },
        })
    }

    /// Copy of a snapshot with secrets masked in payload, result and error.
    fn masked_snapshot(&self, snapshot: &TaskSnapshot) -> TaskSnapshot {
        let mut masked = snapshot.clone();
        if let Some(payload) = &masked.payload {
            masked.payload = Some(self.variables.mask_value(payload));
        }
        if let Some(result) = &masked.result {
            masked.result = Some(self.variables.mask_value(result));
        }
        if let Some(error) = &masked.error {
            if let Value::String(text) = self.variables.mask_value(&Value::String(error.clone())) {
                masked.error = Some(text);
            }
        }
        masked
    }

    pub(crate) fn publish(&self, event: FlowEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn default_max_iterations() -> u64 {
        DEFAULT_MAX_ITERATIONS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::register_builtin_actions;
    use crate::events::NullObserver;
    use tempfile::TempDir;

    fn engine_fixture(dir: &TempDir) -> Arc<Engine> {
        let mut registry = ActionRegistry::new();
        register_builtin_actions(&mut registry).unwrap();
        Arc::new(Engine::new(
            Arc::new(registry),
            Arc::new(NullObserver),
            Arc::new(RunState::new()),
            Arc::new(VariableStore::new()),
            ArtifactWriter::new(dir.path()),
        ))
    }

    fn definition(value: Value) -> Definition {
        let mut definition: Definition = serde_json::from_value(value).unwrap();
        let id = definition.id.clone();
        for task in &mut definition.tasks {
            if task.flow_id.is_empty() {
                task.flow_id = id.clone();
            }
        }
        definition
    }

    #[test]
    fn test_run_options_mutual_exclusion() {
        let ok = RunOptions {
            run_task: Some("a".to_string()),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let conflict = RunOptions {
            run_task: Some("a".to_string()),
            begin_from: Some("b".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            conflict.validate(),
            Err(RunnerError::FilterConflict(_))
        ));
    }

    #[tokio::test]
    async fn test_variables_then_print() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "set", "action": "VARIABLES", "variables": [
                    {"name": "who", "type": "string", "value": "world"}
                ]},
                {"id": "say", "action": "PRINT", "entries": [{"message": "hi ${who}"}]}
            ]
        }));

        engine.run(&definition, &RunOptions::default()).await.unwrap();

        let say = engine.run_state().snapshot("say").unwrap();
        assert_eq!(say.result, Some(json!(["hi world"])));
        assert_eq!(engine.variables().get("who").unwrap().value, json!("world"));
    }

    #[tokio::test]
    async fn test_register_binds_result_variable() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "first", "action": "PRINT", "register": true,
                 "entries": [{"message": "one"}]}
            ]
        }));

        engine.run(&definition, &RunOptions::default()).await.unwrap();
        assert_eq!(
            engine.variables().get("first").unwrap().value,
            json!(["one"])
        );
    }

    #[tokio::test]
    async fn test_evaluate_directive_exit() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "check", "action": "EVALUATE", "expression": "1 < 2",
                 "then": {"exit": true}},
                {"id": "after", "action": "PRINT", "entries": [{"message": "unreachable"}]}
            ]
        }));

        engine.run(&definition, &RunOptions::default()).await.unwrap();
        assert!(engine.run_state().snapshot("after").is_none());
        assert_eq!(
            engine.run_state().snapshot("check").unwrap().result,
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn test_evaluate_jump_directive() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "gate", "action": "EVALUATE", "expression": "false",
                 "else": {"jump": "last"}},
                {"id": "middle", "action": "PRINT", "entries": [{"message": "skipped"}]},
                {"id": "last", "action": "PRINT", "entries": [{"message": "landed"}]}
            ]
        }));

        engine.run(&definition, &RunOptions::default()).await.unwrap();
        assert!(engine.run_state().snapshot("middle").is_none());
        assert!(engine.run_state().is_completed("last"));
    }

    #[tokio::test]
    async fn test_unknown_jump_target_is_fatal() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "gate", "action": "EVALUATE", "expression": "true",
                 "then": {"jump": "nowhere"}}
            ]
        }));

        let error = engine
            .run(&definition, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::InvalidDirective(_)));
    }

    #[tokio::test]
    async fn test_run_task_filter_skips_others() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "a", "action": "PRINT", "entries": [{"message": "a"}]},
                {"id": "b", "action": "PRINT", "entries": [{"message": "b"}]}
            ]
        }));

        let options = RunOptions {
            run_task: Some("b".to_string()),
            ..Default::default()
        };
        engine.run(&definition, &options).await.unwrap();

        use crate::runstate::TaskStatus;
        assert_eq!(
            engine.run_state().snapshot("a").unwrap().status,
            TaskStatus::Skipped
        );
        assert!(engine.run_state().is_completed("b"));
    }

    #[tokio::test]
    async fn test_failure_runs_error_and_finally_hooks() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        // The "hook" flow's tasks are spliced ahead of the root tasks, the
        // way the loader lays out imports.
        let definition = definition(json!({
            "id": "f",
            "on_error_flow": "hooks",
            "finally_task": "cleanup",
            "tasks": [
                {"id": "report", "action": "PRINT", "flow_id": "hooks",
                 "entries": [{"message": "recovering"}]},
                {"id": "boom", "action": "PRINT", "entries": [{"variable": "missing"}]},
                {"id": "cleanup", "action": "PRINT", "entries": [{"message": "cleanup"}]}
            ]
        }));

        let options = RunOptions {
            begin_from: Some("boom".to_string()),
            ..Default::default()
        };
        let error = engine.run(&definition, &options).await.unwrap_err();
        assert!(error.is_failure());

        // Hook and finally both ran after the failure.
        assert!(engine.run_state().is_completed("report"));
        assert!(engine.run_state().is_completed("cleanup"));
    }

    #[tokio::test]
    async fn test_timeout_fails_task() {
        let dir = TempDir::new().unwrap();
        let engine = engine_fixture(&dir);
        let definition = definition(json!({
            "id": "f",
            "tasks": [
                {"id": "slow", "action": "SLEEP", "seconds": 5.0, "timeout_seconds": 0.02}
            ]
        }));

        let error = engine
            .run(&definition, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::Timeout { .. }));

        use crate::runstate::TaskStatus;
        assert_eq!(
            engine.run_state().snapshot("slow").unwrap().status,
            TaskStatus::Failed
        );
    }
}
