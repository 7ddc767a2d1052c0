//! Composite task handlers: PARALLEL and FOR.

use serde_json::{json, Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::definition::Task;
use crate::engine::{Engine, ExecScope};
use crate::errors::{EngineError, EngineResult};
use crate::expression::compare_values;
use crate::registry::{ActionOutcome, Directive};
use crate::variables::Variable;

/// Run a PARALLEL composite: one concurrent unit per child, all awaited.
///
/// The parent's result is a mapping of child id to child result in child
/// declaration order. With `fail_fast` set, the first failure cancels the
/// shared child token; otherwise every child runs to completion and the
/// parent fails iff any child failed.
pub(crate) async fn run_parallel(
    engine: &Engine,
    parent: &Task,
    payload: &Map<String, Value>,
    scope: &ExecScope,
) -> EngineResult<ActionOutcome> {
    let mut children = parent.children();
    if let Some(filter) = &scope.subtask_filter {
        children.retain(|child| child.id == *filter);
        if children.is_empty() {
            return Err(EngineError::PayloadInvalid {
                task_id: parent.id.clone(),
                message: format!("no child task matches subtask '{filter}'"),
            });
        }
    }
    if children.is_empty() {
        return Ok(ActionOutcome::value(json!({})));
    }

    let fail_fast = payload
        .get("fail_fast")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let child_cancel = scope.cancel.child_token();
    let mut join_set = JoinSet::new();
    for child in children.clone() {
        let engine = engine.clone();
        let child_scope = ExecScope {
            flow_id: scope.flow_id.clone(),
            cancel: child_cancel.clone(),
            subtask_filter: None,
            locals: scope.locals.clone(),
        };
        let child_id = child.id.clone();
        debug!(parent = %parent.id, child = %child_id, "spawning parallel child");
        join_set.spawn(async move {
            let result = engine.execute_task(child, child_scope).await;
            (child_id, result)
        });
    }

    let mut failures: Vec<(String, EngineError)> = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((_, Ok(_))) => {}
            Ok((child_id, Err(error))) => {
                if fail_fast && failures.is_empty() {
                    warn!(parent = %parent.id, child = %child_id, "fail-fast: cancelling siblings");
                    child_cancel.cancel();
                }
                failures.push((child_id, error));
            }
            Err(join_error) => {
                failures.push((parent.id.clone(), EngineError::Join(join_error.to_string())));
            }
        }
    }

    if !failures.is_empty() {
        let message = failures
            .iter()
            .map(|(child_id, error)| format!("child '{child_id}' failed: {error}"))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(EngineError::ActionFailed {
            task_id: parent.id.clone(),
            message,
        });
    }

    let mut results = Map::new();
    for child in &children {
        let value = engine
            .run_state()
            .snapshot(&child.id)
            .and_then(|snapshot| snapshot.result)
            .unwrap_or(Value::Null);
        results.insert(child.id.clone(), value);
    }
    Ok(ActionOutcome::value(Value::Object(results)))
}

enum LoopControl {
    Continue,
    Break,
    Exit,
}

/// Run a FOR composite. Modes: a `values` list (possibly produced by a
/// `${from.task:…}` reference) or a numeric range driven by `initial`,
/// `condition {operator, value}` and `step`. Children run sequentially per
/// iteration with the loop variable bound on a cloned view.
pub(crate) async fn run_for(
    engine: &Engine,
    parent: &Task,
    payload: &Map<String, Value>,
    scope: &ExecScope,
) -> EngineResult<ActionOutcome> {
    let invalid = |message: String| EngineError::PayloadInvalid {
        task_id: parent.id.clone(),
        message,
    };

    let variable = payload
        .get("variable")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("FOR requires a 'variable' name".to_string()))?;

    let mut children = loop_children(parent);
    if let Some(filter) = &scope.subtask_filter {
        children.retain(|(_, child)| child.id == *filter);
    }
    if children.is_empty() {
        return Err(invalid("FOR requires a non-empty 'tasks' list".to_string()));
    }

    let max_iterations = payload
        .get("max_iterations")
        .and_then(Value::as_u64)
        .unwrap_or_else(Engine::default_max_iterations);

    let mut iterations: u64 = 0;
    let mut exited = false;

    if let Some(values) = payload.get("values") {
        let items = values
            .as_array()
            .ok_or_else(|| invalid(format!("FOR 'values' must be an array, got {values}")))?;

        for item in items {
            if iterations >= max_iterations {
                return Err(EngineError::MaxIterationsExceeded {
                    task_id: parent.id.clone(),
                    limit: max_iterations,
                });
            }
            let control = run_iteration(
                engine,
                parent,
                &children,
                variable,
                item.clone(),
                iterations,
                scope,
            )
            .await?;
            iterations += 1;
            match control {
                LoopControl::Continue => {}
                LoopControl::Break => break,
                LoopControl::Exit => {
                    exited = true;
                    break;
                }
            }
        }
    } else {
        let initial = payload
            .get("initial")
            .and_then(Value::as_f64)
            .ok_or_else(|| invalid("FOR range mode requires a numeric 'initial'".to_string()))?;
        let step = payload.get("step").and_then(Value::as_f64).unwrap_or(1.0);
        let condition = payload
            .get("condition")
            .ok_or_else(|| invalid("FOR range mode requires a 'condition'".to_string()))?;
        let operator = condition
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("FOR condition requires an 'operator'".to_string()))?;
        let bound = condition
            .get("value")
            .cloned()
            .ok_or_else(|| invalid("FOR condition requires a 'value'".to_string()))?;

        let mut current = initial;
        loop {
            let current_value = number(current);
            let proceed = compare_values(&current_value, operator, &bound)
                .map_err(|message| invalid(format!("FOR condition: {message}")))?;
            if !proceed {
                break;
            }
            if iterations >= max_iterations {
                return Err(EngineError::MaxIterationsExceeded {
                    task_id: parent.id.clone(),
                    limit: max_iterations,
                });
            }

            let control = run_iteration(
                engine,
                parent,
                &children,
                variable,
                current_value,
                iterations,
                scope,
            )
            .await?;
            iterations += 1;
            current += step;
            match control {
                LoopControl::Continue => {}
                LoopControl::Break => break,
                LoopControl::Exit => {
                    exited = true;
                    break;
                }
            }
        }
    }

    let mut outcome = ActionOutcome::value(json!({ "iterations": iterations }));
    if exited {
        outcome = outcome.with_directive(Directive {
            exit: true,
            ..Default::default()
        });
    }
    Ok(outcome)
}

/// Children with their recording keys: the declared id, or the position for
/// anonymous children.
fn loop_children(parent: &Task) -> Vec<(String, Task)> {
    let Some(Value::Array(items)) = parent.payload.get("tasks") else {
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter_map(|(index, item)| {
            let mut child: Task = serde_json::from_value(item.clone()).ok()?;
            let key = if child.id.is_empty() {
                index.to_string()
            } else {
                child.id.clone()
            };
            if child.flow_id.is_empty() {
                child.flow_id = parent.flow_id.clone();
            }
            Some((key, child))
        })
        .collect()
}

async fn run_iteration(
    engine: &Engine,
    parent: &Task,
    children: &[(String, Task)],
    variable: &str,
    item: Value,
    iteration: u64,
    scope: &ExecScope,
) -> EngineResult<LoopControl> {
    let mut locals = scope.locals.clone().unwrap_or_default();
    locals.insert(
        variable.to_string(),
        Variable::json(variable, item),
    );

    for (key, child) in children {
        let mut iteration_child = child.clone();
        iteration_child.id = format!("{}-for-{}-{}", parent.id, iteration, key);

        let child_scope = ExecScope {
            flow_id: scope.flow_id.clone(),
            cancel: scope.cancel.clone(),
            subtask_filter: None,
            locals: Some(locals.clone()),
        };
        let flow = engine.execute_task(iteration_child, child_scope).await?;

        if let Some(directive) = flow.directive {
            if directive.exit {
                return Ok(LoopControl::Exit);
            }
            if directive.break_loop {
                return Ok(LoopControl::Break);
            }
            if directive.jump.is_some() {
                return Err(EngineError::InvalidDirective(
                    "jump is not supported inside FOR".to_string(),
                ));
            }
        }
    }
    Ok(LoopControl::Continue)
}

fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        Value::Number((value as i64).into())
    } else {
        serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}
