//! Action registry: name-to-implementation lookup.
//!
//! The registry is wired explicitly at startup (`register_builtin_actions`
//! plus whatever the embedding binary adds) and read-only afterwards. Lookup
//! is case-insensitive; registration keeps the original casing for display.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::errors::{EngineResult, RegistryError};
use crate::events::{EventKind, FlowEvent, FlowObserver};
use crate::runstate::{ResultType, TaskSnapshot, TaskStatus};
use crate::variables::Variable;

/// Control directive an action may attach to its outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Directive {
    /// Continue execution at the named top-level task.
    pub jump: Option<String>,
    /// Terminate the flow normally.
    pub exit: bool,
    /// Exit the innermost composite.
    pub break_loop: bool,
}

impl Directive {
    pub fn is_empty(&self) -> bool {
        self.jump.is_none() && !self.exit && !self.break_loop
    }

    /// Parse a directive object (`{"jump": "id"} | {"exit": true} |
    /// {"break": true}`). Unknown fields are rejected.
    pub fn parse(value: &Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("directive must be an object, got {value}"));
        };
        let mut directive = Directive::default();
        for (key, item) in map {
            match key.as_str() {
                "jump" => {
                    directive.jump = item.as_str().map(|s| s.to_string());
                    if directive.jump.is_none() {
                        return Err("jump target must be a string".to_string());
                    }
                }
                "exit" => directive.exit = item.as_bool().unwrap_or(false),
                "break" => directive.break_loop = item.as_bool().unwrap_or(false),
                other => return Err(format!("unknown directive '{other}'")),
            }
        }
        Ok(directive)
    }
}

/// Result of a single action execution.
#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub value: Value,
    pub result_type: ResultType,
    pub directive: Option<Directive>,
}

impl ActionOutcome {
    pub fn none() -> Self {
        Self {
            value: Value::Null,
            result_type: ResultType::None,
            directive: None,
        }
    }

    pub fn value(value: Value) -> Self {
        let result_type = ResultType::of(&value);
        Self {
            value,
            result_type,
            directive: None,
        }
    }

    pub fn with_directive(mut self, directive: Directive) -> Self {
        if !directive.is_empty() {
            self.directive = Some(directive);
        }
        self
    }
}

/// Publishes `task_log` events on behalf of a running action. Secret values
/// are masked before a message leaves the action.
#[derive(Clone)]
pub struct TaskLogger {
    observer: Arc<dyn FlowObserver>,
    flow_id: String,
    task_id: String,
    secrets: Vec<String>,
}

impl TaskLogger {
    pub fn new(
        observer: Arc<dyn FlowObserver>,
        flow_id: impl Into<String>,
        task_id: impl Into<String>,
    ) -> Self {
        Self {
            observer,
            flow_id: flow_id.into(),
            task_id: task_id.into(),
            secrets: Vec::new(),
        }
    }

    pub fn with_secrets(mut self, secrets: Vec<String>) -> Self {
        self.secrets = secrets;
        self
    }

    pub fn log(&self, message: &str) {
        let mut masked = message.to_string();
        for secret in &self.secrets {
            if masked.contains(secret.as_str()) {
                masked = masked.replace(secret.as_str(), crate::variables::SECRET_MASK);
            }
        }

        tracing::info!(task_id = %self.task_id, "{masked}");
        let mut task = TaskSnapshot::pending(&self.task_id);
        task.status = TaskStatus::Running;
        let event = FlowEvent::new(EventKind::TaskLog, &self.flow_id)
            .with_task(task)
            .with_message(masked);
        self.observer.on_event(&event);
    }
}

/// Per-invocation context handed to every action.
pub struct ActionContext {
    /// Read-only clone of the variable store at dispatch time.
    pub variables: HashMap<String, Variable>,
    /// Directory for action-owned log files.
    pub log_dir: PathBuf,
    /// Cancellation handle; cooperative actions select on it.
    pub cancel: CancellationToken,
    pub logger: TaskLogger,
}

/// A named, registered task implementation.
#[async_trait]
pub trait Action: Send + Sync {
    fn name(&self) -> &str;

    /// Execute against the expanded payload. Payload validation is the
    /// action's own responsibility.
    async fn execute(&self, payload: &Value, ctx: &ActionContext) -> EngineResult<ActionOutcome>;

    /// Optional JSON-schema fragment merged into the combined flow schema
    /// for tasks with this action name.
    fn schema_fragment(&self) -> Option<Value> {
        None
    }
}

/// Process-wide action lookup table.
#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<String, (String, Arc<dyn Action>)>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action. Colliding names (case-insensitive) are a fatal
    /// init error.
    pub fn register(&mut self, action: Arc<dyn Action>) -> Result<(), RegistryError> {
        let display = action.name().to_string();
        let key = display.to_lowercase();
        if self.actions.contains_key(&key) {
            return Err(RegistryError::DuplicateAction(display));
        }
        self.actions.insert(key, (display, action));
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions
            .get(&name.to_lowercase())
            .map(|(_, action)| action.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(&name.to_lowercase())
    }

    /// Registered names with their original casing, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .actions
            .values()
            .map(|(display, _)| display.clone())
            .collect();
        names.sort();
        names
    }

    /// Schema fragments of all registered actions, keyed by display name.
    pub fn schema_fragments(&self) -> Vec<(String, Value)> {
        let mut fragments: Vec<(String, Value)> = self
            .actions
            .values()
            .filter_map(|(display, action)| {
                action.schema_fragment().map(|f| (display.clone(), f))
            })
            .collect();
        fragments.sort_by(|a, b| a.0.cmp(&b.0));
        fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use serde_json::json;

    struct EchoAction;

    #[async_trait]
    impl Action for EchoAction {
        fn name(&self) -> &str {
            "ECHO"
        }

        async fn execute(
            &self,
            payload: &Value,
            _ctx: &ActionContext,
        ) -> EngineResult<ActionOutcome> {
            Ok(ActionOutcome::value(payload.clone()))
        }
    }

    fn context() -> ActionContext {
        ActionContext {
            variables: HashMap::new(),
            log_dir: PathBuf::from("logs"),
            cancel: CancellationToken::new(),
            logger: TaskLogger::new(Arc::new(NullObserver), "f", "t"),
        }
    }

    #[test]
    fn test_case_insensitive_lookup_preserves_display_name() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(EchoAction)).unwrap();

        assert!(registry.lookup("echo").is_some());
        assert!(registry.lookup("Echo").is_some());
        assert_eq!(registry.names(), vec!["ECHO".to_string()]);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(EchoAction)).unwrap();
        let err = registry.register(Arc::new(EchoAction)).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateAction(_)));
    }

    #[tokio::test]
    async fn test_execute_through_registry() {
        let mut registry = ActionRegistry::new();
        registry.register(Arc::new(EchoAction)).unwrap();

        let action = registry.lookup("ECHO").unwrap();
        let outcome = action.execute(&json!({"x": 1}), &context()).await.unwrap();
        assert_eq!(outcome.value, json!({"x": 1}));
        assert_eq!(outcome.result_type, ResultType::Json);
    }

    #[test]
    fn test_directive_parse() {
        let directive = Directive::parse(&json!({"jump": "t3"})).unwrap();
        assert_eq!(directive.jump.as_deref(), Some("t3"));

        let directive = Directive::parse(&json!({"exit": true})).unwrap();
        assert!(directive.exit);

        let directive = Directive::parse(&json!({"break": true})).unwrap();
        assert!(directive.break_loop);

        assert!(Directive::parse(&json!({"restart": true})).is_err());
        assert!(Directive::parse(&json!("exit")).is_err());
    }
}
