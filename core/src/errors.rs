/// Error types for the FlowK engine.
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while loading and validating flow definitions.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Flow file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Schema validation failed for {path}: {violations}")]
    Schema { path: PathBuf, violations: String },

    #[error("Import cycle detected at {0}")]
    ImportCycle(PathBuf),

    #[error("Task '{task_id}' uses unknown action '{action}'")]
    UnknownAction { task_id: String, action: String },

    #[error("Duplicate task id '{0}'")]
    DuplicateTaskId(String),

    #[error("{field} references unknown flow '{flow_id}'")]
    UnknownFlowReference { field: String, flow_id: String },

    #[error("{field} references unknown task '{task_id}'")]
    UnknownTaskReference { field: String, task_id: String },

    #[error("Flow definition invalid: {0}")]
    Invalid(String),
}

/// Result type for loader operations.
pub type LoadResult<T> = Result<T, LoadError>;

/// Errors produced during placeholder expansion.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpandError {
    #[error("Unknown variable reference '${{{0}}}'")]
    UnknownReference(String),

    #[error("Unresolved task result '{0}'")]
    UnresolvedTaskResult(String),

    #[error("Invalid result path '{path}': {message}")]
    InvalidPath { path: String, message: String },
}

/// Result type for expansion operations.
pub type ExpandResult<T> = Result<T, ExpandError>;

/// Errors produced by the task scheduler and actions.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid payload for task '{task_id}': {message}")]
    PayloadInvalid { task_id: String, message: String },

    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    #[error("Task '{task_id}' failed: {message}")]
    ActionFailed { task_id: String, message: String },

    #[error("Expansion error in task '{task_id}': {source}")]
    Expand {
        task_id: String,
        source: ExpandError,
    },

    #[error("Invalid control directive: {0}")]
    InvalidDirective(String),

    #[error("Task '{task_id}' exceeded {limit} iterations")]
    MaxIterationsExceeded { task_id: String, limit: u64 },

    #[error("Task '{task_id}' timed out after {seconds} seconds")]
    Timeout { task_id: String, seconds: f64 },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run stopped")]
    Stopped,

    #[error("Join error: {0}")]
    Join(String),
}

impl EngineError {
    /// Stop and cancel terminate the run without counting as flow failures.
    pub fn is_failure(&self) -> bool {
        !matches!(self, EngineError::Stopped | EngineError::Cancelled)
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors produced during action registration.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Action '{0}' is already registered")]
    DuplicateAction(String),
}

/// Errors produced by the flow runner.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("A run is already in progress")]
    RunInProgress,

    #[error("No run in progress")]
    NoRunInProgress,

    #[error("Resume task '{0}' not found in run state")]
    ResumeTaskNotFound(String),

    #[error("Resume task '{0}' has not completed")]
    ResumeTaskNotCompleted(String),

    #[error("Conflicting run options: {0}")]
    FilterConflict(String),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Result type for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;

/// Errors produced while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
