//! Flow runner: mediates run lifecycle around the engine.
//!
//! Guards a single active run, validates start/resume options, loads the
//! definition, wires the engine to the run's stop and cancellation handles,
//! and keeps the run state alive between invocations so resume can reuse it.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::artifacts::ArtifactWriter;
use crate::control::{StopAtTask, StopSignal};
use crate::definition::Definition;
use crate::engine::{Engine, RunOptions};
use crate::errors::{EngineResult, RunnerError, RunnerResult};
use crate::events::{EventKind, FlowEvent, FlowObserver};
use crate::loader::DefinitionLoader;
use crate::registry::ActionRegistry;
use crate::runstate::RunState;
use crate::variables::VariableStore;

struct RunnerInner {
    flow_path: PathBuf,
    running: bool,
    stop: Option<StopSignal>,
    cancel: Option<CancellationToken>,
    stop_at: StopAtTask,
    run_state: Arc<RunState>,
    definition: Option<Arc<Definition>>,
}

/// Mutex-guarded single-run mediator. Cloning shares the same runner state.
#[derive(Clone)]
pub struct FlowRunner {
    registry: Arc<ActionRegistry>,
    observer: Arc<dyn FlowObserver>,
    log_dir: PathBuf,
    inner: Arc<Mutex<RunnerInner>>,
}

impl FlowRunner {
    pub fn new(
        registry: Arc<ActionRegistry>,
        observer: Arc<dyn FlowObserver>,
        flow_path: impl Into<PathBuf>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            observer,
            log_dir: log_dir.into(),
            inner: Arc::new(Mutex::new(RunnerInner {
                flow_path: flow_path.into(),
                running: false,
                stop: None,
                cancel: None,
                stop_at: StopAtTask::new(),
                run_state: Arc::new(RunState::new()),
                definition: None,
            })),
        }
    }

    /// Start a run in the background. Returns `RunInProgress` while another
    /// run is active. Resume reuses the retained run state; any other start
    /// gets a fresh one.
    pub fn start(&self, options: RunOptions) -> RunnerResult<JoinHandle<EngineResult<()>>> {
        options.validate()?;

        let (definition, engine) = {
            let mut inner = self.inner.lock();
            if inner.running {
                return Err(RunnerError::RunInProgress);
            }

            if let Some(task_id) = &options.resume_from {
                match inner.run_state.snapshot(task_id) {
                    None => return Err(RunnerError::ResumeTaskNotFound(task_id.clone())),
                    Some(snapshot) if !snapshot.status.is_terminal() => {
                        return Err(RunnerError::ResumeTaskNotCompleted(task_id.clone()))
                    }
                    Some(_) => {}
                }
            } else {
                inner.run_state = Arc::new(RunState::new());
            }

            let loader = DefinitionLoader::new(&self.registry);
            let definition = Arc::new(loader.load(&inner.flow_path)?);
            self.observer.on_event(
                &FlowEvent::new(EventKind::FlowLoaded, &definition.id)
                    .with_message(inner.flow_path.display().to_string()),
            );

            let stop = StopSignal::new();
            let cancel = CancellationToken::new();
            let engine = Engine::new(
                self.registry.clone(),
                self.observer.clone(),
                inner.run_state.clone(),
                Arc::new(VariableStore::new()),
                ArtifactWriter::new(self.log_dir.clone()),
            )
            .with_stop_signal(stop.clone())
            .with_stop_at(inner.stop_at.clone())
            .with_cancellation(cancel.clone());

            inner.running = true;
            inner.stop = Some(stop);
            inner.cancel = Some(cancel);
            inner.definition = Some(definition.clone());
            (definition, engine)
        };

        let run_id = Uuid::new_v4();
        info!(flow_id = %definition.id, %run_id, "starting run");
        let runner = self.clone();
        let handle = tokio::spawn(async move {
            let result = engine.run(&definition, &options).await;
            match &result {
                Ok(()) => info!(%run_id, "run finished"),
                Err(error) => info!(%run_id, "run ended: {error}"),
            }
            let mut inner = runner.inner.lock();
            inner.running = false;
            inner.stop = None;
            inner.cancel = None;
            result
        });
        Ok(handle)
    }

    /// Signal the active run to stop after its current task.
    pub fn request_stop(&self) -> RunnerResult<()> {
        let inner = self.inner.lock();
        match &inner.stop {
            Some(stop) if inner.running => {
                stop.request();
                Ok(())
            }
            _ => Err(RunnerError::NoRunInProgress),
        }
    }

    /// Hard-cancel the active run.
    pub fn cancel(&self) -> RunnerResult<()> {
        let inner = self.inner.lock();
        match &inner.cancel {
            Some(cancel) if inner.running => {
                cancel.cancel();
                Ok(())
            }
            _ => Err(RunnerError::NoRunInProgress),
        }
    }

    /// Set the stop-at task id; an empty id clears it. Applies to the active
    /// run and to subsequent runs until changed.
    pub fn set_stop_at_task(&self, task_id: &str) {
        self.inner.lock().stop_at.set(task_id);
    }

    /// Rebind the definition source for subsequent starts.
    pub fn update_flow_path(&self, path: impl Into<PathBuf>) {
        let mut inner = self.inner.lock();
        inner.flow_path = path.into();
        inner.definition = None;
    }

    pub fn flow_path(&self) -> PathBuf {
        self.inner.lock().flow_path.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    pub fn run_state(&self) -> Arc<RunState> {
        self.inner.lock().run_state.clone()
    }

    /// Definition of the most recent run, if any.
    pub fn definition(&self) -> Option<Arc<Definition>> {
        self.inner.lock().definition.clone()
    }

    /// Load the currently bound flow file without starting a run.
    pub fn load_definition(&self) -> RunnerResult<Definition> {
        let path = self.flow_path();
        let loader = DefinitionLoader::new(&self.registry);
        Ok(loader.load(&path)?)
    }
}

impl std::fmt::Debug for FlowRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRunner")
            .field("flow_path", &self.flow_path())
            .field("running", &self.is_running())
            .finish()
    }
}
