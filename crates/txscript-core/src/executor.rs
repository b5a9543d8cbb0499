//! Host control surface for running scripts.
//!
//! A [`ScriptExecutor`] owns at most one run at a time. A run is a set of
//! tokio tasks (the main sequence, handler activations, frame forwarders and
//! the receive dispatcher) tracked by one [`TaskTracker`] and cancelled by
//! one [`CancellationToken`].
//!
//! ```text
//!            start()              pause()
//!   IDLE ──────────────▶ RUNNING ◀──────▶ PAUSED
//!    ▲  ╲                   │  resume()     │
//!    │   ╲ parse errors     │ main done /   │
//!    │    ▼                 ▼ stop()        │
//!    │   ERROR           STOPPED ◀──────────┘ stop()
//!    │    │ stop()          │ stop() (drains tasks)
//!    └────┴─────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use txscript_core::bus::VirtualBus;
//! use txscript_core::executor::ScriptExecutor;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(VirtualBus::new());
//!     let executor = ScriptExecutor::new(bus.clone());
//!
//!     executor.start("repeat(3) { send(0x7DF, 0x02, 0x01, 0x0C) delay(100) }", &["can0"]).await.unwrap();
//!     executor.wait_until_settled().await;
//!     executor.stop().await.unwrap();
//!
//!     assert_eq!(bus.sent_count(), 3);
//! }
//! ```

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

use crate::ast::Program;
use crate::bus::{CanBus, PortWriter};
use crate::config::ExecutorConfig;
use crate::control::RunControl;
use crate::environment::GlobalScope;
use crate::error::{ExecutorError, ScriptError};
use crate::handlers;
use crate::interpreter::{RunContext, Task};
use crate::log::{ExecutorEvent, RunLog};
use crate::parser::parse_source;
use crate::value::RuntimeValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Idle,
    Running,
    Paused,
    Stopped,
    Error,
}

impl ExecutionState {
    /// `RUNNING` or `PAUSED`.
    pub fn is_active(self) -> bool {
        matches!(self, ExecutionState::Running | ExecutionState::Paused)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::Idle => write!(f, "IDLE"),
            ExecutionState::Running => write!(f, "RUNNING"),
            ExecutionState::Paused => write!(f, "PAUSED"),
            ExecutionState::Stopped => write!(f, "STOPPED"),
            ExecutionState::Error => write!(f, "ERROR"),
        }
    }
}

/// Tasks and cancellation of the current run.
struct ActiveRun {
    run_id: Uuid,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl ActiveRun {
    async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub struct ScriptExecutor {
    writer: Arc<PortWriter>,
    config: ExecutorConfig,
    state_tx: Arc<watch::Sender<ExecutionState>>,
    log: Arc<RunLog>,
    /// Serializes host control calls.
    run: Mutex<Option<ActiveRun>>,
    /// Global scope of the current or most recent run.
    globals: Mutex<Arc<Mutex<GlobalScope>>>,
}

impl ScriptExecutor {
    pub fn new(bus: Arc<dyn CanBus>) -> Self {
        Self::with_config(bus, ExecutorConfig::default())
    }

    pub fn with_config(bus: Arc<dyn CanBus>, config: ExecutorConfig) -> Self {
        let (state_tx, _) = watch::channel(ExecutionState::Idle);
        Self {
            writer: Arc::new(PortWriter::new(bus)),
            log: Arc::new(RunLog::new(config.max_error_log, config.max_output_log)),
            config,
            state_tx: Arc::new(state_tx),
            run: Mutex::new(None),
            globals: Mutex::new(Arc::new(Mutex::new(GlobalScope::new()))),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn state(&self) -> ExecutionState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state changes, errors and `print` output.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutorEvent> {
        self.log.subscribe()
    }

    /// The error log of the current or most recent run.
    pub async fn errors(&self) -> Vec<ScriptError> {
        self.log.errors().await
    }

    /// Total errors of the run, including any past the log's capacity.
    pub async fn error_count(&self) -> usize {
        self.log.error_count().await
    }

    /// Recent `print` output of the current or most recent run.
    pub async fn output(&self) -> Vec<String> {
        self.log.output().await
    }

    /// Appends every subsequent error to `path` as JSON Lines.
    pub async fn persist_errors(&self, path: &Path) -> std::io::Result<()> {
        self.log.persist_to(path).await
    }

    /// Reads a global variable of the current or most recent run.
    pub async fn variable(&self, name: &str) -> Option<RuntimeValue> {
        let globals = self.globals.lock().await.clone();
        let scope = globals.lock().await;
        scope.get(name).cloned()
    }

    /// All global variables of the current or most recent run, sorted by name.
    pub async fn variables(&self) -> Vec<(String, RuntimeValue)> {
        let globals = self.globals.lock().await.clone();
        let scope = globals.lock().await;
        scope.snapshot()
    }

    fn set_state(&self, run_id: Option<Uuid>, state: ExecutionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "execution state changed");
            self.log.state_changed(run_id, state);
        }
    }

    /// Parses `source` and starts it against `ports`.
    ///
    /// LEX/PARSE errors are written to the error log, the executor moves to
    /// `ERROR` and the script is not started.
    pub async fn start<P: AsRef<str>>(&self, source: &str, ports: &[P]) -> Result<Uuid, ExecutorError> {
        let mut run = self.run.lock().await;
        self.check_startable(ports.len())?;
        Self::retire(&mut run).await;
        self.log.reset().await;

        let (program, errors) = parse_source(source);
        if !errors.is_empty() {
            let count = errors.len();
            info!(errors = count, "script rejected");
            self.log.record_errors(None, errors).await;
            self.set_state(None, ExecutionState::Error);
            return Err(ExecutorError::InvalidScript(count));
        }

        Ok(self.launch(&mut run, Arc::new(program), ports).await)
    }

    /// Starts an already parsed program.
    pub async fn start_program<P: AsRef<str>>(&self, program: Program, ports: &[P]) -> Result<Uuid, ExecutorError> {
        let mut run = self.run.lock().await;
        self.check_startable(ports.len())?;
        Self::retire(&mut run).await;
        self.log.reset().await;
        Ok(self.launch(&mut run, Arc::new(program), ports).await)
    }

    fn check_startable(&self, port_count: usize) -> Result<(), ExecutorError> {
        if self.state().is_active() {
            return Err(ExecutorError::AlreadyRunning);
        }
        if port_count == 0 {
            return Err(ExecutorError::NoPorts);
        }
        Ok(())
    }

    /// Drains a finished run that was not yet stopped by the host.
    async fn retire(run: &mut Option<ActiveRun>) {
        if let Some(previous) = run.take() {
            previous.shutdown().await;
        }
    }

    async fn launch<P: AsRef<str>>(&self, run: &mut Option<ActiveRun>, program: Arc<Program>, ports: &[P]) -> Uuid {
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let globals = Arc::new(Mutex::new(GlobalScope::new()));
        *self.globals.lock().await = globals.clone();

        let (frames, dispatch_rx) = broadcast::channel(self.config.frame_buffer.max(1));
        let ports: Vec<String> = ports.iter().map(|p| p.as_ref().to_string()).collect();

        self.set_state(Some(run_id), ExecutionState::Running);

        let ctx = Arc::new(RunContext {
            run_id,
            program: program.clone(),
            globals,
            control: RunControl::new(self.state_tx.subscribe(), cancel.clone()),
            writer: self.writer.clone(),
            ports,
            log: self.log.clone(),
            config: self.config.clone(),
            frames,
            state: self.state_tx.clone(),
            tracker: tracker.clone(),
        });

        let span = info_span!("run", run_id = %run_id);
        info!(
            parent: &span,
            ports = ?ctx.ports,
            statements = program.statements.len(),
            receive_handlers = program.receive_handlers.len(),
            interval_handlers = program.interval_handlers.len(),
            "starting script"
        );

        {
            let _enter = span.enter();
            handlers::spawn_forwarders(&ctx, self.writer.bus().as_ref());
            if !program.receive_handlers.is_empty() {
                handlers::spawn_dispatcher(&ctx, dispatch_rx);
            }
            handlers::spawn_intervals(&ctx);
        }

        let main_ctx = ctx.clone();
        tracker.spawn(
            async move {
                let mut task = Task::new(main_ctx.clone());
                let completed = task.run_main().await.is_ok();
                info!(completed, "main sequence finished");
                if completed && !main_ctx.program.has_handlers() {
                    main_ctx.finish();
                }
            }
            .instrument(span),
        );

        *run = Some(ActiveRun { run_id, cancel, tracker });
        run_id
    }

    /// `RUNNING → PAUSED`. The statement in flight completes; pending
    /// delays and waits keep their remaining budget.
    pub async fn pause(&self) -> Result<(), ExecutorError> {
        let run = self.run.lock().await;
        match self.state() {
            ExecutionState::Running => {
                self.set_state(run.as_ref().map(|r| r.run_id), ExecutionState::Paused);
                Ok(())
            }
            state => Err(ExecutorError::InvalidTransition { action: "pause", state }),
        }
    }

    /// `PAUSED → RUNNING`.
    pub async fn resume(&self) -> Result<(), ExecutorError> {
        let run = self.run.lock().await;
        match self.state() {
            ExecutionState::Paused => {
                self.set_state(run.as_ref().map(|r| r.run_id), ExecutionState::Running);
                Ok(())
            }
            state => Err(ExecutorError::InvalidTransition { action: "resume", state }),
        }
    }

    /// Cancels every task of the run, waits for them to exit and returns to
    /// `IDLE`. Calling it while `IDLE` does nothing.
    pub async fn stop(&self) -> Result<(), ExecutorError> {
        let mut run = self.run.lock().await;
        let active = run.take();
        let run_id = active.as_ref().map(|r| r.run_id);

        if let Some(active) = active {
            active.cancel.cancel();
            if self.state().is_active() {
                self.set_state(run_id, ExecutionState::Stopped);
            }
            active.shutdown().await;
            info!(run_id = %active.run_id, "run drained");
        }

        self.set_state(run_id, ExecutionState::Idle);
        Ok(())
    }

    /// Resolves once the executor is no longer `RUNNING` or `PAUSED`, and
    /// returns the state it settled in.
    pub async fn wait_until_settled(&self) -> ExecutionState {
        let mut rx = self.state_tx.subscribe();
        let settled = rx.wait_for(|s| !s.is_active()).await.map(|s| *s);
        settled.unwrap_or_else(|_| self.state())
    }
}

impl fmt::Debug for ScriptExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptExecutor")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("writer", &self.writer)
            .field("log", &self.log)
            .finish()
    }
}
