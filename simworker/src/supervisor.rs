//! Per-process worker loop: acquire a task, hold it with heartbeats while it
//! runs, report exactly one outcome, repeat.
//!
//! Tasks are handled strictly one at a time. Several supervisors may run on
//! one host as separate processes; they share nothing but the broker.

use std::{fmt, panic::AssertUnwindSafe, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use common::{SimulationSpec, TaskInput};
use futures::FutureExt;
use libtransfer::{ArchiveTransfer, ExecutionStore};
use tempfile::TempDir;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, Task};
use crate::config::Config;
use crate::engine::{RunStatus, SimulationEngine};
use crate::executor::{TaskExecutor, WorkLayout, decompose, panic_message};
use crate::heartbeat::HeartbeatMonitor;
use crate::reporter::ResultReporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    TaskAcquired,
    Preparing,
    Running,
    Reporting,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Idle => "idle",
            SupervisorState::TaskAcquired => "task_acquired",
            SupervisorState::Preparing => "preparing",
            SupervisorState::Running => "running",
            SupervisorState::Reporting => "reporting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub namespace: String,
    pub work_root: PathBuf,
    pub max_concurrency: usize,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub failure_cooldown: Duration,
}

impl From<&Config> for SupervisorConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            work_root: cfg.work_root.clone(),
            max_concurrency: cfg.max_concurrency,
            poll_interval: cfg.poll_interval(),
            heartbeat_interval: cfg.heartbeat_interval(),
            failure_cooldown: cfg.failure_cooldown(),
        }
    }
}

// What gets reported, decided before the heartbeat is stopped.
struct Outcome {
    simulations: Vec<SimulationSpec>,
    errors: Option<String>,
}

pub struct PollSupervisor {
    broker: Arc<dyn Broker>,
    transfer: ArchiveTransfer,
    executor: TaskExecutor,
    reporter: ResultReporter,
    heartbeat: HeartbeatMonitor,
    config: SupervisorConfig,
    state: SupervisorState,
}

impl PollSupervisor {
    pub fn new(
        broker: Arc<dyn Broker>,
        transfer: ArchiveTransfer,
        engine: Arc<dyn SimulationEngine>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            executor: TaskExecutor::new(engine, config.max_concurrency),
            reporter: ResultReporter::new(broker.clone()),
            heartbeat: HeartbeatMonitor::new(broker.clone(), config.heartbeat_interval),
            broker,
            transfer,
            config,
            state: SupervisorState::Idle,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "state transition");
            self.state = state;
        }
    }

    /// Ask the broker once. Transport errors count as an empty poll.
    pub async fn poll(&self) -> Option<Task> {
        match self.broker.get_next_task().await {
            Ok(task) => task,
            Err(e) => {
                warn!("poll failed: {e}");
                None
            }
        }
    }

    /// Poll until a task arrives, sleeping `poll_interval` after every empty poll.
    pub async fn acquire(&mut self) -> Task {
        loop {
            if let Some(task) = self.poll().await {
                info!(token = %task.token, "task acquired");
                self.set_state(SupervisorState::TaskAcquired);
                return task;
            }
            debug!(
                "no task available, polling again in {}s",
                self.config.poll_interval.as_secs()
            );
            sleep(self.config.poll_interval).await;
        }
    }

    /// Acquire one task and see it through to its reported outcome. A panic
    /// while handling the task comes back as an error.
    pub async fn run_once(&mut self) -> Result<()> {
        let task = self.acquire().await;
        let handled = AssertUnwindSafe(self.process(task)).catch_unwind().await;
        handled.unwrap_or_else(|payload| {
            self.set_state(SupervisorState::Idle);
            Err(anyhow!("task handling panicked: {}", panic_message(&*payload)))
        })
    }

    /// Serve tasks forever. A task that ended without a reported outcome is
    /// followed by `failure_cooldown` before polling resumes.
    pub async fn run(&mut self) {
        loop {
            if let Err(e) = self.run_once().await {
                error!("task ended without a reported outcome: {e:#}");
                self.set_state(SupervisorState::Idle);
                sleep(self.config.failure_cooldown).await;
            }
        }
    }

    /// Drive one acquired task. The heartbeat runs from before the first
    /// step until just before the outcome is reported; if handling unwinds,
    /// dropping the handle cancels it.
    ///
    /// Every outcome, including unparseable input, goes out through
    /// `report_success` with the errors embedded.
    #[instrument(skip_all, fields(token = %task.token))]
    pub async fn process(&mut self, task: Task) -> Result<()> {
        let mut heartbeat = self.heartbeat.start(task.token.clone());
        let outcome = self.work(&task).await;
        heartbeat.stop().await;

        self.set_state(SupervisorState::Reporting);
        let reported = self
            .reporter
            .report(&task.token, outcome.simulations, outcome.errors)
            .await
            .context("Failed to report task outcome");
        self.set_state(SupervisorState::Idle);
        reported
    }

    async fn work(&mut self, task: &Task) -> Outcome {
        let input = match TaskInput::from_json(&task.input) {
            Ok(input) => input,
            Err(e) => {
                warn!("task input is not valid: {e}");
                // Nothing to echo back.
                return Outcome {
                    simulations: Vec::new(),
                    errors: Some(format!("invalid task input: {e}")),
                };
            }
        };
        info!(
            execution = %input.upload_s3_key,
            simulations = input.simulation_count(),
            "processing task"
        );

        let errors = match self.create_work_dir() {
            Ok(work_dir) => self.run_batch(&input, &WorkLayout::new(work_dir.path())).await,
            Err(e) => vec![format!("{e:#}")],
        };
        if !errors.is_empty() {
            error!(count = errors.len(), "task finished with errors");
        }

        Outcome {
            simulations: input.simulations,
            errors: (!errors.is_empty()).then(|| errors.join("\n")),
        }
    }

    async fn run_batch(&mut self, input: &TaskInput, layout: &WorkLayout) -> Vec<String> {
        let store = ExecutionStore::new(
            self.transfer.clone(),
            &self.config.namespace,
            &input.upload_s3_key,
        );
        let items = decompose(&input.simulations, layout);
        let mut errors = Vec::new();

        self.set_state(SupervisorState::Preparing);
        let shared = match self
            .executor
            .prepare(&store, &input.simulations, layout)
            .await
        {
            Ok(shared) => shared,
            Err(e) => {
                error!("failed to prepare task: {e:#}");
                errors.push(format!("{e:#}"));
                return errors;
            }
        };

        self.set_state(SupervisorState::Running);
        match self.executor.execute(&items, &shared).await {
            Ok(outcomes) => {
                for outcome in outcomes {
                    if let RunStatus::Failed(reason) = outcome.status {
                        warn!(simulation_id = outcome.simulation_id, "simulation failed: {reason}");
                        errors.push(format!("simulation {}: {reason}", outcome.simulation_id));
                    }
                }
            }
            Err(e) => {
                // Nothing trustworthy was produced; leave the outputs behind.
                error!("simulation batch failed: {e}");
                errors.push(e.to_string());
                return errors;
            }
        }

        self.set_state(SupervisorState::Reporting);
        for e in self.reporter.upload_outputs(&store, &items).await {
            errors.push(format!("{e:#}"));
        }
        errors
    }

    fn create_work_dir(&self) -> Result<TempDir> {
        std::fs::create_dir_all(&self.config.work_root).with_context(|| {
            format!(
                "Failed to create work root {}",
                self.config.work_root.display()
            )
        })?;
        tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(&self.config.work_root)
            .context("Failed to create task work directory")
    }
}
