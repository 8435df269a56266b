//! Seam to the simulation engine.
//!
//! The engine is a black box: it receives one [`RunArgs`] per simulation and
//! runs them with at most `max_concurrency` in flight.

use std::{
    fs::File,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::{process::Command, sync::Semaphore};

/// Arguments of one engine run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgs {
    pub project_path: PathBuf,
    pub project_simulation_id: i64,
    pub aidb_path: PathBuf,
    pub cbm_exe_path: PathBuf,
    pub results_database_path: PathBuf,
    pub tempfiles_output_dir: PathBuf,
    pub stdout_path: PathBuf,
    pub copy_makelist_results: bool,
    pub dist_classes_path: PathBuf,
    pub dist_rules_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Succeeded,
    Failed(String),
}

/// Result of one run, in the same order as the submitted [`RunArgs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub simulation_id: i64,
    pub status: RunStatus,
}

#[async_trait]
pub trait SimulationEngine: Send + Sync {
    /// Run every simulation in `runs`. An `Err` means the batch as a whole
    /// could not run; per-simulation failures are reported in the outcomes.
    async fn run_concurrent(
        &self,
        runs: Vec<RunArgs>,
        toolbox_env: &Path,
        max_concurrency: usize,
    ) -> Result<Vec<RunOutcome>>;
}

/// Runs an external program once per simulation.
///
/// The program is started in `toolbox_env` as
/// `<program> <args..> --run-args <json>`, with stdout and stderr redirected
/// to the run's stdout file.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    async fn run_one(&self, run: &RunArgs, toolbox_env: &Path) -> Result<RunStatus> {
        let encoded = serde_json::to_string(run)?;
        let stdout = File::create(&run.stdout_path)
            .with_context(|| format!("Failed to create {}", run.stdout_path.display()))?;
        let stderr = stdout.try_clone()?;

        let status = Command::new(&self.program)
            .args(&self.args)
            .arg("--run-args")
            .arg(encoded)
            .current_dir(toolbox_env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .status()
            .await
            .with_context(|| format!("Failed to start {}", self.program.display()))?;

        if status.success() {
            Ok(RunStatus::Succeeded)
        } else {
            Ok(RunStatus::Failed(format!("engine exited with {status}")))
        }
    }
}

#[async_trait]
impl SimulationEngine for ProcessEngine {
    async fn run_concurrent(
        &self,
        runs: Vec<RunArgs>,
        toolbox_env: &Path,
        max_concurrency: usize,
    ) -> Result<Vec<RunOutcome>> {
        let semaphore = Arc::new(Semaphore::new(max_concurrency.max(1)));
        let jobs = runs.iter().map(|run| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = semaphore.acquire().await?;
                tracing::info!(
                    simulation_id = run.project_simulation_id,
                    project = %run.project_path.display(),
                    "starting simulation"
                );
                let status = self.run_one(run, toolbox_env).await?;
                Ok::<_, anyhow::Error>(RunOutcome {
                    simulation_id: run.project_simulation_id,
                    status,
                })
            }
        });

        join_all(jobs).await.into_iter().collect()
    }
}
