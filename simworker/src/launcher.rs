//! Host-level fan-out: one worker process per slice of the CPU budget.

use std::{path::PathBuf, process::ExitStatus};

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::process::{Child, Command};
use tracing::{error, info};

/// Number of worker processes for a host: `ceil(cpu_budget / max_concurrency)`.
pub fn worker_count(cpu_budget: usize, max_concurrency: usize) -> usize {
    cpu_budget.div_ceil(max_concurrency.max(1))
}

#[derive(Debug, Clone)]
pub struct Launcher {
    program: PathBuf,
    config_path: PathBuf,
    log_json: bool,
}

impl Launcher {
    /// Launch copies of the running executable.
    pub fn current(config_path: impl Into<PathBuf>, log_json: bool) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate current executable")?;
        Ok(Self::new(program, config_path, log_json))
    }

    pub fn new(program: impl Into<PathBuf>, config_path: impl Into<PathBuf>, log_json: bool) -> Self {
        Self {
            program: program.into(),
            config_path: config_path.into(),
            log_json,
        }
    }

    fn command(&self, process_index: usize) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.log_json {
            cmd.arg("--log-json");
        }
        cmd.arg("worker")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--process-index")
            .arg(process_index.to_string())
            .kill_on_drop(true);
        cmd
    }

    /// Start `count` workers and wait for all of them. Exited workers are not
    /// restarted.
    pub async fn launch(&self, count: usize) -> Result<Vec<ExitStatus>> {
        let mut children: Vec<Child> = Vec::with_capacity(count);
        for index in 0..count {
            let child = self
                .command(index)
                .spawn()
                .with_context(|| format!("Failed to start worker {index}"))?;
            info!(process_index = index, pid = child.id(), "worker started");
            children.push(child);
        }

        let statuses = join_all(children.iter_mut().map(|child| child.wait())).await;
        statuses
            .into_iter()
            .enumerate()
            .map(|(index, status)| {
                let status = status.with_context(|| format!("Failed to wait for worker {index}"))?;
                if !status.success() {
                    error!(process_index = index, "worker exited with {status}");
                }
                Ok(status)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_count() {
        assert_eq!(worker_count(8, 1), 8);
        assert_eq!(worker_count(8, 3), 3);
        assert_eq!(worker_count(8, 8), 1);
        assert_eq!(worker_count(2, 4), 1);
        assert_eq!(worker_count(4, 0), 4);
    }

    #[test]
    fn test_worker_command_line() {
        let launcher = Launcher::new("/usr/bin/simworker", "/etc/simfleet.yaml", true);
        let cmd = launcher.command(2);
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "--log-json",
                "worker",
                "--config",
                "/etc/simfleet.yaml",
                "--process-index",
                "2"
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_waits_for_every_worker() {
        let launcher = Launcher::new("/bin/true", "unused.yaml", false);
        let statuses = launcher.launch(3).await.unwrap();
        assert_eq!(statuses.len(), 3);
        assert!(statuses.iter().all(|s| s.success()));
    }
}
