use std::{path::PathBuf, sync::Arc};

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use gethostname::gethostname;
use libtransfer::{ArchiveTransfer, ExecutionStore};
use tracing::{Instrument, info, info_span};

use crate::broker::{
    Broker,
    sfn::{SfnBroker, SfnConfig},
};
use crate::config::{Config, load_config};
use crate::engine::ProcessEngine;
use crate::launcher::{Launcher, worker_count};
use crate::manifest::{download_simulation, load_manifest, upload_manifest};
use crate::supervisor::{PollSupervisor, SupervisorConfig};

#[derive(Parser, Debug)]
#[command(name = "simworker")]
#[command(about = "Runs simulation tasks handed out by an activity broker", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(about = "Run one worker process: poll, run, report, forever")]
    Worker {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        process_index: usize,
    },
    #[command(about = "Start one worker per slice of the host's CPU budget")]
    Launch {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: PathBuf,
    },
    #[command(about = "Upload an execution's resources and projects from a JSON manifest")]
    Upload {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: PathBuf,
        #[arg(long)]
        execution: String,
        #[arg(long, value_name = "MANIFEST_JSON")]
        manifest: PathBuf,
    },
    #[command(about = "Download a simulation's results database and/or result directory")]
    Download {
        #[arg(long, value_name = "CONFIG_YAML")]
        config: PathBuf,
        #[arg(long)]
        execution: String,
        #[arg(long)]
        project: String,
        #[arg(long)]
        simulation: i64,
        #[arg(long, value_name = "PATH")]
        results: Option<PathBuf>,
        #[arg(long, value_name = "PATH")]
        tempfiles: Option<PathBuf>,
    },
}

/// Name a worker registers under with the broker.
pub fn worker_name(process_index: usize) -> String {
    format!("{}-{process_index}", gethostname().to_string_lossy())
}

fn read_config(path: &std::path::Path) -> Result<Config> {
    load_config(&path.to_string_lossy())
}

async fn execution_store(cfg: &Config, execution: &str) -> ExecutionStore {
    let transfer = ArchiveTransfer::new(cfg.connect_blob_store().await);
    ExecutionStore::new(transfer, &cfg.namespace, execution)
}

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Worker {
            config,
            process_index,
        } => {
            let cfg = read_config(&config)?;
            let span = info_span!("worker", process_index);
            run_worker(cfg, process_index).instrument(span).await
        }
        Commands::Launch { config } => {
            let cfg = read_config(&config)?;
            let count = worker_count(cfg.cpu_budget, cfg.max_concurrency);
            info!(
                count,
                cpu_budget = cfg.cpu_budget,
                max_concurrency = cfg.max_concurrency,
                "launching workers"
            );
            let statuses = Launcher::current(&config, cli.log_json)?.launch(count).await?;
            let failed = statuses.iter().filter(|s| !s.success()).count();
            if failed > 0 {
                bail!("{failed} of {count} workers exited unsuccessfully");
            }
            Ok(())
        }
        Commands::Upload {
            config,
            execution,
            manifest,
        } => {
            let cfg = read_config(&config)?;
            let entries = load_manifest(&manifest)?;
            let store = execution_store(&cfg, &execution).await;
            for key in upload_manifest(&store, &entries).await? {
                println!("{key}");
            }
            Ok(())
        }
        Commands::Download {
            config,
            execution,
            project,
            simulation,
            results,
            tempfiles,
        } => {
            if results.is_none() && tempfiles.is_none() {
                bail!("nothing to download: pass --results and/or --tempfiles");
            }
            let cfg = read_config(&config)?;
            let store = execution_store(&cfg, &execution).await;
            download_simulation(
                &store,
                &project,
                simulation,
                results.as_deref(),
                tempfiles.as_deref(),
            )
            .await
        }
    }
}

async fn run_worker(cfg: Config, process_index: usize) -> Result<()> {
    let worker_name = worker_name(process_index);
    let broker: Arc<dyn Broker> = Arc::new(
        SfnBroker::new(SfnConfig {
            activity_arn: cfg.activity_arn.clone(),
            region: cfg.region.clone(),
            worker_name: worker_name.clone(),
            read_timeout: cfg.broker_timeout(),
            connect_timeout: std::time::Duration::from_secs(10),
        })
        .await,
    );
    let transfer = ArchiveTransfer::new(cfg.connect_blob_store().await)
        .with_scratch_root(cfg.work_root.join("scratch"));
    let engine = Arc::new(ProcessEngine::new(
        cfg.engine.program.clone(),
        cfg.engine.args.clone(),
    ));

    let mut supervisor =
        PollSupervisor::new(broker, transfer, engine, SupervisorConfig::from(&cfg));
    info!(worker = %worker_name, activity = %cfg.activity_arn, "worker started");
    supervisor.run().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_worker_args() {
        let cli = Cli::parse_from([
            "simworker",
            "worker",
            "--config",
            "/etc/simfleet.yaml",
            "--process-index",
            "3",
            "--log-json",
        ]);
        assert!(cli.log_json);
        match cli.command {
            Commands::Worker {
                config,
                process_index,
            } => {
                assert_eq!(config, PathBuf::from("/etc/simfleet.yaml"));
                assert_eq!(process_index, 3);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_worker_name_has_index_suffix() {
        assert!(worker_name(4).ends_with("-4"));
    }
}
