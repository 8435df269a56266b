use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use libtransfer::{BlobStore, LocalFsBlobStore, S3BlobStore, S3Config};
use serde::Deserialize;
use sysinfo::System;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bucket: String,
    pub region: String,
    pub activity_arn: String,
    // prefix of every blob key this fleet touches
    #[serde(default = "default_namespace")]
    pub namespace: String,
    // per-task work roots are created below this directory
    #[serde(default = "std::env::temp_dir")]
    pub work_root: PathBuf,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    // heartbeat timeout configured on the broker side
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown_secs: u64,
    #[serde(default = "default_broker_timeout")]
    pub broker_timeout_secs: u64,
    // cores the launcher divides between worker processes
    #[serde(default = "host_cpu_count")]
    pub cpu_budget: usize,
    pub engine: EngineConfig,
    #[serde(default)]
    pub blob_store: BlobStoreConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobStoreConfig {
    #[default]
    S3,
    /// Blobs kept as files under `root`; for local runs.
    Local { root: PathBuf },
}

fn default_namespace() -> String {
    "simfleet".to_string()
}

fn default_max_concurrency() -> usize {
    1
}

fn default_poll_interval() -> u64 {
    30
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_task_timeout() -> u64 {
    60
}

fn default_failure_cooldown() -> u64 {
    60
}

fn default_broker_timeout() -> u64 {
    65
}

fn host_cpu_count() -> usize {
    let mut sys = System::new();
    sys.refresh_cpu();
    sys.cpus().len().max(1)
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            bail!("max_concurrency must be at least 1");
        }
        if self.heartbeat_interval_secs == 0 {
            bail!("heartbeat_interval_secs must be at least 1");
        }
        if self.heartbeat_interval_secs >= self.task_timeout_secs {
            bail!(
                "heartbeat_interval_secs ({}) must be below task_timeout_secs ({})",
                self.heartbeat_interval_secs,
                self.task_timeout_secs
            );
        }
        if self.cpu_budget == 0 {
            bail!("cpu_budget must be at least 1");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_secs)
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_secs(self.broker_timeout_secs)
    }

    /// Open the configured blob store.
    pub async fn connect_blob_store(&self) -> Arc<dyn BlobStore> {
        match &self.blob_store {
            BlobStoreConfig::S3 => {
                let mut s3 = S3Config::new(&self.bucket, &self.region);
                s3.read_timeout = self.broker_timeout();
                Arc::new(S3BlobStore::new(s3).await)
            }
            BlobStoreConfig::Local { root } => Arc::new(LocalFsBlobStore::new(root)),
        }
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    let cfg: Config = serde_yaml::from_str(content).context("Failed to parse YAML config")?;
    cfg.validate()?;
    Ok(cfg)
}

pub fn load_config(path: &str) -> Result<Config> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read config from {path}"))?;
    parse_config(&content)
}
