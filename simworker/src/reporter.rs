use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use common::{SimulationSpec, TaskOutput};
use libtransfer::{ExecutionStore, TransferKind};
use tokio::fs;
use tracing::{info, warn};

use crate::broker::{ActivityToken, Broker, BrokerError};
use crate::executor::WorkItem;

/// Ships a task's outputs to the blob store and closes the task with the
/// broker.
pub struct ResultReporter {
    broker: Arc<dyn Broker>,
}

impl ResultReporter {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Upload every item's outputs. A failing item does not stop the rest;
    /// its error is returned in the list.
    pub async fn upload_outputs(
        &self,
        store: &ExecutionStore,
        items: &[WorkItem],
    ) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        for item in items {
            if let Err(e) = upload_item(store, item).await {
                warn!(
                    project = %item.project_code,
                    simulation_id = item.simulation_id,
                    "failed to upload outputs: {e:#}"
                );
                errors.push(e);
            }
        }
        errors
    }

    /// Report the task as complete. This is the only outcome sent for a task
    /// that got past input parsing, even when `errors` is set.
    pub async fn report(
        &self,
        token: &ActivityToken,
        simulations: Vec<SimulationSpec>,
        errors: Option<String>,
    ) -> Result<(), BrokerError> {
        let failed = errors.is_some();
        let output = TaskOutput::new(simulations, errors);
        self.broker.report_success(token, &output).await?;
        info!(token = %token, failed, "task reported");
        Ok(())
    }
}

async fn upload_item(store: &ExecutionStore, item: &WorkItem) -> Result<()> {
    let results = TransferKind::results(&item.project_code, item.simulation_id);
    if fs::try_exists(&item.results_database_path).await? {
        store
            .upload(&results, &item.results_database_path)
            .await
            .with_context(|| format!("Failed to upload {results}"))?;
        // Kept out of the tempfiles archive below.
        fs::remove_file(&item.results_database_path).await?;
    } else {
        warn!(
            project = %item.project_code,
            simulation_id = item.simulation_id,
            "no results database produced"
        );
    }

    let tempfiles = TransferKind::tempfiles(&item.project_code, item.simulation_id);
    let dir = item.simulation_dir();
    store
        .upload(&tempfiles, dir)
        .await
        .with_context(|| format!("Failed to upload {tempfiles}"))?;
    remove_dir(dir).await
}

async fn remove_dir(dir: &Path) -> Result<()> {
    fs::remove_dir_all(dir)
        .await
        .with_context(|| format!("Failed to remove {}", dir.display()))
}
