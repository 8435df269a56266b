//! Operator-side transfers: staging an execution's inputs before tasks are
//! issued, and fetching a simulation's outputs afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use libtransfer::{ArchiveKey, ExecutionStore, TransferKind};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One upload in a manifest, e.g.
/// `{"kind": "project", "project_code": "AB", "local_path": "/data/AB.mdb"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    #[serde(flatten)]
    pub kind: TransferKind,
    pub local_path: PathBuf,
}

pub fn parse_manifest(content: &str) -> Result<Vec<ManifestEntry>> {
    serde_json::from_str(content).context("Failed to parse upload manifest")
}

pub fn load_manifest(path: &Path) -> Result<Vec<ManifestEntry>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest from {}", path.display()))?;
    parse_manifest(&content)
}

/// Upload every entry in order, stopping at the first failure.
pub async fn upload_manifest(
    store: &ExecutionStore,
    entries: &[ManifestEntry],
) -> Result<Vec<ArchiveKey>> {
    let mut keys = Vec::with_capacity(entries.len());
    for entry in entries {
        let key = store
            .upload(&entry.kind, &entry.local_path)
            .await
            .with_context(|| format!("Failed to upload {}", entry.kind))?;
        keys.push(key);
    }
    info!(execution = store.execution_id(), count = keys.len(), "manifest uploaded");
    Ok(keys)
}

/// Fetch the results database and/or the result directory of one simulation.
pub async fn download_simulation(
    store: &ExecutionStore,
    project_code: &str,
    simulation_id: i64,
    results_path: Option<&Path>,
    tempfiles_path: Option<&Path>,
) -> Result<()> {
    let fetches = [
        (TransferKind::results(project_code, simulation_id), results_path),
        (TransferKind::tempfiles(project_code, simulation_id), tempfiles_path),
    ];
    for (kind, path) in fetches {
        let Some(path) = path else { continue };
        store
            .download(&kind, path)
            .await
            .with_context(|| format!("Failed to download {kind}"))?;
    }
    Ok(())
}
