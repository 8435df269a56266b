use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tempfile::TempDir;
use tokio::task;

use crate::archive::{self, ArchiveForm};
use crate::error::Result;
use crate::keys::{ArchiveKey, TransferKind, local_archive_name};
use crate::store::BlobStore;

/// Moves files and directory trees through a blob store as single archives.
///
/// Every local artifact (the archive itself) lives in a scratch directory that
/// is removed when the operation returns, whatever the outcome.
#[derive(Clone)]
pub struct ArchiveTransfer {
    store: Arc<dyn BlobStore>,
    scratch_root: Option<PathBuf>,
}

impl ArchiveTransfer {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            store,
            scratch_root: None,
        }
    }

    /// Stage archives under `root` instead of the system temp directory.
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    fn scratch_dir(&self) -> Result<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("transfer-");
        let dir = match &self.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Archive `local_path` and store it as `<namespace>/<document_name>.tar.gz`.
    pub async fn upload(
        &self,
        local_path: &Path,
        namespace: &str,
        document_name: &str,
    ) -> Result<ArchiveKey> {
        let key = ArchiveKey::new(namespace, document_name);
        let scratch = self.scratch_dir()?;
        let archive_path = scratch.path().join(local_archive_name(document_name));

        let source = local_path.to_path_buf();
        let target = archive_path.clone();
        let form = task::spawn_blocking(move || archive::pack(&source, &target)).await??;

        self.store.put_file(key.as_str(), &archive_path).await?;
        tracing::info!(
            key = %key,
            form = ?form,
            "uploaded {}",
            local_path.display()
        );
        Ok(key)
    }

    /// Fetch `<namespace>/<document_name>.tar.gz` and restore it at
    /// `destination`: as that exact file for a single-file archive, or as a
    /// directory root otherwise.
    pub async fn download(
        &self,
        namespace: &str,
        document_name: &str,
        destination: &Path,
    ) -> Result<ArchiveForm> {
        let key = ArchiveKey::new(namespace, document_name);
        let scratch = self.scratch_dir()?;
        let archive_path = scratch.path().join(local_archive_name(document_name));

        self.store.get_file(key.as_str(), &archive_path).await?;

        let target = destination.to_path_buf();
        let label = key.to_string();
        let form =
            task::spawn_blocking(move || archive::unpack(&archive_path, &target, &label)).await??;
        tracing::info!(
            key = %key,
            form = ?form,
            "downloaded to {}",
            destination.display()
        );
        Ok(form)
    }
}

/// Transfers scoped to one execution: keys are built from a [`TransferKind`]
/// under `<namespace>/<execution_id>`.
#[derive(Clone)]
pub struct ExecutionStore {
    transfer: ArchiveTransfer,
    namespace: String,
    execution_id: String,
}

impl ExecutionStore {
    pub fn new(
        transfer: ArchiveTransfer,
        namespace: impl Into<String>,
        execution_id: impl Into<String>,
    ) -> Self {
        Self {
            transfer,
            namespace: namespace.into(),
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn key_for(&self, kind: &TransferKind) -> ArchiveKey {
        ArchiveKey::new(
            &kind.prefix(&self.namespace, &self.execution_id),
            &kind.document_name(),
        )
    }

    pub async fn upload(&self, kind: &TransferKind, local_path: &Path) -> Result<ArchiveKey> {
        self.transfer
            .upload(
                local_path,
                &kind.prefix(&self.namespace, &self.execution_id),
                &kind.document_name(),
            )
            .await
    }

    pub async fn download(&self, kind: &TransferKind, local_path: &Path) -> Result<ArchiveForm> {
        self.transfer
            .download(
                &kind.prefix(&self.namespace, &self.execution_id),
                &kind.document_name(),
                local_path,
            )
            .await
    }
}

impl std::fmt::Debug for ExecutionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStore")
            .field("namespace", &self.namespace)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

