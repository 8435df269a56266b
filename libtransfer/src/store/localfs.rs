//! Local directory backend: each key is a relative path below `root`.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::fs;

use crate::error::{Result, TransferError};
use crate::store::BlobStore;

#[derive(Debug, Clone)]
pub struct LocalFsBlobStore {
    root: PathBuf,
}

impl LocalFsBlobStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob stored under `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for LocalFsBlobStore {
    async fn put_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let path = self.path_for(key);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        fs::copy(local_path, &path).await?;
        tracing::debug!(key, path = %path.display(), "stored blob");
        Ok(())
    }

    async fn get_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let path = self.path_for(key);
        match fs::copy(&path, local_path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound && !path.exists() => {
                Err(TransferError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
