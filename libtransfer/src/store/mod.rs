//! Blob store backends.
//!
//! Submodules:
//! - `s3`: S3-compatible backend built on aws-sdk-s3
//! - `localfs`: directory-rooted backend, used for local runs and tests
//!
//! Backends move whole files: archives are always staged on local disk
//! before upload and after download.

use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

pub mod localfs;
pub mod s3;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store the content of `local_path` under `key`, replacing any previous blob.
    async fn put_file(&self, key: &str, local_path: &Path) -> Result<()>;

    /// Write the blob stored under `key` to `local_path`.
    ///
    /// Returns [`TransferError::NotFound`](crate::TransferError::NotFound)
    /// when no such blob exists.
    async fn get_file(&self, key: &str, local_path: &Path) -> Result<()>;
}
