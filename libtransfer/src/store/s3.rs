//! S3 backend built on aws-sdk-s3, with bounded retries for transport errors.

use std::{future::Future, path::Path};

use async_trait::async_trait;
use aws_sdk_s3::{
    Client,
    config::Region,
    error::{DisplayErrorContext, SdkError},
    primitives::ByteStream,
};
use tokio::{
    fs::File,
    io::{self, AsyncWriteExt, BufWriter},
    time::{Duration, sleep},
};

use crate::error::{Result, TransferError};
use crate::store::BlobStore;

/// S3 backend options
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores; `None` uses AWS.
    pub endpoint_url: Option<String>,
    /// Attempts per request, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each further attempt.
    pub initial_retry_delay_ms: u64,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl S3Config {
    pub fn new(bucket: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            region: region.into(),
            endpoint_url: None,
            max_attempts: 10,
            initial_retry_delay_ms: 200,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(65),
        }
    }
}

pub struct S3BlobStore {
    client: Client,
    config: S3Config,
}

impl S3BlobStore {
    pub async fn new(config: S3Config) -> Self {
        let timeouts = aws_config::timeout::TimeoutConfig::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build();
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .timeout_config(timeouts);
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.endpoint_url.is_some())
            .build();
        Self {
            client: Client::from_conf(s3_config),
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    async fn execute_with_retry<T, F, Fut>(
        &self,
        operation: F,
        operation_name: &'static str,
        key: &str,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if !e.is_retryable() || attempt >= self.config.max_attempts => {
                    return Err(e);
                }
                Err(e) => {
                    let delay_ms = self.config.initial_retry_delay_ms * 2u64.pow(attempt - 1);
                    tracing::warn!(
                        key,
                        attempt,
                        delay_ms,
                        "{operation_name} failed, retrying: {e}"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
            }
        }
    }

    async fn put_once(&self, key: &str, local_path: &Path) -> Result<()> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(io::Error::other)?;
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| transport("put_object", key, e))?;
        Ok(())
    }

    async fn get_once(&self, key: &str, local_path: &Path) -> Result<()> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await;
        let output = match resp {
            Ok(o) => o,
            Err(SdkError::ServiceError(e)) if e.err().is_no_such_key() => {
                return Err(TransferError::NotFound(key.to_string()));
            }
            Err(e) => return Err(transport("get_object", key, e)),
        };

        let mut body = output.body.into_async_read();
        let mut writer = BufWriter::new(File::create(local_path).await?);
        io::copy(&mut body, &mut writer)
            .await
            .map_err(|e| transport("get_object", key, e))?;
        writer.flush().await?;
        Ok(())
    }
}

fn transport<E>(operation: &'static str, key: &str, err: E) -> TransferError
where
    E: std::error::Error,
{
    TransferError::Transport {
        operation,
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_file(&self, key: &str, local_path: &Path) -> Result<()> {
        tracing::info!(
            "uploading file '{}' to s3://{}/{key}",
            local_path.display(),
            self.config.bucket
        );
        self.execute_with_retry(|| self.put_once(key, local_path), "put_object", key)
            .await
    }

    async fn get_file(&self, key: &str, local_path: &Path) -> Result<()> {
        tracing::info!(
            "downloading file from s3://{}/{key} to '{}'",
            self.config.bucket,
            local_path.display()
        );
        self.execute_with_retry(|| self.get_once(key, local_path), "get_object", key)
            .await
    }
}
