//! Object store capability: durable key → bytes storage.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },
    #[error("object store request for {bucket}/{key} failed: {message}")]
    Backend {
        bucket: String,
        key: String,
        message: String,
    },
    #[error("object store request for {key} timed out after {}s", .after.as_secs())]
    Timeout { key: String, after: Duration },
}

/// Bucket/key addressed blob storage. Implementations must be safe to share
/// across concurrent requests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, bucket: &str, key: &str, content: Vec<u8>) -> Result<(), StoreError>;

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;
}

/// Run a store call with an upper bound on its duration.
pub async fn bounded<T, F>(key: &str, after: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout {
            key: key.to_string(),
            after,
        }),
    }
}
