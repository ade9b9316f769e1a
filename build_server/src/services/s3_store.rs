//! S3-compatible object store adapter.

use async_trait::async_trait;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use serde::Deserialize;

use super::object_store::{ObjectStore, StoreError};

/// Contents of the S3 credentials file.
#[derive(Clone, Default, Deserialize)]
pub struct S3Credentials {
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub s3_force_path_style: bool,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

impl std::fmt::Debug for S3Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Credentials")
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("insecure", &self.insecure)
            .field("s3_force_path_style", &self.s3_force_path_style)
            .finish_non_exhaustive()
    }
}

impl S3Credentials {
    pub fn has_static_keys(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }

    /// Endpoint URL with a scheme, `http://` when TLS is disabled.
    pub fn endpoint_url(&self) -> Option<String> {
        if self.endpoint.is_empty() {
            return None;
        }
        if self.endpoint.contains("://") {
            return Some(self.endpoint.clone());
        }
        let scheme = if self.insecure { "http" } else { "https" };
        Some(format!("{scheme}://{}", self.endpoint))
    }
}

pub struct S3ObjectStore {
    client: S3Client,
}

impl std::fmt::Debug for S3ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectStore").finish_non_exhaustive()
    }
}

impl S3ObjectStore {
    /// Build a client from the credentials file. Without static keys the AWS
    /// default chain (environment, profile, instance role) supplies them.
    pub async fn connect(credentials: &S3Credentials) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if !credentials.region.is_empty() {
            loader = loader.region(aws_config::Region::new(credentials.region.clone()));
        }
        if credentials.has_static_keys() {
            tracing::info!("Using static S3 access keys");
            loader = loader.credentials_provider(aws_credential_types::Credentials::new(
                credentials.access_key.clone(),
                credentials.secret_key.clone(),
                None,
                None,
                "build-bot-static",
            ));
        } else {
            tracing::info!("No static S3 keys configured, using the AWS default credential chain");
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(credentials.s3_force_path_style);
        if let Some(endpoint) = credentials.endpoint_url() {
            tracing::info!(endpoint = %endpoint, "Using custom S3 endpoint");
            builder = builder.endpoint_url(endpoint);
        }

        Self {
            client: S3Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn upload(&self, bucket: &str, key: &str, content: Vec<u8>) -> Result<(), StoreError> {
        let size = content.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(content))
            .send()
            .await
            .map_err(|e| StoreError::Backend {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: DisplayErrorContext(&e).to_string(),
            })?;

        tracing::debug!(bucket, key, size, "Object uploaded");
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    StoreError::Backend {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    }
                }
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Backend {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();

        tracing::debug!(bucket, key, size = bytes.len(), "Object downloaded");
        Ok(bytes.to_vec())
    }
}
