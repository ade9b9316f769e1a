//! Build bot configuration: resolved once at startup from flags and env.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;

use crate::services::s3_store::S3Credentials;

pub const AUTHOR_NAME: &str = "Powercloud Bot";
pub const AUTHOR_EMAIL: &str = "ltccci@in.ibm.com";

/// Takes precedence over `--github-token-path`.
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_AUTH_TOKEN";

pub const DEFAULT_PORT: u16 = 8090;
pub const DEFAULT_OWNER: &str = "ppc64le-cloud";
pub const DEFAULT_REPO: &str = "builds";
pub const DEFAULT_BASE_BRANCH: &str = "master";
pub const DEFAULT_BUCKET: &str = "ppc64le-ci-builds";
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_MAX_UPLOAD_MB: usize = 1024;

/// Settings shared by every request. Holds no secrets.
#[derive(Clone, Debug)]
pub struct BotConfig {
    /// GitHub organization or user owning the tracking repository.
    pub owner: String,
    /// Tracking repository the manifests are committed to.
    pub repo: String,
    /// Branch every publish merges into.
    pub base_branch: String,
    /// Bucket holding artifacts and manifests.
    pub bucket: String,
    pub github_api_url: String,
    /// Upper bound for each object store or GitHub call.
    pub call_timeout: Duration,
    /// Largest accepted `POST /build` body.
    pub max_upload_bytes: usize,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            owner: DEFAULT_OWNER.to_string(),
            repo: DEFAULT_REPO.to_string(),
            base_branch: DEFAULT_BASE_BRANCH.to_string(),
            bucket: DEFAULT_BUCKET.to_string(),
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            max_upload_bytes: DEFAULT_MAX_UPLOAD_MB * 1024 * 1024,
        }
    }
}

/// The GitHub token from the environment, or else from `token_path`.
pub fn resolve_github_token(
    env_token: Option<String>,
    token_path: Option<&Path>,
) -> anyhow::Result<String> {
    if let Some(token) = env_token.filter(|t| !t.trim().is_empty()) {
        tracing::info!("Using GitHub token from {GITHUB_TOKEN_ENV}");
        return Ok(token.trim().to_string());
    }

    let path = token_path.with_context(|| {
        format!("github token is missing, either --github-token-path or {GITHUB_TOKEN_ENV} env is missing")
    })?;
    let secret = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read github token from {}", path.display()))?;
    let token = secret.trim();
    if token.is_empty() {
        anyhow::bail!("github token file {} is empty", path.display());
    }

    tracing::info!(path = %path.display(), "Using GitHub token from file");
    Ok(token.to_string())
}

/// Parse the S3 credentials file. Without a file the AWS default chain
/// supplies region and keys.
pub fn load_s3_credentials(path: Option<&Path>) -> anyhow::Result<S3Credentials> {
    let Some(path) = path else {
        tracing::warn!("--s3-credentials-file not set -- using the AWS default configuration");
        return Ok(S3Credentials::default());
    };

    let raw = std::fs::read(path)
        .with_context(|| format!("failed to read s3 credentials from {}", path.display()))?;
    serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse s3 credentials in {}", path.display()))
}
