//! Build retrieval: serves a stored artifact by project and commit.

use serde::Deserialize;
use thiserror::Error;

use crate::config::BotConfig;
use crate::models::build::{artifact_key, manifest_key, Build};
use crate::services::content_type::detect_content_type;
use crate::services::object_store::{bounded, ObjectStore, StoreError};

/// Query of `GET /build`.
#[derive(Debug, Default, Deserialize)]
pub struct BuildQuery {
    pub project: Option<String>,
    pub commit: Option<String>,
    /// Defaults to the first artifact recorded in the manifest.
    pub artifact: Option<String>,
}

#[derive(Debug)]
pub struct Artifact {
    pub filename: String,
    pub content_type: &'static str,
    pub content: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("project or commit param is missing")]
    MissingParameter,
    #[error("failed to get {key} from the bucket: no such build")]
    ManifestNotFound { key: String },
    #[error("failed to get {key} from the bucket: {source}")]
    ManifestDownload {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to unmarshal {key} to a build record: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("build {project} commit {commit} has no artifacts")]
    NoArtifacts { project: String, commit: String },
    #[error("artifact {name} is not recorded for {project} commit {commit}")]
    ArtifactNotListed {
        name: String,
        project: String,
        commit: String,
    },
    #[error("failed to get {key} from the bucket: {source}")]
    ArtifactDownload {
        key: String,
        #[source]
        source: StoreError,
    },
}

/// Look up the manifest for `project`/`commit` and download one artifact.
pub async fn fetch_artifact(
    store: &dyn ObjectStore,
    config: &BotConfig,
    query: &BuildQuery,
) -> Result<Artifact, RetrievalError> {
    let (project, commit) = match (query.project.as_deref(), query.commit.as_deref()) {
        (Some(p), Some(c)) if !p.is_empty() && !c.is_empty() => (p, c),
        _ => return Err(RetrievalError::MissingParameter),
    };

    let key = manifest_key(project, commit);
    let manifest = bounded(&key, config.call_timeout, store.download(&config.bucket, &key))
        .await
        .map_err(|source| match source {
            StoreError::NotFound { .. } => RetrievalError::ManifestNotFound { key: key.clone() },
            source => RetrievalError::ManifestDownload {
                key: key.clone(),
                source,
            },
        })?;
    let build = Build::from_manifest_bytes(&manifest).map_err(|source| RetrievalError::Decode {
        key: key.clone(),
        source,
    })?;

    let filename = match query.artifact.as_deref().filter(|a| !a.is_empty()) {
        Some(name) if build.artifacts.iter().any(|a| a == name) => name.to_string(),
        Some(name) => {
            return Err(RetrievalError::ArtifactNotListed {
                name: name.to_string(),
                project: project.to_string(),
                commit: commit.to_string(),
            })
        }
        None => build
            .artifacts
            .first()
            .cloned()
            .ok_or_else(|| RetrievalError::NoArtifacts {
                project: project.to_string(),
                commit: commit.to_string(),
            })?,
    };

    let key = artifact_key(project, commit, &filename);
    let content = bounded(&key, config.call_timeout, store.download(&config.bucket, &key))
        .await
        .map_err(|source| RetrievalError::ArtifactDownload {
            key: key.clone(),
            source,
        })?;

    crate::metrics::artifact_downloaded();
    tracing::info!(%project, %commit, %filename, size = content.len(), "Serving artifact");

    Ok(Artifact {
        content_type: detect_content_type(&content),
        filename,
        content,
    })
}
