//! Build ingest: stores uploaded artifacts and the build record, then
//! publishes the record to the tracking repository.
//!
//! The three writes (artifacts, manifest, git publish) are independent and
//! not rolled back. A failed ingest can leave earlier writes in place; the
//! caller recovers by resubmitting the same request, which overwrites the
//! stored objects by key and publishes on a fresh scratch branch.

use std::collections::HashSet;
use std::io::Write;

use thiserror::Error;

use crate::config::BotConfig;
use crate::models::build::{artifact_key, Build, MANIFEST_FILE_NAME};
use crate::services::object_store::{bounded, ObjectStore, StoreError};
use crate::services::publisher::{
    scratch_branch_name, FileSpec, GitPublisher, PublishError, PublishReport, PublishRequest,
};

pub const PR_BODY: &str = "This is an automated PR via build-bot";

/// One file part of the multipart request.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Form field name, only logged.
    pub field: String,
    /// Declared file name, becomes the artifact name.
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestRequest {
    pub source: Option<String>,
    pub commit: Option<String>,
    pub project: Option<String>,
    /// In multipart order.
    pub files: Vec<UploadedFile>,
    pub dry_run: bool,
}

#[derive(Debug)]
pub enum IngestOutcome {
    DryRun(Build),
    Published { build: Build, report: PublishReport },
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("missing required form field: {0}")]
    MissingField(&'static str),
    #[error("invalid artifact filename {filename:?}: {reason}")]
    InvalidFilename {
        filename: String,
        reason: &'static str,
    },
    #[error("artifact {0} appears more than once in the request")]
    DuplicateArtifact(String),
    #[error("failed to upload the file: {filename} to the object store: {source}")]
    Upload {
        filename: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to marshal build record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to upload {key} to the object store: {source}")]
    ManifestUpload {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to write the scratch manifest: {0}")]
    ScratchWrite(#[source] std::io::Error),
    #[error("failed to publish the build record: {0}")]
    Publish(#[from] PublishError),
}

/// Run one ingest. See the module docs for what survives a failure.
pub async fn ingest(
    store: &dyn ObjectStore,
    publisher: &GitPublisher,
    config: &BotConfig,
    request: IngestRequest,
) -> Result<IngestOutcome, IngestError> {
    let result = run(store, publisher, config, request).await;
    match &result {
        Ok(IngestOutcome::DryRun(_)) => crate::metrics::ingest_finished("dry_run"),
        Ok(IngestOutcome::Published { .. }) => crate::metrics::ingest_finished("published"),
        Err(IngestError::Publish(e)) if e.is_concurrent_update() => {
            crate::metrics::ingest_finished("failed");
            tracing::warn!(
                stage = e.stage().as_str(),
                "Ingest lost a publish race, resubmit to retry: {e}"
            );
        }
        Err(e) => {
            crate::metrics::ingest_finished("failed");
            tracing::error!("Ingest failed: {e}");
        }
    }
    result
}

async fn run(
    store: &dyn ObjectStore,
    publisher: &GitPublisher,
    config: &BotConfig,
    request: IngestRequest,
) -> Result<IngestOutcome, IngestError> {
    let source = required(request.source, "source")?;
    let commit = required(request.commit, "commit")?;
    let project = required(request.project, "project")?;
    validate_files(&request.files)?;

    tracing::info!(
        %project,
        %commit,
        files = request.files.len(),
        dry_run = request.dry_run,
        "Ingesting build"
    );

    let mut artifacts = Vec::with_capacity(request.files.len());
    for file in request.files {
        tracing::info!(
            field = %file.field,
            filename = %file.filename,
            size = file.content.len(),
            "File found in the request"
        );
        if !request.dry_run {
            let key = artifact_key(&project, &commit, &file.filename);
            bounded(&key, config.call_timeout, store.upload(&config.bucket, &key, file.content))
                .await
                .map_err(|source| IngestError::Upload {
                    filename: file.filename.clone(),
                    source,
                })?;
            crate::metrics::artifact_stored();
        }
        artifacts.push(file.filename);
    }

    let build = Build::new(source, commit, project, artifacts);
    if request.dry_run {
        tracing::info!(build = ?build, "Dry run, skipping storage and publish");
        return Ok(IngestOutcome::DryRun(build));
    }

    let manifest = build.to_manifest_bytes()?;
    let key = build.manifest_key();
    bounded(&key, config.call_timeout, store.upload(&config.bucket, &key, manifest.clone()))
        .await
        .map_err(|source| IngestError::ManifestUpload {
            key: key.clone(),
            source,
        })?;
    tracing::info!(%key, "Build record stored");

    // Removed when dropped, so it must outlive the publish.
    let scratch = write_scratch_manifest(&manifest).map_err(IngestError::ScratchWrite)?;

    let publish = PublishRequest {
        base_branch: config.base_branch.clone(),
        scratch_branch: scratch_branch_name(&build.project, &build.commit),
        files: vec![FileSpec::new(scratch.path(), build.repo_path())],
        commit_message: format!("{} commit {}", build.project, build.commit),
        pr_title: format!("Update {} build", build.project),
        pr_body: PR_BODY.to_string(),
    };
    let report = publisher.publish(&publish).await?;

    Ok(IngestOutcome::Published { build, report })
}

fn required(value: Option<String>, field: &'static str) -> Result<String, IngestError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or(IngestError::MissingField(field))
}

/// Reject names that would escape `<project>/<commit>/`, shadow the
/// manifest, or collide with another part of the same request.
fn validate_files(files: &[UploadedFile]) -> Result<(), IngestError> {
    let mut seen = HashSet::with_capacity(files.len());
    for file in files {
        if let Err(reason) = validate_filename(&file.filename) {
            return Err(IngestError::InvalidFilename {
                filename: file.filename.clone(),
                reason,
            });
        }
        if !seen.insert(file.filename.as_str()) {
            return Err(IngestError::DuplicateArtifact(file.filename.clone()));
        }
    }
    Ok(())
}

fn validate_filename(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty filename");
    }
    if name == "." || name == ".." {
        return Err("not a file name");
    }
    if name.contains(['/', '\\']) {
        return Err("path separators are not allowed");
    }
    if name.chars().any(char::is_control) {
        return Err("control characters are not allowed");
    }
    if name == MANIFEST_FILE_NAME {
        return Err("reserved for the build record");
    }
    Ok(())
}

fn write_scratch_manifest(manifest: &[u8]) -> std::io::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new().prefix("build").tempfile()?;
    file.write_all(manifest)?;
    file.flush()?;
    Ok(file)
}
