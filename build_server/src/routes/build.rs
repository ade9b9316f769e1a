//! `/build` request decoding and response encoding.

use std::collections::HashMap;

use axum::extract::multipart::{Multipart, MultipartError};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::services::ingest_service::{IngestRequest, UploadedFile};
use crate::services::retrieval_service::Artifact;

/// Query of `POST /build`.
#[derive(Debug, Default, Deserialize)]
pub struct IngestQuery {
    /// Any non-empty value enables a dry run.
    pub dryrun: Option<String>,
}

impl IngestQuery {
    pub fn is_dry_run(&self) -> bool {
        self.dryrun.as_deref().is_some_and(|v| !v.is_empty())
    }
}

/// Split a multipart form into text fields and file parts, keeping file
/// parts in the order they arrive.
pub async fn read_ingest_request(
    mut multipart: Multipart,
    dry_run: bool,
) -> Result<IngestRequest, MultipartError> {
    let mut form: HashMap<String, String> = HashMap::new();
    let mut files = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let content = field.bytes().await?;
                tracing::debug!(field = %name, %filename, size = content.len(), "Read file part");
                files.push(UploadedFile {
                    field: name,
                    filename,
                    content: content.to_vec(),
                });
            }
            None => {
                let value = field.text().await?;
                tracing::debug!(field = %name, %value, "Read form field");
                form.entry(name).or_insert(value);
            }
        }
    }

    Ok(IngestRequest {
        source: form.remove("source"),
        commit: form.remove("commit"),
        project: form.remove("project"),
        files,
        dry_run,
    })
}

/// Artifact bytes as an attachment download.
pub fn artifact_response(artifact: Artifact) -> Result<Response, String> {
    let disposition = HeaderValue::from_bytes(
        format!("attachment; filename={}", quoted(&artifact.filename)).as_bytes(),
    )
    .map_err(|_| format!("artifact name {:?} is not a valid header", artifact.filename))?;

    let headers = [
        (CONTENT_DISPOSITION, disposition),
        (CONTENT_TYPE, HeaderValue::from_static(artifact.content_type)),
        (CONTENT_LENGTH, HeaderValue::from(artifact.content.len())),
    ];
    Ok((headers, artifact.content).into_response())
}

/// Quoted-string form of `name` for a `Content-Disposition` parameter.
fn quoted(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('"');
    out
}
