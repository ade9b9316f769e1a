//! Build record: the manifest stored next to a build's artifacts.
//!
//! Stored in the object store at `<project>/<commit>/build.yaml` and
//! committed to the tracking repository at `<project>/build.yaml`. The file
//! name is historical; the content is JSON.

use serde::{Deserialize, Serialize};

/// File name of the manifest, both in the bucket and in the repository.
pub const MANIFEST_FILE_NAME: &str = "build.yaml";

/// One ingested build. Field order is the serialized order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub source: String,
    pub commit: String,
    pub artifacts: Vec<String>,
    pub project: String,
}

impl Build {
    pub fn new(
        source: impl Into<String>,
        commit: impl Into<String>,
        project: impl Into<String>,
        artifacts: Vec<String>,
    ) -> Self {
        Self {
            source: source.into(),
            commit: commit.into(),
            artifacts,
            project: project.into(),
        }
    }

    /// Indented JSON, two spaces per level.
    pub fn to_manifest_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_manifest_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    pub fn manifest_key(&self) -> String {
        manifest_key(&self.project, &self.commit)
    }

    /// Path of the manifest inside the tracking repository.
    pub fn repo_path(&self) -> String {
        format!("{}/{MANIFEST_FILE_NAME}", self.project)
    }
}

/// Object key of one artifact: `<project>/<commit>/<filename>`.
pub fn artifact_key(project: &str, commit: &str, filename: &str) -> String {
    format!("{project}/{commit}/{filename}")
}

/// Object key of the manifest: `<project>/<commit>/build.yaml`.
pub fn manifest_key(project: &str, commit: &str) -> String {
    artifact_key(project, commit, MANIFEST_FILE_NAME)
}
