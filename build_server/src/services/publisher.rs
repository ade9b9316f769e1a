//! Git publisher: turns a set of files into a single merged commit on the
//! base branch of the tracking repository.
//!
//! One publish runs four stages strictly in order:
//!
//! 1. resolve (or create) the scratch branch,
//! 2. upload the files as blobs and build a tree on top of the branch head,
//! 3. commit the tree and compare-and-swap the branch ref onto it,
//! 4. open a pull request into the base branch, merge it, delete the branch.
//!
//! Any failure ends the call. Nothing is rolled back: a failure after the PR
//! was opened leaves the PR or the branch behind for an operator.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use regex::Regex;
use thiserror::Error;

use crate::services::github_service::{
    CommitAuthor, GitHost, GitHostError, GitRef, NewCommit, NewPullRequest, PullRequest,
    TreeEntry,
};

/// Regular, non-executable file.
pub const FILE_MODE: &str = "100644";
pub const MERGE_COMMIT_MESSAGE: &str = "Merged!";

static UNSAFE_REF_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStage {
    ResolveRef,
    BuildTree,
    Commit,
    OpenPullRequest,
    MergePullRequest,
    DeleteBranch,
}

impl PublishStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishStage::ResolveRef => "resolve_ref",
            PublishStage::BuildTree => "build_tree",
            PublishStage::Commit => "commit",
            PublishStage::OpenPullRequest => "open_pull_request",
            PublishStage::MergePullRequest => "merge_pull_request",
            PublishStage::DeleteBranch => "delete_branch",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to resolve ref {branch}: {source}")]
    ResolveRef {
        branch: String,
        #[source]
        source: GitHostError,
    },
    #[error("failed to read {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build tree on {branch}: {source}")]
    BuildTree {
        branch: String,
        #[source]
        source: GitHostError,
    },
    #[error("unable to create the commit on {branch}: {source}")]
    Commit {
        branch: String,
        #[source]
        source: GitHostError,
    },
    /// Another publisher moved or created the scratch branch first. Retry the
    /// whole publish after a backoff.
    #[error("scratch branch {branch} was updated concurrently: {message}")]
    ConcurrentUpdate {
        stage: PublishStage,
        branch: String,
        message: String,
    },
    #[error("error while creating the pull request from {head} into {base}: {source}")]
    PullRequestOpen {
        head: String,
        base: String,
        #[source]
        source: GitHostError,
    },
    #[error("failed to merge pull request #{number}: {source}")]
    PullRequestMerge {
        number: u64,
        #[source]
        source: GitHostError,
    },
    #[error("failed to delete branch {branch} after merge: {source}")]
    BranchCleanup {
        branch: String,
        #[source]
        source: GitHostError,
    },
}

impl PublishError {
    pub fn stage(&self) -> PublishStage {
        match self {
            PublishError::ResolveRef { .. } => PublishStage::ResolveRef,
            PublishError::ReadFile { .. } | PublishError::BuildTree { .. } => {
                PublishStage::BuildTree
            }
            PublishError::Commit { .. } => PublishStage::Commit,
            PublishError::ConcurrentUpdate { stage, .. } => *stage,
            PublishError::PullRequestOpen { .. } => PublishStage::OpenPullRequest,
            PublishError::PullRequestMerge { .. } => PublishStage::MergePullRequest,
            PublishError::BranchCleanup { .. } => PublishStage::DeleteBranch,
        }
    }

    pub fn is_concurrent_update(&self) -> bool {
        matches!(self, PublishError::ConcurrentUpdate { .. })
    }
}

/// A local file and the path it gets in the repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSpec {
    pub local_path: PathBuf,
    pub repo_path: String,
}

impl FileSpec {
    pub fn new(local_path: impl Into<PathBuf>, repo_path: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            repo_path: repo_path.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub base_branch: String,
    pub scratch_branch: String,
    pub files: Vec<FileSpec>,
    pub commit_message: String,
    pub pr_title: String,
    pub pr_body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub branch: String,
    pub commit_sha: String,
    pub pull_number: u64,
    pub pull_url: String,
}

/// Fresh scratch branch for one publish:
/// `build-bot/<project>/<commit prefix>-<random>`.
pub fn scratch_branch_name(project: &str, commit: &str) -> String {
    let commit: String = ref_component(commit).chars().take(12).collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "build-bot/{}/{}-{}",
        ref_component(project),
        commit.trim_end_matches(['.', '-']),
        &suffix[..8]
    )
}

/// Reduce `raw` to one valid ref path component.
fn ref_component(raw: &str) -> String {
    let mut slug = UNSAFE_REF_CHARS.replace_all(raw, "-").into_owned();
    while slug.contains("..") {
        slug = slug.replace("..", ".");
    }
    let mut slug = slug.trim_matches(['.', '-']).to_string();
    if slug.ends_with(".lock") {
        slug.push_str("-x");
    }
    if slug.is_empty() {
        slug.push_str("build");
    }
    slug
}

struct StagedTree {
    parent_sha: String,
    tree_sha: String,
}

/// Publishes through an injected [`GitHost`], bounding every call.
pub struct GitPublisher {
    host: Arc<dyn GitHost>,
    author_name: String,
    author_email: String,
    call_timeout: Duration,
}

impl GitPublisher {
    pub fn new(
        host: Arc<dyn GitHost>,
        author_name: &str,
        author_email: &str,
        call_timeout: Duration,
    ) -> Self {
        Self {
            host,
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
            call_timeout,
        }
    }

    pub async fn publish(&self, request: &PublishRequest) -> Result<PublishReport, PublishError> {
        let started = Instant::now();
        let result = self.run(request).await;

        match &result {
            Ok(report) => {
                crate::metrics::publish_duration(started.elapsed().as_millis() as u64);
                tracing::info!(
                    branch = %report.branch,
                    commit = %report.commit_sha,
                    pull = report.pull_number,
                    "Publish complete"
                );
            }
            Err(e) => {
                crate::metrics::publish_failed(e.stage().as_str());
                tracing::error!(
                    branch = %request.scratch_branch,
                    stage = e.stage().as_str(),
                    "Publish failed: {e}"
                );
            }
        }
        result
    }

    async fn run(&self, request: &PublishRequest) -> Result<PublishReport, PublishError> {
        let branch = &request.scratch_branch;

        let git_ref = self.resolve_ref(&request.base_branch, branch).await?;
        tracing::info!(%branch, sha = %git_ref.sha, "Ref resolved");

        let staged = self.build_tree(&git_ref, &request.files).await?;
        tracing::info!(%branch, tree = %staged.tree_sha, "Tree built");

        let commit_sha = self
            .commit(&git_ref, &staged, &request.commit_message)
            .await?;
        tracing::info!(%branch, commit = %commit_sha, "Committed");

        let pull = self.open_pull(request).await?;
        tracing::info!(%branch, pull = pull.number, url = %pull.html_url, "PR created");

        self.call(self.host.merge_pull(pull.number, MERGE_COMMIT_MESSAGE))
            .await
            .map_err(|source| PublishError::PullRequestMerge {
                number: pull.number,
                source,
            })?;
        tracing::info!(%branch, pull = pull.number, "PR merged");

        self.call(self.host.delete_ref(branch))
            .await
            .map_err(|source| PublishError::BranchCleanup {
                branch: branch.clone(),
                source,
            })?;
        tracing::info!(%branch, "Branch deleted");

        Ok(PublishReport {
            branch: branch.clone(),
            commit_sha,
            pull_number: pull.number,
            pull_url: pull.html_url,
        })
    }

    /// Reuse `scratch` if it exists, otherwise branch it off `base`.
    async fn resolve_ref(&self, base: &str, scratch: &str) -> Result<GitRef, PublishError> {
        let resolve_err = |branch: &str| {
            let branch = branch.to_string();
            move |source: GitHostError| PublishError::ResolveRef { branch, source }
        };

        if let Some(existing) = self
            .call(self.host.get_ref(scratch))
            .await
            .map_err(resolve_err(scratch))?
        {
            tracing::warn!(
                branch = scratch,
                sha = %existing.sha,
                "Scratch branch already exists, reusing it"
            );
            return Ok(existing);
        }

        let base_ref = self
            .call(self.host.get_ref(base))
            .await
            .map_err(resolve_err(base))?
            .ok_or_else(|| PublishError::ResolveRef {
                branch: base.to_string(),
                source: GitHostError::NotFound(format!("branch {base}")),
            })?;

        self.call(self.host.create_ref(scratch, &base_ref.sha))
            .await
            .map_err(|source| match source {
                GitHostError::Conflict(message) => PublishError::ConcurrentUpdate {
                    stage: PublishStage::ResolveRef,
                    branch: scratch.to_string(),
                    message,
                },
                source => PublishError::ResolveRef {
                    branch: scratch.to_string(),
                    source,
                },
            })
    }

    async fn build_tree(
        &self,
        git_ref: &GitRef,
        files: &[FileSpec],
    ) -> Result<StagedTree, PublishError> {
        let tree_err = |source: GitHostError| PublishError::BuildTree {
            branch: git_ref.branch.clone(),
            source,
        };

        let parent = self
            .call(self.host.get_commit(&git_ref.sha))
            .await
            .map_err(tree_err)?;

        let mut entries = Vec::with_capacity(files.len());
        for file in files {
            let content = tokio::fs::read(&file.local_path)
                .await
                .map_err(|source| PublishError::ReadFile {
                    path: file.local_path.clone(),
                    source,
                })?;
            // Blobs go up base64-encoded, so binary content survives intact.
            let blob_sha = self
                .call(self.host.create_blob(&content))
                .await
                .map_err(tree_err)?;
            entries.push(TreeEntry {
                path: file.repo_path.clone(),
                mode: FILE_MODE.to_string(),
                blob_sha,
            });
        }

        let tree_sha = self
            .call(self.host.create_tree(&parent.tree_sha, &entries))
            .await
            .map_err(tree_err)?;

        Ok(StagedTree {
            parent_sha: parent.sha,
            tree_sha,
        })
    }

    async fn commit(
        &self,
        git_ref: &GitRef,
        staged: &StagedTree,
        message: &str,
    ) -> Result<String, PublishError> {
        let new_commit = NewCommit {
            message: message.to_string(),
            tree_sha: staged.tree_sha.clone(),
            parents: vec![staged.parent_sha.clone()],
            author: CommitAuthor {
                name: self.author_name.clone(),
                email: self.author_email.clone(),
                date: Utc::now(),
            },
        };

        let commit_sha = self
            .call(self.host.create_commit(&new_commit))
            .await
            .map_err(|source| PublishError::Commit {
                branch: git_ref.branch.clone(),
                source,
            })?;

        self.call(
            self.host
                .update_ref(&git_ref.branch, &git_ref.sha, &commit_sha),
        )
        .await
        .map_err(|source| match source {
            GitHostError::Conflict(message) => PublishError::ConcurrentUpdate {
                stage: PublishStage::Commit,
                branch: git_ref.branch.clone(),
                message,
            },
            source => PublishError::Commit {
                branch: git_ref.branch.clone(),
                source,
            },
        })?;

        Ok(commit_sha)
    }

    async fn open_pull(&self, request: &PublishRequest) -> Result<PullRequest, PublishError> {
        let pull = NewPullRequest {
            title: request.pr_title.clone(),
            body: request.pr_body.clone(),
            head: request.scratch_branch.clone(),
            base: request.base_branch.clone(),
        };

        self.call(self.host.create_pull(&pull))
            .await
            .map_err(|source| PublishError::PullRequestOpen {
                head: pull.head.clone(),
                base: pull.base.clone(),
                source,
            })
    }

    async fn call<T, F>(&self, call: F) -> Result<T, GitHostError>
    where
        F: Future<Output = Result<T, GitHostError>>,
    {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .unwrap_or_else(|_| Err(GitHostError::Timeout(self.call_timeout)))
    }
}
