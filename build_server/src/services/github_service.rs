//! GitHub integration: git data API (refs, blobs, trees, commits) and pull
//! requests against the tracking repository.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitHostError {
    /// The ref was moved by someone else, or already exists.
    #[error("conflicting update: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("GitHub API returned {status}: {message}")]
    Api { status: u16, message: String },
    #[error("GitHub request failed: {0}")]
    Transport(String),
    #[error("GitHub request timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitRef {
    pub branch: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub sha: String,
    pub tree_sha: String,
}

/// A regular file entry pointing at an uploaded blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    pub mode: String,
    pub blob_sha: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
    pub date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCommit {
    pub message: String,
    pub tree_sha: String,
    pub parents: Vec<String>,
    pub author: CommitAuthor,
}

#[derive(Debug, Clone)]
pub struct NewPullRequest {
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

/// The subset of a git hosting API the publisher needs.
#[async_trait]
pub trait GitHost: Send + Sync {
    /// `Ok(None)` when the branch does not exist.
    async fn get_ref(&self, branch: &str) -> Result<Option<GitRef>, GitHostError>;

    async fn create_ref(&self, branch: &str, sha: &str) -> Result<GitRef, GitHostError>;

    async fn get_commit(&self, sha: &str) -> Result<CommitInfo, GitHostError>;

    async fn create_blob(&self, content: &[u8]) -> Result<String, GitHostError>;

    async fn create_tree(
        &self,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String, GitHostError>;

    async fn create_commit(&self, commit: &NewCommit) -> Result<String, GitHostError>;

    /// Compare-and-swap: move `branch` from `expected` to `new_sha`, failing
    /// with [`GitHostError::Conflict`] if it no longer points at `expected`.
    async fn update_ref(
        &self,
        branch: &str,
        expected: &str,
        new_sha: &str,
    ) -> Result<(), GitHostError>;

    async fn create_pull(&self, pull: &NewPullRequest) -> Result<PullRequest, GitHostError>;

    async fn merge_pull(&self, number: u64, commit_message: &str) -> Result<(), GitHostError>;

    async fn delete_ref(&self, branch: &str) -> Result<(), GitHostError>;
}

/// REST client for one repository.
pub struct GithubClient {
    http: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient")
            .field("api_url", &self.api_url)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct RefResponse {
    object: ShaObject,
}

#[derive(Deserialize)]
struct ShaObject {
    sha: String,
}

#[derive(Deserialize)]
struct CommitResponse {
    sha: String,
    tree: ShaObject,
}

#[derive(Deserialize)]
struct PullResponse {
    number: u64,
    #[serde(default)]
    html_url: String,
}

impl GithubClient {
    pub fn new(
        api_url: &str,
        owner: &str,
        repo: &str,
        token: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("build-bot")
            .build()?;

        Ok(Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            token,
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}/{path}", self.api_url, self.owner, self.repo)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http
            .request(method, self.repo_url(path))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response, GitHostError> {
        let resp = request
            .send()
            .await
            .map_err(|e| GitHostError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let message = api_message(&text);
        tracing::warn!(status = status.as_u16(), %message, "GitHub API call failed");
        Err(match status {
            StatusCode::NOT_FOUND => GitHostError::NotFound(message),
            _ => GitHostError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn send_json<T: for<'de> Deserialize<'de>>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, GitHostError> {
        self.send(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| GitHostError::Transport(format!("invalid response body: {e}")))
    }
}

/// Pull `message` out of a GitHub error body, falling back to the raw text.
fn api_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}

/// GitHub answers 422 both for "Reference already exists" and for a
/// rejected non-fast-forward ref update.
fn unprocessable_as_conflict(err: GitHostError) -> GitHostError {
    match err {
        GitHostError::Api { status: 422, message } => GitHostError::Conflict(message),
        other => other,
    }
}

#[async_trait]
impl GitHost for GithubClient {
    async fn get_ref(&self, branch: &str) -> Result<Option<GitRef>, GitHostError> {
        let request = self.request(Method::GET, &format!("git/ref/heads/{branch}"));
        match self.send_json::<RefResponse>(request).await {
            Ok(r) => Ok(Some(GitRef {
                branch: branch.to_string(),
                sha: r.object.sha,
            })),
            Err(GitHostError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_ref(&self, branch: &str, sha: &str) -> Result<GitRef, GitHostError> {
        let body = serde_json::json!({
            "ref": format!("refs/heads/{branch}"),
            "sha": sha,
        });
        let created: RefResponse = self
            .send_json(self.request(Method::POST, "git/refs").json(&body))
            .await
            .map_err(unprocessable_as_conflict)?;

        Ok(GitRef {
            branch: branch.to_string(),
            sha: created.object.sha,
        })
    }

    async fn get_commit(&self, sha: &str) -> Result<CommitInfo, GitHostError> {
        let commit: CommitResponse = self
            .send_json(self.request(Method::GET, &format!("git/commits/{sha}")))
            .await?;

        Ok(CommitInfo {
            sha: commit.sha,
            tree_sha: commit.tree.sha,
        })
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String, GitHostError> {
        let body = serde_json::json!({
            "content": base64::engine::general_purpose::STANDARD.encode(content),
            "encoding": "base64",
        });
        let blob: ShaObject = self
            .send_json(self.request(Method::POST, "git/blobs").json(&body))
            .await?;
        Ok(blob.sha)
    }

    async fn create_tree(
        &self,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String, GitHostError> {
        let tree: Vec<serde_json::Value> = entries
            .iter()
            .map(|e| {
                serde_json::json!({
                    "path": e.path,
                    "mode": e.mode,
                    "type": "blob",
                    "sha": e.blob_sha,
                })
            })
            .collect();
        let body = serde_json::json!({ "base_tree": base_tree, "tree": tree });

        let created: ShaObject = self
            .send_json(self.request(Method::POST, "git/trees").json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn create_commit(&self, commit: &NewCommit) -> Result<String, GitHostError> {
        let body = serde_json::json!({
            "message": commit.message,
            "tree": commit.tree_sha,
            "parents": commit.parents,
            "author": commit.author,
        });
        let created: ShaObject = self
            .send_json(self.request(Method::POST, "git/commits").json(&body))
            .await?;
        Ok(created.sha)
    }

    async fn update_ref(
        &self,
        branch: &str,
        expected: &str,
        new_sha: &str,
    ) -> Result<(), GitHostError> {
        // GitHub has no conditional ref update; check first, then rely on the
        // fast-forward-only PATCH to reject anything that slipped in between.
        match self.get_ref(branch).await? {
            Some(current) if current.sha == expected => {}
            Some(current) => {
                return Err(GitHostError::Conflict(format!(
                    "refs/heads/{branch} is at {} instead of {expected}",
                    current.sha
                )))
            }
            None => {
                return Err(GitHostError::Conflict(format!(
                    "refs/heads/{branch} was deleted"
                )))
            }
        }

        let body = serde_json::json!({ "sha": new_sha, "force": false });
        self.send(
            self.request(Method::PATCH, &format!("git/refs/heads/{branch}"))
                .json(&body),
        )
        .await
        .map_err(unprocessable_as_conflict)?;
        Ok(())
    }

    async fn create_pull(&self, pull: &NewPullRequest) -> Result<PullRequest, GitHostError> {
        let body = serde_json::json!({
            "title": pull.title,
            "head": pull.head,
            "base": pull.base,
            "body": pull.body,
            "maintainer_can_modify": true,
        });
        let created: PullResponse = self
            .send_json(self.request(Method::POST, "pulls").json(&body))
            .await?;

        Ok(PullRequest {
            number: created.number,
            html_url: created.html_url,
        })
    }

    async fn merge_pull(&self, number: u64, commit_message: &str) -> Result<(), GitHostError> {
        let body = serde_json::json!({ "commit_message": commit_message });
        self.send(
            self.request(Method::PUT, &format!("pulls/{number}/merge"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn delete_ref(&self, branch: &str) -> Result<(), GitHostError> {
        self.send(self.request(Method::DELETE, &format!("git/refs/heads/{branch}")))
            .await?;
        Ok(())
    }
}
