//! In-memory stand-ins for the object store and the git host.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Barrier;

use crate::services::github_service::{
    CommitInfo, GitHost, GitHostError, GitRef, NewCommit, NewPullRequest, PullRequest, TreeEntry,
};
use crate::services::object_store::{ObjectStore, StoreError};

// ── Object store ──

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    fail_on_key: Option<String>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads and downloads of `key` fail with a backend error.
    pub fn failing_on(key: &str) -> Self {
        Self {
            fail_on_key: Some(key.to_string()),
            ..Self::default()
        }
    }

    pub fn insert(&self, bucket: &str, key: &str, content: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), content.to_vec());
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn keys_under(&self, bucket: &str, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    fn check(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
        if self.fail_on_key.as_deref() == Some(key) {
            return Err(StoreError::Backend {
                bucket: bucket.to_string(),
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, bucket: &str, key: &str, content: Vec<u8>) -> Result<(), StoreError> {
        self.check(bucket, key)?;
        self.objects
            .lock()
            .unwrap()
            .insert((bucket.to_string(), key.to_string()), content);
        Ok(())
    }

    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check(bucket, key)?;
        self.get(bucket, key).ok_or_else(|| StoreError::NotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

// ── Git host ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    GetRef,
    CreateTree,
    CreateCommit,
    CreatePull,
    MergePull,
    DeleteRef,
}

#[derive(Debug, Clone)]
pub struct FakeCommit {
    pub tree: String,
    pub parents: Vec<String>,
    pub message: String,
    pub author_name: String,
}

#[derive(Debug, Clone)]
pub struct FakePull {
    pub number: u64,
    pub title: String,
    pub body: String,
    pub head: String,
    pub base: String,
    pub merged: bool,
}

#[derive(Default)]
struct FakeRepo {
    refs: BTreeMap<String, String>,
    commits: HashMap<String, FakeCommit>,
    trees: HashMap<String, BTreeMap<String, Vec<u8>>>,
    blobs: HashMap<String, Vec<u8>>,
    pulls: Vec<FakePull>,
    calls: Vec<&'static str>,
    next_id: u64,
}

impl FakeRepo {
    fn id(&mut self, kind: &str) -> String {
        self.next_id += 1;
        format!("{kind}{:06}", self.next_id)
    }
}

/// A repository whose `master` starts with one commit holding `README.md`.
pub struct FakeGitHost {
    repo: Mutex<FakeRepo>,
    fail_at: Option<FailPoint>,
    commit_barrier: Option<Arc<Barrier>>,
}

impl FakeGitHost {
    pub fn new() -> Self {
        let mut repo = FakeRepo::default();
        let mut files = BTreeMap::new();
        files.insert("README.md".to_string(), b"builds\n".to_vec());
        repo.trees.insert("tree-root".to_string(), files);
        repo.commits.insert(
            "commit-root".to_string(),
            FakeCommit {
                tree: "tree-root".to_string(),
                parents: vec![],
                message: "initial".to_string(),
                author_name: "init".to_string(),
            },
        );
        repo.refs
            .insert("master".to_string(), "commit-root".to_string());

        Self {
            repo: Mutex::new(repo),
            fail_at: None,
            commit_barrier: None,
        }
    }

    pub fn failing_at(point: FailPoint) -> Self {
        Self {
            fail_at: Some(point),
            ..Self::new()
        }
    }

    /// Every `create_commit` waits on `barrier` before returning.
    pub fn with_commit_barrier(barrier: Arc<Barrier>) -> Self {
        Self {
            commit_barrier: Some(barrier),
            ..Self::new()
        }
    }

    pub fn branch_sha(&self, branch: &str) -> Option<String> {
        self.repo.lock().unwrap().refs.get(branch).cloned()
    }

    pub fn branches(&self) -> Vec<String> {
        self.repo.lock().unwrap().refs.keys().cloned().collect()
    }

    pub fn commit(&self, sha: &str) -> Option<FakeCommit> {
        self.repo.lock().unwrap().commits.get(sha).cloned()
    }

    /// Content of `path` in the tree of the commit `branch` points at.
    pub fn file_at(&self, branch: &str, path: &str) -> Option<Vec<u8>> {
        let repo = self.repo.lock().unwrap();
        let sha = repo.refs.get(branch)?;
        let tree = &repo.commits.get(sha)?.tree;
        repo.trees.get(tree)?.get(path).cloned()
    }

    pub fn pulls(&self) -> Vec<FakePull> {
        self.repo.lock().unwrap().pulls.clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.repo.lock().unwrap().calls.clone()
    }

    fn enter(&self, call: &'static str, point: Option<FailPoint>) -> Result<(), GitHostError> {
        self.repo.lock().unwrap().calls.push(call);
        if point.is_some() && point == self.fail_at {
            return Err(GitHostError::Api {
                status: 500,
                message: format!("injected {call} failure"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GitHost for FakeGitHost {
    async fn get_ref(&self, branch: &str) -> Result<Option<GitRef>, GitHostError> {
        self.enter("get_ref", Some(FailPoint::GetRef))?;
        Ok(self.branch_sha(branch).map(|sha| GitRef {
            branch: branch.to_string(),
            sha,
        }))
    }

    async fn create_ref(&self, branch: &str, sha: &str) -> Result<GitRef, GitHostError> {
        self.enter("create_ref", None)?;
        let mut repo = self.repo.lock().unwrap();
        if repo.refs.contains_key(branch) {
            return Err(GitHostError::Conflict("Reference already exists".to_string()));
        }
        repo.refs.insert(branch.to_string(), sha.to_string());
        Ok(GitRef {
            branch: branch.to_string(),
            sha: sha.to_string(),
        })
    }

    async fn get_commit(&self, sha: &str) -> Result<CommitInfo, GitHostError> {
        self.enter("get_commit", None)?;
        let repo = self.repo.lock().unwrap();
        let commit = repo
            .commits
            .get(sha)
            .ok_or_else(|| GitHostError::NotFound(format!("commit {sha}")))?;
        Ok(CommitInfo {
            sha: sha.to_string(),
            tree_sha: commit.tree.clone(),
        })
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String, GitHostError> {
        self.enter("create_blob", None)?;
        let mut repo = self.repo.lock().unwrap();
        let sha = repo.id("blob");
        repo.blobs.insert(sha.clone(), content.to_vec());
        Ok(sha)
    }

    async fn create_tree(
        &self,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> Result<String, GitHostError> {
        self.enter("create_tree", Some(FailPoint::CreateTree))?;
        let mut repo = self.repo.lock().unwrap();
        let mut files = repo
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| GitHostError::NotFound(format!("tree {base_tree}")))?;
        for entry in entries {
            let blob = repo
                .blobs
                .get(&entry.blob_sha)
                .cloned()
                .ok_or_else(|| GitHostError::NotFound(format!("blob {}", entry.blob_sha)))?;
            files.insert(entry.path.clone(), blob);
        }
        let sha = repo.id("tree");
        repo.trees.insert(sha.clone(), files);
        Ok(sha)
    }

    async fn create_commit(&self, commit: &NewCommit) -> Result<String, GitHostError> {
        self.enter("create_commit", Some(FailPoint::CreateCommit))?;
        let sha = {
            let mut repo = self.repo.lock().unwrap();
            if !repo.trees.contains_key(&commit.tree_sha) {
                return Err(GitHostError::NotFound(format!("tree {}", commit.tree_sha)));
            }
            let sha = repo.id("commit");
            repo.commits.insert(
                sha.clone(),
                FakeCommit {
                    tree: commit.tree_sha.clone(),
                    parents: commit.parents.clone(),
                    message: commit.message.clone(),
                    author_name: commit.author.name.clone(),
                },
            );
            sha
        };
        if let Some(barrier) = &self.commit_barrier {
            barrier.wait().await;
        }
        Ok(sha)
    }

    async fn update_ref(
        &self,
        branch: &str,
        expected: &str,
        new_sha: &str,
    ) -> Result<(), GitHostError> {
        self.enter("update_ref", None)?;
        let mut repo = self.repo.lock().unwrap();
        match repo.refs.get(branch) {
            Some(current) if current == expected => {
                repo.refs.insert(branch.to_string(), new_sha.to_string());
                Ok(())
            }
            Some(current) => Err(GitHostError::Conflict(format!(
                "refs/heads/{branch} is at {current} instead of {expected}"
            ))),
            None => Err(GitHostError::Conflict(format!(
                "refs/heads/{branch} was deleted"
            ))),
        }
    }

    async fn create_pull(&self, pull: &NewPullRequest) -> Result<PullRequest, GitHostError> {
        self.enter("create_pull", Some(FailPoint::CreatePull))?;
        let mut repo = self.repo.lock().unwrap();
        if !repo.refs.contains_key(&pull.head) {
            return Err(GitHostError::Api {
                status: 422,
                message: format!("head {} does not exist", pull.head),
            });
        }
        let number = repo.pulls.len() as u64 + 1;
        repo.pulls.push(FakePull {
            number,
            title: pull.title.clone(),
            body: pull.body.clone(),
            head: pull.head.clone(),
            base: pull.base.clone(),
            merged: false,
        });
        Ok(PullRequest {
            number,
            html_url: format!("https://github.test/pull/{number}"),
        })
    }

    async fn merge_pull(&self, number: u64, commit_message: &str) -> Result<(), GitHostError> {
        self.enter("merge_pull", Some(FailPoint::MergePull))?;
        let mut repo = self.repo.lock().unwrap();
        let pull = repo
            .pulls
            .iter()
            .find(|p| p.number == number && !p.merged)
            .cloned()
            .ok_or_else(|| GitHostError::NotFound(format!("open pull #{number}")))?;
        let head = repo
            .refs
            .get(&pull.head)
            .cloned()
            .ok_or_else(|| GitHostError::NotFound(format!("branch {}", pull.head)))?;
        let base = repo
            .refs
            .get(&pull.base)
            .cloned()
            .ok_or_else(|| GitHostError::NotFound(format!("branch {}", pull.base)))?;
        // Apply what the head changed since it branched onto the current base.
        let head_commit = repo.commits[&head].clone();
        let fork_files = head_commit
            .parents
            .first()
            .and_then(|p| repo.commits.get(p))
            .and_then(|c| repo.trees.get(&c.tree))
            .cloned()
            .unwrap_or_default();
        let mut files = repo.trees[&repo.commits[&base].tree].clone();
        for (path, content) in &repo.trees[&head_commit.tree] {
            if fork_files.get(path) != Some(content) {
                files.insert(path.clone(), content.clone());
            }
        }
        let tree = repo.id("tree");
        repo.trees.insert(tree.clone(), files);

        let merge = repo.id("commit");
        repo.commits.insert(
            merge.clone(),
            FakeCommit {
                tree,
                parents: vec![base, head],
                message: commit_message.to_string(),
                author_name: "merge".to_string(),
            },
        );
        repo.refs.insert(pull.base.clone(), merge);
        if let Some(p) = repo.pulls.iter_mut().find(|p| p.number == number) {
            p.merged = true;
        }
        Ok(())
    }

    async fn delete_ref(&self, branch: &str) -> Result<(), GitHostError> {
        self.enter("delete_ref", Some(FailPoint::DeleteRef))?;
        self.repo
            .lock()
            .unwrap()
            .refs
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| GitHostError::NotFound(format!("branch {branch}")))
    }
}
