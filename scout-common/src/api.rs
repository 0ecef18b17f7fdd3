//! Remote code-hosting API surface.
//!
//! [`HostApi`] is the narrow interface the core calls through; every
//! implementation is accessed exclusively via
//! [`RetryingClient`](crate::retry::RetryingClient). The DTOs mirror a
//! GitLab-style REST shape but carry only the fields discovery, hook
//! registration, and status notification actually consume.

use crate::error::RemoteError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Parent project reference for forks/mirrors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForkParent {
    pub id: u64,
    pub path_with_namespace: String,
}

/// Project metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: u64,
    pub path_with_namespace: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub forked_from_project: Option<ForkParent>,
    #[serde(default)]
    pub mirror: bool,
}

impl ProjectInfo {
    /// A project that is itself a fork/mirror of another never gets its
    /// change requests discovered.
    pub fn is_mirror(&self) -> bool {
        self.mirror || self.forked_from_project.is_some()
    }
}

/// Commit reference embedded in branch and tag listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRef {
    pub id: String,
    #[serde(default)]
    pub committed_date: Option<DateTime<Utc>>,
}

/// One branch as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchInfo {
    pub name: String,
    pub commit: CommitRef,
    #[serde(default)]
    pub default: bool,
}

/// One tag as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    pub name: String,
    pub commit: CommitRef,
}

impl TagInfo {
    /// Commit timestamp in epoch millis; 0 when the host did not report one.
    pub fn timestamp_millis(&self) -> i64 {
        self.commit
            .committed_date
            .map(|d| d.timestamp_millis())
            .unwrap_or(0)
    }
}

/// The base/head sha pair pinning a change request's diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRefs {
    pub base_sha: String,
    pub head_sha: String,
}

/// One open change request as reported by the listing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRequestInfo {
    pub iid: u64,
    pub title: String,
    pub source_project_id: u64,
    pub target_project_id: u64,
    pub source_branch: String,
    pub target_branch: String,
    /// Head commit of the source branch.
    pub sha: String,
    #[serde(default)]
    pub diff_refs: Option<DiffRefs>,
}

/// One registered hook, project- or server-scoped.
///
/// `token` is the stored shared secret as the host reports it; hosts that
/// never echo the secret report `None`, which registration treats as
/// "unknown, rotate to be safe".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookInfo {
    pub id: u64,
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
}

/// Hook creation/update payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub push_events: bool,
    pub merge_requests_events: bool,
    pub tag_push_events: bool,
    pub note_events: bool,
}

impl HookRequest {
    /// The standard webhook subscription: push, merge-request, tag-push and
    /// note events.
    pub fn standard(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            push_events: true,
            merge_requests_events: true,
            tag_push_events: true,
            note_events: true,
        }
    }
}

/// Commit build state as the remote host models it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
}

/// One commit-status publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitStatusUpdate {
    pub state: CommitState,
    /// Stable status label, see [`NamingPolicy`](crate::notify::NamingPolicy).
    pub name: String,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub ref_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The remote code-hosting API, as narrow as the core needs it.
///
/// Implementations must be cheap to share across threads; the status
/// notifier calls them from background workers.
pub trait HostApi: Send + Sync {
    fn project(&self, project: &str) -> Result<ProjectInfo, RemoteError>;
    fn project_by_id(&self, id: u64) -> Result<ProjectInfo, RemoteError>;
    fn branches(&self, project: &str) -> Result<Vec<BranchInfo>, RemoteError>;
    fn branch(&self, project: &str, name: &str) -> Result<BranchInfo, RemoteError>;
    fn tags(&self, project: &str) -> Result<Vec<TagInfo>, RemoteError>;
    fn open_merge_requests(&self, project: &str) -> Result<Vec<MergeRequestInfo>, RemoteError>;
    /// Whether `path` exists in the tree at `ref_name`.
    fn file_exists(&self, project: &str, path: &str, ref_name: &str) -> Result<bool, RemoteError>;
    fn hooks(&self, project: &str) -> Result<Vec<HookInfo>, RemoteError>;
    fn add_hook(&self, project: &str, hook: &HookRequest) -> Result<HookInfo, RemoteError>;
    fn update_hook(
        &self,
        project: &str,
        hook_id: u64,
        hook: &HookRequest,
    ) -> Result<HookInfo, RemoteError>;
    fn system_hooks(&self) -> Result<Vec<HookInfo>, RemoteError>;
    fn add_system_hook(&self, url: &str) -> Result<HookInfo, RemoteError>;
    fn publish_status(
        &self,
        project: &str,
        sha: &str,
        status: &CommitStatusUpdate,
    ) -> Result<(), RemoteError>;
}
