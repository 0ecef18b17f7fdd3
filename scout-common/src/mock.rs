//! In-memory [`HostApi`] implementation for tests.
//!
//! Remote state is seeded through the `add_*` methods; failures are
//! scripted per endpoint with [`MockHost::fail_next`]. Every call is
//! counted so tests can assert exactly how many remote round-trips an
//! operation cost.

use crate::api::{
    BranchInfo, CommitRef, CommitStatusUpdate, HookInfo, HookRequest, HostApi, MergeRequestInfo,
    ProjectInfo, TagInfo,
};
use crate::error::RemoteError;
use chrono::DateTime;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

#[derive(Default)]
struct MockState {
    projects: Vec<ProjectInfo>,
    branches: HashMap<String, Vec<BranchInfo>>,
    tags: HashMap<String, Vec<TagInfo>>,
    merge_requests: HashMap<String, Vec<MergeRequestInfo>>,
    files: HashSet<(String, String)>,
    hooks: HashMap<String, Vec<HookInfo>>,
    system_hooks: Vec<HookInfo>,
    statuses: Vec<(String, String, CommitStatusUpdate)>,
    calls: HashMap<String, u32>,
    failures: HashMap<String, VecDeque<RemoteError>>,
    next_hook_id: u64,
}

/// Scriptable in-memory remote host.
#[derive(Default)]
pub struct MockHost {
    state: Mutex<MockState>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_project(&self, project: ProjectInfo) {
        self.state.lock().unwrap().projects.push(project);
    }

    /// Seed a plain, non-mirror project.
    pub fn add_simple_project(&self, id: u64, path: &str) {
        self.add_project(ProjectInfo {
            id,
            path_with_namespace: path.to_string(),
            default_branch: Some("main".into()),
            forked_from_project: None,
            mirror: false,
        });
    }

    pub fn add_branch(&self, project: &str, name: &str, sha: &str) {
        self.state
            .lock()
            .unwrap()
            .branches
            .entry(project.to_string())
            .or_default()
            .push(BranchInfo {
                name: name.to_string(),
                commit: CommitRef {
                    id: sha.to_string(),
                    committed_date: None,
                },
                default: name == "main",
            });
    }

    pub fn add_tag(&self, project: &str, name: &str, sha: &str, timestamp_millis: i64) {
        self.state
            .lock()
            .unwrap()
            .tags
            .entry(project.to_string())
            .or_default()
            .push(TagInfo {
                name: name.to_string(),
                commit: CommitRef {
                    id: sha.to_string(),
                    committed_date: DateTime::from_timestamp_millis(timestamp_millis)
                        .filter(|_| timestamp_millis != 0),
                },
            });
    }

    pub fn add_merge_request(&self, project: &str, mr: MergeRequestInfo) {
        self.state
            .lock()
            .unwrap()
            .merge_requests
            .entry(project.to_string())
            .or_default()
            .push(mr);
    }

    pub fn add_file(&self, project: &str, path: &str) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert((project.to_string(), path.to_string()));
    }

    /// Queue `times` failures for `method` before it succeeds again.
    pub fn fail_next(&self, method: &str, error: RemoteError, times: u32) {
        let mut state = self.state.lock().unwrap();
        let queue = state.failures.entry(method.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    /// How many times `method` was invoked.
    pub fn calls(&self, method: &str) -> u32 {
        *self
            .state
            .lock()
            .unwrap()
            .calls
            .get(method)
            .unwrap_or(&0)
    }

    /// All published statuses, in publication order.
    pub fn published_statuses(&self) -> Vec<(String, String, CommitStatusUpdate)> {
        self.state.lock().unwrap().statuses.clone()
    }

    pub fn project_hooks(&self, project: &str) -> Vec<HookInfo> {
        self.state
            .lock()
            .unwrap()
            .hooks
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    pub fn registered_system_hooks(&self) -> Vec<HookInfo> {
        self.state.lock().unwrap().system_hooks.clone()
    }

    fn enter(&self, method: &str) -> Result<std::sync::MutexGuard<'_, MockState>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(method.to_string()).or_insert(0) += 1;
        if let Some(err) = state
            .failures
            .get_mut(method)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        Ok(state)
    }
}

impl HostApi for MockHost {
    fn project(&self, project: &str) -> Result<ProjectInfo, RemoteError> {
        let state = self.enter("project")?;
        state
            .projects
            .iter()
            .find(|p| p.path_with_namespace == project)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, "project not found"))
    }

    fn project_by_id(&self, id: u64) -> Result<ProjectInfo, RemoteError> {
        let state = self.enter("project_by_id")?;
        state
            .projects
            .iter()
            .find(|p| p.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, "project not found"))
    }

    fn branches(&self, project: &str) -> Result<Vec<BranchInfo>, RemoteError> {
        let state = self.enter("branches")?;
        Ok(state.branches.get(project).cloned().unwrap_or_default())
    }

    fn branch(&self, project: &str, name: &str) -> Result<BranchInfo, RemoteError> {
        let state = self.enter("branch")?;
        state
            .branches
            .get(project)
            .and_then(|list| list.iter().find(|b| b.name == name))
            .cloned()
            .ok_or_else(|| RemoteError::from_status(404, "branch not found"))
    }

    fn tags(&self, project: &str) -> Result<Vec<TagInfo>, RemoteError> {
        let state = self.enter("tags")?;
        Ok(state.tags.get(project).cloned().unwrap_or_default())
    }

    fn open_merge_requests(&self, project: &str) -> Result<Vec<MergeRequestInfo>, RemoteError> {
        let state = self.enter("open_merge_requests")?;
        Ok(state
            .merge_requests
            .get(project)
            .cloned()
            .unwrap_or_default())
    }

    fn file_exists(&self, project: &str, path: &str, _ref_name: &str) -> Result<bool, RemoteError> {
        let state = self.enter("file_exists")?;
        Ok(state
            .files
            .contains(&(project.to_string(), path.to_string())))
    }

    fn hooks(&self, project: &str) -> Result<Vec<HookInfo>, RemoteError> {
        let state = self.enter("hooks")?;
        Ok(state.hooks.get(project).cloned().unwrap_or_default())
    }

    fn add_hook(&self, project: &str, hook: &HookRequest) -> Result<HookInfo, RemoteError> {
        let mut state = self.enter("add_hook")?;
        state.next_hook_id += 1;
        let info = HookInfo {
            id: state.next_hook_id,
            url: hook.url.clone(),
            token: hook.token.clone(),
        };
        state
            .hooks
            .entry(project.to_string())
            .or_default()
            .push(info.clone());
        Ok(info)
    }

    fn update_hook(
        &self,
        project: &str,
        hook_id: u64,
        hook: &HookRequest,
    ) -> Result<HookInfo, RemoteError> {
        let mut state = self.enter("update_hook")?;
        let existing = state
            .hooks
            .get_mut(project)
            .and_then(|list| list.iter_mut().find(|h| h.id == hook_id))
            .ok_or_else(|| RemoteError::from_status(404, "hook not found"))?;
        existing.url = hook.url.clone();
        existing.token = hook.token.clone();
        Ok(existing.clone())
    }

    fn system_hooks(&self) -> Result<Vec<HookInfo>, RemoteError> {
        let state = self.enter("system_hooks")?;
        Ok(state.system_hooks.clone())
    }

    fn add_system_hook(&self, url: &str) -> Result<HookInfo, RemoteError> {
        let mut state = self.enter("add_system_hook")?;
        state.next_hook_id += 1;
        let info = HookInfo {
            id: state.next_hook_id,
            url: url.to_string(),
            token: None,
        };
        state.system_hooks.push(info.clone());
        Ok(info)
    }

    fn publish_status(
        &self,
        project: &str,
        sha: &str,
        status: &CommitStatusUpdate,
    ) -> Result<(), RemoteError> {
        let mut state = self.enter("publish_status")?;
        state
            .statuses
            .push((project.to_string(), sha.to_string(), status.clone()));
        Ok(())
    }
}
