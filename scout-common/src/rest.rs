//! GitLab-style REST implementation of [`HostApi`] over `ureq`.
//!
//! HTTP statuses are mapped onto [`RemoteError`] here and nowhere else;
//! retry classification happens in [`crate::retry`], purely on the mapped
//! error. All listing endpoints paginate with `per_page`/`page`.

use crate::api::{
    BranchInfo, CommitStatusUpdate, HookInfo, HookRequest, HostApi, MergeRequestInfo, ProjectInfo,
    TagInfo,
};
use crate::error::RemoteError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use ureq::Agent;

const PER_PAGE: usize = 100;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Percent-encode one path component (project paths contain `/`, branch
/// names may contain anything).
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// ureq-backed host client authenticated with a private token.
pub struct RestHost {
    agent: Agent,
    base_url: String,
    token: Option<String>,
}

impl RestHost {
    /// `base_url` is the server root, e.g. `https://gitlab.example.com`.
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        let config = Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(DEFAULT_TIMEOUT))
            .build();
        Self {
            agent: Agent::new_with_config(config),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v4/{}", self.base_url, path)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let url = self.url(path);
        debug!(%url, "GET");
        let mut req = self.agent.get(&url);
        if let Some(token) = &self.token {
            req = req.header("PRIVATE-TOKEN", token);
        }
        let mut resp = req
            .call()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.body_mut().read_to_string().unwrap_or_default();
            return Err(RemoteError::from_status(status, body));
        }
        resp.body_mut()
            .read_json::<T>()
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }

    /// GET all pages of a listing endpoint. `path` must not already carry a
    /// query string.
    fn get_paged<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, RemoteError> {
        self.get_paged_with_query(path, "")
    }

    fn get_paged_with_query<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &str,
    ) -> Result<Vec<T>, RemoteError> {
        let mut items = Vec::new();
        let mut page = 1usize;
        loop {
            let sep = if query.is_empty() { "" } else { "&" };
            let paged = format!("{path}?per_page={PER_PAGE}&page={page}{sep}{query}");
            let batch: Vec<T> = self.get_json(&paged)?;
            let last = batch.len() < PER_PAGE;
            items.extend(batch);
            if last {
                return Ok(items);
            }
            page += 1;
        }
    }

    fn send_json<B: Serialize, T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: &B,
    ) -> Result<T, RemoteError> {
        let url = self.url(path);
        debug!(%url, method, "send");
        let mut req = match method {
            "PUT" => self.agent.put(&url),
            _ => self.agent.post(&url),
        };
        if let Some(token) = &self.token {
            req = req.header("PRIVATE-TOKEN", token);
        }
        let mut resp = req
            .send_json(body)
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let text = resp.body_mut().read_to_string().unwrap_or_default();
            return Err(RemoteError::from_status(status, text));
        }
        resp.body_mut()
            .read_json::<T>()
            .map_err(|e| RemoteError::Transport(e.to_string()))
    }
}

impl HostApi for RestHost {
    fn project(&self, project: &str) -> Result<ProjectInfo, RemoteError> {
        self.get_json(&format!("projects/{}", encode_component(project)))
    }

    fn project_by_id(&self, id: u64) -> Result<ProjectInfo, RemoteError> {
        self.get_json(&format!("projects/{id}"))
    }

    fn branches(&self, project: &str) -> Result<Vec<BranchInfo>, RemoteError> {
        self.get_paged(&format!(
            "projects/{}/repository/branches",
            encode_component(project)
        ))
    }

    fn branch(&self, project: &str, name: &str) -> Result<BranchInfo, RemoteError> {
        self.get_json(&format!(
            "projects/{}/repository/branches/{}",
            encode_component(project),
            encode_component(name)
        ))
    }

    fn tags(&self, project: &str) -> Result<Vec<TagInfo>, RemoteError> {
        self.get_paged(&format!(
            "projects/{}/repository/tags",
            encode_component(project)
        ))
    }

    fn open_merge_requests(&self, project: &str) -> Result<Vec<MergeRequestInfo>, RemoteError> {
        self.get_paged_with_query(
            &format!("projects/{}/merge_requests", encode_component(project)),
            "state=opened",
        )
    }

    fn file_exists(&self, project: &str, path: &str, ref_name: &str) -> Result<bool, RemoteError> {
        let url = self.url(&format!(
            "projects/{}/repository/files/{}?ref={}",
            encode_component(project),
            encode_component(path),
            encode_component(ref_name)
        ));
        let mut req = self.agent.head(&url);
        if let Some(token) = &self.token {
            req = req.header("PRIVATE-TOKEN", token);
        }
        let resp = req
            .call()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        match resp.status().as_u16() {
            status if (200..300).contains(&status) => Ok(true),
            404 => Ok(false),
            status => Err(RemoteError::from_status(status, "file lookup failed")),
        }
    }

    fn hooks(&self, project: &str) -> Result<Vec<HookInfo>, RemoteError> {
        self.get_paged(&format!("projects/{}/hooks", encode_component(project)))
    }

    fn add_hook(&self, project: &str, hook: &HookRequest) -> Result<HookInfo, RemoteError> {
        self.send_json(
            "POST",
            &format!("projects/{}/hooks", encode_component(project)),
            hook,
        )
    }

    fn update_hook(
        &self,
        project: &str,
        hook_id: u64,
        hook: &HookRequest,
    ) -> Result<HookInfo, RemoteError> {
        self.send_json(
            "PUT",
            &format!("projects/{}/hooks/{hook_id}", encode_component(project)),
            hook,
        )
    }

    fn system_hooks(&self) -> Result<Vec<HookInfo>, RemoteError> {
        self.get_paged("hooks")
    }

    fn add_system_hook(&self, url: &str) -> Result<HookInfo, RemoteError> {
        self.send_json("POST", "hooks", &serde_json::json!({ "url": url }))
    }

    fn publish_status(
        &self,
        project: &str,
        sha: &str,
        status: &CommitStatusUpdate,
    ) -> Result<(), RemoteError> {
        let _: serde_json::Value = self.send_json(
            "POST",
            &format!(
                "projects/{}/statuses/{}",
                encode_component(project),
                encode_component(sha)
            ),
            status,
        )?;
        Ok(())
    }
}
