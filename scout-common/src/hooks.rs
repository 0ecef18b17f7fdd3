//! Idempotent webhook and system-hook registration.
//!
//! `ensure_webhook` guarantees exactly one correctly configured hook per
//! project and target URL, across secret rotation. `ensure_system_hook` is
//! the server-wide analogue; it requires administrative credentials and has
//! no secret to rotate.

use crate::api::{HookRequest, HostApi};
use crate::context::WebhookMode;
use crate::error::RemoteError;
use crate::retry::RetryingClient;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What [`HookRegistrar::ensure_webhook`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// No hook with the target URL existed; one was created.
    Created,
    /// A hook existed but its stored secret differed; it was updated in
    /// place.
    Modified,
    /// A hook with the target URL and current secret already exists.
    AlreadyPresent,
}

/// Registers hooks against one server, with one set of credentials baked
/// into the host client.
pub struct HookRegistrar {
    host: Arc<dyn HostApi>,
    retry: RetryingClient,
}

impl HookRegistrar {
    pub fn new(host: Arc<dyn HostApi>, retry: RetryingClient) -> Self {
        Self { host, retry }
    }

    /// Ensure exactly one webhook for `target_url` exists on `project`,
    /// carrying `secret` and subscribed to push, merge-request, tag-push
    /// and note events.
    pub fn ensure_webhook(
        &self,
        project: &str,
        target_url: &str,
        secret: &str,
    ) -> Result<HookOutcome, RemoteError> {
        let hooks = self.retry.call("list hooks", || self.host.hooks(project))?;
        let existing = hooks.iter().find(|hook| hook.url == target_url);
        match existing {
            None => {
                let request = HookRequest::standard(target_url, Some(secret.to_string()));
                self.retry
                    .call("create hook", || self.host.add_hook(project, &request))?;
                info!(project, target_url, "registered webhook");
                Ok(HookOutcome::Created)
            }
            Some(hook) if hook.token.as_deref() != Some(secret) => {
                let request = HookRequest::standard(target_url, Some(secret.to_string()));
                let id = hook.id;
                self.retry
                    .call("update hook", || self.host.update_hook(project, id, &request))?;
                info!(project, target_url, "rotated webhook secret");
                Ok(HookOutcome::Modified)
            }
            Some(_) => {
                debug!(project, target_url, "webhook already present");
                Ok(HookOutcome::AlreadyPresent)
            }
        }
    }

    /// Ensure a server-wide system hook for `target_url` exists. System
    /// hooks carry no rotating secret, so an existing hook is never
    /// updated.
    pub fn ensure_system_hook(&self, target_url: &str) -> Result<HookOutcome, RemoteError> {
        let hooks = self.retry.call("list system hooks", || self.host.system_hooks())?;
        if hooks.iter().any(|hook| hook.url == target_url) {
            debug!(target_url, "system hook already present");
            return Ok(HookOutcome::AlreadyPresent);
        }
        self.retry
            .call("create system hook", || self.host.add_system_hook(target_url))?;
        info!(target_url, "registered system hook");
        Ok(HookOutcome::Created)
    }
}

/// Mode-driven registration entry point for lifecycle callbacks.
///
/// Never raises: a missing registrar (credentials could not be resolved) or
/// a remote failure is logged and swallowed, because hook registration is
/// best-effort from the caller's point of view.
pub fn register_for_mode(
    mode: WebhookMode,
    server_allows_managed_hooks: bool,
    registrar: Option<&HookRegistrar>,
    project: &str,
    target_url: &str,
    secret: &str,
) -> Option<HookOutcome> {
    let registrar = match (mode, registrar) {
        (WebhookMode::Disabled, _) => return None,
        (_, None) => {
            warn!(project, ?mode, "no usable credentials, skipping hook registration");
            return None;
        }
        (_, Some(registrar)) => registrar,
    };

    let result = match mode {
        WebhookMode::Disabled => unreachable!("handled above"),
        WebhookMode::SystemManaged => {
            if !server_allows_managed_hooks {
                debug!(project, "server does not allow managed hooks");
                return None;
            }
            registrar.ensure_system_hook(target_url)
        }
        WebhookMode::ItemManaged => registrar.ensure_webhook(project, target_url, secret),
    };

    match result {
        Ok(outcome) => Some(outcome),
        Err(err) => {
            warn!(project, error = %err, "hook registration failed");
            None
        }
    }
}
