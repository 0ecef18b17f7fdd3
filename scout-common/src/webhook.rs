//! Inbound webhook event classification and payload parsing.
//!
//! Events arrive with an `X-Gitlab-Event` header naming the event kind and
//! a JSON body. Parsing turns the provider payload into the same model
//! types a discovery scan produces; change-request heads in particular are
//! assembled through [`ChangeRequestSummary::heads`], so an event-driven
//! head is byte-identical to a scan-driven one for the same remote state.

use crate::model::{BranchHead, ChangeRequestSummary, TagHead};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The all-zero object id the host sends for a deleted ref.
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// Prefixes stripped from the `ref` field of push payloads.
const BRANCH_REF_PREFIX: &str = "refs/heads/";
const TAG_REF_PREFIX: &str = "refs/tags/";

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("unsupported event header {0:?}")]
    UnsupportedEvent(String),
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("payload ref {0:?} is neither a branch nor a tag ref")]
    UnrecognizedRef(String),
    #[error("change request !{0} comes from a fork but carries no source project path")]
    MissingForkSource(u64),
}

/// Event kind, from the `X-Gitlab-Event` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Push,
    TagPush,
    MergeRequest,
    Note,
    /// Server-wide hook; the body carries an `event_name` discriminator.
    System,
}

impl EventKind {
    pub fn from_header(header: &str) -> Option<Self> {
        match header.trim() {
            "Push Hook" => Some(EventKind::Push),
            "Tag Push Hook" => Some(EventKind::TagPush),
            "Merge Request Hook" => Some(EventKind::MergeRequest),
            "Note Hook" => Some(EventKind::Note),
            "System Hook" => Some(EventKind::System),
            _ => None,
        }
    }
}

/// What a change-request event did, as far as discovery cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeRequestAction {
    Open,
    Update,
    Close,
    Reopen,
    Merge,
    Other,
}

impl ChangeRequestAction {
    fn from_payload(action: Option<&str>) -> Self {
        match action {
            Some("open") => ChangeRequestAction::Open,
            Some("update") => ChangeRequestAction::Update,
            Some("close") => ChangeRequestAction::Close,
            Some("reopen") => ChangeRequestAction::Reopen,
            Some("merge") => ChangeRequestAction::Merge,
            _ => ChangeRequestAction::Other,
        }
    }

    /// Whether the change request still exists as a buildable head after
    /// this action.
    pub fn leaves_head_open(self) -> bool {
        !matches!(self, ChangeRequestAction::Close | ChangeRequestAction::Merge)
    }
}

/// A parsed inbound event, reduced to the fields discovery acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookEvent {
    /// A branch moved, was created, or was deleted.
    BranchPush {
        project_path: String,
        head: BranchHead,
        /// `None` when the branch was deleted.
        commit: Option<String>,
    },
    /// A tag was created or deleted. The payload carries no commit
    /// timestamp, so the head's timestamp is unknown (0).
    TagPush {
        project_path: String,
        head: TagHead,
        commit: Option<String>,
    },
    /// A change request was opened, updated, closed, reopened or merged.
    ChangeRequest {
        /// Target project path; this is the project discovery scans.
        project_path: String,
        action: ChangeRequestAction,
        summary: ChangeRequestSummary,
        /// Head commit of the source branch at event time.
        commit: Option<String>,
    },
    /// A comment; carries the change request when the comment is on one.
    Note {
        project_path: String,
        summary: Option<ChangeRequestSummary>,
    },
}

impl HookEvent {
    pub fn project_path(&self) -> &str {
        match self {
            HookEvent::BranchPush { project_path, .. }
            | HookEvent::TagPush { project_path, .. }
            | HookEvent::ChangeRequest { project_path, .. }
            | HookEvent::Note { project_path, .. } => project_path,
        }
    }
}

#[derive(Deserialize)]
struct PayloadProject {
    path_with_namespace: String,
}

#[derive(Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    after: String,
    project: PayloadProject,
}

#[derive(Deserialize)]
struct PayloadCommitRef {
    id: String,
}

#[derive(Deserialize)]
struct PayloadSourceProject {
    path_with_namespace: Option<String>,
}

#[derive(Deserialize)]
struct MergeRequestAttributes {
    iid: u64,
    #[serde(default)]
    title: String,
    source_project_id: u64,
    target_project_id: u64,
    source_branch: String,
    target_branch: String,
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    last_commit: Option<PayloadCommitRef>,
    #[serde(default)]
    source: Option<PayloadSourceProject>,
}

#[derive(Deserialize)]
struct MergeRequestPayload {
    project: PayloadProject,
    object_attributes: MergeRequestAttributes,
}

#[derive(Deserialize)]
struct NotePayload {
    project: PayloadProject,
    #[serde(default)]
    merge_request: Option<MergeRequestAttributes>,
}

#[derive(Deserialize)]
struct SystemPayload {
    #[serde(default)]
    event_name: Option<String>,
    #[serde(default)]
    object_kind: Option<String>,
}

impl MergeRequestAttributes {
    /// Reduce the payload to the provider-independent summary.
    ///
    /// The target project path stands in for a missing source path only
    /// when the change request is not from a fork; a fork head built from
    /// the target path would never correlate with the scan-built head for
    /// the same remote state, so such a payload is rejected instead.
    fn into_summary(
        self,
        target_project_path: &str,
    ) -> Result<(ChangeRequestSummary, Option<String>), WebhookError> {
        let source_project_path = match self.source.and_then(|s| s.path_with_namespace) {
            Some(path) => path,
            None if self.source_project_id == self.target_project_id => {
                target_project_path.to_string()
            }
            None => return Err(WebhookError::MissingForkSource(self.iid)),
        };
        let commit = self.last_commit.map(|c| c.id);
        Ok((
            ChangeRequestSummary {
                iid: self.iid,
                title: self.title,
                source_project_id: self.source_project_id,
                target_project_id: self.target_project_id,
                source_project_path,
                source_branch: self.source_branch,
                target_branch: self.target_branch,
            },
            commit,
        ))
    }
}

/// Parse one event body according to its header-declared kind.
///
/// System-hook bodies reuse the project-hook shapes; the `event_name` or
/// `object_kind` discriminator selects which one applies.
pub fn parse_event(kind: EventKind, body: &str) -> Result<HookEvent, WebhookError> {
    match kind {
        EventKind::Push => parse_push(body, false),
        EventKind::TagPush => parse_push(body, true),
        EventKind::MergeRequest => parse_merge_request(body),
        EventKind::Note => parse_note(body),
        EventKind::System => {
            let probe: SystemPayload = serde_json::from_str(body)?;
            let discriminator = probe
                .event_name
                .or(probe.object_kind)
                .unwrap_or_default();
            match discriminator.as_str() {
                "push" => parse_push(body, false),
                "tag_push" => parse_push(body, true),
                "merge_request" => parse_merge_request(body),
                "note" => parse_note(body),
                other => Err(WebhookError::UnsupportedEvent(format!(
                    "system event {other:?}"
                ))),
            }
        }
    }
}

fn parse_push(body: &str, expect_tag: bool) -> Result<HookEvent, WebhookError> {
    let payload: PushPayload = serde_json::from_str(body)?;
    let commit = if payload.after == ZERO_SHA {
        None
    } else {
        Some(payload.after)
    };
    let project_path = payload.project.path_with_namespace;

    if let Some(name) = payload.ref_name.strip_prefix(TAG_REF_PREFIX) {
        return Ok(HookEvent::TagPush {
            project_path,
            head: TagHead::new(name, 0),
            commit,
        });
    }
    if expect_tag {
        return Err(WebhookError::UnrecognizedRef(payload.ref_name));
    }
    match payload.ref_name.strip_prefix(BRANCH_REF_PREFIX) {
        Some(name) => Ok(HookEvent::BranchPush {
            project_path,
            head: BranchHead::new(name),
            commit,
        }),
        None => Err(WebhookError::UnrecognizedRef(payload.ref_name)),
    }
}

fn parse_merge_request(body: &str) -> Result<HookEvent, WebhookError> {
    let payload: MergeRequestPayload = serde_json::from_str(body)?;
    let project_path = payload.project.path_with_namespace;
    let action = ChangeRequestAction::from_payload(payload.object_attributes.action.as_deref());
    let (summary, commit) = payload.object_attributes.into_summary(&project_path)?;
    Ok(HookEvent::ChangeRequest {
        project_path,
        action,
        summary,
        commit,
    })
}

fn parse_note(body: &str) -> Result<HookEvent, WebhookError> {
    let payload: NotePayload = serde_json::from_str(body)?;
    let project_path = payload.project.path_with_namespace;
    let summary = payload
        .merge_request
        .map(|attrs| attrs.into_summary(&project_path))
        .transpose()?
        .map(|(summary, _)| summary);
    Ok(HookEvent::Note {
        project_path,
        summary,
    })
}

/// Compare a presented hook token against the expected secret without
/// leaking the mismatch position through timing. Both sides are hashed so
/// the comparison runs over fixed-size digests, and the digests are folded
/// byte by byte without short-circuiting.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckoutStrategy;
    use std::collections::BTreeSet;

    const PUSH_BODY: &str = r#"{
        "object_kind": "push",
        "event_name": "push",
        "ref": "refs/heads/feature",
        "after": "95790bf891e76fee5e1747ab589903a6a1f80f22",
        "project": { "id": 11, "path_with_namespace": "group/project" }
    }"#;

    const MR_BODY: &str = r#"{
        "object_kind": "merge_request",
        "project": { "id": 11, "path_with_namespace": "group/project" },
        "object_attributes": {
            "iid": 7,
            "title": "Add feature",
            "action": "update",
            "source_project_id": 99,
            "target_project_id": 11,
            "source_branch": "feature",
            "target_branch": "main",
            "last_commit": { "id": "da1560886d4f094c3e6c9ef40349f7d38b5d27d7" },
            "source": { "path_with_namespace": "fork-owner/project" }
        }
    }"#;

    #[test]
    fn header_classification() {
        assert_eq!(EventKind::from_header("Push Hook"), Some(EventKind::Push));
        assert_eq!(
            EventKind::from_header("Tag Push Hook"),
            Some(EventKind::TagPush)
        );
        assert_eq!(
            EventKind::from_header("Merge Request Hook"),
            Some(EventKind::MergeRequest)
        );
        assert_eq!(EventKind::from_header("Note Hook"), Some(EventKind::Note));
        assert_eq!(EventKind::from_header("System Hook"), Some(EventKind::System));
        assert_eq!(EventKind::from_header("Pipeline Hook"), None);
    }

    #[test]
    fn branch_push_parses_ref_and_commit() {
        let event = parse_event(EventKind::Push, PUSH_BODY).unwrap();
        assert_eq!(
            event,
            HookEvent::BranchPush {
                project_path: "group/project".into(),
                head: BranchHead::new("feature"),
                commit: Some("95790bf891e76fee5e1747ab589903a6a1f80f22".into()),
            }
        );
    }

    #[test]
    fn zero_sha_means_deletion() {
        let body = PUSH_BODY.replace(
            "95790bf891e76fee5e1747ab589903a6a1f80f22",
            ZERO_SHA,
        );
        let event = parse_event(EventKind::Push, &body).unwrap();
        match event {
            HookEvent::BranchPush { commit, .. } => assert_eq!(commit, None),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn tag_push_yields_unknown_timestamp() {
        let body = PUSH_BODY.replace("refs/heads/feature", "refs/tags/v1.0");
        let event = parse_event(EventKind::TagPush, &body).unwrap();
        match event {
            HookEvent::TagPush { head, commit, .. } => {
                assert_eq!(head, TagHead::new("v1.0", 0));
                assert!(commit.is_some());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn tag_header_with_branch_ref_is_rejected() {
        let err = parse_event(EventKind::TagPush, PUSH_BODY).unwrap_err();
        assert!(matches!(err, WebhookError::UnrecognizedRef(_)));
    }

    #[test]
    fn merge_request_event_carries_full_summary() {
        let event = parse_event(EventKind::MergeRequest, MR_BODY).unwrap();
        match event {
            HookEvent::ChangeRequest {
                project_path,
                action,
                summary,
                commit,
            } => {
                assert_eq!(project_path, "group/project");
                assert_eq!(action, ChangeRequestAction::Update);
                assert_eq!(summary.iid, 7);
                assert!(summary.is_fork());
                assert_eq!(summary.source_project_path, "fork-owner/project");
                assert_eq!(
                    commit.as_deref(),
                    Some("da1560886d4f094c3e6c9ef40349f7d38b5d27d7")
                );
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    /// The event path and the scan path must assemble identical heads for
    /// the same remote state.
    #[test]
    fn event_heads_match_scan_heads_exactly() {
        let event = parse_event(EventKind::MergeRequest, MR_BODY).unwrap();
        let event_summary = match event {
            HookEvent::ChangeRequest { summary, .. } => summary,
            other => panic!("unexpected event {other:?}"),
        };

        // The same change request as a scan over the remote listing sees it.
        let scan_summary = ChangeRequestSummary {
            iid: 7,
            title: "Add feature".into(),
            source_project_id: 99,
            target_project_id: 11,
            source_project_path: "fork-owner/project".into(),
            source_branch: "feature".into(),
            target_branch: "main".into(),
        };

        let strategies: BTreeSet<_> =
            [CheckoutStrategy::Merge, CheckoutStrategy::Head].into();
        assert_eq!(
            event_summary.heads(&strategies),
            scan_summary.heads(&strategies)
        );
    }

    /// A fork payload without a source project path cannot yield a head
    /// that correlates with the scan-built one, so it must be rejected at
    /// the boundary rather than silently fall back to the target path.
    #[test]
    fn fork_event_without_source_path_is_rejected() {
        let body = MR_BODY.replace(
            r#""source": { "path_with_namespace": "fork-owner/project" }"#,
            r#""source": { "path_with_namespace": null }"#,
        );
        let err = parse_event(EventKind::MergeRequest, &body).unwrap_err();
        assert!(matches!(err, WebhookError::MissingForkSource(7)));
    }

    #[test]
    fn non_fork_event_without_source_path_falls_back_to_target() {
        let body = MR_BODY
            .replace(r#""source_project_id": 99,"#, r#""source_project_id": 11,"#)
            .replace(
                r#""source": { "path_with_namespace": "fork-owner/project" }"#,
                r#""source": null"#,
            );
        let event = parse_event(EventKind::MergeRequest, &body).unwrap();
        match event {
            HookEvent::ChangeRequest { summary, .. } => {
                assert!(!summary.is_fork());
                assert_eq!(summary.source_project_path, "group/project");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn note_event_extracts_change_request_when_present() {
        let body = r#"{
            "object_kind": "note",
            "project": { "id": 11, "path_with_namespace": "group/project" },
            "merge_request": {
                "iid": 7,
                "title": "Add feature",
                "source_project_id": 11,
                "target_project_id": 11,
                "source_branch": "feature",
                "target_branch": "main"
            }
        }"#;
        let event = parse_event(EventKind::Note, body).unwrap();
        match event {
            HookEvent::Note { summary, .. } => {
                let summary = summary.unwrap();
                assert_eq!(summary.iid, 7);
                assert!(!summary.is_fork());
                assert_eq!(summary.source_project_path, "group/project");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn system_hook_dispatches_on_event_name() {
        let event = parse_event(EventKind::System, PUSH_BODY).unwrap();
        assert!(matches!(event, HookEvent::BranchPush { .. }));

        let err = parse_event(EventKind::System, r#"{"event_name": "project_create"}"#)
            .unwrap_err();
        assert!(matches!(err, WebhookError::UnsupportedEvent(_)));
    }

    #[test]
    fn malformed_payload_is_an_error() {
        assert!(matches!(
            parse_event(EventKind::Push, "not json"),
            Err(WebhookError::Malformed(_))
        ));
    }

    #[test]
    fn token_comparison() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cret", "other"));
        assert!(!token_matches("", "s3cret"));
    }
}
