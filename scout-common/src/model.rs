//! Head and revision data model.
//!
//! A [`Head`] is a discoverable unit (branch, tag, or change request) named
//! uniquely within a project. A [`Revision`] pins a head to concrete commit
//! state at one instant; it is immutable once constructed and is what a
//! build is triggered from and labelled with.
//!
//! Heads are produced fresh on every discovery pass and never cached across
//! passes. The host correlates webhook events to previously discovered heads
//! by equality, so every code path that constructs a [`ChangeRequestHead`]
//! goes through [`ChangeRequestSummary::heads`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// How a change request is checked out for building.
///
/// Declaration order is the iteration order of strategy sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutStrategy {
    /// Build the change request merged onto its current target.
    Merge,
    /// Build the change request's own head commit as-is.
    Head,
}

impl CheckoutStrategy {
    /// Suffix appended to a change-request display name when more than one
    /// strategy is configured for the same change request.
    pub fn suffix(self) -> &'static str {
        match self {
            CheckoutStrategy::Merge => "merge",
            CheckoutStrategy::Head => "head",
        }
    }
}

impl fmt::Display for CheckoutStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Where a change request's source branch lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRequestOrigin {
    /// Source branch lives in the target project itself.
    Default,
    /// Source branch lives in a fork, identified by its full path.
    Fork { project_path: String },
}

/// A branch in the project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchHead {
    pub name: String,
}

impl BranchHead {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A tag in the project.
///
/// `timestamp_millis` is the tag's commit timestamp; 0 means the timestamp
/// has not been observed yet (e.g. a head built from a webhook payload).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagHead {
    pub name: String,
    pub timestamp_millis: i64,
}

impl TagHead {
    pub fn new(name: impl Into<String>, timestamp_millis: i64) -> Self {
        Self {
            name: name.into(),
            timestamp_millis,
        }
    }
}

/// An open change request, qualified by the checkout strategy it will be
/// built with.
///
/// `display_name` is unique per project: when more than one strategy is
/// configured for the same change-request id, the strategy suffix is folded
/// into the name to disambiguate (`MR-7-merge` vs `MR-7-head`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRequestHead {
    /// Numeric change-request id local to the project.
    pub local_id: u64,
    pub display_name: String,
    /// The branch this change request merges into.
    pub target: BranchHead,
    pub strategy: CheckoutStrategy,
    pub origin: ChangeRequestOrigin,
    /// Namespace segment of the source project path.
    pub origin_owner: String,
    pub origin_project_path: String,
    pub origin_branch: String,
    pub title: Option<String>,
}

/// A discoverable unit before any revision is pinned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Head {
    Branch(BranchHead),
    Tag(TagHead),
    ChangeRequest(ChangeRequestHead),
}

impl Head {
    /// The unique-within-project name of this head.
    pub fn name(&self) -> &str {
        match self {
            Head::Branch(b) => &b.name,
            Head::Tag(t) => &t.name,
            Head::ChangeRequest(cr) => &cr.display_name,
        }
    }
}

impl fmt::Display for Head {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A branch pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchRevision {
    pub head: BranchHead,
    pub commit: String,
}

impl BranchRevision {
    pub fn new(head: BranchHead, commit: impl Into<String>) -> Self {
        Self {
            head,
            commit: commit.into(),
        }
    }
}

/// A tag pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagRevision {
    pub head: TagHead,
    pub commit: String,
}

/// A change request pinned on both sides: `target` pins the base branch,
/// `origin` pins the source branch.
///
/// Build-trigger equivalence is defined by `origin` alone; see
/// [`Revision::equivalent`]. The merge-strategy string rendering, however,
/// intentionally includes both pins, because a merge build's input changes
/// whenever either side moves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeRequestRevision {
    pub head: ChangeRequestHead,
    pub target: BranchRevision,
    pub origin: BranchRevision,
}

/// A head pinned to concrete commit state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Revision {
    Branch(BranchRevision),
    Tag(TagRevision),
    ChangeRequest(ChangeRequestRevision),
}

impl Revision {
    /// The commit hash that will actually be built.
    ///
    /// For change requests this is the *origin* commit, never the target:
    /// commit status must land on the commit the remote host displays for
    /// the change request.
    pub fn built_commit(&self) -> &str {
        match self {
            Revision::Branch(b) => &b.commit,
            Revision::Tag(t) => &t.commit,
            Revision::ChangeRequest(cr) => &cr.origin.commit,
        }
    }

    /// The ref name reported alongside commit status: the origin branch for
    /// change requests, the tag name for tags, the branch name otherwise.
    pub fn ref_name(&self) -> &str {
        match self {
            Revision::Branch(b) => &b.head.name,
            Revision::Tag(t) => &t.head.name,
            Revision::ChangeRequest(cr) => &cr.origin.head.name,
        }
    }

    /// The head this revision pins.
    pub fn head(&self) -> Head {
        match self {
            Revision::Branch(b) => Head::Branch(b.head.clone()),
            Revision::Tag(t) => Head::Tag(t.head.clone()),
            Revision::ChangeRequest(cr) => Head::ChangeRequest(cr.head.clone()),
        }
    }

    /// Build-trigger equivalence.
    ///
    /// For change requests only the origin pin participates: a retarget
    /// without new commits must not force a rebuild. Other variants compare
    /// by full equality.
    pub fn equivalent(&self, other: &Revision) -> bool {
        match (self, other) {
            (Revision::ChangeRequest(a), Revision::ChangeRequest(b)) => a.origin == b.origin,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Branch(b) => f.write_str(&b.commit),
            Revision::Tag(t) => f.write_str(&t.commit),
            Revision::ChangeRequest(cr) => match cr.head.strategy {
                CheckoutStrategy::Merge => write!(f, "{}+{}", cr.origin.commit, cr.target.commit),
                CheckoutStrategy::Head => f.write_str(&cr.origin.commit),
            },
        }
    }
}

/// The provider-independent fields of an open change request, as seen by
/// both a full discovery scan and a webhook payload.
///
/// Both code paths must yield byte-identical [`ChangeRequestHead`] values
/// for the same remote state, so head assembly lives here and nowhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequestSummary {
    pub iid: u64,
    pub title: String,
    pub source_project_id: u64,
    pub target_project_id: u64,
    /// Full path of the source project (equal to the target project path
    /// when the change request does not come from a fork).
    pub source_project_path: String,
    pub source_branch: String,
    pub target_branch: String,
}

impl ChangeRequestSummary {
    /// Whether the source branch lives in a different project.
    pub fn is_fork(&self) -> bool {
        self.source_project_id != self.target_project_id
    }

    /// Display name for one strategy. The suffix appears only when more
    /// than one strategy is configured for this change request.
    pub fn display_name(&self, strategy: CheckoutStrategy, multiple: bool) -> String {
        if multiple {
            format!("MR-{}-{}", self.iid, strategy.suffix())
        } else {
            format!("MR-{}", self.iid)
        }
    }

    /// Assemble one head per requested strategy, in strategy order.
    pub fn heads(&self, strategies: &BTreeSet<CheckoutStrategy>) -> Vec<ChangeRequestHead> {
        let multiple = strategies.len() > 1;
        let origin = if self.is_fork() {
            ChangeRequestOrigin::Fork {
                project_path: self.source_project_path.clone(),
            }
        } else {
            ChangeRequestOrigin::Default
        };
        let origin_owner = self
            .source_project_path
            .split('/')
            .next()
            .unwrap_or_default()
            .to_string();
        let title = if self.title.is_empty() {
            None
        } else {
            Some(self.title.clone())
        };

        strategies
            .iter()
            .map(|&strategy| ChangeRequestHead {
                local_id: self.iid,
                display_name: self.display_name(strategy, multiple),
                target: BranchHead::new(&self.target_branch),
                strategy,
                origin: origin.clone(),
                origin_owner: origin_owner.clone(),
                origin_project_path: self.source_project_path.clone(),
                origin_branch: self.source_branch.clone(),
                title: title.clone(),
            })
            .collect()
    }
}
