//! One discovery pass over a project.
//!
//! A [`DiscoveryRequest`] is created from a finalized
//! [`DiscoveryContext`](crate::context::DiscoveryContext) and executes the
//! pass in a fixed order: branches, then change requests, then tags. Raw
//! listings are fetched at most once per request; every candidate runs
//! through prefilters, the build criteria probe, filters, and the trust
//! authorities before being emitted to the caller's observer.
//!
//! Observers can stop the pass early. Scoped requests (refreshing a single
//! named head) terminate as soon as every requested name has been
//! processed, so a webhook-driven refresh never pays for a full scan.

use crate::api::{BranchInfo, HostApi, MergeRequestInfo, TagInfo};
use crate::context::{DiscoveryContext, SourceProbe, Trust};
use crate::error::{DiscoveryError, RemoteError};
use crate::model::{
    BranchHead, BranchRevision, ChangeRequestRevision, ChangeRequestSummary, Head, Revision,
    TagHead, TagRevision,
};
use crate::retry::RetryingClient;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What the observer wants the pass to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverSignal {
    Continue,
    /// The observer has located everything it was scoped to find.
    Done,
}

/// Receives each accepted `(head, revision)` pair.
pub trait HeadObserver {
    fn observe(&mut self, head: Head, revision: Revision, trust: Trust) -> ObserverSignal;
}

/// Observer that collects everything, optionally stopping after a fixed
/// number of emissions.
#[derive(Default)]
pub struct Collector {
    pub emitted: Vec<(Head, Revision, Trust)>,
    pub stop_after: Option<usize>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<&str> {
        self.emitted.iter().map(|(h, _, _)| h.name()).collect()
    }
}

impl HeadObserver for Collector {
    fn observe(&mut self, head: Head, revision: Revision, trust: Trust) -> ObserverSignal {
        self.emitted.push((head, revision, trust));
        match self.stop_after {
            Some(limit) if self.emitted.len() >= limit => ObserverSignal::Done,
            _ => ObserverSignal::Continue,
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub emitted: usize,
    pub prefiltered: usize,
    pub filtered: usize,
    pub criteria_rejected: usize,
    pub early_exit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Done,
}

struct RequestProbe<'a> {
    head: &'a Head,
    revision: &'a Revision,
    host: &'a dyn HostApi,
    retry: &'a RetryingClient,
    /// Project the candidate's tree lives in (the fork for fork change
    /// requests).
    project: &'a str,
}

impl SourceProbe for RequestProbe<'_> {
    fn head(&self) -> &Head {
        self.head
    }

    fn revision(&self) -> &Revision {
        self.revision
    }

    fn file_exists(&self, path: &str) -> Result<bool, RemoteError> {
        let commit = self.revision.built_commit();
        self.retry
            .call("probe file", || self.host.file_exists(self.project, path, commit))
    }
}

/// One discovery pass, scoped to one project.
pub struct DiscoveryRequest {
    ctx: DiscoveryContext,
    host: Arc<dyn HostApi>,
    retry: RetryingClient,
    project: String,
    scope: Option<BTreeSet<String>>,
    branches: Option<Vec<BranchInfo>>,
    merge_requests: Option<Vec<MergeRequestInfo>>,
    tags: Option<Vec<TagInfo>>,
    closed: bool,
}

impl DiscoveryRequest {
    pub(crate) fn new(
        ctx: DiscoveryContext,
        host: Arc<dyn HostApi>,
        retry: RetryingClient,
        project: String,
    ) -> Self {
        Self {
            ctx,
            host,
            retry,
            project,
            scope: None,
            branches: None,
            merge_requests: None,
            tags: None,
            closed: false,
        }
    }

    /// Restrict the pass to the named heads. Candidates outside the scope
    /// are skipped before any per-candidate work, and the pass terminates
    /// once every named head has been processed.
    pub fn restricted_to<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scope = Some(names.into_iter().map(Into::into).collect());
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Execute the pass. Partial results already emitted to the observer
    /// stand even when the pass aborts with an error.
    pub fn run(&mut self, observer: &mut dyn HeadObserver) -> Result<DiscoveryStats, DiscoveryError> {
        if self.closed {
            return Err(DiscoveryError::Closed);
        }
        let mut stats = DiscoveryStats::default();
        let mut remaining = self.scope.clone();

        if self.discover_branches(observer, &mut stats, &mut remaining)? == Flow::Done
            || self.discover_change_requests(observer, &mut stats, &mut remaining)? == Flow::Done
            || self.discover_tags(observer, &mut stats, &mut remaining)? == Flow::Done
        {
            stats.early_exit = true;
        }
        Ok(stats)
    }

    /// Release the fetched listings. Further `run` calls fail.
    pub fn close(&mut self) {
        self.closed = true;
        self.branches = None;
        self.merge_requests = None;
        self.tags = None;
    }

    fn discover_branches(
        &mut self,
        observer: &mut dyn HeadObserver,
        stats: &mut DiscoveryStats,
        remaining: &mut Option<BTreeSet<String>>,
    ) -> Result<Flow, DiscoveryError> {
        if !self.ctx.want_branches {
            return Ok(Flow::Continue);
        }
        let branches = self.branch_list()?.to_vec();
        for branch in branches {
            if !scope_excludes(remaining, &branch.name) {
                let head = Head::Branch(BranchHead::new(&branch.name));
                if self.prefiltered(&head) {
                    stats.prefiltered += 1;
                } else {
                    // The listing already pins the tip, so resolving the
                    // revision costs nothing extra here.
                    let revision = Revision::Branch(BranchRevision::new(
                        BranchHead::new(&branch.name),
                        &branch.commit.id,
                    ));
                    if self.offer(head, revision, None, observer, stats)? == Flow::Done {
                        return Ok(Flow::Done);
                    }
                }
            }
            if scope_mark(remaining, &branch.name) {
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Continue)
    }

    fn discover_change_requests(
        &mut self,
        observer: &mut dyn HeadObserver,
        stats: &mut DiscoveryStats,
        remaining: &mut Option<BTreeSet<String>>,
    ) -> Result<Flow, DiscoveryError> {
        if !self.ctx.want_origin_change_requests && !self.ctx.want_fork_change_requests {
            return Ok(Flow::Continue);
        }
        if self.ctx.origin_strategies.is_empty() && self.ctx.fork_strategies.is_empty() {
            return Ok(Flow::Continue);
        }
        let project = self.project.clone();
        let project_info = self
            .retry
            .call("get project", || self.host.project(&project))?;
        if project_info.is_mirror() {
            debug!(project = %self.project, "mirror project, skipping change requests");
            return Ok(Flow::Continue);
        }

        let empty = BTreeSet::new();
        let merge_requests = self.merge_request_list()?.to_vec();
        for mr in merge_requests {
            let fork = mr.source_project_id != mr.target_project_id;
            let strategies = if fork {
                if self.ctx.want_fork_change_requests {
                    &self.ctx.fork_strategies
                } else {
                    &empty
                }
            } else if self.ctx.want_origin_change_requests {
                &self.ctx.origin_strategies
            } else {
                &empty
            };
            // Without strategies there is nothing to build; skip before any
            // per-item detail is fetched.
            if strategies.is_empty() {
                continue;
            }

            let source_path = if fork {
                match self
                    .retry
                    .call("get source project", || self.host.project_by_id(mr.source_project_id))
                {
                    Ok(source) => source.path_with_namespace,
                    Err(err @ RemoteError::Rejected { .. }) => {
                        warn!(iid = mr.iid, error = %err, "cannot resolve fork source project, skipping");
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            } else {
                project_info.path_with_namespace.clone()
            };

            let summary = ChangeRequestSummary {
                iid: mr.iid,
                title: mr.title.clone(),
                source_project_id: mr.source_project_id,
                target_project_id: mr.target_project_id,
                source_project_path: source_path.clone(),
                source_branch: mr.source_branch.clone(),
                target_branch: mr.target_branch.clone(),
            };

            // The base pin is shared by all strategies of this change
            // request and only resolved when a head survives the cheap
            // checks.
            let mut base_sha = mr.diff_refs.as_ref().map(|d| d.base_sha.clone());

            for cr_head in summary.heads(strategies) {
                let name = cr_head.display_name.clone();
                if !scope_excludes(remaining, &name) {
                    let head = Head::ChangeRequest(cr_head.clone());
                    if self.prefiltered(&head) {
                        stats.prefiltered += 1;
                    } else {
                        let base = match &base_sha {
                            Some(sha) => sha.clone(),
                            None => {
                                let project = self.project.clone();
                                let target = mr.target_branch.clone();
                                let tip = self
                                    .retry
                                    .call("get target branch", || self.host.branch(&project, &target))?
                                    .commit
                                    .id;
                                base_sha = Some(tip.clone());
                                tip
                            }
                        };
                        let revision = Revision::ChangeRequest(ChangeRequestRevision {
                            head: cr_head,
                            target: BranchRevision::new(
                                BranchHead::new(&mr.target_branch),
                                base,
                            ),
                            origin: BranchRevision::new(
                                BranchHead::new(&mr.source_branch),
                                &mr.sha,
                            ),
                        });
                        if self.offer(head, revision, Some(&source_path), observer, stats)?
                            == Flow::Done
                        {
                            return Ok(Flow::Done);
                        }
                    }
                }
                if scope_mark(remaining, &name) {
                    return Ok(Flow::Done);
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn discover_tags(
        &mut self,
        observer: &mut dyn HeadObserver,
        stats: &mut DiscoveryStats,
        remaining: &mut Option<BTreeSet<String>>,
    ) -> Result<Flow, DiscoveryError> {
        if !self.ctx.want_tags {
            return Ok(Flow::Continue);
        }
        let tags = self.tag_list()?.to_vec();
        for tag in tags {
            if !scope_excludes(remaining, &tag.name) {
                let tag_head = TagHead::new(&tag.name, tag.timestamp_millis());
                let head = Head::Tag(tag_head.clone());
                if self.prefiltered(&head) {
                    stats.prefiltered += 1;
                } else {
                    let revision = Revision::Tag(TagRevision {
                        head: tag_head,
                        commit: tag.commit.id.clone(),
                    });
                    if self.offer(head, revision, None, observer, stats)? == Flow::Done {
                        return Ok(Flow::Done);
                    }
                }
            }
            if scope_mark(remaining, &tag.name) {
                return Ok(Flow::Done);
            }
        }
        Ok(Flow::Continue)
    }

    /// Criteria, filters, trust, emit. Runs after the prefilter stage.
    fn offer(
        &self,
        head: Head,
        revision: Revision,
        probe_project: Option<&str>,
        observer: &mut dyn HeadObserver,
        stats: &mut DiscoveryStats,
    ) -> Result<Flow, DiscoveryError> {
        if !self.criteria_match(&head, &revision, probe_project.unwrap_or(&self.project))? {
            trace!(head = %head, "criteria did not match");
            stats.criteria_rejected += 1;
            return Ok(Flow::Continue);
        }
        if self.ctx.filters.iter().any(|filter| filter(&head)) {
            trace!(head = %head, "excluded by filter");
            stats.filtered += 1;
            return Ok(Flow::Continue);
        }
        let trust = self.ctx.evaluate_trust(&head);
        debug!(head = %head, revision = %revision, ?trust, "discovered");
        stats.emitted += 1;
        match observer.observe(head, revision, trust) {
            ObserverSignal::Done => Ok(Flow::Done),
            ObserverSignal::Continue => Ok(Flow::Continue),
        }
    }

    fn prefiltered(&self, head: &Head) -> bool {
        let skip = self.ctx.prefilters.iter().any(|prefilter| prefilter(head));
        if skip {
            trace!(head = %head, "rejected by prefilter");
        }
        skip
    }

    fn criteria_match(
        &self,
        head: &Head,
        revision: &Revision,
        probe_project: &str,
    ) -> Result<bool, DiscoveryError> {
        let Some(criteria) = &self.ctx.criteria else {
            return Ok(true);
        };
        let probe = RequestProbe {
            head,
            revision,
            host: self.host.as_ref(),
            retry: &self.retry,
            project: probe_project,
        };
        criteria(&probe).map_err(|source| DiscoveryError::Criteria {
            head: head.name().to_string(),
            source,
        })
    }

    fn branch_list(&mut self) -> Result<&[BranchInfo], DiscoveryError> {
        if self.branches.is_none() {
            let project = self.project.clone();
            let list = self
                .retry
                .call("list branches", || self.host.branches(&project))?;
            debug!(project = %self.project, count = list.len(), "fetched branch list");
            self.branches = Some(list);
        }
        Ok(self.branches.as_deref().unwrap_or_default())
    }

    fn merge_request_list(&mut self) -> Result<&[MergeRequestInfo], DiscoveryError> {
        if self.merge_requests.is_none() {
            let project = self.project.clone();
            let list = self
                .retry
                .call("list merge requests", || self.host.open_merge_requests(&project))?;
            debug!(project = %self.project, count = list.len(), "fetched open change requests");
            self.merge_requests = Some(list);
        }
        Ok(self.merge_requests.as_deref().unwrap_or_default())
    }

    fn tag_list(&mut self) -> Result<&[TagInfo], DiscoveryError> {
        if self.tags.is_none() {
            let project = self.project.clone();
            let list = self.retry.call("list tags", || self.host.tags(&project))?;
            debug!(project = %self.project, count = list.len(), "fetched tag list");
            self.tags = Some(list);
        }
        Ok(self.tags.as_deref().unwrap_or_default())
    }
}

fn scope_excludes(remaining: &Option<BTreeSet<String>>, name: &str) -> bool {
    remaining.as_ref().is_some_and(|scope| !scope.contains(name))
}

/// Mark a scoped name as processed; true when the scope is exhausted.
fn scope_mark(remaining: &mut Option<BTreeSet<String>>, name: &str) -> bool {
    match remaining {
        Some(scope) => {
            scope.remove(name);
            scope.is_empty()
        }
        None => false,
    }
}
