//! Trait-driven discovery configuration.
//!
//! A [`DiscoveryContext`] is built once per discovery invocation from an
//! ordered list of [`DiscoveryTrait`]s. Each trait mutates exactly the
//! fields it understands; boolean fields are monotonic ORs (once set, no
//! later trait can unset them) and strategy sets are unions, so trait order
//! never matters for the flags.
//!
//! Filters, prefilters, criteria, and trust authorities are first-class
//! function values rather than an open subclassing surface.

use crate::error::RemoteError;
use crate::model::{CheckoutStrategy, Head, Revision};
use crate::notify::NamingPolicy;
use crate::request::DiscoveryRequest;
use crate::retry::RetryingClient;
use crate::api::HostApi;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Whether a discovered unit's changes may be built with elevated
/// permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    Trusted,
    Untrusted,
}

/// How hooks are registered for projects discovered through this context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WebhookMode {
    /// Never touch hooks.
    #[default]
    Disabled,
    /// One server-wide system hook, registered with administrative
    /// credentials. Additionally gated on the server's own
    /// allow-managed-hooks flag.
    SystemManaged,
    /// One webhook per project, registered with the item's own credentials.
    ItemManaged,
}

/// Excludes a head after criteria evaluation. `true` means drop.
pub type HeadFilter = Arc<dyn Fn(&Head) -> bool + Send + Sync>;

/// Rejects a head before any expensive work. `true` means skip.
pub type HeadPrefilter = Arc<dyn Fn(&Head) -> bool + Send + Sync>;

/// Decides the trust level of a head.
pub type TrustAuthority = Arc<dyn Fn(&Head) -> Trust + Send + Sync>;

/// Read-only view of one candidate offered to the build criteria.
pub trait SourceProbe {
    fn head(&self) -> &Head;
    fn revision(&self) -> &Revision;
    /// Whether `path` exists in the candidate's tree.
    fn file_exists(&self, path: &str) -> Result<bool, RemoteError>;
}

/// External predicate deciding whether a discovered unit should be built.
/// Absent criteria match everything.
pub type BuildCriteria = Arc<dyn Fn(&dyn SourceProbe) -> Result<bool, RemoteError> + Send + Sync>;

/// The canonical prefilter: drop tags older than a retention cutoff without
/// resolving their revisions. Tags with an unknown timestamp (0) are kept.
pub fn tag_retention_prefilter(cutoff_millis: i64) -> HeadPrefilter {
    Arc::new(move |head| {
        matches!(head, Head::Tag(tag)
            if tag.timestamp_millis != 0 && tag.timestamp_millis < cutoff_millis)
    })
}

/// Criteria requiring a marker file (e.g. a build config file) in the tree.
pub fn file_exists_criteria(path: impl Into<String>) -> BuildCriteria {
    let path = path.into();
    Arc::new(move |probe| probe.file_exists(&path))
}

/// A composable configuration unit. Pure: applying the same traits in any
/// order yields the same context.
pub enum DiscoveryTrait {
    Branches,
    Tags,
    OriginChangeRequests(BTreeSet<CheckoutStrategy>),
    ForkChangeRequests(BTreeSet<CheckoutStrategy>),
    Filter(HeadFilter),
    Prefilter(HeadPrefilter),
    TrustAuthority(TrustAuthority),
    Criteria(BuildCriteria),
    WebhookMode(WebhookMode),
    SuppressNotifications,
    StatusNaming(NamingPolicy),
}

impl DiscoveryTrait {
    fn apply(self, ctx: DiscoveryContext) -> DiscoveryContext {
        match self {
            DiscoveryTrait::Branches => ctx.want_branches(true),
            DiscoveryTrait::Tags => ctx.want_tags(true),
            DiscoveryTrait::OriginChangeRequests(set) => ctx
                .want_origin_change_requests(true)
                .with_origin_strategies(set),
            DiscoveryTrait::ForkChangeRequests(set) => ctx
                .want_fork_change_requests(true)
                .with_fork_strategies(set),
            DiscoveryTrait::Filter(f) => ctx.with_filter(f),
            DiscoveryTrait::Prefilter(p) => ctx.with_prefilter(p),
            DiscoveryTrait::TrustAuthority(a) => ctx.with_trust_authority(a),
            DiscoveryTrait::Criteria(c) => ctx.with_criteria(c),
            DiscoveryTrait::WebhookMode(mode) => ctx.webhook_mode(mode),
            DiscoveryTrait::SuppressNotifications => ctx.suppress_notifications(true),
            DiscoveryTrait::StatusNaming(policy) => ctx.status_naming(policy),
        }
    }
}

/// Accumulated fetch/filter/trust configuration for one discovery
/// invocation.
#[derive(Clone, Default)]
pub struct DiscoveryContext {
    pub(crate) want_branches: bool,
    pub(crate) want_tags: bool,
    pub(crate) want_origin_change_requests: bool,
    pub(crate) want_fork_change_requests: bool,
    pub(crate) origin_strategies: BTreeSet<CheckoutStrategy>,
    pub(crate) fork_strategies: BTreeSet<CheckoutStrategy>,
    pub(crate) filters: Vec<HeadFilter>,
    pub(crate) prefilters: Vec<HeadPrefilter>,
    pub(crate) trust_authorities: Vec<TrustAuthority>,
    pub(crate) criteria: Option<BuildCriteria>,
    pub(crate) webhook_mode: WebhookMode,
    pub(crate) suppress_notifications: bool,
    pub(crate) status_naming: NamingPolicy,
}

impl DiscoveryContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an ordered trait list into a context.
    pub fn from_traits(traits: impl IntoIterator<Item = DiscoveryTrait>) -> Self {
        traits
            .into_iter()
            .fold(Self::new(), |ctx, t| t.apply(ctx))
    }

    pub fn want_branches(mut self, flag: bool) -> Self {
        self.want_branches |= flag;
        self
    }

    pub fn want_tags(mut self, flag: bool) -> Self {
        self.want_tags |= flag;
        self
    }

    pub fn want_origin_change_requests(mut self, flag: bool) -> Self {
        self.want_origin_change_requests |= flag;
        self
    }

    pub fn want_fork_change_requests(mut self, flag: bool) -> Self {
        self.want_fork_change_requests |= flag;
        self
    }

    pub fn with_origin_strategies(mut self, set: BTreeSet<CheckoutStrategy>) -> Self {
        self.origin_strategies.extend(set);
        self
    }

    pub fn with_fork_strategies(mut self, set: BTreeSet<CheckoutStrategy>) -> Self {
        self.fork_strategies.extend(set);
        self
    }

    pub fn with_filter(mut self, filter: HeadFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_prefilter(mut self, prefilter: HeadPrefilter) -> Self {
        self.prefilters.push(prefilter);
        self
    }

    pub fn with_trust_authority(mut self, authority: TrustAuthority) -> Self {
        self.trust_authorities.push(authority);
        self
    }

    pub fn with_criteria(mut self, criteria: BuildCriteria) -> Self {
        self.criteria = Some(criteria);
        self
    }

    /// `Disabled` is the default and cannot override a managed mode set by
    /// an earlier trait; managed modes replace each other in trait order.
    pub fn webhook_mode(mut self, mode: WebhookMode) -> Self {
        if mode != WebhookMode::Disabled {
            self.webhook_mode = mode;
        }
        self
    }

    pub fn suppress_notifications(mut self, flag: bool) -> Self {
        self.suppress_notifications |= flag;
        self
    }

    pub fn status_naming(mut self, policy: NamingPolicy) -> Self {
        self.status_naming = policy;
        self
    }

    pub fn notifications_suppressed(&self) -> bool {
        self.suppress_notifications
    }

    pub fn configured_webhook_mode(&self) -> WebhookMode {
        self.webhook_mode
    }

    pub fn configured_status_naming(&self) -> &NamingPolicy {
        &self.status_naming
    }

    /// Untrusted if any authority says so; trusted by default.
    pub(crate) fn evaluate_trust(&self, head: &Head) -> Trust {
        for authority in &self.trust_authorities {
            if authority(head) == Trust::Untrusted {
                return Trust::Untrusted;
            }
        }
        Trust::Trusted
    }

    /// Finalize this context for one project and return the request that
    /// will execute the pass. The request takes a frozen copy: mutating the
    /// context afterwards does not affect it.
    pub fn new_request(
        &self,
        host: Arc<dyn HostApi>,
        retry: RetryingClient,
        project: impl Into<String>,
    ) -> DiscoveryRequest {
        DiscoveryRequest::new(self.clone(), host, retry, project.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BranchHead, TagHead};

    #[test]
    fn boolean_fields_are_monotonic() {
        let ctx = DiscoveryContext::new()
            .want_branches(true)
            .want_branches(false)
            .want_tags(false)
            .suppress_notifications(true)
            .suppress_notifications(false);
        assert!(ctx.want_branches);
        assert!(!ctx.want_tags);
        assert!(ctx.suppress_notifications);
    }

    #[test]
    fn strategy_sets_union_across_traits() {
        let ctx = DiscoveryContext::from_traits([
            DiscoveryTrait::OriginChangeRequests([CheckoutStrategy::Merge].into()),
            DiscoveryTrait::OriginChangeRequests([CheckoutStrategy::Head].into()),
        ]);
        assert!(ctx.want_origin_change_requests);
        assert_eq!(ctx.origin_strategies.len(), 2);
    }

    #[test]
    fn disabled_webhook_mode_cannot_override_managed() {
        let ctx = DiscoveryContext::new()
            .webhook_mode(WebhookMode::ItemManaged)
            .webhook_mode(WebhookMode::Disabled);
        assert_eq!(ctx.webhook_mode, WebhookMode::ItemManaged);
    }

    #[test]
    fn trust_defaults_to_trusted_and_any_veto_wins() {
        let head = Head::Branch(BranchHead::new("main"));
        let ctx = DiscoveryContext::new();
        assert_eq!(ctx.evaluate_trust(&head), Trust::Trusted);

        let ctx = ctx
            .with_trust_authority(Arc::new(|_| Trust::Trusted))
            .with_trust_authority(Arc::new(|_| Trust::Untrusted));
        assert_eq!(ctx.evaluate_trust(&head), Trust::Untrusted);
    }

    #[test]
    fn tag_retention_prefilter_keeps_fresh_and_unknown_tags() {
        let prefilter = tag_retention_prefilter(1_000);
        let old = Head::Tag(TagHead::new("v0.1", 500));
        let fresh = Head::Tag(TagHead::new("v1.0", 2_000));
        let unknown = Head::Tag(TagHead::new("v0.0", 0));
        let branch = Head::Branch(BranchHead::new("main"));
        assert!(prefilter(&old));
        assert!(!prefilter(&fresh));
        assert!(!prefilter(&unknown));
        assert!(!prefilter(&branch));
    }
}
