//! Race-free build status notification.
//!
//! Three phases are published to the remote host, keyed by the commit that
//! will actually be built: `Pending` on enqueue, `Running` on checkout
//! start, `Finished` on run completion.
//!
//! The enqueue notification runs on a background worker because resolving
//! the revision may itself need remote calls. That opens a race: the build
//! can start (and publish `Running`) before the queued notification's
//! resolution finishes. The ticket board closes it: a stale `Pending` is
//! abandoned instead of clobbering a later state. The board's mutex is the
//! only synchronized region; it is held for map reads and writes only,
//! never across network I/O.

use crate::api::{CommitState, CommitStatusUpdate, HostApi};
use crate::error::RemoteError;
use crate::model::{CheckoutStrategy, Revision};
use crate::retry::RetryingClient;
use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, warn};

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResult {
    Success,
    Failed,
    Canceled,
}

/// Status phase reported to the remote host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    /// Unit queued, build not started.
    Pending,
    /// Checkout started.
    Running,
    Finished(BuildResult),
}

impl BuildPhase {
    fn commit_state(self) -> CommitState {
        match self {
            BuildPhase::Pending => CommitState::Pending,
            BuildPhase::Running => CommitState::Running,
            BuildPhase::Finished(BuildResult::Success) => CommitState::Success,
            BuildPhase::Finished(BuildResult::Failed) => CommitState::Failed,
            BuildPhase::Finished(BuildResult::Canceled) => CommitState::Canceled,
        }
    }

    fn description(self) -> &'static str {
        match self {
            BuildPhase::Pending => "Build queued",
            BuildPhase::Running => "Build started",
            BuildPhase::Finished(BuildResult::Success) => "Build succeeded",
            BuildPhase::Finished(BuildResult::Failed) => "Build failed",
            BuildPhase::Finished(BuildResult::Canceled) => "Build canceled",
        }
    }
}

/// Identity of one job instance in the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub project: String,
    /// Head display name the job builds.
    pub head: String,
}

impl JobKey {
    pub fn new(project: impl Into<String>, head: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            head: head.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.head)
    }
}

/// Builds the stable status label: fixed prefix, optional user-configured
/// segment, and a type suffix chosen from the revision variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingPolicy {
    pub prefix: String,
    pub custom: Option<String>,
}

impl Default for NamingPolicy {
    fn default() -> Self {
        Self {
            prefix: "ci".into(),
            custom: None,
        }
    }
}

impl NamingPolicy {
    pub fn with_custom(custom: impl Into<String>) -> Self {
        Self {
            custom: Some(custom.into()),
            ..Self::default()
        }
    }

    /// `<prefix>[/<custom>]/<branch|mr-head|mr-merge|tag>`.
    pub fn status_name(&self, revision: &Revision) -> String {
        let suffix = match revision {
            Revision::Branch(_) => "branch",
            Revision::Tag(_) => "tag",
            Revision::ChangeRequest(cr) => match cr.head.strategy {
                CheckoutStrategy::Merge => "mr-merge",
                CheckoutStrategy::Head => "mr-head",
            },
        };
        match &self.custom {
            Some(custom) => format!("{}/{}/{}", self.prefix, custom, suffix),
            None => format!("{}/{}", self.prefix, suffix),
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool of background workers draining a FIFO queue.
struct WorkerPool {
    sender: Option<mpsc::Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    fn new(threads: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..threads.max(1))
            .map(|index| {
                let receiver = Arc::clone(&receiver);
                std::thread::Builder::new()
                    .name(format!("status-notify-{index}"))
                    .spawn(move || {
                        loop {
                            let job = {
                                let guard = receiver.lock().expect("worker queue poisoned");
                                guard.recv()
                            };
                            match job {
                                Ok(job) => job(),
                                Err(_) => break,
                            }
                        }
                    })
                    .expect("failed to spawn status worker")
            })
            .collect();
        Self {
            sender: Some(sender),
            handles,
        }
    }

    fn dispatch(&self, job: Job) {
        if let Some(sender) = &self.sender {
            // A send failure means shutdown is in progress; the status is
            // lost, which final-phase publication tolerates.
            let _ = sender.send(job);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.sender.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
struct TicketBoard {
    next: u64,
    pending: HashMap<JobKey, u64>,
}

struct NotifierInner {
    host: Arc<dyn HostApi>,
    retry: RetryingClient,
    naming: NamingPolicy,
    suppress: bool,
    board: Mutex<TicketBoard>,
}

impl NotifierInner {
    /// Allocate the next ticket and record it for the job.
    fn allocate(&self, job: &JobKey) -> u64 {
        let mut board = self.board.lock().expect("ticket board poisoned");
        board.next += 1;
        let ticket = board.next;
        board.pending.insert(job.clone(), ticket);
        ticket
    }

    /// Claim the right to send `Pending`: succeeds only while the job's
    /// recorded ticket is still ours, and removes the entry on success.
    fn claim(&self, job: &JobKey, ticket: u64) -> bool {
        let mut board = self.board.lock().expect("ticket board poisoned");
        if board.pending.get(job) == Some(&ticket) {
            board.pending.remove(job);
            true
        } else {
            false
        }
    }

    /// Drop our ticket without sending, leaving a newer one untouched.
    fn abandon(&self, job: &JobKey, ticket: u64) {
        let mut board = self.board.lock().expect("ticket board poisoned");
        if board.pending.get(job) == Some(&ticket) {
            board.pending.remove(job);
        }
    }

    /// Invalidate any in-flight `Pending` ticket for the job.
    fn invalidate(&self, job: &JobKey) {
        let mut board = self.board.lock().expect("ticket board poisoned");
        board.pending.remove(job);
    }

    fn send(&self, job: &JobKey, revision: &Revision, phase: BuildPhase, target_url: Option<&str>) {
        // Status lands on the project the built commit lives in: the fork
        // for fork change requests.
        let project = match revision {
            Revision::ChangeRequest(cr) => cr.head.origin_project_path.as_str(),
            _ => job.project.as_str(),
        };
        let sha = revision.built_commit();
        let update = CommitStatusUpdate {
            state: phase.commit_state(),
            name: self.naming.status_name(revision),
            ref_name: Some(revision.ref_name().to_string()),
            target_url: target_url.map(str::to_string),
            description: Some(phase.description().to_string()),
        };
        let result = self
            .retry
            .call("publish status", || self.host.publish_status(project, sha, &update));
        match result {
            Ok(()) => debug!(job = %job, sha, ?phase, "published build status"),
            Err(err) if err.is_status_transition_rejection() => {
                debug!(job = %job, sha, ?phase, "host refused regressive status transition")
            }
            Err(err) => warn!(job = %job, sha, ?phase, error = %err, "failed to publish build status"),
        }
    }
}

/// Publishes build status from scheduler lifecycle events.
pub struct StatusNotifier {
    inner: Arc<NotifierInner>,
    pool: WorkerPool,
}

impl StatusNotifier {
    pub fn new(host: Arc<dyn HostApi>, retry: RetryingClient, naming: NamingPolicy) -> Self {
        Self::with_workers(host, retry, naming, false, 2)
    }

    pub fn with_workers(
        host: Arc<dyn HostApi>,
        retry: RetryingClient,
        naming: NamingPolicy,
        suppress: bool,
        workers: usize,
    ) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                host,
                retry,
                naming,
                suppress,
                board: Mutex::new(TicketBoard::default()),
            }),
            pool: WorkerPool::new(workers),
        }
    }

    /// Unit queued. Resolution of the revision may block on remote calls,
    /// so it runs on a background worker carrying the allocated ticket.
    pub fn on_enqueue(
        &self,
        job: JobKey,
        resolve: impl FnOnce() -> Result<Revision, RemoteError> + Send + 'static,
        target_url: Option<String>,
    ) {
        if self.inner.suppress {
            return;
        }
        let ticket = self.inner.allocate(&job);
        let inner = Arc::clone(&self.inner);
        self.pool.dispatch(Box::new(move || {
            let revision = match resolve() {
                Ok(revision) => revision,
                Err(err) => {
                    warn!(job = %job, error = %err, "failed to resolve revision for pending status");
                    inner.abandon(&job, ticket);
                    return;
                }
            };
            if !inner.claim(&job, ticket) {
                debug!(job = %job, ticket, "pending status superseded, dropping");
                return;
            }
            inner.send(&job, &revision, BuildPhase::Pending, target_url.as_deref());
        }));
    }

    /// Checkout started. Invalidates any in-flight pending ticket before
    /// composing the `Running` status, so `Pending` can never land after
    /// it.
    pub fn on_checkout_start(&self, job: &JobKey, revision: &Revision, target_url: Option<&str>) {
        self.inner.invalidate(job);
        if self.inner.suppress {
            return;
        }
        self.inner.send(job, revision, BuildPhase::Running, target_url);
    }

    /// Run finished. Same invalidation as checkout start.
    pub fn on_run_completed(
        &self,
        job: &JobKey,
        revision: &Revision,
        result: BuildResult,
        target_url: Option<&str>,
    ) {
        self.inner.invalidate(job);
        if self.inner.suppress {
            return;
        }
        self.inner
            .send(job, revision, BuildPhase::Finished(result), target_url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockHost;
    use crate::model::{
        BranchHead, BranchRevision, ChangeRequestRevision, ChangeRequestSummary,
    };
    use crate::retry::{RetryPolicy, RetryingClient};
    use std::time::Duration;

    fn branch_revision(name: &str, sha: &str) -> Revision {
        Revision::Branch(BranchRevision::new(BranchHead::new(name), sha))
    }

    fn merge_revision(origin_path: &str, strategy: CheckoutStrategy) -> Revision {
        let summary = ChangeRequestSummary {
            iid: 9,
            title: "Change".into(),
            source_project_id: 99,
            target_project_id: 11,
            source_project_path: origin_path.into(),
            source_branch: "feature".into(),
            target_branch: "main".into(),
        };
        let head = summary.heads(&[strategy].into()).remove(0);
        Revision::ChangeRequest(ChangeRequestRevision {
            head,
            target: BranchRevision::new(BranchHead::new("main"), "base-sha"),
            origin: BranchRevision::new(BranchHead::new("feature"), "head-sha"),
        })
    }

    fn notifier(host: &Arc<MockHost>) -> StatusNotifier {
        StatusNotifier::with_workers(
            host.clone() as Arc<dyn HostApi>,
            RetryingClient::new(RetryPolicy::fixed_delay(0)),
            NamingPolicy::default(),
            false,
            1,
        )
    }

    /// Wait until all previously dispatched background work has run. Relies
    /// on the single-worker FIFO queue used in tests.
    fn drain(notifier: &StatusNotifier) {
        let (tx, rx) = mpsc::channel();
        notifier.pool.dispatch(Box::new(move || {
            let _ = tx.send(());
        }));
        rx.recv_timeout(Duration::from_secs(5))
            .expect("background queue did not drain");
    }

    #[test]
    fn pending_is_published_when_nothing_supersedes_it() {
        let host = Arc::new(MockHost::new());
        let n = notifier(&host);
        n.on_enqueue(
            JobKey::new("group/project", "main"),
            || Ok(branch_revision("main", "sha-1")),
            Some("https://ci.example.com/job/1".into()),
        );
        drain(&n);

        let statuses = host.published_statuses();
        assert_eq!(statuses.len(), 1);
        let (project, sha, update) = &statuses[0];
        assert_eq!(project, "group/project");
        assert_eq!(sha, "sha-1");
        assert_eq!(update.state, CommitState::Pending);
        assert_eq!(update.name, "ci/branch");
        assert_eq!(update.ref_name.as_deref(), Some("main"));
        assert_eq!(
            update.target_url.as_deref(),
            Some("https://ci.example.com/job/1")
        );
    }

    #[test]
    fn checkout_start_invalidates_in_flight_pending_ticket() {
        let host = Arc::new(MockHost::new());
        let n = notifier(&host);
        let job = JobKey::new("group/project", "main");

        // The background resolution blocks until released, simulating a
        // slow remote lookup.
        let (release_tx, release_rx) = mpsc::channel::<()>();
        n.on_enqueue(job.clone(), move || {
            release_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("never released");
            Ok(branch_revision("main", "sha-1"))
        }, None);

        // The build starts before resolution completes.
        n.on_checkout_start(&job, &branch_revision("main", "sha-1"), None);

        release_tx.send(()).unwrap();
        drain(&n);

        let states: Vec<_> = host
            .published_statuses()
            .iter()
            .map(|(_, _, update)| update.state)
            .collect();
        assert_eq!(states, vec![CommitState::Running]);
    }

    #[test]
    fn run_completion_also_invalidates_pending() {
        let host = Arc::new(MockHost::new());
        let n = notifier(&host);
        let job = JobKey::new("group/project", "main");

        let (release_tx, release_rx) = mpsc::channel::<()>();
        n.on_enqueue(job.clone(), move || {
            release_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("never released");
            Ok(branch_revision("main", "sha-1"))
        }, None);

        n.on_run_completed(&job, &branch_revision("main", "sha-1"), BuildResult::Failed, None);
        release_tx.send(()).unwrap();
        drain(&n);

        let states: Vec<_> = host
            .published_statuses()
            .iter()
            .map(|(_, _, update)| update.state)
            .collect();
        assert_eq!(states, vec![CommitState::Failed]);
    }

    #[test]
    fn re_enqueue_supersedes_older_ticket() {
        let host = Arc::new(MockHost::new());
        let n = notifier(&host);
        let job = JobKey::new("group/project", "main");

        let (release_tx, release_rx) = mpsc::channel::<()>();
        n.on_enqueue(job.clone(), move || {
            release_rx
                .recv_timeout(Duration::from_secs(5))
                .expect("never released");
            Ok(branch_revision("main", "old-sha"))
        }, None);
        n.on_enqueue(job.clone(), || Ok(branch_revision("main", "new-sha")), None);

        release_tx.send(()).unwrap();
        drain(&n);

        let statuses = host.published_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].1, "new-sha");
        assert_eq!(statuses[0].2.state, CommitState::Pending);
    }

    #[test]
    fn transition_rejection_is_benign_and_not_retried() {
        let host = Arc::new(MockHost::new());
        host.fail_next(
            "publish_status",
            RemoteError::from_status(400, "Cannot transition status via :enqueue"),
            1,
        );
        let n = StatusNotifier::with_workers(
            host.clone() as Arc<dyn HostApi>,
            RetryingClient::new(RetryPolicy::fixed_delay(3)),
            NamingPolicy::default(),
            false,
            1,
        );
        let job = JobKey::new("group/project", "main");
        n.on_checkout_start(&job, &branch_revision("main", "sha-1"), None);

        assert_eq!(host.calls("publish_status"), 1);
        assert!(host.published_statuses().is_empty());
    }

    #[test]
    fn merge_strategy_names_and_fork_targeting() {
        let host = Arc::new(MockHost::new());
        let n = notifier(&host);
        let job = JobKey::new("group/project", "MR-9");
        let revision = merge_revision("fork-owner/project", CheckoutStrategy::Merge);
        n.on_checkout_start(&job, &revision, None);

        let statuses = host.published_statuses();
        assert_eq!(statuses.len(), 1);
        let (project, sha, update) = &statuses[0];
        // Status lands on the fork, keyed by the origin commit.
        assert_eq!(project, "fork-owner/project");
        assert_eq!(sha, "head-sha");
        assert_eq!(update.name, "ci/mr-merge");
        assert_eq!(update.ref_name.as_deref(), Some("feature"));
    }

    #[test]
    fn custom_naming_segment_is_included() {
        let host = Arc::new(MockHost::new());
        let n = StatusNotifier::with_workers(
            host.clone() as Arc<dyn HostApi>,
            RetryingClient::new(RetryPolicy::fixed_delay(0)),
            NamingPolicy::with_custom("nightly"),
            false,
            1,
        );
        let job = JobKey::new("group/project", "v1.0");
        let revision = Revision::Tag(crate::model::TagRevision {
            head: crate::model::TagHead::new("v1.0", 123),
            commit: "tag-sha".into(),
        });
        n.on_checkout_start(&job, &revision, None);

        let statuses = host.published_statuses();
        assert_eq!(statuses[0].2.name, "ci/nightly/tag");
        assert_eq!(statuses[0].2.ref_name.as_deref(), Some("v1.0"));
    }

    #[test]
    fn suppressed_notifier_sends_nothing() {
        let host = Arc::new(MockHost::new());
        let n = StatusNotifier::with_workers(
            host.clone() as Arc<dyn HostApi>,
            RetryingClient::new(RetryPolicy::fixed_delay(0)),
            NamingPolicy::default(),
            true,
            1,
        );
        let job = JobKey::new("group/project", "main");
        n.on_enqueue(job.clone(), || Ok(branch_revision("main", "sha-1")), None);
        n.on_checkout_start(&job, &branch_revision("main", "sha-1"), None);
        drain(&n);
        assert!(host.published_statuses().is_empty());
    }
}
