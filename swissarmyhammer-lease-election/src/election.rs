//! The election handle applications hold

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candidate::Candidate;
use crate::config::ElectionConfig;
use crate::coordinator::{Coordinator, LeaseId, LeaseSession};
use crate::error::{CoordinatorError, ElectionError, Result};
use crate::supervisor::{ElectionShared, ElectionSupervisor, SupervisorState};

/// A candidate's participation in one election
///
/// Owns the background supervisor that keeps re-entering the race after any
/// session, campaign or observation failure. Call [`close`](Self::close)
/// before exiting so that leadership is released immediately instead of
/// after the lease TTL.
pub struct LeaderElection<C: Coordinator> {
    coordinator: Arc<C>,
    config: ElectionConfig,
    shared: Arc<ElectionShared<C::Session>>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: OnceCell<std::result::Result<(), CoordinatorError>>,
}

impl<C: Coordinator> LeaderElection<C> {
    /// Create an election for `election_key` with the default configuration
    pub fn new(coordinator: Arc<C>, election_key: impl Into<String>) -> Self {
        Self::build(coordinator, election_key.into(), ElectionConfig::default())
    }

    /// Create an election with a custom configuration
    pub fn with_config(
        coordinator: Arc<C>,
        election_key: impl Into<String>,
        config: ElectionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(coordinator, election_key.into(), config))
    }

    fn build(coordinator: Arc<C>, election_key: String, config: ElectionConfig) -> Self {
        let candidate = Candidate::new(election_key, config.id_prefix.as_deref());
        Self {
            coordinator,
            config,
            shared: Arc::new(ElectionShared::new(candidate)),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: OnceCell::new(),
        }
    }

    /// Stop the election when `parent` is cancelled
    ///
    /// Cancelling `parent` halts the supervisor; [`close`](Self::close)
    /// must still be called to release the active session.
    pub fn with_cancellation(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Join the election and wait until a leader is known
    ///
    /// Returns once any candidate, not necessarily this one, has been
    /// observed as leader. If that takes longer than the configured ready
    /// timeout the election is closed and [`ElectionError::ReadinessTimeout`]
    /// is returned.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ElectionError::Cancelled);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(ElectionError::AlreadyStarted);
        }

        let supervisor = ElectionSupervisor::new(
            self.coordinator.clone(),
            self.shared.clone(),
            self.config.clone(),
            self.cancel.clone(),
        );
        *self.lock_supervisor() = Some(tokio::spawn(supervisor.run()));

        let limit = self.config.ready_timeout;
        let ready = tokio::select! {
            ready = self.shared.readiness.wait(limit) => ready,
            _ = self.cancel.cancelled() => return Err(ElectionError::Cancelled),
        };
        if ready {
            info!(
                candidate = self.id(),
                leader = self.is_leader(),
                "Election started"
            );
            return Ok(());
        }

        warn!(candidate = self.id(), ?limit, "No leader determined, closing election");
        if let Err(e) = self.close().await {
            warn!(error = %e, "Failed to release election after readiness timeout");
        }
        Err(ElectionError::ReadinessTimeout(limit))
    }

    /// This candidate's identity
    pub fn id(&self) -> &str {
        self.shared.candidate.id()
    }

    /// The key candidates race for
    pub fn key(&self) -> &str {
        self.shared.candidate.election_key()
    }

    /// Whether this candidate is currently the leader
    ///
    /// Always false before the election is ready and after it is closed.
    pub fn is_leader(&self) -> bool {
        self.shared.leadership.is_leader()
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    /// Lease of the session backing the current cycle
    pub fn current_lease(&self) -> Option<LeaseId> {
        self.shared.session.lease_id()
    }

    /// Number of election cycles started so far
    pub fn cycles(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Leave the election and release leadership immediately
    ///
    /// Stops the supervisor and closes the active session, which revokes this
    /// candidate's registration. Safe to call more than once and from several
    /// tasks: the shutdown runs once and every call reports its outcome, so a
    /// failed session close is returned again by later calls.
    pub async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.closed
            .get_or_init(|| self.shutdown())
            .await
            .clone()
            .map_err(ElectionError::Close)
    }

    async fn shutdown(&self) -> std::result::Result<(), CoordinatorError> {
        let supervisor = self.lock_supervisor().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                warn!(error = %e, "Election supervisor did not stop cleanly");
            }
        }

        if self.shared.leadership.clear() {
            info!(candidate = self.id(), "Released leadership");
        }

        let result = match self.shared.session.take() {
            Some(session) => {
                let lease = session.lease_id();
                let closed = session.close().await;
                debug!(lease, ok = closed.is_ok(), "Closed election session");
                closed
            }
            None => Ok(()),
        };
        info!(candidate = self.id(), "Election closed");
        result
    }

    fn lock_supervisor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<C: Coordinator> Drop for LeaderElection<C> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
