//! The long-lived loop driving election cycles
//!
//! ```text
//!            ┌──────────────────── backoff ◀─────────────────┐
//!            ▼                                               │ failure
//!   CreateSession ──▶ Campaign ──▶ Observe ──────────────────┤
//!            │ failure                                       │ cancelled
//!            └──▶ backoff ──▶ CreateSession                  ▼
//!                                                          Closed
//! ```
//!
//! Cycles run strictly one after another. A failed cycle's session is closed
//! before the next one is negotiated.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::campaign::Campaign;
use crate::candidate::Candidate;
use crate::config::ElectionConfig;
use crate::coordinator::{Coordinator, LeaseSession};
use crate::error::ElectionError;
use crate::observer::LeaderObserver;
use crate::session::{close_quietly, SessionManager, SessionSlot};
use crate::state::{LeadershipState, ReadinessGate};

/// Phase of the election supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// Not started yet
    Idle,
    /// Negotiating a session
    CreateSession,
    /// Registering candidacy
    Campaign,
    /// Watching for the leader
    Observe,
    /// Waiting before the next attempt
    Backoff,
    /// Stopped for good
    Closed,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::CreateSession => "create-session",
            Self::Campaign => "campaign",
            Self::Observe => "observe",
            Self::Backoff => "backoff",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// State shared between the supervisor task and the election handle
pub(crate) struct ElectionShared<S> {
    pub candidate: Candidate,
    pub leadership: LeadershipState,
    pub readiness: ReadinessGate,
    pub session: SessionSlot<S>,
    pub state: watch::Sender<SupervisorState>,
    pub cycles: AtomicU64,
}

impl<S: LeaseSession> ElectionShared<S> {
    pub fn new(candidate: Candidate) -> Self {
        Self {
            candidate,
            leadership: LeadershipState::new(),
            readiness: ReadinessGate::new(),
            session: SessionSlot::new(),
            state: watch::channel(SupervisorState::Idle).0,
            cycles: AtomicU64::new(0),
        }
    }
}

enum Step<S> {
    CreateSession,
    Campaign(Arc<S>),
    Observe(Arc<S>, Campaign),
    Backoff(Duration),
    Closed,
}

pub struct ElectionSupervisor<C: Coordinator> {
    shared: Arc<ElectionShared<C::Session>>,
    sessions: SessionManager<C>,
    config: ElectionConfig,
    cancel: CancellationToken,
}

impl<C: Coordinator> ElectionSupervisor<C> {
    pub(crate) fn new(
        coordinator: Arc<C>,
        shared: Arc<ElectionShared<C::Session>>,
        config: ElectionConfig,
        cancel: CancellationToken,
    ) -> Self {
        let sessions = SessionManager::new(coordinator, config.ttl, config.session_timeout);
        Self {
            shared,
            sessions,
            config,
            cancel,
        }
    }

    /// Drive election cycles until cancelled
    pub async fn run(self) {
        let candidate = self.shared.candidate.id().to_string();
        info!(candidate = %candidate, key = self.shared.candidate.election_key(), "Election supervisor started");

        let mut step = Step::CreateSession;
        loop {
            step = match step {
                Step::CreateSession => self.create_session().await,
                Step::Campaign(session) => self.campaign(session),
                Step::Observe(session, campaign) => self.observe(session, campaign).await,
                Step::Backoff(delay) => self.backoff(delay).await,
                Step::Closed => break,
            };
        }

        // Nothing observes the leader once stopped
        if self.shared.leadership.clear() {
            info!(candidate = %candidate, "Released leadership on shutdown");
        }
        self.enter(SupervisorState::Closed);
        info!(candidate = %candidate, "Election supervisor stopped");
    }

    fn enter(&self, state: SupervisorState) {
        let previous = self.shared.state.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Supervisor state changed");
        }
    }

    async fn create_session(&self) -> Step<C::Session> {
        self.enter(SupervisorState::CreateSession);
        match self.sessions.create(&self.cancel).await {
            Ok(session) => {
                if self.shared.session.install(session.clone(), &self.cancel) {
                    Step::Campaign(session)
                } else {
                    close_quietly(session.as_ref()).await;
                    Step::Closed
                }
            }
            Err(ElectionError::Cancelled) => Step::Closed,
            Err(e) => {
                warn!(error = %e, retry_in = ?self.config.session_retry_delay, "Session creation failed");
                Step::Backoff(self.config.session_retry_delay)
            }
        }
    }

    fn campaign(&self, session: Arc<C::Session>) -> Step<C::Session> {
        self.enter(SupervisorState::Campaign);
        let cycle = self.shared.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let candidate = &self.shared.candidate;
        debug!(cycle, lease = session.lease_id(), candidate = candidate.id(), "Campaigning");
        let campaign = Campaign::start(session.clone(), candidate.election_key(), candidate.id());
        Step::Observe(session, campaign)
    }

    async fn observe(&self, session: Arc<C::Session>, mut campaign: Campaign) -> Step<C::Session> {
        self.enter(SupervisorState::Observe);
        let observer = LeaderObserver::new(
            &self.shared.candidate,
            &self.shared.leadership,
            &self.shared.readiness,
            self.config.poll_interval,
            self.config.max_poll_failures,
        );

        match observer.run(session.as_ref(), &mut campaign, &self.cancel).await {
            Ok(()) => Step::Closed,
            Err(e) => {
                warn!(
                    lease = session.lease_id(),
                    error = %e,
                    retry_in = ?self.config.cycle_retry_delay,
                    "Election cycle failed"
                );
                drop(campaign);
                self.abandon(session).await;
                Step::Backoff(self.config.cycle_retry_delay)
            }
        }
    }

    /// Release a failed cycle's session
    ///
    /// Everything registered under it is revoked, so leadership is dropped
    /// before the session is closed. The close runs to completion even if the
    /// election is cancelled meanwhile, bounded by the session timeout.
    async fn abandon(&self, session: Arc<C::Session>) {
        self.shared.session.remove(&session);
        if self.shared.leadership.clear() {
            info!(candidate = self.shared.candidate.id(), "Lost leadership with abandoned session");
        }
        let limit = self.config.session_timeout;
        if tokio::time::timeout(limit, close_quietly(session.as_ref())).await.is_err() {
            warn!(lease = session.lease_id(), ?limit, "Timed out closing abandoned session");
        }
    }

    async fn backoff(&self, delay: Duration) -> Step<C::Session> {
        self.enter(SupervisorState::Backoff);
        tokio::select! {
            _ = self.cancel.cancelled() => Step::Closed,
            _ = tokio::time::sleep(delay) => Step::CreateSession,
        }
    }
}
