//! In-process coordination service
//!
//! Behaves like an etcd election prefix: every campaign gets the next
//! revision, the live registration with the lowest revision is the leader,
//! and revoking a lease removes everything registered under it. Faults can be
//! injected to exercise the recovery paths of an election.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::coordinator::{Coordinator, LeaderStream, LeaseId, LeaseSession};
use crate::error::CoordinatorError;

/// How leader notification streams behave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WatchMode {
    /// Deliver every leader change
    #[default]
    Live,
    /// Stay open but deliver nothing
    Silent,
    /// End every stream
    Closed,
}

#[derive(Debug)]
struct Lease {
    ttl: Duration,
    alive: watch::Sender<bool>,
}

impl Lease {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            alive: watch::channel(true).0,
        }
    }

    fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }
}

#[derive(Debug)]
struct Registration {
    key: String,
    value: String,
    lease: LeaseId,
}

#[derive(Debug)]
struct Inner {
    next_revision: i64,
    next_lease: LeaseId,
    leases: HashMap<LeaseId, Lease>,
    /// Registrations ordered by revision
    registrations: Vec<(i64, Registration)>,
    watches: HashMap<String, watch::Sender<Option<String>>>,
    reachable: bool,
    failing_sessions: u32,
    failing_leader_reads: bool,
    session_delay: Duration,
    sessions_created: u64,
}

impl Inner {
    fn leader_of(&self, key: &str) -> Option<String> {
        self.registrations
            .iter()
            .find(|(_, registration)| registration.key == key)
            .map(|(_, registration)| registration.value.clone())
    }

    fn is_alive(&self, lease: LeaseId) -> bool {
        self.leases.get(&lease).is_some_and(Lease::is_alive)
    }

    fn publish(&self) {
        for (key, tx) in &self.watches {
            let leader = self.leader_of(key);
            tx.send_if_modified(|current| {
                if *current == leader {
                    false
                } else {
                    *current = leader.clone();
                    true
                }
            });
        }
    }
}

#[derive(Debug)]
struct Shared {
    inner: Mutex<Inner>,
    watch_mode: watch::Sender<WatchMode>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn revoke(&self, lease: LeaseId) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.leases.get(&lease) else {
            return false;
        };
        if !entry.alive.send_replace(false) {
            return false;
        }
        inner
            .registrations
            .retain(|(_, registration)| registration.lease != lease);
        inner.publish();
        debug!(lease, "Lease revoked");
        true
    }

    /// Let the lease lapse after its TTL, as if keep-alives stopped arriving
    fn expire_after_ttl(self: &Arc<Self>, lease: LeaseId) {
        let Some(ttl) = self.lock().leases.get(&lease).map(|lease| lease.ttl) else {
            return;
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            shared.revoke(lease);
        });
    }
}

/// In-memory coordination service
///
/// Clones share the same state, so several elections can race on one store.
#[derive(Clone)]
pub struct MemoryCoordinator {
    shared: Arc<Shared>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        let (watch_mode, _) = watch::channel(WatchMode::Live);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    next_revision: 1,
                    next_lease: 1,
                    leases: HashMap::new(),
                    registrations: Vec::new(),
                    watches: HashMap::new(),
                    reachable: true,
                    failing_sessions: 0,
                    failing_leader_reads: false,
                    session_delay: Duration::ZERO,
                    sessions_created: 0,
                }),
                watch_mode,
            }),
        }
    }

    /// Make the next `count` session negotiations fail
    pub fn fail_next_sessions(&self, count: u32) {
        self.shared.lock().failing_sessions = count;
    }

    /// Simulate losing or regaining connectivity to the service
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.lock().reachable = reachable;
    }

    /// Delay every session negotiation by `delay`
    pub fn set_session_delay(&self, delay: Duration) {
        self.shared.lock().session_delay = delay;
    }

    /// Make point reads of the leader fail with a transient error
    pub fn fail_leader_reads(&self, failing: bool) {
        self.shared.lock().failing_leader_reads = failing;
    }

    /// Change how existing and future notification streams behave
    pub fn set_watch_mode(&self, mode: WatchMode) {
        self.shared.watch_mode.send_replace(mode);
    }

    /// Stop keeping `lease` alive; it expires once its TTL elapses
    ///
    /// Must be called from within a tokio runtime.
    pub fn kill_session(&self, lease: LeaseId) {
        debug!(lease, "Session killed");
        self.shared.expire_after_ttl(lease);
    }

    /// Revoke `lease` immediately
    pub fn revoke(&self, lease: LeaseId) -> bool {
        self.shared.revoke(lease)
    }

    pub fn current_leader(&self, key: &str) -> Option<String> {
        self.shared.lock().leader_of(key)
    }

    pub fn is_lease_alive(&self, lease: LeaseId) -> bool {
        self.shared.lock().is_alive(lease)
    }

    pub fn sessions_created(&self) -> u64 {
        self.shared.lock().sessions_created
    }

    pub fn live_sessions(&self) -> usize {
        self.shared
            .lock()
            .leases
            .values()
            .filter(|lease| lease.is_alive())
            .count()
    }

    /// Number of live registrations under `key`
    pub fn candidates(&self, key: &str) -> usize {
        self.shared
            .lock()
            .registrations
            .iter()
            .filter(|(_, registration)| registration.key == key)
            .count()
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    type Session = MemorySession;

    async fn create_session(&self, ttl: Duration) -> Result<MemorySession, CoordinatorError> {
        let delay = self.shared.lock().session_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.shared.lock();
        if !inner.reachable {
            return Err(CoordinatorError::Unavailable("connection refused".to_string()));
        }
        if inner.failing_sessions > 0 {
            inner.failing_sessions -= 1;
            return Err(CoordinatorError::Unavailable("lease grant rejected".to_string()));
        }

        let lease = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(lease, Lease::new(ttl));
        inner.sessions_created += 1;
        trace!(lease, ?ttl, "Lease granted");

        Ok(MemorySession {
            lease,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// A session handed out by [`MemoryCoordinator`]
#[derive(Debug)]
pub struct MemorySession {
    lease: LeaseId,
    shared: Arc<Shared>,
}

struct WatchState {
    leader: watch::Receiver<Option<String>>,
    mode: watch::Receiver<WatchMode>,
    primed: bool,
}

impl WatchState {
    async fn next(mut self) -> Option<(Option<String>, Self)> {
        loop {
            let mode = *self.mode.borrow_and_update();
            match mode {
                WatchMode::Closed => return None,
                WatchMode::Silent => {
                    self.mode.changed().await.ok()?;
                    self.primed = false;
                    continue;
                }
                WatchMode::Live => {}
            }

            if !self.primed {
                self.primed = true;
                let leader = self.leader.borrow_and_update().clone();
                return Some((leader, self));
            }

            tokio::select! {
                changed = self.leader.changed() => {
                    changed.ok()?;
                    let leader = self.leader.borrow_and_update().clone();
                    return Some((leader, self));
                }
                changed = self.mode.changed() => {
                    changed.ok()?;
                }
            }
        }
    }
}

#[async_trait]
impl LeaseSession for MemorySession {
    fn lease_id(&self) -> LeaseId {
        self.lease
    }

    async fn campaign(&self, key: &str, value: &str) -> Result<(), CoordinatorError> {
        let mut inner = self.shared.lock();
        if !inner.reachable {
            return Err(CoordinatorError::Unavailable("connection refused".to_string()));
        }
        if !inner.is_alive(self.lease) {
            return Err(CoordinatorError::SessionExpired(self.lease));
        }

        let already_registered = inner
            .registrations
            .iter()
            .any(|(_, r)| r.key == key && r.lease == self.lease);
        if !already_registered {
            let revision = inner.next_revision;
            inner.next_revision += 1;
            inner.registrations.push((
                revision,
                Registration {
                    key: key.to_string(),
                    value: value.to_string(),
                    lease: self.lease,
                },
            ));
            inner.publish();
            trace!(lease = self.lease, key, revision, "Candidate registered");
        }
        Ok(())
    }

    async fn leader(&self, key: &str) -> Result<String, CoordinatorError> {
        let inner = self.shared.lock();
        if !inner.reachable || inner.failing_leader_reads {
            return Err(CoordinatorError::Unavailable("leader read failed".to_string()));
        }
        inner.leader_of(key).ok_or(CoordinatorError::NoLeader)
    }

    fn observe(&self, key: &str) -> LeaderStream {
        let mut inner = self.shared.lock();
        if !inner.reachable {
            return stream::empty().boxed();
        }

        let initial = inner.leader_of(key);
        let leader = inner
            .watches
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(initial).0)
            .subscribe();

        let state = WatchState {
            leader,
            mode: self.shared.watch_mode.subscribe(),
            primed: false,
        };
        stream::unfold(state, WatchState::next).boxed()
    }

    async fn done(&self) {
        let mut alive = match self.shared.lock().leases.get(&self.lease) {
            Some(lease) => lease.alive.subscribe(),
            None => return,
        };
        let _ = alive.wait_for(|alive| !*alive).await;
    }

    async fn close(&self) -> Result<(), CoordinatorError> {
        let reachable = self.shared.lock().reachable;
        if !reachable {
            self.shared.expire_after_ttl(self.lease);
            return Err(CoordinatorError::Unavailable("lease revoke failed".to_string()));
        }
        self.shared.revoke(self.lease);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(10);

    #[tokio::test]
    async fn test_lowest_revision_leads() {
        let coordinator = MemoryCoordinator::new();
        let first = coordinator.create_session(TTL).await.unwrap();
        let second = coordinator.create_session(TTL).await.unwrap();

        second.campaign("/e", "b").await.unwrap();
        first.campaign("/e", "a").await.unwrap();

        assert_eq!(first.leader("/e").await.unwrap(), "b");
        assert_eq!(coordinator.candidates("/e"), 2);

        second.close().await.unwrap();
        assert_eq!(first.leader("/e").await.unwrap(), "a");
        assert!(!coordinator.is_lease_alive(second.lease_id()));
    }

    #[tokio::test]
    async fn test_campaign_is_idempotent_per_lease() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.create_session(TTL).await.unwrap();

        session.campaign("/e", "a").await.unwrap();
        session.campaign("/e", "a").await.unwrap();
        assert_eq!(coordinator.candidates("/e"), 1);
    }

    #[tokio::test]
    async fn test_leader_read_without_candidates() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.create_session(TTL).await.unwrap();
        assert_eq!(
            session.leader("/e").await.unwrap_err(),
            CoordinatorError::NoLeader
        );
    }

    #[tokio::test]
    async fn test_injected_session_failures() {
        let coordinator = MemoryCoordinator::new();
        coordinator.fail_next_sessions(2);

        assert!(coordinator.create_session(TTL).await.is_err());
        assert!(coordinator.create_session(TTL).await.is_err());
        assert!(coordinator.create_session(TTL).await.is_ok());
        assert_eq!(coordinator.sessions_created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_killed_session_expires_after_ttl() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.create_session(TTL).await.unwrap();
        session.campaign("/e", "a").await.unwrap();

        coordinator.kill_session(session.lease_id());
        tokio::time::sleep(TTL - Duration::from_millis(1)).await;
        assert_eq!(coordinator.current_leader("/e").as_deref(), Some("a"));

        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(coordinator.current_leader("/e"), None);
        assert_eq!(coordinator.live_sessions(), 0);
    }

    #[tokio::test]
    async fn test_observe_delivers_changes() {
        let coordinator = MemoryCoordinator::new();
        let watcher = coordinator.create_session(TTL).await.unwrap();
        let candidate = coordinator.create_session(TTL).await.unwrap();
        let mut leaders = watcher.observe("/e");

        assert_eq!(leaders.next().await, Some(None));
        candidate.campaign("/e", "a").await.unwrap();
        assert_eq!(leaders.next().await, Some(Some("a".to_string())));
        candidate.close().await.unwrap();
        assert_eq!(leaders.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_closed_watch_mode_ends_streams() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.create_session(TTL).await.unwrap();
        let mut leaders = session.observe("/e");
        assert_eq!(leaders.next().await, Some(None));

        coordinator.set_watch_mode(WatchMode::Closed);
        assert_eq!(leaders.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_watch_mode_delivers_nothing() {
        let coordinator = MemoryCoordinator::new();
        coordinator.set_watch_mode(WatchMode::Silent);
        let session = coordinator.create_session(TTL).await.unwrap();
        let mut leaders = session.observe("/e");
        session.campaign("/e", "a").await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(60), leaders.next()).await;
        assert!(next.is_err());

        coordinator.set_watch_mode(WatchMode::Live);
        assert_eq!(leaders.next().await, Some(Some("a".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_done_resolves_when_lease_lapses() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.create_session(TTL).await.unwrap();

        let early = tokio::time::timeout(Duration::from_secs(60), session.done()).await;
        assert!(early.is_err());

        coordinator.kill_session(session.lease_id());
        let lapsed = tokio::time::timeout(TTL + Duration::from_millis(1), session.done()).await;
        assert!(lapsed.is_ok());

        // Resolves at once for a lease that is already gone
        session.done().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_while_unreachable_lets_lease_lapse() {
        let coordinator = MemoryCoordinator::new();
        let session = coordinator.create_session(TTL).await.unwrap();
        coordinator.set_reachable(false);

        assert!(session.close().await.is_err());
        assert!(coordinator.is_lease_alive(session.lease_id()));

        tokio::time::sleep(TTL + Duration::from_millis(1)).await;
        assert!(!coordinator.is_lease_alive(session.lease_id()));
    }
}
