//! State shared between the supervisor task and the election handle

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;

/// Whether this candidate currently holds leadership
///
/// Written only by the leader observer, read lock-free by anyone.
#[derive(Debug, Default)]
pub struct LeadershipState {
    leader: AtomicBool,
}

impl LeadershipState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::Acquire)
    }

    /// Record a leadership observation
    ///
    /// Returns true if the flag changed.
    pub fn set(&self, leader: bool) -> bool {
        self.leader
            .compare_exchange(!leader, leader, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop leadership, returning true if it was held
    pub fn clear(&self) -> bool {
        self.set(false)
    }
}

/// One-shot signal raised the first time any leader is determined
///
/// Never reopens once raised, no matter how many cycles run afterwards.
#[derive(Debug)]
pub struct ReadinessGate {
    tx: watch::Sender<bool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Raise the gate; returns true only for the call that raised it
    pub fn open(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait for the gate to open, up to `limit`
    ///
    /// Returns false if the wait timed out.
    pub async fn wait(&self, limit: Duration) -> bool {
        let mut rx = self.tx.subscribe();
        let ready = tokio::time::timeout(limit, rx.wait_for(|ready| *ready))
            .await
            .is_ok_and(|waited| waited.is_ok());
        ready
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}
