//! Capabilities consumed from the coordination service
//!
//! The election only needs a handful of operations from an etcd-like store:
//! lease-bound sessions, a candidacy write, a point read of the current leader
//! and a stream of leader changes. Client crates implement these traits over
//! their wire protocol; [`MemoryCoordinator`](crate::memory::MemoryCoordinator)
//! implements them in-process.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::CoordinatorError;

/// Server-assigned lease identifier
pub type LeaseId = i64;

/// Push notifications of the leader value for one key
///
/// `None` means the key currently has no leader. The stream may end without
/// warning when the underlying transport fails.
pub type LeaderStream = BoxStream<'static, Option<String>>;

/// Entry point to a coordination service
#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Session type handed out by this service
    type Session: LeaseSession;

    /// Negotiate a new lease-bound session
    ///
    /// The implementation keeps the lease alive until the session is closed or
    /// the connection to the service is lost.
    async fn create_session(&self, ttl: Duration) -> Result<Self::Session, CoordinatorError>;
}

/// A lease-bound session
///
/// Everything written through a session is revoked by the service when the
/// session is closed or its lease expires.
#[async_trait]
pub trait LeaseSession: Send + Sync + 'static {
    fn lease_id(&self) -> LeaseId;

    /// Register `value` as a candidate under `key`
    ///
    /// Resolves once the registration is durably committed. This does not
    /// imply leadership; the service orders candidates by arrival and the
    /// earliest live one is the leader.
    async fn campaign(&self, key: &str, value: &str) -> Result<(), CoordinatorError>;

    /// Point read of the current leader value
    ///
    /// Returns [`CoordinatorError::NoLeader`] when no candidate is registered.
    async fn leader(&self, key: &str) -> Result<String, CoordinatorError>;

    /// Subscribe to leader changes for `key`
    fn observe(&self, key: &str) -> LeaderStream;

    /// Resolves once the lease has expired or been revoked
    ///
    /// Never resolves while the service keeps the lease alive.
    async fn done(&self);

    /// Revoke the lease and everything registered under it
    async fn close(&self) -> Result<(), CoordinatorError>;
}
