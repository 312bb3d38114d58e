//! Session lifecycle for election cycles

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::{Coordinator, LeaseId, LeaseSession};
use crate::error::{ElectionError, Result};

/// Creates one lease-bound session per election cycle
pub struct SessionManager<C: Coordinator> {
    coordinator: Arc<C>,
    ttl: Duration,
    timeout: Duration,
}

impl<C: Coordinator> SessionManager<C> {
    pub fn new(coordinator: Arc<C>, ttl: Duration, timeout: Duration) -> Self {
        Self {
            coordinator,
            ttl,
            timeout,
        }
    }

    /// Negotiate a fresh session
    ///
    /// Fails with [`ElectionError::SessionTimeout`] if the service does not
    /// answer within the negotiation timeout, and with
    /// [`ElectionError::Cancelled`] if `cancel` fires first.
    pub async fn create(&self, cancel: &CancellationToken) -> Result<Arc<C::Session>> {
        let negotiate = tokio::time::timeout(self.timeout, self.coordinator.create_session(self.ttl));

        tokio::select! {
            _ = cancel.cancelled() => Err(ElectionError::Cancelled),
            result = negotiate => match result {
                Ok(Ok(session)) => {
                    debug!(lease = session.lease_id(), ttl = ?self.ttl, "Session created");
                    Ok(Arc::new(session))
                }
                Ok(Err(e)) => Err(ElectionError::Session(e)),
                Err(_) => Err(ElectionError::SessionTimeout(self.timeout)),
            },
        }
    }
}

/// The session of the running cycle, shared with the election handle
///
/// The supervisor installs and removes sessions at cycle boundaries while
/// `close` may take the session from another task. Installing is refused once
/// the election is cancelled, so a session created concurrently with `close`
/// is never orphaned.
pub struct SessionSlot<S> {
    current: Mutex<Option<Arc<S>>>,
}

impl<S: LeaseSession> SessionSlot<S> {
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<S>>> {
        // A poisoned slot still holds a valid Option
        self.current.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the session for a new cycle
    ///
    /// Returns false, leaving the slot untouched, if `cancel` has fired.
    pub fn install(&self, session: Arc<S>, cancel: &CancellationToken) -> bool {
        let mut current = self.lock();
        if cancel.is_cancelled() {
            return false;
        }
        *current = Some(session);
        true
    }

    /// Remove `session` if it is still the installed one
    pub fn remove(&self, session: &Arc<S>) -> bool {
        let mut current = self.lock();
        match current.as_ref() {
            Some(installed) if Arc::ptr_eq(installed, session) => {
                *current = None;
                true
            }
            _ => false,
        }
    }

    pub fn take(&self) -> Option<Arc<S>> {
        self.lock().take()
    }

    pub fn lease_id(&self) -> Option<LeaseId> {
        self.lock().as_ref().map(|session| session.lease_id())
    }
}

impl<S: LeaseSession> Default for SessionSlot<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// Close a session that is being abandoned, logging any failure
pub async fn close_quietly<S: LeaseSession>(session: &S) {
    if let Err(e) = session.close().await {
        warn!(lease = session.lease_id(), error = %e, "Failed to close abandoned session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordinatorError;
    use crate::memory::MemoryCoordinator;

    fn manager(coordinator: &Arc<MemoryCoordinator>) -> SessionManager<MemoryCoordinator> {
        SessionManager::new(
            coordinator.clone(),
            Duration::from_secs(10),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn test_create_session() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let session = manager(&coordinator)
            .create(&CancellationToken::new())
            .await
            .unwrap();

        assert!(coordinator.is_lease_alive(session.lease_id()));
        assert_eq!(coordinator.sessions_created(), 1);
    }

    #[tokio::test]
    async fn test_create_session_unreachable() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        coordinator.set_reachable(false);

        let err = manager(&coordinator)
            .create(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ElectionError::Session(CoordinatorError::Unavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_times_out() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        coordinator.set_session_delay(Duration::from_secs(60));

        let err = manager(&coordinator)
            .create(&CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ElectionError::SessionTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_session_cancelled() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        coordinator.set_session_delay(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager(&coordinator).create(&cancel).await.unwrap_err();
        assert!(matches!(err, ElectionError::Cancelled));
    }

    #[tokio::test]
    async fn test_slot_refuses_install_after_cancel() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let session = manager(&coordinator)
            .create(&CancellationToken::new())
            .await
            .unwrap();
        let slot = SessionSlot::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(!slot.install(session, &cancel));
        assert!(slot.take().is_none());
    }

    #[tokio::test]
    async fn test_slot_remove_only_matching_session() {
        let coordinator = Arc::new(MemoryCoordinator::new());
        let manager = manager(&coordinator);
        let cancel = CancellationToken::new();
        let first = manager.create(&cancel).await.unwrap();
        let second = manager.create(&cancel).await.unwrap();
        let slot = SessionSlot::new();

        assert!(slot.install(second.clone(), &cancel));
        assert!(!slot.remove(&first));
        assert_eq!(slot.lease_id(), Some(second.lease_id()));
        assert!(slot.remove(&second));
        assert_eq!(slot.lease_id(), None);
    }
}
