//! Candidacy registration for one election cycle

use std::future;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use crate::coordinator::LeaseSession;
use crate::error::{CoordinatorError, ElectionError};

/// An in-flight candidacy write
///
/// The write is driven by whoever awaits [`Campaign::outcome`], so it makes
/// progress only inside the observer's event loop and is dropped with the
/// cycle. No retries happen here; a failed campaign fails the cycle.
pub struct Campaign {
    pending: Option<BoxFuture<'static, Result<(), CoordinatorError>>>,
}

impl Campaign {
    /// Begin campaigning for `key` with `candidate_id` under `session`
    pub fn start<S: LeaseSession>(session: Arc<S>, key: &str, candidate_id: &str) -> Self {
        let key = key.to_string();
        let candidate_id = candidate_id.to_string();
        let write = async move { session.campaign(&key, &candidate_id).await };
        Self {
            pending: Some(Box::pin(write)),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve the campaign
    ///
    /// Cancel-safe: dropping this future before it completes leaves the write
    /// in flight for the next call. Once the write has resolved this future
    /// never completes again.
    pub async fn outcome(&mut self) -> Result<(), ElectionError> {
        let Some(write) = self.pending.as_mut() else {
            return future::pending().await;
        };
        let result = write.as_mut().await;
        self.pending = None;
        match result {
            Ok(()) => {
                debug!("Candidacy committed");
                Ok(())
            }
            Err(e) => Err(ElectionError::Campaign(e)),
        }
    }
}
