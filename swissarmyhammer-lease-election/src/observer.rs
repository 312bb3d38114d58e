//! Leader observation for one election cycle
//!
//! The observer merges five event sources into a single loop:
//!
//! - the campaign write, which fails the cycle if it errors
//! - loss of the session lease, which fails the cycle at any point
//! - leader change notifications, the primary path
//! - a periodic point read of the leader, which catches a notification
//!   stream that has silently stopped delivering
//! - cancellation of the election, which ends the cycle cleanly
//!
//! A lost lease means the candidacy is gone from the service, so the cycle
//! ends and the supervisor campaigns again under a fresh session.
//!
//! Observations are applied in the order they are processed, whichever path
//! they come from.

use std::time::Duration;

use futures::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::campaign::Campaign;
use crate::candidate::Candidate;
use crate::coordinator::LeaseSession;
use crate::error::{CoordinatorError, ElectionError, Result};
use crate::state::{LeadershipState, ReadinessGate};

/// Where a leader observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Notification,
    Poll,
}

pub struct LeaderObserver<'a> {
    candidate: &'a Candidate,
    leadership: &'a LeadershipState,
    readiness: &'a ReadinessGate,
    poll_interval: Duration,
    max_poll_failures: u32,
}

impl<'a> LeaderObserver<'a> {
    pub fn new(
        candidate: &'a Candidate,
        leadership: &'a LeadershipState,
        readiness: &'a ReadinessGate,
        poll_interval: Duration,
        max_poll_failures: u32,
    ) -> Self {
        Self {
            candidate,
            leadership,
            readiness,
            poll_interval,
            max_poll_failures,
        }
    }

    /// Observe the leader until the cycle fails or `cancel` fires
    ///
    /// Returns `Ok(())` only on cancellation. Every other exit is a cycle
    /// failure: a failed campaign, a lost session lease, a closed
    /// notification stream, a poll reporting that nobody holds the key, or
    /// too many consecutive poll errors.
    pub async fn run<S: LeaseSession>(
        &self,
        session: &S,
        campaign: &mut Campaign,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let key = self.candidate.election_key();
        let mut notifications = session.observe(key);
        let mut poll = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut poll_failures = 0u32;
        let lease_lost = session.done();
        tokio::pin!(lease_lost);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Observer cancelled");
                    return Ok(());
                }

                result = campaign.outcome(), if campaign.is_pending() => result?,

                _ = &mut lease_lost => {
                    return Err(ElectionError::Observation {
                        reason: "session lease lost".to_string(),
                        source: Some(CoordinatorError::SessionExpired(session.lease_id())),
                    });
                }

                event = notifications.next() => match event {
                    Some(Some(leader)) if !leader.is_empty() => {
                        poll_failures = 0;
                        self.observe(&leader, Source::Notification);
                    }
                    Some(_) => trace!("Notification without a leader value"),
                    None => return Err(ElectionError::observation("leader notification stream closed")),
                },

                _ = poll.tick() => {
                    let read = tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        read = tokio::time::timeout(self.poll_interval, session.leader(key)) => read,
                    };
                    match read {
                        Ok(Ok(leader)) if !leader.is_empty() => {
                            poll_failures = 0;
                            self.observe(&leader, Source::Poll);
                        }
                        Ok(Ok(_)) | Ok(Err(CoordinatorError::NoLeader)) => {
                            return Err(ElectionError::Observation {
                                reason: "poll found no leader".to_string(),
                                source: Some(CoordinatorError::NoLeader),
                            });
                        }
                        Ok(Err(e)) => {
                            poll_failures += 1;
                            self.check_poll_failures(poll_failures, e)?;
                        }
                        Err(_) => {
                            poll_failures += 1;
                            let e = CoordinatorError::Unavailable("leader read timed out".to_string());
                            self.check_poll_failures(poll_failures, e)?;
                        }
                    }
                }
            }
        }
    }

    fn check_poll_failures(&self, failures: u32, error: CoordinatorError) -> Result<()> {
        if self.max_poll_failures > 0 && failures >= self.max_poll_failures {
            return Err(ElectionError::Observation {
                reason: format!("{} consecutive leader polls failed", failures),
                source: Some(error),
            });
        }
        warn!(failures, error = %error, "Leader poll failed");
        Ok(())
    }

    fn observe(&self, leader: &str, source: Source) {
        let is_self = self.candidate.is(leader);
        if self.leadership.set(is_self) {
            if is_self {
                info!(candidate = self.candidate.id(), ?source, "Became leader");
            } else {
                info!(candidate = self.candidate.id(), leader, ?source, "Lost leadership");
            }
        } else {
            trace!(leader, ?source, "Leader unchanged");
        }

        if self.readiness.open() {
            info!(candidate = self.candidate.id(), leader, "Election ready");
        }
    }
}
