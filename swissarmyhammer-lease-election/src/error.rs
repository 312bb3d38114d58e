//! Error types for lease-based leader election

use std::time::Duration;

/// Errors reported by a coordination-service client
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The coordination service could not be reached
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    /// The lease backing the session has expired or been revoked
    #[error("Session lease {0} expired")]
    SessionExpired(i64),

    /// No candidate is currently registered under the election key
    #[error("Election has no leader")]
    NoLeader,

    /// The operation was abandoned before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// Any other client-side failure
    #[error("{0}")]
    Other(String),
}

/// Errors that can occur during leader election
#[derive(Debug, thiserror::Error)]
pub enum ElectionError {
    /// Failed to negotiate a session with the coordination service
    #[error("Failed to create session: {0}")]
    Session(#[source] CoordinatorError),

    /// Session negotiation did not finish in time
    #[error("Session negotiation timed out after {0:?}")]
    SessionTimeout(Duration),

    /// The candidacy registration was lost or abandoned
    #[error("Campaign failed: {0}")]
    Campaign(#[source] CoordinatorError),

    /// Leader observation can no longer be trusted
    #[error("Leader observation failed: {reason}")]
    Observation {
        reason: String,
        #[source]
        source: Option<CoordinatorError>,
    },

    /// No leader was determined within the readiness window
    #[error("Wait for election ready timed out after {0:?}")]
    ReadinessTimeout(Duration),

    /// `start` was called on an election that is already running
    #[error("Election already started")]
    AlreadyStarted,

    /// Closing the active session failed
    #[error("Failed to close session: {0}")]
    Close(#[source] CoordinatorError),

    /// A configuration value is out of range
    #[error("Invalid election configuration for '{key}': {message}")]
    InvalidConfig { key: String, message: String },

    /// Configuration could not be extracted
    #[error("Failed to load election configuration: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The election was shut down while the operation was pending
    #[error("Election cancelled")]
    Cancelled,
}

impl ElectionError {
    /// Observation failure without an underlying client error
    pub fn observation(reason: impl Into<String>) -> Self {
        Self::Observation {
            reason: reason.into(),
            source: None,
        }
    }

    /// True for the failures the supervisor recovers from by starting a new cycle
    pub fn is_cycle_failure(&self) -> bool {
        matches!(
            self,
            Self::Session(_) | Self::SessionTimeout(_) | Self::Campaign(_) | Self::Observation { .. }
        )
    }
}

impl From<figment::Error> for ElectionError {
    fn from(error: figment::Error) -> Self {
        Self::Config(Box::new(error))
    }
}

/// Result type for election operations
pub type Result<T> = std::result::Result<T, ElectionError>;
