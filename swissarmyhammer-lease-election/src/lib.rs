//! Lease-based leader election over an etcd-like coordination service.
//!
//! Any number of processes may race for the same election key. Each one holds
//! a [`LeaderElection`] and asks it [`is_leader`](LeaderElection::is_leader)
//! whenever it needs to know whether it is the exclusive leader right now.
//!
//! # Overview
//!
//! - **Lease-bound**: candidacy is registered under a session lease, so a
//!   crashed leader is replaced once its TTL lapses
//! - **Self-healing**: a background supervisor re-enters the race after any
//!   session, campaign or notification failure, with backoff
//! - **Push and poll**: leader changes arrive through a watch stream, and a
//!   periodic point read catches a stream that silently stopped delivering
//! - **Fast release**: [`close`](LeaderElection::close) revokes the session
//!   so a follower can take over without waiting for the TTL
//! - **Pluggable**: the coordination service is reached through the
//!   [`Coordinator`] and [`LeaseSession`] traits; [`MemoryCoordinator`] is an
//!   in-process implementation for tests
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use swissarmyhammer_lease_election::{LeaderElection, MemoryCoordinator};
//!
//! let coordinator = Arc::new(MemoryCoordinator::new());
//! let election = LeaderElection::new(coordinator, "/services/scheduler/leader");
//!
//! // Waits until some candidate is known to lead
//! election.start().await?;
//!
//! if election.is_leader() {
//!     // Run the singleton work
//! }
//!
//! // Hand leadership over right away
//! election.close().await?;
//! ```
//!
//! # Custom Configuration
//!
//! ```ignore
//! use std::time::Duration;
//! use swissarmyhammer_lease_election::{ElectionConfig, LeaderElection};
//!
//! let config = ElectionConfig::new()
//!     .with_ttl(Duration::from_secs(5))
//!     .with_poll_interval(Duration::from_secs(10))
//!     .with_id_prefix("10.0.0.7");
//!
//! let election = LeaderElection::with_config(coordinator, "/services/scheduler/leader", config)?;
//! ```
//!
//! Timings can also be loaded from `SAH_ELECTION_*` environment variables
//! with [`ElectionConfig::load`].

mod campaign;
mod candidate;
mod config;
mod coordinator;
mod election;
mod error;
pub mod memory;
mod observer;
mod session;
mod state;
mod supervisor;

pub use candidate::Candidate;
pub use config::{ElectionConfig, ENV_PREFIX};
pub use coordinator::{Coordinator, LeaderStream, LeaseId, LeaseSession};
pub use election::LeaderElection;
pub use error::{CoordinatorError, ElectionError, Result};
pub use memory::{MemoryCoordinator, MemorySession, WatchMode};
pub use state::{LeadershipState, ReadinessGate};
pub use supervisor::SupervisorState;
