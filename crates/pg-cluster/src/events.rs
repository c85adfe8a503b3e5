//! Structured pool and cluster events.
//!
//! The pool and the cluster never log through a process-wide logger
//! directly; they report [`PoolEvent`]s to an injected [`EventListener`].
//! [`TracingListener`] is the default and forwards every event to
//! `tracing`.
//!
//! Host identifiers carried by events are always credential-free.

use std::sync::Arc;

use crate::command_control::CommandControl;
use crate::topology::HostRole;

/// Target used for all events emitted by [`TracingListener`].
pub const EVENT_TARGET: &str = "pg_cluster";

/// Why a connection was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Released while no longer connected.
    Broken,
    /// Cleanup of a dirty connection failed or timed out.
    CleanupFailed,
    /// The idle queue was full.
    QueueFull,
    /// The pool was shut down.
    PoolClosed,
}

impl DropReason {
    /// Short name for log fields.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Broken => "broken",
            Self::CleanupFailed => "cleanup_failed",
            Self::QueueFull => "queue_full",
            Self::PoolClosed => "pool_closed",
        }
    }
}

/// Something worth logging happened in a pool or cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolEvent {
    /// A new connection is ready.
    ConnectionCreated {
        /// Credential-free host identifier.
        host: String,
        /// Connection id.
        id: u32,
        /// Live connections including this one.
        pool_size: usize,
    },
    /// Connection establishment failed.
    ConnectionFailed {
        /// Credential-free host identifier.
        host: String,
        /// Connection id.
        id: u32,
        /// Error description.
        error: String,
        /// Whether the failure feeds the circuit breaker.
        connectivity: bool,
    },
    /// A connection was discarded.
    ConnectionDropped {
        /// Credential-free host identifier.
        host: String,
        /// Connection id.
        id: u32,
        /// Why it was discarded.
        reason: DropReason,
    },
    /// A connection released in a busy state was cleaned up and requeued.
    CleanupSucceeded {
        /// Credential-free host identifier.
        host: String,
        /// Connection id.
        id: u32,
    },
    /// New connections are suppressed after recent failures.
    CircuitBreakerEngaged {
        /// Credential-free host identifier.
        host: String,
        /// Failures in the trailing error window.
        recent_errors: u64,
    },
    /// A caller gave up waiting for a connection.
    PoolExhausted {
        /// Credential-free host identifier.
        host: String,
        /// Callers still waiting.
        waiting: usize,
    },
    /// A caller was rejected because the wait queue was full.
    QueueSizeExceeded {
        /// Credential-free host identifier.
        host: String,
        /// Callers waiting, including the rejected one.
        waiting: usize,
    },
    /// A health-check ping failed.
    PingFailed {
        /// Credential-free host identifier.
        host: String,
        /// Connection id.
        id: u32,
        /// Error description.
        error: String,
    },
    /// Acquired connections now receive a different command control.
    CommandControlChanged {
        /// Credential-free host identifier.
        host: String,
        /// The new default.
        cmd_ctl: CommandControl,
    },
    /// The cluster published a new topology.
    TopologyChanged {
        /// Credential-free host identifiers with their new roles.
        hosts: Vec<(String, HostRole)>,
    },
}

/// Receives pool and cluster events.
pub trait EventListener: Send + Sync + 'static {
    /// Handle one event. Must not block.
    fn on_event(&self, event: &PoolEvent);
}

/// Shared handle to an event listener.
pub type DynEventListener = Arc<dyn EventListener>;

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl EventListener for TracingListener {
    fn on_event(&self, event: &PoolEvent) {
        match event {
            PoolEvent::ConnectionCreated { host, id, pool_size } => {
                tracing::trace!(target: EVENT_TARGET, host = %host, id, pool_size, "PostgreSQL connection created");
            }
            PoolEvent::ConnectionFailed {
                host,
                id,
                error,
                connectivity: true,
            } => {
                tracing::warn!(target: EVENT_TARGET, host = %host, id, error = %error, "connection attempt failed");
            }
            PoolEvent::ConnectionFailed {
                host,
                id,
                error,
                connectivity: false,
            } => {
                tracing::error!(target: EVENT_TARGET, host = %host, id, error = %error, "connection creation failed");
            }
            PoolEvent::ConnectionDropped { host, id, reason } => {
                tracing::warn!(target: EVENT_TARGET, host = %host, id, reason = reason.as_str(), "connection dropped");
            }
            PoolEvent::CleanupSucceeded { host, id } => {
                tracing::debug!(target: EVENT_TARGET, host = %host, id, "cleaned up dirty connection");
            }
            PoolEvent::CircuitBreakerEngaged {
                host,
                recent_errors,
            } => {
                tracing::debug!(target: EVENT_TARGET, host = %host, recent_errors, "too many connection errors in recent period");
            }
            PoolEvent::PoolExhausted { host, waiting } => {
                tracing::warn!(target: EVENT_TARGET, host = %host, waiting, "no available connections found");
            }
            PoolEvent::QueueSizeExceeded { host, waiting } => {
                tracing::warn!(target: EVENT_TARGET, host = %host, waiting, "wait queue size exceeded");
            }
            PoolEvent::PingFailed { host, id, error } => {
                tracing::error!(target: EVENT_TARGET, host = %host, id, error = %error, "ping failed");
            }
            PoolEvent::CommandControlChanged { host, cmd_ctl } => {
                tracing::debug!(target: EVENT_TARGET, host = %host, network = ?cmd_ctl.network, statement = ?cmd_ctl.statement, "default command control changed");
            }
            PoolEvent::TopologyChanged { hosts } => {
                tracing::info!(target: EVENT_TARGET, hosts = ?hosts, "cluster topology changed");
            }
        }
    }
}
