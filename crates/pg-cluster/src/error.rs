//! Error types for the pool and cluster.

use thiserror::Error;

/// Invalid settings detected at construction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The connection string is empty.
    #[error("PostgreSQL DSN is empty")]
    EmptyDsn,

    /// `min_size` is greater than `max_size`.
    #[error("pool max size {max} is less than requested initial size {min}")]
    InvalidPoolSize {
        /// Requested initial size.
        min: usize,
        /// Maximum size.
        max: usize,
    },

    /// The cluster description lists no hosts.
    #[error("cluster description contains no hosts")]
    EmptyCluster,

    /// A connection string could not be parsed.
    #[error("invalid DSN: {0}")]
    InvalidDsn(String),
}

/// Errors raised by a connection implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConnectionError {
    /// The operation did not complete in time.
    #[error("connection timed out")]
    Timeout,

    /// The host could not be reached or the session broke.
    #[error("connection failed: {0}")]
    Failed(String),

    /// Any other lower-level failure.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Whether this is a plain connectivity problem.
    ///
    /// Connectivity problems feed the circuit breaker and are never
    /// propagated from background connection attempts.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Timeout | Self::Failed(_))
    }
}

/// Errors returned by [`ConnectionPool`](crate::ConnectionPool) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The deadline had passed before acquisition started.
    #[error("deadline reached before trying to get a connection")]
    DeadlineExceeded,

    /// Too many callers are already waiting for a connection.
    #[error("wait queue size exceeded")]
    QueueSizeExceeded,

    /// No connection became available before the deadline.
    #[error("no available connections found")]
    PoolExhausted,

    /// The pool has been shut down.
    #[error("connection pool is closed")]
    PoolClosed,

    /// Invalid pool settings.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Connection establishment or a statement failed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Errors returned by [`Cluster`](crate::Cluster) operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ClusterError {
    /// The current topology has no host of the requested role.
    #[error("no host of requested role {0:?} available")]
    NoHostOfRequestedRole(crate::topology::ClusterHostType),

    /// Invalid cluster settings.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The selected pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Result alias for pool operations.
pub type Result<T, E = PoolError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_classification() {
        assert!(ConnectionError::Timeout.is_connectivity());
        assert!(ConnectionError::Failed("refused".into()).is_connectivity());
        assert!(!ConnectionError::Protocol("bad auth".into()).is_connectivity());
    }

    #[test]
    fn test_config_error_message() {
        let err = PoolError::from(ConfigError::InvalidPoolSize { min: 5, max: 2 });
        assert_eq!(
            err.to_string(),
            "configuration error: pool max size 2 is less than requested initial size 5"
        );
    }
}
