//! # pg-cluster
//!
//! Connection pool and cluster routing layer for PostgreSQL clients.
//!
//! The wire protocol is not part of this crate: drivers plug in through the
//! [`Connection`] and [`Connector`] traits. On top of them the crate
//! provides:
//!
//! - [`ConnectionPool`]: a bounded pool for one host with deadline-aware
//!   acquisition, a bounded wait queue, background connection creation, a
//!   connection-error circuit breaker, asynchronous cleanup of connections
//!   released dirty and a periodic health-check ping
//! - [`Cluster`]: one pool per host, periodic topology discovery and
//!   routing of [`Cluster::begin`]/[`Cluster::start`] by host role
//! - [`InstanceStatistics`]: counters and rolling percentile windows
//! - [`PoolEvent`]: structured events delivered to an injected
//!   [`EventListener`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use pg_cluster::{Cluster, ClusterDescription, ClusterHostType, Deadline, TransactionOptions};
//! use std::time::Duration;
//!
//! let cluster = Cluster::builder(
//!     ClusterDescription::new(["host=db1 dbname=main", "host=db2 dbname=main"]),
//!     connector,
//! )
//! .build()
//! .await?;
//!
//! let deadline = Deadline::from_duration(Duration::from_millis(500));
//! let mut trx = cluster
//!     .begin(ClusterHostType::Master, TransactionOptions::new(), deadline, None)
//!     .await?;
//! trx.execute("UPDATE accounts SET balance = balance - 1 WHERE id = 42").await?;
//! trx.commit().await?;
//!
//! let stats = cluster.statistics();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cluster;
pub mod command_control;
pub mod config;
pub mod connection;
pub mod deadline;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod pool;
pub mod stats;
pub mod swap;
pub mod topology;
pub mod transaction;

// Configuration
pub use command_control::{CommandControl, CommandControlStore};
pub use config::{ClusterDescription, ClusterSettings, Dsn, PoolSettings};
pub use deadline::Deadline;

// Error types
pub use error::{ClusterError, ConfigError, ConnectionError, PoolError};

// Pool and cluster
pub use cluster::{Cluster, ClusterBuilder, ClusterStatistics, HostStatistics};
pub use connection::PooledConnection;
pub use pool::{ConnectionPool, PoolBuilder, PoolStatus};
pub use topology::{ClusterHostType, HostRole, Topology};
pub use transaction::{IsolationLevel, NonTransaction, Transaction, TransactionMode, TransactionOptions};

// Connection capability
pub use lifecycle::{Connection, ConnectionState, ConnectionStatistics, Connector};

// Observability
pub use events::{DropReason, EventListener, PoolEvent, TracingListener};
pub use stats::{ConnectionStats, InstanceStatistics, PercentileSnapshot, TransactionStats};
