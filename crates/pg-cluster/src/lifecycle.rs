//! Connection capability consumed by the pool.
//!
//! The wire protocol lives outside this crate. A driver plugs in by
//! implementing [`Connection`] for its session type and [`Connector`] for
//! the factory that opens sessions.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::command_control::CommandControl;
use crate::config::Dsn;
use crate::error::ConnectionError;
use crate::topology::HostRole;
use crate::transaction::TransactionOptions;

/// Observable state of a physical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Connection establishment is still running.
    Connecting,
    /// Connected and ready for reuse.
    Idle,
    /// A statement is running or results are pending.
    Busy,
    /// Inside a transaction block.
    InTransaction,
    /// The session is unusable.
    Broken,
}

/// Per-connection counters, taken and reset by the pool on release.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatistics {
    /// Transactions started.
    pub trx_total: u64,
    /// Transactions committed.
    pub commit_total: u64,
    /// Transactions rolled back.
    pub rollback_total: u64,
    /// Statements executed outside of a transaction.
    pub out_of_trx: u64,
    /// Parse requests.
    pub parse_total: u64,
    /// Execute requests.
    pub execute_total: u64,
    /// Replies received.
    pub reply_total: u64,
    /// Binary replies received.
    pub bin_reply_total: u64,
    /// Failed executions.
    pub error_execute_total: u64,
    /// Executions that timed out.
    pub execute_timeout: u64,
    /// Start of the last transaction.
    pub trx_start_time: Option<Instant>,
    /// End of the last transaction.
    pub trx_end_time: Option<Instant>,
    /// First statement of the last transaction.
    pub work_start_time: Option<Instant>,
    /// Completion of the last statement.
    pub last_execute_finish: Option<Instant>,
    /// Time spent executing statements.
    pub sum_query_duration: Duration,
}

/// One physical database session.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Identifier assigned by the pool at connect time.
    fn id(&self) -> u32;

    /// Current session state.
    fn state(&self) -> ConnectionState;

    /// Whether the session can be reused as is.
    fn is_idle(&self) -> bool {
        self.state() == ConnectionState::Idle
    }

    /// Whether the session is still connected, whatever its state.
    fn is_connected(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Broken | ConnectionState::Connecting
        )
    }

    /// Whether a transaction block is open.
    fn is_in_transaction(&self) -> bool {
        self.state() == ConnectionState::InTransaction
    }

    /// Time since the session last did any work.
    fn idle_duration(&self) -> Duration;

    /// Apply the timeouts used for subsequent operations.
    fn set_default_command_control(&mut self, cmd_ctl: CommandControl);

    /// Round-trip to the server to check the session.
    async fn ping(&mut self) -> Result<(), ConnectionError>;

    /// Bring a busy or dirty session back to idle within `timeout`.
    async fn cleanup(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &str) -> Result<u64, ConnectionError>;

    /// Open a transaction block.
    async fn begin(&mut self, options: &TransactionOptions) -> Result<(), ConnectionError>;

    /// Commit the open transaction block.
    async fn commit(&mut self) -> Result<(), ConnectionError>;

    /// Roll back the open transaction block.
    async fn rollback(&mut self) -> Result<(), ConnectionError>;

    /// Role the server currently plays in its cluster.
    async fn host_role(&mut self) -> Result<HostRole, ConnectionError>;

    /// Take the counters accumulated since the previous call.
    fn take_statistics(&mut self) -> ConnectionStatistics;
}

/// Opens new sessions.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `dsn`, tagging the session with `id`.
    async fn connect(
        &self,
        dsn: &Dsn,
        id: u32,
        cmd_ctl: CommandControl,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

#[async_trait]
impl<T: Connector + ?Sized> Connector for std::sync::Arc<T> {
    async fn connect(
        &self,
        dsn: &Dsn,
        id: u32,
        cmd_ctl: CommandControl,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        (**self).connect(dsn, id, cmd_ctl).await
    }
}
