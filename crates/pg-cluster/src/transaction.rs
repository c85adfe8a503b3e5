//! Transaction and single-statement handles.

use tokio::time::Instant;

use crate::command_control::CommandControl;
use crate::connection::PooledConnection;
use crate::deadline::Deadline;
use crate::error::ConnectionError;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    /// Read committed (PostgreSQL default).
    #[default]
    ReadCommitted,
    /// Repeatable read.
    RepeatableRead,
    /// Serializable.
    Serializable,
    /// Read uncommitted (behaves as read committed in PostgreSQL).
    ReadUncommitted,
}

impl IsolationLevel {
    /// SQL spelling of the level.
    #[must_use]
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
            Self::ReadUncommitted => "READ UNCOMMITTED",
        }
    }
}

/// Access mode of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionMode {
    /// Reads and writes.
    #[default]
    ReadWrite,
    /// Reads only.
    ReadOnly,
    /// Read only and deferrable (serializable snapshots without aborts).
    Deferrable,
}

/// Options of a transaction block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionOptions {
    /// Isolation level.
    pub isolation_level: IsolationLevel,
    /// Access mode.
    pub mode: TransactionMode,
}

impl TransactionOptions {
    /// Default options: read committed, read write.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the isolation level.
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Make the transaction read only.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.mode = TransactionMode::ReadOnly;
        self
    }

    /// Make the transaction read only and deferrable.
    #[must_use]
    pub fn deferrable(mut self) -> Self {
        self.mode = TransactionMode::Deferrable;
        self
    }

    /// The statement that opens a transaction with these options.
    #[must_use]
    pub fn begin_statement(&self) -> String {
        let mut statement = format!("BEGIN ISOLATION LEVEL {}", self.isolation_level.as_sql());
        match self.mode {
            TransactionMode::ReadWrite => {}
            TransactionMode::ReadOnly => statement.push_str(", READ ONLY"),
            TransactionMode::Deferrable => statement.push_str(", READ ONLY, DEFERRABLE"),
        }
        statement
    }
}

/// An open transaction on a pooled connection.
///
/// Dropping the handle without committing leaves the connection inside a
/// transaction block; the pool rolls it back in the background before the
/// connection is reused.
#[derive(Debug)]
pub struct Transaction {
    conn: PooledConnection,
    options: TransactionOptions,
    cmd_ctl: Option<CommandControl>,
    start_time: Instant,
    finished: bool,
}

impl Transaction {
    pub(crate) async fn begin(
        mut conn: PooledConnection,
        options: TransactionOptions,
        cmd_ctl: Option<CommandControl>,
        start_time: Instant,
    ) -> Result<Self, ConnectionError> {
        if let Some(cmd_ctl) = cmd_ctl {
            conn.set_default_command_control(cmd_ctl);
        }
        tracing::debug!(
            id = conn.id(),
            isolation_level = options.isolation_level.as_sql(),
            "beginning transaction"
        );
        conn.begin(&options).await?;
        Ok(Self {
            conn,
            options,
            cmd_ctl,
            start_time,
            finished: false,
        })
    }

    /// Execute a statement inside the transaction.
    pub async fn execute(&mut self, statement: &str) -> Result<u64, ConnectionError> {
        self.conn.execute(statement).await
    }

    /// Commit the transaction.
    pub async fn commit(mut self) -> Result<(), ConnectionError> {
        tracing::debug!(id = self.conn.id(), "committing transaction");
        self.finished = true;
        self.conn.commit().await
    }

    /// Roll back the transaction.
    pub async fn rollback(mut self) -> Result<(), ConnectionError> {
        tracing::debug!(id = self.conn.id(), "rolling back transaction");
        self.finished = true;
        self.conn.rollback().await
    }

    /// Options the transaction was started with.
    #[must_use]
    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Command control override, if any.
    #[must_use]
    pub fn command_control(&self) -> Option<CommandControl> {
        self.cmd_ctl
    }

    /// When the caller asked for the transaction.
    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.conn.is_in_transaction() {
            tracing::warn!(
                id = self.conn.id(),
                "transaction handle dropped without commit or rollback"
            );
        }
    }
}

/// A pooled connection used for statements outside of a transaction.
#[derive(Debug)]
pub struct NonTransaction {
    conn: PooledConnection,
    deadline: Deadline,
    start_time: Instant,
}

impl NonTransaction {
    pub(crate) fn new(conn: PooledConnection, deadline: Deadline, start_time: Instant) -> Self {
        Self {
            conn,
            deadline,
            start_time,
        }
    }

    /// Execute a single statement, bounded by the deadline given at start.
    pub async fn execute(&mut self, statement: &str) -> Result<u64, ConnectionError> {
        if self.deadline.is_reached() {
            return Err(ConnectionError::Timeout);
        }
        match self.deadline.instant() {
            Some(at) => tokio::time::timeout_at(at, self.conn.execute(statement))
                .await
                .unwrap_or(Err(ConnectionError::Timeout)),
            None => self.conn.execute(statement).await,
        }
    }

    /// When the caller asked for the session.
    #[must_use]
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Underlying connection.
    #[must_use]
    pub fn connection(&self) -> &PooledConnection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_statement() {
        assert_eq!(
            TransactionOptions::new().begin_statement(),
            "BEGIN ISOLATION LEVEL READ COMMITTED"
        );
        assert_eq!(
            TransactionOptions::new()
                .isolation_level(IsolationLevel::Serializable)
                .deferrable()
                .begin_statement(),
            "BEGIN ISOLATION LEVEL SERIALIZABLE, READ ONLY, DEFERRABLE"
        );
        assert_eq!(
            TransactionOptions::new()
                .isolation_level(IsolationLevel::RepeatableRead)
                .read_only()
                .begin_statement(),
            "BEGIN ISOLATION LEVEL REPEATABLE READ, READ ONLY"
        );
    }
}
