//! # pg-cluster-testing
//!
//! Test infrastructure for `pg-cluster`.
//!
//! Provides a scriptable in-memory [`MockConnector`] whose connections
//! behave like PostgreSQL sessions as far as the pool can observe them,
//! and a [`RecordingListener`] that collects pool and cluster events.
//!
//! Pool and cluster integration tests live in this crate (under `tests/`)
//! so that `pg-cluster` itself does not need a dev-dependency cycle.
//!
//! ## Example
//!
//! ```rust,ignore
//! use pg_cluster::{ConnectionPool, Deadline};
//! use pg_cluster_testing::MockConnector;
//!
//! let connector = MockConnector::new();
//! let pool = ConnectionPool::builder("host=db1", connector.clone())
//!     .min_size(1)
//!     .build()
//!     .await?;
//! assert_eq!(connector.connect_attempts(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pg_cluster::{
    CommandControl, Connection, ConnectionError, ConnectionState, ConnectionStatistics,
    Connector, Dsn, EventListener, HostRole, PoolEvent, TransactionOptions,
};
use tokio::time::Instant;

/// Statement that makes a mock session break, like a terminated backend.
pub const TERMINATE_BACKEND: &str = "SELECT pg_terminate_backend(pg_backend_pid())";

/// What [`Connection::cleanup`] does on mock sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CleanupBehavior {
    /// Roll back and become idle.
    #[default]
    Succeed,
    /// Fail with a connectivity error.
    Fail,
    /// Never finish.
    Hang,
}

#[derive(Debug, Default)]
struct Script {
    connect_failure: Option<ConnectionError>,
    connect_delay: Duration,
    roles: HashMap<String, HostRole>,
    cleanup: CleanupBehavior,
    last_cmd_ctl: Option<CommandControl>,
}

#[derive(Debug, Default)]
struct Shared {
    script: Mutex<Script>,
    connect_attempts: AtomicUsize,
    probes: AtomicUsize,
    alive: AtomicUsize,
    peak_alive: AtomicUsize,
    pings: AtomicUsize,
    cleanups: AtomicUsize,
    fail_pings: AtomicBool,
}

/// Scriptable [`Connector`] producing in-memory sessions.
///
/// Clones share their script and counters, so a test keeps one clone and
/// hands another to the pool or cluster.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    shared: Arc<Shared>,
}

impl MockConnector {
    /// Create a connector whose hosts are all healthy primaries.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent connects fail with `error`, or succeed again with `None`.
    pub fn set_connect_failure(&self, error: Option<ConnectionError>) {
        self.shared.script.lock().connect_failure = error;
    }

    /// Delay every subsequent connect.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.shared.script.lock().connect_delay = delay;
    }

    /// Set the role reported by `dsn`. Unavailable hosts refuse connections.
    pub fn set_role(&self, dsn: &str, role: HostRole) {
        self.shared.script.lock().roles.insert(dsn.to_string(), role);
    }

    /// Set several roles in one step.
    pub fn set_roles(&self, roles: &[(&str, HostRole)]) {
        let mut script = self.shared.script.lock();
        for (dsn, role) in roles {
            script.roles.insert((*dsn).to_string(), *role);
        }
    }

    /// Choose what cleanup of dirty sessions does.
    pub fn set_cleanup(&self, behavior: CleanupBehavior) {
        self.shared.script.lock().cleanup = behavior;
    }

    /// Make pings fail and break the session.
    pub fn set_fail_pings(&self, fail: bool) {
        self.shared.fail_pings.store(fail, Ordering::SeqCst);
    }

    /// Pool connects attempted, successful or not. Topology probes excluded.
    #[must_use]
    pub fn connect_attempts(&self) -> usize {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Topology probes attempted.
    #[must_use]
    pub fn probes(&self) -> usize {
        self.shared.probes.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    #[must_use]
    pub fn alive(&self) -> usize {
        self.shared.alive.load(Ordering::SeqCst)
    }

    /// Most sessions open at the same time.
    #[must_use]
    pub fn peak_alive(&self) -> usize {
        self.shared.peak_alive.load(Ordering::SeqCst)
    }

    /// Pings answered or failed.
    #[must_use]
    pub fn pings(&self) -> usize {
        self.shared.pings.load(Ordering::SeqCst)
    }

    /// Cleanups started.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.shared.cleanups.load(Ordering::SeqCst)
    }

    /// Command control most recently applied to any session.
    #[must_use]
    pub fn last_command_control(&self) -> Option<CommandControl> {
        self.shared.script.lock().last_cmd_ctl
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        dsn: &Dsn,
        id: u32,
        cmd_ctl: CommandControl,
    ) -> Result<Box<dyn Connection>, ConnectionError> {
        // Topology probes use id 0.
        if id == 0 {
            self.shared.probes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.shared.connect_attempts.fetch_add(1, Ordering::SeqCst);
        }

        let (delay, failure, role) = {
            let script = self.shared.script.lock();
            (
                script.connect_delay,
                script.connect_failure.clone(),
                script
                    .roles
                    .get(dsn.as_str())
                    .copied()
                    .unwrap_or(HostRole::Master),
            )
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }
        if role == HostRole::Unavailable {
            return Err(ConnectionError::Failed(format!("could not connect to {dsn}")));
        }

        let alive = self.shared.alive.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.peak_alive.fetch_max(alive, Ordering::SeqCst);
        tracing::trace!(dsn = %dsn, id, "mock session opened");

        Ok(Box::new(MockConnection {
            id,
            dsn: dsn.as_str().to_string(),
            state: ConnectionState::Idle,
            last_activity: Instant::now(),
            cmd_ctl,
            stats: ConnectionStatistics {
                // Handshake traffic the pool is expected to discard.
                execute_total: 1,
                ..ConnectionStatistics::default()
            },
            shared: Arc::clone(&self.shared),
        }))
    }
}

/// In-memory session handed out by [`MockConnector`].
#[derive(Debug)]
pub struct MockConnection {
    id: u32,
    dsn: String,
    state: ConnectionState,
    last_activity: Instant,
    cmd_ctl: CommandControl,
    stats: ConnectionStatistics,
    shared: Arc<Shared>,
}

impl MockConnection {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn finish_transaction(&mut self) {
        let now = Instant::now();
        self.stats.trx_end_time = Some(now);
        self.state = ConnectionState::Idle;
        self.last_activity = now;
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn id(&self) -> u32 {
        self.id
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn idle_duration(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_activity)
    }

    fn set_default_command_control(&mut self, cmd_ctl: CommandControl) {
        self.cmd_ctl = cmd_ctl;
        self.shared.script.lock().last_cmd_ctl = Some(cmd_ctl);
    }

    async fn ping(&mut self) -> Result<(), ConnectionError> {
        self.shared.pings.fetch_add(1, Ordering::SeqCst);
        if self.shared.fail_pings.load(Ordering::SeqCst) {
            self.state = ConnectionState::Broken;
            return Err(ConnectionError::Failed("server closed the connection".into()));
        }
        self.touch();
        Ok(())
    }

    async fn cleanup(&mut self, timeout: Duration) -> Result<(), ConnectionError> {
        self.shared.cleanups.fetch_add(1, Ordering::SeqCst);
        let behavior = self.shared.script.lock().cleanup;
        match behavior {
            CleanupBehavior::Succeed => {
                if self.state == ConnectionState::InTransaction {
                    self.stats.rollback_total += 1;
                    self.finish_transaction();
                } else {
                    self.state = ConnectionState::Idle;
                    self.touch();
                }
                Ok(())
            }
            CleanupBehavior::Fail => {
                self.state = ConnectionState::Broken;
                Err(ConnectionError::Failed("cleanup failed".into()))
            }
            CleanupBehavior::Hang => {
                tokio::time::sleep(timeout * 2).await;
                Err(ConnectionError::Timeout)
            }
        }
    }

    async fn execute(&mut self, statement: &str) -> Result<u64, ConnectionError> {
        if self.state == ConnectionState::Broken {
            return Err(ConnectionError::Failed("connection is broken".into()));
        }
        let now = Instant::now();
        self.stats.execute_total += 1;
        self.stats.last_execute_finish = Some(now);
        if statement == TERMINATE_BACKEND {
            self.state = ConnectionState::Broken;
            return Err(ConnectionError::Failed(
                "terminating connection due to administrator command".into(),
            ));
        }
        if self.state == ConnectionState::InTransaction {
            self.stats.work_start_time.get_or_insert(now);
        } else {
            self.stats.out_of_trx += 1;
        }
        self.touch();
        Ok(1)
    }

    async fn begin(&mut self, options: &TransactionOptions) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Idle {
            return Err(ConnectionError::Protocol(format!(
                "cannot run {} in state {:?}",
                options.begin_statement(),
                self.state
            )));
        }
        let now = Instant::now();
        self.stats.trx_total += 1;
        self.stats.trx_start_time = Some(now);
        self.stats.work_start_time = None;
        self.stats.trx_end_time = None;
        self.state = ConnectionState::InTransaction;
        self.last_activity = now;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::InTransaction {
            return Err(ConnectionError::Protocol("no transaction in progress".into()));
        }
        self.stats.commit_total += 1;
        self.finish_transaction();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::InTransaction {
            return Err(ConnectionError::Protocol("no transaction in progress".into()));
        }
        self.stats.rollback_total += 1;
        self.finish_transaction();
        Ok(())
    }

    async fn host_role(&mut self) -> Result<HostRole, ConnectionError> {
        let role = self
            .shared
            .script
            .lock()
            .roles
            .get(&self.dsn)
            .copied()
            .unwrap_or(HostRole::Master);
        Ok(role)
    }

    fn take_statistics(&mut self) -> ConnectionStatistics {
        std::mem::take(&mut self.stats)
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.shared.alive.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`EventListener`] that keeps every event it receives.
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<PoolEvent>>>,
}

impl RecordingListener {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far, oldest first.
    #[must_use]
    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().clone()
    }

    /// Number of received events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&PoolEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    /// Forget all received events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &PoolEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Poll `condition` until it holds, yielding to other tasks in between.
///
/// With paused time every poll advances the clock by a millisecond, so
/// give up after `limit` of virtual time.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_mock_session_lifecycle() {
        let connector = MockConnector::new();
        let mut conn = connector
            .connect(&Dsn::new("host=db1"), 7, CommandControl::default())
            .await
            .unwrap();
        assert_eq!(conn.id(), 7);
        assert_eq!(connector.alive(), 1);
        assert_eq!(connector.connect_attempts(), 1);

        conn.begin(&TransactionOptions::new()).await.unwrap();
        assert!(conn.is_in_transaction());
        conn.execute("UPDATE t SET x = 1").await.unwrap();
        conn.commit().await.unwrap();
        assert!(conn.is_idle());

        let stats = conn.take_statistics();
        assert_eq!(stats.trx_total, 1);
        assert_eq!(stats.commit_total, 1);
        assert_eq!(conn.take_statistics(), ConnectionStatistics::default());

        assert!(conn.execute(TERMINATE_BACKEND).await.is_err());
        assert!(!conn.is_connected());

        drop(conn);
        assert_eq!(connector.alive(), 0);
        assert_eq!(connector.peak_alive(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_roles_and_probes() {
        let connector = MockConnector::new();
        connector.set_role("host=db2", HostRole::SyncSlave);
        connector.set_role("host=db3", HostRole::Unavailable);

        let mut conn = connector
            .connect(&Dsn::new("host=db2"), 0, CommandControl::default())
            .await
            .unwrap();
        assert_eq!(conn.host_role().await.unwrap(), HostRole::SyncSlave);
        assert_eq!(connector.probes(), 1);
        assert_eq!(connector.connect_attempts(), 0);

        let refused = connector
            .connect(&Dsn::new("host=db3"), 1, CommandControl::default())
            .await;
        assert!(matches!(refused, Err(ConnectionError::Failed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_mock_idle_duration_resets_on_ping() {
        let connector = MockConnector::new();
        let mut conn = connector
            .connect(&Dsn::new("host=db1"), 1, CommandControl::default())
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(conn.idle_duration() >= Duration::from_secs(20));
        conn.ping().await.unwrap();
        assert!(conn.idle_duration() < Duration::from_secs(1));
    }
}
