//! Connection pool for a single host.
//!
//! The pool keeps a bounded queue of idle connections. Acquisition takes an
//! idle connection if there is one; otherwise the caller joins a bounded
//! wait queue, a new connection is started in the background (unless the
//! pool is full or the host failed recently) and the caller waits until
//! some connection is returned or created.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::command_control::{CommandControl, CommandControlStore};
use crate::config::{Dsn, PoolSettings};
use crate::connection::PooledConnection;
use crate::deadline::Deadline;
use crate::error::{ConnectionError, PoolError, Result};
use crate::events::{DropReason, DynEventListener, EventListener, PoolEvent, TracingListener};
use crate::lifecycle::{Connection, Connector};
use crate::stats::{Counter, InstanceStatistics, PoolStatistics, RecentPeriod, Stopwatch};
use crate::transaction::{NonTransaction, Transaction, TransactionOptions};

/// Connection failures in the trailing window that stop new attempts.
const RECENT_ERROR_THRESHOLD: u64 = 2;
/// Length of the trailing connection error window.
const RECENT_ERROR_PERIOD: Duration = Duration::from_secs(15);
/// Granularity of the connection error window.
const RECENT_ERROR_EPOCH: Duration = Duration::from_secs(1);

const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Idle connections older than this are pinged by the health task.
const MAX_IDLE_DURATION: Duration = Duration::from_secs(15);
/// Cleanup of a dirty connection may take this many network timeouts.
const CLEANUP_TIMEOUT_FACTOR: u32 = 10;

/// Counts one live connection for as long as it exists.
pub(crate) struct SharedSizeGuard {
    size: Arc<AtomicUsize>,
    value: usize,
}

impl SharedSizeGuard {
    fn new(size: &Arc<AtomicUsize>) -> Self {
        let value = size.fetch_add(1, Ordering::AcqRel) + 1;
        Self {
            size: Arc::clone(size),
            value,
        }
    }

    /// Counter value right after this guard was taken.
    fn value(&self) -> usize {
        self.value
    }
}

impl Drop for SharedSizeGuard {
    fn drop(&mut self) {
        self.size.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts one waiting caller for the duration of a wait.
struct WaitGuard<'a> {
    count: &'a AtomicUsize,
    value: usize,
}

impl<'a> WaitGuard<'a> {
    fn new(count: &'a AtomicUsize) -> Self {
        let value = count.fetch_add(1, Ordering::AcqRel) + 1;
        Self { count, value }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A connection owned by the pool together with its slot in the live count.
pub(crate) struct PoolEntry {
    pub(crate) conn: Box<dyn Connection>,
    _size: SharedSizeGuard,
}

pub(crate) struct PoolInner {
    dsn: Dsn,
    host: String,
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    listener: DynEventListener,
    idle: Mutex<VecDeque<PoolEntry>>,
    conn_available: Notify,
    size: Arc<AtomicUsize>,
    wait_count: AtomicUsize,
    recent_conn_errors: RecentPeriod<Counter>,
    default_cmd_ctl: CommandControlStore,
    stats: PoolStatistics,
    next_connection_id: AtomicU32,
    closed: AtomicBool,
}

impl PoolInner {
    pub(crate) fn host(&self) -> &str {
        &self.host
    }

    fn emit(&self, event: PoolEvent) {
        self.listener.on_event(&event);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn acquire(self: &Arc<Self>, deadline: Deadline) -> Result<PooledConnection> {
        let mut entry = self.pop(deadline).await?;
        self.stats.connection_lent();
        entry
            .conn
            .set_default_command_control(self.default_cmd_ctl.get());
        Ok(PooledConnection::new(entry, Arc::clone(self)))
    }

    async fn pop(self: &Arc<Self>, deadline: Deadline) -> Result<PoolEntry> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        if deadline.is_reached() {
            self.stats.error_timeout.incr();
            return Err(PoolError::DeadlineExceeded);
        }
        let _sw = Stopwatch::new(&self.stats.acquire_percentile);

        if let Some(entry) = self.try_pop() {
            return Ok(entry);
        }

        let wait = WaitGuard::new(&self.wait_count);
        if wait.value > self.settings.max_queue_size {
            self.stats.queue_size_errors.incr();
            self.emit(PoolEvent::QueueSizeExceeded {
                host: self.host.clone(),
                waiting: wait.value,
            });
            return Err(PoolError::QueueSizeExceeded);
        }

        tracing::debug!(
            host = %self.host,
            time_left_ms = deadline.time_left().map(|left| left.as_millis() as u64),
            "no idle connections, waiting for one"
        );
        self.maybe_connect();
        self.wait_for_idle(deadline).await
    }

    fn try_pop(&self) -> Option<PoolEntry> {
        self.idle.lock().pop_front()
    }

    async fn wait_for_idle(&self, deadline: Deadline) -> Result<PoolEntry> {
        loop {
            let notified = self.conn_available.notified();
            tokio::pin!(notified);
            // Register before checking the queue so a push in between is not missed.
            notified.as_mut().enable();

            if let Some(entry) = self.try_pop() {
                return Ok(entry);
            }
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }

            match deadline.instant() {
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        break;
                    }
                }
                None => notified.await,
            }
        }

        self.stats.pool_exhaust_errors.incr();
        self.emit(PoolEvent::PoolExhausted {
            host: self.host.clone(),
            waiting: self.wait_count.load(Ordering::Relaxed).saturating_sub(1),
        });
        Err(PoolError::PoolExhausted)
    }

    /// Start a background connection if the pool has room and the host
    /// has not been failing recently.
    fn maybe_connect(self: &Arc<Self>) {
        let size = SharedSizeGuard::new(&self.size);
        if size.value() > self.settings.max_size {
            return;
        }

        // Reading the error window costs more than an atomic increment, so
        // it is only checked once a new connection is allowed at all.
        let recent_errors = self
            .recent_conn_errors
            .stats_for_period(RECENT_ERROR_PERIOD, true);
        if recent_errors >= RECENT_ERROR_THRESHOLD {
            self.emit(PoolEvent::CircuitBreakerEngaged {
                host: self.host.clone(),
                recent_errors,
            });
            return;
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            // Only connectivity errors are expected here and those are
            // already counted; anything else has been reported as well.
            let _ = pool.connect(size).await;
        });
    }

    /// Open one connection and put it into the idle queue.
    ///
    /// Connectivity failures are counted and reported as `Ok(false)`; any
    /// other failure is returned to the caller.
    async fn connect(self: Arc<Self>, size: SharedSizeGuard) -> std::result::Result<bool, ConnectionError> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        self.stats.open_total.incr();
        tracing::trace!(host = %self.host, id, pool_size = size.value(), "creating PostgreSQL connection");

        let cmd_ctl = self.default_cmd_ctl.get();
        let result = {
            let _sw = Stopwatch::new(&self.stats.connection_percentile);
            tokio::time::timeout(cmd_ctl.network, self.connector.connect(&self.dsn, id, cmd_ctl))
                .await
                .unwrap_or(Err(ConnectionError::Timeout))
        };

        match result {
            Ok(mut conn) => {
                // Whatever the handshake accounted is not pool traffic.
                let _ = conn.take_statistics();
                self.emit(PoolEvent::ConnectionCreated {
                    host: self.host.clone(),
                    id,
                    pool_size: size.value(),
                });
                self.push(PoolEntry { conn, _size: size });
                Ok(true)
            }
            Err(e) => {
                if e == ConnectionError::Timeout {
                    self.stats.error_timeout.incr();
                }
                self.stats.error_total.incr();
                self.stats.drop_total.incr();

                let connectivity = e.is_connectivity();
                if connectivity {
                    self.recent_conn_errors.current().incr();
                }
                self.emit(PoolEvent::ConnectionFailed {
                    host: self.host.clone(),
                    id,
                    error: e.to_string(),
                    connectivity,
                });
                if connectivity { Ok(false) } else { Err(e) }
            }
        }
    }

    fn push(&self, entry: PoolEntry) {
        // `closed` only flips under the idle lock, see `shut_down`.
        let rejected = {
            let mut idle = self.idle.lock();
            if self.is_closed() {
                Some((entry, DropReason::PoolClosed))
            } else if idle.len() < self.settings.max_size {
                idle.push_back(entry);
                None
            } else {
                Some((entry, DropReason::QueueFull))
            }
        };

        match rejected {
            None => self.conn_available.notify_one(),
            Some((entry, reason)) => self.delete(entry, reason),
        }
    }

    fn delete(&self, entry: PoolEntry, reason: DropReason) {
        self.stats.drop_total.incr();
        self.emit(PoolEvent::ConnectionDropped {
            host: self.host.clone(),
            id: entry.conn.id(),
            reason,
        });
    }

    /// Take back a connection from a [`PooledConnection`].
    ///
    /// Never blocks: dirty connections are cleaned up in a background task.
    pub(crate) fn release(self: &Arc<Self>, mut entry: PoolEntry) {
        if !entry.conn.is_in_transaction() {
            self.stats.account_connection(&entry.conn.take_statistics());
        }

        if entry.conn.is_idle() {
            self.stats.connection_returned();
            self.push(entry);
            return;
        }

        if !entry.conn.is_connected() {
            self.stats.error_total.incr();
            self.stats.connection_returned();
            self.delete(entry, DropReason::Broken);
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::clone(self);
                handle.spawn(async move {
                    pool.cleanup(entry).await;
                    pool.stats.connection_returned();
                });
            }
            Err(_) => {
                self.stats.error_total.incr();
                self.stats.connection_returned();
                self.delete(entry, DropReason::CleanupFailed);
            }
        }
    }

    async fn cleanup(&self, mut entry: PoolEntry) {
        let id = entry.conn.id();
        tracing::warn!(host = %self.host, id, state = ?entry.conn.state(), "released connection in busy state, trying to clean up");

        let timeout = self.default_cmd_ctl.get().network * CLEANUP_TIMEOUT_FACTOR;
        match tokio::time::timeout(timeout, entry.conn.cleanup(timeout)).await {
            Ok(Ok(())) if entry.conn.is_idle() => {
                self.stats.account_connection(&entry.conn.take_statistics());
                self.emit(PoolEvent::CleanupSucceeded {
                    host: self.host.clone(),
                    id,
                });
                self.push(entry);
                return;
            }
            Ok(Ok(())) => {
                tracing::warn!(host = %self.host, id, "connection still busy after cleanup");
            }
            Ok(Err(e)) => {
                tracing::warn!(host = %self.host, id, error = %e, "error while cleaning up a dirty connection");
            }
            Err(_) => {
                tracing::warn!(host = %self.host, id, timeout_ms = timeout.as_millis() as u64, "cleanup of a dirty connection timed out");
            }
        }

        self.stats.error_total.incr();
        self.delete(entry, DropReason::CleanupFailed);
    }

    /// Keep idle connections warm and weed out silently broken ones.
    async fn ping_connections(self: &Arc<Self>) {
        // No point in database round-trips while callers wait for connections.
        if self.wait_count.load(Ordering::Acquire) > 0 {
            tracing::debug!(host = %self.host, "no ping required for connection pool");
            return;
        }

        tracing::debug!(host = %self.host, "ping connection pool");
        let deadline = Deadline::from_duration(self.default_cmd_ctl.get().network);
        // Every live connection is visited at most once per round.
        let rounds = self.size.load(Ordering::Acquire).max(1);
        for _ in 0..rounds {
            let mut conn = match self.acquire(deadline).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::debug!(host = %self.host, error = %e, "could not acquire connection for ping");
                    return;
                }
            };
            if conn.idle_duration() < MAX_IDLE_DURATION {
                return;
            }
            if let Err(e) = conn.ping().await {
                self.emit(PoolEvent::PingFailed {
                    host: self.host.clone(),
                    id: conn.id(),
                    error: e.to_string(),
                });
            }
        }
    }

    /// Mark the pool closed and close every idle connection. Returns
    /// `false` if the pool was already closed.
    fn shut_down(&self) -> bool {
        let drained: Vec<PoolEntry> = {
            let mut idle = self.idle.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return false;
            }
            idle.drain(..).collect()
        };
        for entry in drained {
            self.delete(entry, DropReason::PoolClosed);
        }
        true
    }
}

/// Connection pool for a single PostgreSQL host.
///
/// # Example
///
/// ```rust,ignore
/// use pg_cluster::{ConnectionPool, Deadline, PoolSettings, TransactionOptions};
/// use std::time::Duration;
///
/// let pool = ConnectionPool::builder("host=db1 dbname=main", connector)
///     .settings(PoolSettings::new().min_size(2).max_size(10))
///     .build()
///     .await?;
///
/// let mut trx = pool
///     .begin(TransactionOptions::new(), Deadline::from_duration(Duration::from_millis(500)), None)
///     .await?;
/// trx.execute("UPDATE t SET x = 1").await?;
/// trx.commit().await?;
/// ```
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    ping_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool builder for `dsn` using `connector` to open sessions.
    pub fn builder(dsn: impl Into<Dsn>, connector: impl Connector) -> PoolBuilder {
        PoolBuilder::new(dsn.into(), Arc::new(connector))
    }

    /// Get a connection, waiting until `deadline` if none is idle.
    pub async fn acquire(&self, deadline: Deadline) -> Result<PooledConnection> {
        self.inner.acquire(deadline).await
    }

    /// Acquire a connection and open a transaction on it.
    pub async fn begin(
        &self,
        options: TransactionOptions,
        deadline: Deadline,
        trx_cmd_ctl: Option<CommandControl>,
    ) -> Result<Transaction> {
        let start_time = Instant::now();
        let conn = self.acquire(deadline).await?;
        Ok(Transaction::begin(conn, options, trx_cmd_ctl, start_time).await?)
    }

    /// Acquire a connection for statements outside of a transaction.
    pub async fn start(&self, deadline: Deadline) -> Result<NonTransaction> {
        let start_time = Instant::now();
        let conn = self.acquire(deadline).await?;
        Ok(NonTransaction::new(conn, deadline, start_time))
    }

    /// Point-in-time statistics. Safe to call at any time.
    #[must_use]
    pub fn statistics(&self) -> InstanceStatistics {
        self.inner.stats.snapshot(
            self.inner.size.load(Ordering::Relaxed),
            self.inner.wait_count.load(Ordering::Relaxed),
            self.inner.settings.max_size,
        )
    }

    /// Current status of the pool.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let total = self.inner.size.load(Ordering::Relaxed);
        let available = self.inner.idle.lock().len();
        PoolStatus {
            available,
            in_use: total.saturating_sub(available),
            total,
            waiting: self.inner.wait_count.load(Ordering::Relaxed),
            max: self.inner.settings.max_size,
        }
    }

    /// Replace the command control given to acquired connections.
    ///
    /// Returns `false` if `cmd_ctl` equals the current value.
    pub fn set_default_command_control(&self, cmd_ctl: CommandControl) -> bool {
        if !self.inner.default_cmd_ctl.set(cmd_ctl) {
            return false;
        }
        self.inner.emit(PoolEvent::CommandControlChanged {
            host: self.inner.host.clone(),
            cmd_ctl,
        });
        true
    }

    /// Command control given to acquired connections.
    #[must_use]
    pub fn default_command_control(&self) -> CommandControl {
        self.inner.default_cmd_ctl.get()
    }

    /// Connection string of the host.
    #[must_use]
    pub fn dsn(&self) -> &Dsn {
        &self.inner.dsn
    }

    /// Credential-free host identifier.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    /// Pool settings.
    #[must_use]
    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Shut the pool down.
    ///
    /// Stops the ping task, then closes all idle connections. Borrowed
    /// connections are closed when their handles are dropped. Waiting
    /// callers fail with [`PoolError::PoolClosed`].
    pub fn close(&self) {
        if let Some(task) = self.ping_task.lock().take() {
            task.abort();
        }
        if !self.inner.shut_down() {
            return;
        }
        self.inner.conn_available.notify_waiters();
        tracing::info!(host = %self.inner.host, "connection pool closed");
    }

    /// Whether the pool has been shut down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn start_ping_task(&self) {
        let pool = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.ping_connections().await;
            }
        });
        *self.ping_task.lock() = Some(task);
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("host", &self.inner.host)
            .field("settings", &self.inner.settings)
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for [`ConnectionPool`].
pub struct PoolBuilder {
    dsn: Dsn,
    connector: Arc<dyn Connector>,
    settings: PoolSettings,
    cmd_ctl: CommandControl,
    listener: DynEventListener,
}

impl PoolBuilder {
    fn new(dsn: Dsn, connector: Arc<dyn Connector>) -> Self {
        Self {
            dsn,
            connector,
            settings: PoolSettings::default(),
            cmd_ctl: CommandControl::default(),
            listener: Arc::new(TracingListener),
        }
    }

    /// Set the pool settings.
    #[must_use]
    pub fn settings(mut self, settings: PoolSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_size(mut self, size: usize) -> Self {
        self.settings.min_size = size;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.settings.max_size = size;
        self
    }

    /// Set the maximum number of waiting callers.
    #[must_use]
    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.settings.max_queue_size = size;
        self
    }

    /// Set the initial command control.
    #[must_use]
    pub fn command_control(mut self, cmd_ctl: CommandControl) -> Self {
        self.cmd_ctl = cmd_ctl;
        self
    }

    /// Set the event listener.
    #[must_use]
    pub fn listener(mut self, listener: impl EventListener) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub(crate) fn shared_listener(mut self, listener: DynEventListener) -> Self {
        self.listener = listener;
        self
    }

    pub(crate) fn shared_connector(dsn: Dsn, connector: Arc<dyn Connector>) -> Self {
        Self::new(dsn, connector)
    }

    /// Validate the settings, open `min_size` connections and start the
    /// health-check task.
    ///
    /// Connectivity failures during warm-up are counted and tolerated; any
    /// other connection error aborts construction.
    pub async fn build(self) -> Result<ConnectionPool> {
        self.dsn.validate()?;
        self.settings.validate()?;

        let host = self.dsn.cut_password();
        let inner = Arc::new(PoolInner {
            dsn: self.dsn,
            host,
            settings: self.settings,
            connector: self.connector,
            listener: self.listener,
            idle: Mutex::new(VecDeque::with_capacity(self.settings.max_size)),
            conn_available: Notify::new(),
            size: Arc::new(AtomicUsize::new(0)),
            wait_count: AtomicUsize::new(0),
            recent_conn_errors: RecentPeriod::new(
                RECENT_ERROR_EPOCH,
                (RECENT_ERROR_PERIOD.as_secs() / RECENT_ERROR_EPOCH.as_secs()) as usize + 1,
            ),
            default_cmd_ctl: CommandControlStore::new(self.cmd_ctl),
            stats: PoolStatistics::default(),
            next_connection_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
        });

        tracing::info!(
            host = %inner.host,
            min = inner.settings.min_size,
            max = inner.settings.max_size,
            "creating PostgreSQL connections"
        );
        let warm_up = (0..inner.settings.min_size)
            .map(|_| Arc::clone(&inner).connect(SharedSizeGuard::new(&inner.size)));
        for result in join_all(warm_up).await {
            result?;
        }
        tracing::info!(host = %inner.host, "pool initialized");

        let pool = ConnectionPool {
            inner,
            ping_task: Mutex::new(None),
        };
        pool.start_ping_task();
        Ok(pool)
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of live connections not in the idle queue.
    pub in_use: usize,
    /// Number of live connections.
    pub total: usize,
    /// Number of waiting callers.
    pub waiting: usize,
    /// Maximum allowed connections.
    pub max: usize,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            waiting: 0,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
        assert!(!status.is_at_capacity());
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            available: 0,
            in_use: 10,
            total: 10,
            waiting: 3,
            max: 10,
        };
        assert!(status.is_at_capacity());
    }

    #[test]
    fn test_size_guards_track_live_count() {
        let size = Arc::new(AtomicUsize::new(0));
        let first = SharedSizeGuard::new(&size);
        let second = SharedSizeGuard::new(&size);
        assert_eq!(first.value(), 1);
        assert_eq!(second.value(), 2);
        drop(first);
        assert_eq!(size.load(Ordering::Relaxed), 1);
        drop(second);
        assert_eq!(size.load(Ordering::Relaxed), 0);

        let waiting = AtomicUsize::new(0);
        {
            let guard = WaitGuard::new(&waiting);
            assert_eq!(guard.value, 1);
        }
        assert_eq!(waiting.load(Ordering::Relaxed), 0);
    }
}
