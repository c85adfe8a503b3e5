//! Pool statistics.
//!
//! Counters are plain atomics updated with `Relaxed` ordering: they are
//! eventually consistent and never torn. Timings go into rolling
//! percentile windows made of fixed-length epochs; old epochs expire as
//! time moves on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::lifecycle::ConnectionStatistics;

/// Epoch length of timing windows.
const PERCENTILE_EPOCH: Duration = Duration::from_secs(5);
/// Number of epochs kept by timing windows.
const PERCENTILE_EPOCHS: usize = 12;

/// Values below this are tracked with 1 ms resolution.
const EXACT_LIMIT_MS: u64 = 100;
/// Resolution above [`EXACT_LIMIT_MS`].
const COARSE_STEP_MS: u64 = 100;
/// Values at or above this all land in the last bucket.
const MAX_TRACKED_MS: u64 = 10_000;
const BUCKET_COUNT: usize =
    (EXACT_LIMIT_MS + (MAX_TRACKED_MS - EXACT_LIMIT_MS) / COARSE_STEP_MS) as usize + 1;

/// Accumulator that can live in a [`RecentPeriod`] slot.
pub trait Accumulate: Default + Send + Sync {
    /// Aggregated value produced when reading a window.
    type Snapshot: Default;

    /// Forget everything accumulated so far.
    fn reset(&self);

    /// Add this accumulator's contents to `out`.
    fn merge_into(&self, out: &mut Self::Snapshot);
}

/// Monotonic event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increment by one.
    pub fn incr(&self) {
        self.add(1);
    }

    /// Increment by `n`.
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Accumulate for Counter {
    type Snapshot = u64;

    fn reset(&self) {
        self.0.store(0, Ordering::Relaxed);
    }

    fn merge_into(&self, out: &mut u64) {
        *out += self.get();
    }
}

/// Histogram of millisecond durations.
#[derive(Debug)]
pub struct Percentile {
    buckets: Box<[AtomicU64]>,
}

impl Default for Percentile {
    fn default() -> Self {
        Self {
            buckets: (0..BUCKET_COUNT).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

impl Percentile {
    /// Record one value in milliseconds.
    pub fn account(&self, value_ms: u64) {
        self.buckets[bucket_index(value_ms)].fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duration.
    pub fn account_duration(&self, value: Duration) {
        self.account(u64::try_from(value.as_millis()).unwrap_or(u64::MAX));
    }
}

impl Accumulate for Percentile {
    type Snapshot = PercentileSnapshot;

    fn reset(&self) {
        for bucket in self.buckets.iter() {
            bucket.store(0, Ordering::Relaxed);
        }
    }

    fn merge_into(&self, out: &mut PercentileSnapshot) {
        if out.counts.len() < BUCKET_COUNT {
            out.counts.resize(BUCKET_COUNT, 0);
        }
        for (total, bucket) in out.counts.iter_mut().zip(self.buckets.iter()) {
            *total += bucket.load(Ordering::Relaxed);
        }
    }
}

fn bucket_index(value_ms: u64) -> usize {
    let index = if value_ms < EXACT_LIMIT_MS {
        value_ms
    } else if value_ms < MAX_TRACKED_MS {
        EXACT_LIMIT_MS + (value_ms - EXACT_LIMIT_MS) / COARSE_STEP_MS
    } else {
        BUCKET_COUNT as u64 - 1
    };
    index as usize
}

fn bucket_value(index: usize) -> u64 {
    let index = index as u64;
    if index < EXACT_LIMIT_MS {
        index
    } else if index < BUCKET_COUNT as u64 - 1 {
        EXACT_LIMIT_MS + (index - EXACT_LIMIT_MS) * COARSE_STEP_MS
    } else {
        MAX_TRACKED_MS
    }
}

/// Aggregated histogram over a time window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PercentileSnapshot {
    counts: Vec<u64>,
}

impl PercentileSnapshot {
    /// Number of recorded values.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// Smallest tracked value such that `percent` percent of the recorded
    /// values are less than or equal to it. Returns 0 for an empty window.
    #[must_use]
    pub fn percentile(&self, percent: f64) -> u64 {
        let total = self.count();
        if total == 0 {
            return 0;
        }
        let rank = (percent.clamp(0.0, 100.0) * total as f64 / 100.0).ceil() as u64;
        let rank = rank.max(1);

        let mut seen = 0;
        for (index, count) in self.counts.iter().enumerate() {
            seen += count;
            if seen >= rank {
                return bucket_value(index);
            }
        }
        MAX_TRACKED_MS
    }
}

/// Slot epoch while its accumulator is being reset. Readers skip it as
/// an epoch from the future.
const ROTATING: u64 = u64::MAX;

struct Slot<A> {
    epoch: AtomicU64,
    value: A,
}

/// Rolling window of accumulators split into fixed-length epochs.
pub struct RecentPeriod<A: Accumulate> {
    slots: Box<[Slot<A>]>,
    epoch_len: Duration,
    start: Instant,
}

impl<A: Accumulate> RecentPeriod<A> {
    /// Create a window of `epochs` epochs of `epoch_len` each.
    #[must_use]
    pub fn new(epoch_len: Duration, epochs: usize) -> Self {
        let epochs = epochs.max(1);
        Self {
            slots: (0..epochs)
                .map(|_| Slot {
                    epoch: AtomicU64::new(0),
                    value: A::default(),
                })
                .collect(),
            epoch_len,
            start: Instant::now(),
        }
    }

    fn current_epoch(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.start);
        let epoch = elapsed.as_nanos() / self.epoch_len.as_nanos().max(1);
        u64::try_from(epoch).unwrap_or(u64::MAX)
    }

    /// Accumulator of the current epoch.
    ///
    /// The slot is reset the first time it is touched in a new epoch. The
    /// new epoch is published only after the reset, so no increment made
    /// in the new epoch can be wiped.
    pub fn current(&self) -> &A {
        let epoch = self.current_epoch();
        let slot = &self.slots[(epoch % self.slots.len() as u64) as usize];
        loop {
            let seen = slot.epoch.load(Ordering::Acquire);
            if seen == epoch {
                break;
            }
            if seen == ROTATING {
                std::hint::spin_loop();
                continue;
            }
            if slot
                .epoch
                .compare_exchange(seen, ROTATING, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.value.reset();
                slot.epoch.store(epoch, Ordering::Release);
                break;
            }
        }
        &slot.value
    }

    /// Aggregate of the epochs that fall in the trailing `period`.
    ///
    /// The still-running epoch is included only when `with_current` is set.
    #[must_use]
    pub fn stats_for_period(&self, period: Duration, with_current: bool) -> A::Snapshot {
        let now = self.current_epoch();
        let span = period
            .as_nanos()
            .div_ceil(self.epoch_len.as_nanos().max(1))
            .clamp(1, self.slots.len() as u128) as u64;

        let mut out = A::Snapshot::default();
        for slot in self.slots.iter() {
            let epoch = slot.epoch.load(Ordering::Acquire);
            if epoch > now || now - epoch >= span {
                continue;
            }
            if epoch == now && !with_current {
                continue;
            }
            slot.value.merge_into(&mut out);
        }
        out
    }

    /// Aggregate of the whole window.
    #[must_use]
    pub fn stats(&self) -> A::Snapshot {
        self.stats_for_period(self.epoch_len * self.slots.len() as u32, true)
    }
}

impl<A: Accumulate> Default for RecentPeriod<A> {
    fn default() -> Self {
        Self::new(PERCENTILE_EPOCH, PERCENTILE_EPOCHS)
    }
}

impl<A: Accumulate> std::fmt::Debug for RecentPeriod<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecentPeriod")
            .field("epoch_len", &self.epoch_len)
            .field("epochs", &self.slots.len())
            .finish()
    }
}

/// Records the time from its creation until drop into a timing window.
pub(crate) struct Stopwatch<'a> {
    window: &'a RecentPeriod<Percentile>,
    start: Instant,
}

impl<'a> Stopwatch<'a> {
    pub(crate) fn new(window: &'a RecentPeriod<Percentile>) -> Self {
        Self {
            window,
            start: Instant::now(),
        }
    }
}

impl Drop for Stopwatch<'_> {
    fn drop(&mut self) {
        self.window.current().account_duration(self.start.elapsed());
    }
}

/// Live statistics of one pool.
#[derive(Debug, Default)]
pub(crate) struct PoolStatistics {
    pub(crate) open_total: Counter,
    pub(crate) drop_total: Counter,
    pub(crate) error_total: Counter,
    pub(crate) error_timeout: Counter,
    used: AtomicU64,

    pub(crate) trx_total: Counter,
    pub(crate) commit_total: Counter,
    pub(crate) rollback_total: Counter,
    pub(crate) out_of_trx_total: Counter,
    pub(crate) parse_total: Counter,
    pub(crate) execute_total: Counter,
    pub(crate) reply_total: Counter,
    pub(crate) bin_reply_total: Counter,
    pub(crate) error_execute_total: Counter,
    pub(crate) execute_timeout: Counter,

    pub(crate) pool_exhaust_errors: Counter,
    pub(crate) queue_size_errors: Counter,

    pub(crate) trx_total_percentile: RecentPeriod<Percentile>,
    pub(crate) trx_busy_percentile: RecentPeriod<Percentile>,
    pub(crate) wait_start_percentile: RecentPeriod<Percentile>,
    pub(crate) wait_end_percentile: RecentPeriod<Percentile>,
    pub(crate) return_to_pool_percentile: RecentPeriod<Percentile>,
    pub(crate) connection_percentile: RecentPeriod<Percentile>,
    pub(crate) acquire_percentile: RecentPeriod<Percentile>,
}

impl PoolStatistics {
    pub(crate) fn connection_lent(&self) {
        self.used.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_returned(&self) {
        // Saturate instead of wrapping if accounting ever goes wrong.
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_sub(1)
            });
    }

    /// Fold the statistics taken from a released connection into the pool.
    pub(crate) fn account_connection(&self, stats: &ConnectionStatistics) {
        self.trx_total.add(stats.trx_total);
        self.commit_total.add(stats.commit_total);
        self.rollback_total.add(stats.rollback_total);
        self.out_of_trx_total.add(stats.out_of_trx);
        self.parse_total.add(stats.parse_total);
        self.execute_total.add(stats.execute_total);
        self.reply_total.add(stats.reply_total);
        self.bin_reply_total.add(stats.bin_reply_total);
        self.error_execute_total.add(stats.error_execute_total);
        self.execute_timeout.add(stats.execute_timeout);

        let (Some(trx_start), Some(trx_end)) = (stats.trx_start_time, stats.trx_end_time) else {
            return;
        };
        self.trx_total_percentile
            .current()
            .account_duration(trx_end.saturating_duration_since(trx_start));
        self.trx_busy_percentile
            .current()
            .account_duration(stats.sum_query_duration);
        if let Some(work_start) = stats.work_start_time {
            self.wait_start_percentile
                .current()
                .account_duration(work_start.saturating_duration_since(trx_start));
        }
        if let Some(last_execute) = stats.last_execute_finish {
            self.wait_end_percentile
                .current()
                .account_duration(trx_end.saturating_duration_since(last_execute));
        }
        self.return_to_pool_percentile
            .current()
            .account_duration(Instant::now().saturating_duration_since(trx_end));
    }

    pub(crate) fn snapshot(&self, active: usize, waiting: usize, maximum: usize) -> InstanceStatistics {
        InstanceStatistics {
            connection: ConnectionStats {
                open_total: self.open_total.get(),
                drop_total: self.drop_total.get(),
                active,
                used: self.used.load(Ordering::Relaxed),
                waiting,
                maximum,
                error_total: self.error_total.get(),
                error_timeout: self.error_timeout.get(),
            },
            transaction: TransactionStats {
                total: self.trx_total.get(),
                commit_total: self.commit_total.get(),
                rollback_total: self.rollback_total.get(),
                out_of_trx_total: self.out_of_trx_total.get(),
                parse_total: self.parse_total.get(),
                execute_total: self.execute_total.get(),
                reply_total: self.reply_total.get(),
                bin_reply_total: self.bin_reply_total.get(),
                error_execute_total: self.error_execute_total.get(),
                execute_timeout: self.execute_timeout.get(),
                total_percentile: self.trx_total_percentile.stats(),
                busy_percentile: self.trx_busy_percentile.stats(),
                wait_start_percentile: self.wait_start_percentile.stats(),
                wait_end_percentile: self.wait_end_percentile.stats(),
                return_to_pool_percentile: self.return_to_pool_percentile.stats(),
            },
            pool_exhaust_errors: self.pool_exhaust_errors.get(),
            queue_size_errors: self.queue_size_errors.get(),
            connection_percentile: self.connection_percentile.stats(),
            acquire_percentile: self.acquire_percentile.stats(),
        }
    }
}

/// Connection counters and gauges of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Connections opened, successfully or not.
    pub open_total: u64,
    /// Connections closed or discarded.
    pub drop_total: u64,
    /// Live connections, idle and lent out.
    pub active: usize,
    /// Connections currently lent out.
    pub used: u64,
    /// Callers waiting for a connection.
    pub waiting: usize,
    /// Configured maximum of live connections.
    pub maximum: usize,
    /// Connection errors of any kind.
    pub error_total: u64,
    /// Connection timeouts.
    pub error_timeout: u64,
}

/// Transaction counters and timings of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransactionStats {
    /// Transactions started.
    pub total: u64,
    /// Transactions committed.
    pub commit_total: u64,
    /// Transactions rolled back.
    pub rollback_total: u64,
    /// Statements executed outside of transactions.
    pub out_of_trx_total: u64,
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
    /// Full transaction time, ms.
    pub total_percentile: PercentileSnapshot,
    /// Time spent executing queries, ms.
    pub busy_percentile: PercentileSnapshot,
    /// Time from transaction start until first statement, ms.
    pub wait_start_percentile: PercentileSnapshot,
    /// Time from last statement until transaction end, ms.
    pub wait_end_percentile: PercentileSnapshot,
    /// Time from transaction end until the connection was released, ms.
    pub return_to_pool_percentile: PercentileSnapshot,
}

/// Point-in-time statistics of one pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstanceStatistics {
    /// Connection counters.
    pub connection: ConnectionStats,
    /// Transaction counters.
    pub transaction: TransactionStats,
    /// Acquisitions that timed out waiting.
    pub pool_exhaust_errors: u64,
    /// Acquisitions rejected because the wait queue was full.
    pub queue_size_errors: u64,
    /// Connection establishment time, ms.
    pub connection_percentile: PercentileSnapshot,
    /// Acquisition time, ms.
    pub acquire_percentile: PercentileSnapshot,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_mapping_is_monotonic() {
        let mut last = 0;
        for value in [0, 1, 50, 99, 100, 150, 199, 200, 5_000, 9_999, 10_000, 1_000_000] {
            let index = bucket_index(value);
            assert!(index >= last, "bucket for {value} went backwards");
            assert!(bucket_value(index) <= value);
            last = index;
        }
        assert_eq!(bucket_index(u64::MAX), BUCKET_COUNT - 1);
    }

    #[test]
    fn test_percentile_snapshot() {
        let percentile = Percentile::default();
        for value in 1..=100 {
            percentile.account(value);
        }
        let mut snapshot = PercentileSnapshot::default();
        percentile.merge_into(&mut snapshot);

        assert_eq!(snapshot.count(), 100);
        assert_eq!(snapshot.percentile(50.0), 50);
        assert_eq!(snapshot.percentile(99.0), 99);
        assert_eq!(snapshot.percentile(100.0), 100);
        assert_eq!(PercentileSnapshot::default().percentile(95.0), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_period_expires_old_epochs() {
        let window: RecentPeriod<Counter> = RecentPeriod::new(Duration::from_secs(1), 16);
        window.current().incr();
        window.current().incr();
        assert_eq!(window.stats_for_period(Duration::from_secs(15), true), 2);
        assert_eq!(window.stats_for_period(Duration::from_secs(15), false), 0);

        tokio::time::advance(Duration::from_secs(5)).await;
        window.current().incr();
        assert_eq!(window.stats_for_period(Duration::from_secs(15), true), 3);
        assert_eq!(window.stats_for_period(Duration::from_secs(3), true), 1);

        tokio::time::advance(Duration::from_secs(12)).await;
        assert_eq!(window.stats_for_period(Duration::from_secs(15), true), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(window.stats_for_period(Duration::from_secs(15), true), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recent_period_reuses_slots() {
        let window: RecentPeriod<Counter> = RecentPeriod::new(Duration::from_secs(1), 2);
        window.current().add(7);
        tokio::time::advance(Duration::from_secs(2)).await;
        window.current().add(1);
        assert_eq!(window.stats(), 1);
    }

    #[test]
    fn test_recent_period_keeps_increments_across_rotation() {
        const THREADS: u64 = 4;
        const INCREMENTS: u64 = 50_000;

        // Epochs are short enough to rotate many times while the threads
        // run, and the window is long enough that none of them expires.
        let window: RecentPeriod<Counter> =
            RecentPeriod::new(Duration::from_micros(100), 1_000_000);
        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..INCREMENTS {
                        window.current().incr();
                    }
                });
            }
        });
        assert_eq!(window.stats(), THREADS * INCREMENTS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopwatch_records_elapsed_time() {
        let window = RecentPeriod::<Percentile>::default();
        {
            let _sw = Stopwatch::new(&window);
            tokio::time::advance(Duration::from_millis(42)).await;
        }
        let stats = window.stats();
        assert_eq!(stats.count(), 1);
        assert_eq!(stats.percentile(100.0), 42);
    }

    #[test]
    fn test_used_gauge_never_wraps() {
        let stats = PoolStatistics::default();
        stats.connection_returned();
        stats.connection_lent();
        stats.connection_lent();
        stats.connection_returned();
        assert_eq!(stats.snapshot(0, 0, 0).connection.used, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_account_connection_transaction_timings() {
        let stats = PoolStatistics::default();
        let start = Instant::now();
        let conn = ConnectionStatistics {
            trx_total: 1,
            commit_total: 1,
            execute_total: 3,
            trx_start_time: Some(start),
            work_start_time: Some(start + Duration::from_millis(5)),
            last_execute_finish: Some(start + Duration::from_millis(30)),
            trx_end_time: Some(start + Duration::from_millis(40)),
            sum_query_duration: Duration::from_millis(20),
            ..ConnectionStatistics::default()
        };
        tokio::time::advance(Duration::from_millis(40)).await;
        stats.account_connection(&conn);

        let snapshot = stats.snapshot(2, 0, 4);
        assert_eq!(snapshot.transaction.total, 1);
        assert_eq!(snapshot.transaction.execute_total, 3);
        assert_eq!(snapshot.transaction.total_percentile.percentile(100.0), 40);
        assert_eq!(snapshot.transaction.busy_percentile.percentile(100.0), 20);
        assert_eq!(snapshot.transaction.wait_start_percentile.percentile(100.0), 5);
        assert_eq!(snapshot.transaction.wait_end_percentile.percentile(100.0), 10);
        assert_eq!(snapshot.transaction.return_to_pool_percentile.percentile(100.0), 0);

        // Statements outside of a transaction carry no timings.
        stats.account_connection(&ConnectionStatistics {
            out_of_trx: 2,
            ..ConnectionStatistics::default()
        });
        let snapshot = stats.snapshot(2, 0, 4);
        assert_eq!(snapshot.transaction.out_of_trx_total, 2);
        assert_eq!(snapshot.transaction.total_percentile.count(), 1);
    }

    #[test]
    fn test_snapshot_serializes_to_json() {
        let stats = PoolStatistics::default();
        stats.open_total.add(3);
        stats.connection_lent();

        let json = serde_json::to_value(stats.snapshot(3, 1, 15)).unwrap();
        assert_eq!(json["connection"]["open_total"], 3);
        assert_eq!(json["connection"]["active"], 3);
        assert_eq!(json["connection"]["used"], 1);
        assert_eq!(json["connection"]["waiting"], 1);
        assert_eq!(json["connection"]["maximum"], 15);
        assert_eq!(json["queue_size_errors"], 0);
    }
}
