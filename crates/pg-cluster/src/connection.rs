//! Borrowed connection handle.

use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use crate::lifecycle::Connection;
use crate::pool::{PoolEntry, PoolInner};

/// A connection lent out by a [`ConnectionPool`](crate::ConnectionPool).
///
/// The handle owns the connection exclusively. Dropping it hands the
/// connection back to the pool, which requeues, cleans up or discards it
/// depending on the state it was left in.
pub struct PooledConnection {
    entry: Option<PoolEntry>,
    pool: Arc<PoolInner>,
    acquired_at: Instant,
}

impl PooledConnection {
    pub(crate) fn new(entry: PoolEntry, pool: Arc<PoolInner>) -> Self {
        Self {
            entry: Some(entry),
            pool,
            acquired_at: Instant::now(),
        }
    }

    /// When the connection was handed out.
    #[must_use]
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Credential-free identifier of the owning pool's host.
    #[must_use]
    pub fn host(&self) -> &str {
        self.pool.host()
    }
}

// The entry is only taken in `drop`, so it is always present while the
// handle is reachable.
#[allow(clippy::expect_used)]
impl std::ops::Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.entry
            .as_ref()
            .expect("connection used after return to pool")
            .conn
            .as_ref()
    }
}

#[allow(clippy::expect_used)]
impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.entry
            .as_mut()
            .expect("connection used after return to pool")
            .conn
            .as_mut()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.take() {
            tracing::trace!(id = entry.conn.id(), "returning connection to pool");
            self.pool.release(entry);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PooledConnection");
        if let Some(entry) = &self.entry {
            debug
                .field("id", &entry.conn.id())
                .field("state", &entry.conn.state());
        }
        debug.field("host", &self.pool.host()).finish()
    }
}
