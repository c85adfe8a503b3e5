//! Multi-host cluster with role-based routing.
//!
//! The cluster owns one [`ConnectionPool`] per available host. A periodic
//! task probes every configured host, builds a brand-new routing table and
//! publishes it with a single pointer swap; requests being routed keep
//! using whatever table they looked up.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::command_control::{CommandControl, CommandControlStore};
use crate::config::{ClusterDescription, ClusterSettings, Dsn};
use crate::deadline::Deadline;
use crate::error::{ClusterError, PoolError};
use crate::events::{DynEventListener, EventListener, PoolEvent, TracingListener};
use crate::lifecycle::Connector;
use crate::pool::{ConnectionPool, PoolBuilder};
use crate::stats::InstanceStatistics;
use crate::swap::SharedCell;
use crate::topology::{ClusterHostType, HostRole, Topology};
use crate::transaction::{NonTransaction, Transaction, TransactionOptions};

/// Immutable routing table.
#[derive(Default)]
struct ClusterState {
    topology: Topology,
    pools: HashMap<Dsn, Arc<ConnectionPool>>,
}

/// Releases the topology update flag, also when the update is cancelled.
struct UpdateGuard<'a>(&'a AtomicBool);

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ClusterInner {
    description: ClusterDescription,
    settings: ClusterSettings,
    connector: Arc<dyn Connector>,
    listener: DynEventListener,
    // Only `check_topology` publishes new states.
    state: SharedCell<ClusterState>,
    host_ind: AtomicU32,
    default_cmd_ctl: CommandControlStore,
    update_in_progress: AtomicBool,
}

impl ClusterInner {
    /// Probe all hosts and publish a new routing table.
    ///
    /// Returns `false` without doing anything if another check is running.
    async fn check_topology(&self) -> bool {
        if self
            .update_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("topology check already in progress");
            return false;
        }
        let _guard = UpdateGuard(&self.update_in_progress);

        let cmd_ctl = self.default_cmd_ctl.get();
        let topology =
            Topology::discover(self.connector.as_ref(), &self.description.dsns, cmd_ctl).await;

        let current = self.state.read();
        let mut pools = HashMap::new();
        for dsn in topology.available() {
            if let Some(pool) = current.pools.get(dsn) {
                pools.insert(dsn.clone(), Arc::clone(pool));
                continue;
            }
            match self.create_pool(dsn.clone(), cmd_ctl).await {
                Ok(pool) => {
                    pools.insert(dsn.clone(), Arc::new(pool));
                }
                Err(e) => {
                    tracing::warn!(host = %dsn, error = %e, "failed to create connection pool");
                }
            }
        }

        let changed = current.topology != topology;
        drop(current);
        let hosts = topology
            .hosts()
            .iter()
            .map(|(dsn, role)| (dsn.cut_password(), *role))
            .collect();
        self.state.store(ClusterState { topology, pools });

        // The default may have changed since the pools were created, and a
        // setter running before the store only saw the old table.
        let cmd_ctl = self.default_cmd_ctl.get();
        for pool in self.state.read().pools.values() {
            pool.set_default_command_control(cmd_ctl);
        }

        if changed {
            self.listener
                .on_event(&PoolEvent::TopologyChanged { hosts });
        }
        true
    }

    async fn create_pool(&self, dsn: Dsn, cmd_ctl: CommandControl) -> Result<ConnectionPool, PoolError> {
        PoolBuilder::shared_connector(dsn, Arc::clone(&self.connector))
            .settings(self.settings.pool)
            .command_control(cmd_ctl)
            .shared_listener(Arc::clone(&self.listener))
            .build()
            .await
    }

    fn find_pool(&self, host_type: ClusterHostType) -> Result<Arc<ConnectionPool>, ClusterError> {
        let state = self.state.read();
        let candidates: Vec<&Arc<ConnectionPool>> = state
            .topology
            .hosts_of(host_type)
            .filter_map(|dsn| state.pools.get(dsn))
            .collect();

        let index = match candidates.len() {
            0 => return Err(ClusterError::NoHostOfRequestedRole(host_type)),
            1 => 0,
            n => self.host_ind.fetch_add(1, Ordering::Relaxed) as usize % n,
        };
        Ok(Arc::clone(candidates[index]))
    }
}

/// A PostgreSQL cluster: one pool per host, routed by host role.
///
/// # Example
///
/// ```rust,ignore
/// use pg_cluster::{Cluster, ClusterDescription, ClusterHostType, Deadline, TransactionOptions};
///
/// let cluster = Cluster::builder(ClusterDescription::new(["host=db1", "host=db2"]), connector)
///     .build()
///     .await?;
///
/// let trx = cluster
///     .begin(ClusterHostType::Master, TransactionOptions::new(), Deadline::from_duration(timeout), None)
///     .await?;
/// ```
pub struct Cluster {
    inner: Arc<ClusterInner>,
    periodic_task: Mutex<Option<JoinHandle<()>>>,
}

impl Cluster {
    /// Create a cluster builder.
    pub fn builder(description: ClusterDescription, connector: impl Connector) -> ClusterBuilder {
        ClusterBuilder {
            description,
            connector: Arc::new(connector),
            settings: ClusterSettings::default(),
            cmd_ctl: CommandControl::default(),
            listener: Arc::new(TracingListener),
        }
    }

    /// Open a transaction on a host of the requested role.
    pub async fn begin(
        &self,
        host_type: ClusterHostType,
        options: TransactionOptions,
        deadline: Deadline,
        trx_cmd_ctl: Option<CommandControl>,
    ) -> Result<Transaction, ClusterError> {
        let pool = self.inner.find_pool(host_type)?;
        Ok(pool.begin(options, deadline, trx_cmd_ctl).await?)
    }

    /// Get a connection for single statements on a host of the requested role.
    pub async fn start(
        &self,
        host_type: ClusterHostType,
        deadline: Deadline,
    ) -> Result<NonTransaction, ClusterError> {
        let pool = self.inner.find_pool(host_type)?;
        Ok(pool.start(deadline).await?)
    }

    /// Run one topology check now.
    ///
    /// Returns `false` if a check was already running; in that case this
    /// call does nothing.
    pub async fn discover_topology(&self) -> bool {
        self.inner.check_topology().await
    }

    /// Current role assignment.
    #[must_use]
    pub fn topology(&self) -> Topology {
        self.inner.state.read().topology.clone()
    }

    /// Replace the cluster-wide command control.
    ///
    /// Nothing happens if `cmd_ctl` equals the current value; otherwise the
    /// new value is published to every pool. Returns whether it changed.
    pub fn set_default_command_control(&self, cmd_ctl: CommandControl) -> bool {
        if !self.inner.default_cmd_ctl.set(cmd_ctl) {
            return false;
        }
        for pool in self.inner.state.read().pools.values() {
            pool.set_default_command_control(cmd_ctl);
        }
        true
    }

    /// Cluster-wide command control.
    #[must_use]
    pub fn default_command_control(&self) -> CommandControl {
        self.inner.default_cmd_ctl.get()
    }

    /// Statistics of every host pool, grouped by role.
    #[must_use]
    pub fn statistics(&self) -> ClusterStatistics {
        let state = self.inner.state.read();
        let mut stats = ClusterStatistics::default();
        for (dsn, role) in state.topology.hosts() {
            let Some(pool) = state.pools.get(dsn) else {
                stats.unavailable.push(dsn.cut_password());
                continue;
            };
            let host = HostStatistics {
                host: pool.host().to_string(),
                role: *role,
                statistics: pool.statistics(),
            };
            match role {
                HostRole::Master if stats.master.is_none() => stats.master = Some(host),
                HostRole::SyncSlave => stats.sync_slaves.push(host),
                _ => stats.slaves.push(host),
            }
        }
        stats
    }

    fn start_periodic_updates(&self) {
        let cluster = Arc::downgrade(&self.inner);
        let period = self.inner.settings.topology_check_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                cluster.check_topology().await;
            }
        });
        *self.periodic_task.lock() = Some(task);
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        if let Some(task) = self.periodic_task.lock().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("hosts", &self.inner.description.dsns)
            .field("topology", &self.inner.state.read().topology)
            .finish()
    }
}

/// Builder for [`Cluster`].
pub struct ClusterBuilder {
    description: ClusterDescription,
    connector: Arc<dyn Connector>,
    settings: ClusterSettings,
    cmd_ctl: CommandControl,
    listener: DynEventListener,
}

impl ClusterBuilder {
    /// Set the cluster settings.
    #[must_use]
    pub fn settings(mut self, settings: ClusterSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Set the initial command control.
    #[must_use]
    pub fn command_control(mut self, cmd_ctl: CommandControl) -> Self {
        self.cmd_ctl = cmd_ctl;
        self
    }

    /// Set the event listener shared by the cluster and its pools.
    #[must_use]
    pub fn listener(mut self, listener: impl EventListener) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    /// Validate the configuration, discover the initial topology and start
    /// periodic topology updates.
    pub async fn build(self) -> Result<Cluster, ClusterError> {
        self.description.validate()?;
        self.settings.pool.validate()?;

        let inner = Arc::new(ClusterInner {
            description: self.description,
            settings: self.settings,
            connector: self.connector,
            listener: self.listener,
            state: SharedCell::default(),
            host_ind: AtomicU32::new(0),
            default_cmd_ctl: CommandControlStore::new(self.cmd_ctl),
            update_in_progress: AtomicBool::new(false),
        });

        inner.check_topology().await;
        let cluster = Cluster {
            inner,
            periodic_task: Mutex::new(None),
        };
        cluster.start_periodic_updates();
        Ok(cluster)
    }
}

/// Statistics of one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatistics {
    /// Credential-free host identifier.
    pub host: String,
    /// Role at the last topology check.
    pub role: HostRole,
    /// Pool statistics.
    pub statistics: InstanceStatistics,
}

/// Statistics of a whole cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClusterStatistics {
    /// The primary.
    pub master: Option<HostStatistics>,
    /// Synchronous replicas.
    pub sync_slaves: Vec<HostStatistics>,
    /// Asynchronous replicas and any additional primaries.
    pub slaves: Vec<HostStatistics>,
    /// Hosts without a pool.
    pub unavailable: Vec<String>,
}
