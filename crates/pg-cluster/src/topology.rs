//! Cluster topology: which host plays which role.

use futures_util::future::join_all;
use serde::Serialize;

use crate::command_control::CommandControl;
use crate::config::Dsn;
use crate::error::ConnectionError;
use crate::lifecycle::Connector;

/// Connection id used for short-lived probe sessions.
const PROBE_CONNECTION_ID: u32 = 0;

/// Role a host reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HostRole {
    /// Writable primary.
    Master,
    /// Synchronous replica.
    SyncSlave,
    /// Asynchronous replica.
    Slave,
    /// The host could not be probed.
    Unavailable,
}

/// Kind of host a caller asks the cluster for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ClusterHostType {
    /// The writable primary.
    Master,
    /// A synchronous replica.
    SyncSlave,
    /// Any replica, synchronous or not.
    Slave,
    /// Any available host.
    Any,
}

impl ClusterHostType {
    /// Whether a host with `role` can serve requests of this type.
    #[must_use]
    pub fn accepts(&self, role: HostRole) -> bool {
        match (self, role) {
            (_, HostRole::Unavailable) => false,
            (Self::Master, HostRole::Master) => true,
            (Self::SyncSlave, HostRole::SyncSlave) => true,
            (Self::Slave, HostRole::SyncSlave | HostRole::Slave) => true,
            (Self::Any, _) => true,
            _ => false,
        }
    }
}

/// Role assignment of every configured host, in configuration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    hosts: Vec<(Dsn, HostRole)>,
}

impl Topology {
    /// Build a topology from explicit role assignments.
    #[must_use]
    pub fn new(hosts: Vec<(Dsn, HostRole)>) -> Self {
        Self { hosts }
    }

    /// Probe every host concurrently and collect the roles they report.
    pub async fn discover(connector: &dyn Connector, dsns: &[Dsn], cmd_ctl: CommandControl) -> Self {
        let roles = join_all(dsns.iter().map(|dsn| probe_host(connector, dsn, cmd_ctl))).await;
        Self {
            hosts: dsns.iter().cloned().zip(roles).collect(),
        }
    }

    /// All hosts with their roles.
    #[must_use]
    pub fn hosts(&self) -> &[(Dsn, HostRole)] {
        &self.hosts
    }

    /// Hosts able to serve `host_type`.
    pub fn hosts_of(&self, host_type: ClusterHostType) -> impl Iterator<Item = &Dsn> {
        self.hosts
            .iter()
            .filter(move |(_, role)| host_type.accepts(*role))
            .map(|(dsn, _)| dsn)
    }

    /// Role of `dsn`, if it is part of the topology.
    #[must_use]
    pub fn role_of(&self, dsn: &Dsn) -> Option<HostRole> {
        self.hosts
            .iter()
            .find(|(host, _)| host == dsn)
            .map(|(_, role)| *role)
    }

    /// Hosts that answered the probe.
    pub fn available(&self) -> impl Iterator<Item = &Dsn> {
        self.hosts_of(ClusterHostType::Any)
    }
}

async fn probe_host(connector: &dyn Connector, dsn: &Dsn, cmd_ctl: CommandControl) -> HostRole {
    let probe = async {
        let mut conn = connector.connect(dsn, PROBE_CONNECTION_ID, cmd_ctl).await?;
        conn.host_role().await
    };

    let result = match tokio::time::timeout(cmd_ctl.network, probe).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::Timeout),
    };

    match result {
        Ok(role) => role,
        Err(e) => {
            tracing::debug!(host = %dsn, error = %e, "host probe failed");
            HostRole::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Topology {
        Topology::new(vec![
            (Dsn::new("host=a"), HostRole::Slave),
            (Dsn::new("host=b"), HostRole::Master),
            (Dsn::new("host=c"), HostRole::SyncSlave),
            (Dsn::new("host=d"), HostRole::Unavailable),
        ])
    }

    fn names(topology: &Topology, host_type: ClusterHostType) -> Vec<String> {
        topology
            .hosts_of(host_type)
            .map(|dsn| dsn.as_str().to_string())
            .collect()
    }

    #[test]
    fn test_routing_by_host_type() {
        let topology = sample();
        assert_eq!(names(&topology, ClusterHostType::Master), ["host=b"]);
        assert_eq!(names(&topology, ClusterHostType::SyncSlave), ["host=c"]);
        assert_eq!(names(&topology, ClusterHostType::Slave), ["host=a", "host=c"]);
        assert_eq!(
            names(&topology, ClusterHostType::Any),
            ["host=a", "host=b", "host=c"]
        );
    }

    #[test]
    fn test_role_lookup() {
        let topology = sample();
        assert_eq!(topology.role_of(&Dsn::new("host=d")), Some(HostRole::Unavailable));
        assert_eq!(topology.role_of(&Dsn::new("host=x")), None);
        assert_eq!(topology.available().count(), 3);
    }
}
