//! Cluster routing and topology integration tests.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use pg_cluster::{
    Cluster, ClusterDescription, ClusterError, ClusterHostType, ClusterSettings, CommandControl,
    ConfigError, Deadline, Dsn, HostRole, PoolEvent, PoolSettings, TransactionOptions,
};
use pg_cluster_testing::{MockConnector, RecordingListener, wait_until};

const MASTER: &str = "host=a";
const REPLICA: &str = "host=b";
const SYNC_REPLICA: &str = "host=c";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn deadline() -> Deadline {
    Deadline::from_duration(Duration::from_millis(500))
}

fn settings(check_interval: Duration) -> ClusterSettings {
    ClusterSettings::default()
        .pool(PoolSettings::new().min_size(1).max_size(2))
        .topology_check_interval(check_interval)
}

fn three_hosts() -> MockConnector {
    let connector = MockConnector::new();
    connector.set_roles(&[
        (MASTER, HostRole::Master),
        (REPLICA, HostRole::Slave),
        (SYNC_REPLICA, HostRole::SyncSlave),
    ]);
    connector
}

async fn build_cluster(
    connector: &MockConnector,
    listener: &RecordingListener,
    check_interval: Duration,
) -> Cluster {
    init_tracing();
    Cluster::builder(
        ClusterDescription::new([MASTER, REPLICA, SYNC_REPLICA]),
        connector.clone(),
    )
    .settings(settings(check_interval))
    .listener(listener.clone())
    .build()
    .await
    .unwrap()
}

fn command_control_changes(listener: &RecordingListener) -> usize {
    listener.count(|e| matches!(e, PoolEvent::CommandControlChanged { .. }))
}

async fn host_for(cluster: &Cluster, host_type: ClusterHostType) -> String {
    let session = cluster.start(host_type, deadline()).await.unwrap();
    session.connection().host().to_string()
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_requests_are_routed_by_role() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(60)).await;

    assert_eq!(connector.probes(), 3);
    assert_eq!(host_for(&cluster, ClusterHostType::Master).await, MASTER);
    assert_eq!(host_for(&cluster, ClusterHostType::SyncSlave).await, SYNC_REPLICA);

    let mut replicas = HashSet::new();
    for _ in 0..4 {
        replicas.insert(host_for(&cluster, ClusterHostType::Slave).await);
    }
    assert_eq!(replicas, HashSet::from([REPLICA.to_string(), SYNC_REPLICA.to_string()]));

    let mut any = HashSet::new();
    for _ in 0..6 {
        any.insert(host_for(&cluster, ClusterHostType::Any).await);
    }
    assert_eq!(any.len(), 3);

    let mut trx = cluster
        .begin(ClusterHostType::Master, TransactionOptions::new(), deadline(), None)
        .await
        .unwrap();
    assert_eq!(trx.connection().host(), MASTER);
    trx.execute("UPDATE accounts SET balance = balance - 1").await.unwrap();
    trx.commit().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_missing_role_is_reported() {
    let connector = MockConnector::new();
    let cluster = Cluster::builder(ClusterDescription::new([MASTER]), connector.clone())
        .settings(settings(Duration::from_secs(60)))
        .build()
        .await
        .unwrap();

    let err = cluster
        .start(ClusterHostType::SyncSlave, deadline())
        .await
        .unwrap_err();
    assert_eq!(err, ClusterError::NoHostOfRequestedRole(ClusterHostType::SyncSlave));

    let err = cluster
        .begin(ClusterHostType::Slave, TransactionOptions::new(), deadline(), None)
        .await
        .unwrap_err();
    assert_eq!(err, ClusterError::NoHostOfRequestedRole(ClusterHostType::Slave));
}

#[tokio::test(start_paused = true)]
async fn test_empty_description_is_rejected() {
    let err = Cluster::builder(ClusterDescription::new(Vec::<&str>::new()), MockConnector::new())
        .build()
        .await
        .unwrap_err();
    assert_eq!(err, ClusterError::Config(ConfigError::EmptyCluster));

    let err = Cluster::builder(ClusterDescription::new([MASTER, ""]), MockConnector::new())
        .build()
        .await
        .unwrap_err();
    assert_eq!(err, ClusterError::Config(ConfigError::EmptyDsn));
}

// =============================================================================
// Topology
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_failover_is_picked_up_by_discovery() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(60)).await;
    assert_eq!(listener.count(|e| matches!(e, PoolEvent::TopologyChanged { .. })), 1);

    connector.set_roles(&[(MASTER, HostRole::Slave), (REPLICA, HostRole::Master)]);
    assert!(cluster.discover_topology().await);

    assert_eq!(host_for(&cluster, ClusterHostType::Master).await, REPLICA);
    assert_eq!(
        cluster.topology().role_of(&Dsn::new(MASTER)),
        Some(HostRole::Slave)
    );
    assert_eq!(listener.count(|e| matches!(e, PoolEvent::TopologyChanged { .. })), 2);

    // Pools of hosts that stay available are reused.
    assert_eq!(connector.connect_attempts(), 3);

    // Nothing changed: no new event.
    assert!(cluster.discover_topology().await);
    assert_eq!(listener.count(|e| matches!(e, PoolEvent::TopologyChanged { .. })), 2);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_host_leaves_topology() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(60)).await;

    connector.set_role(REPLICA, HostRole::Unavailable);
    assert!(cluster.discover_topology().await);

    let stats = cluster.statistics();
    assert_eq!(stats.unavailable, vec![REPLICA.to_string()]);
    assert!(stats.slaves.is_empty());
    assert_eq!(stats.sync_slaves.len(), 1);

    // Only the synchronous replica is left to serve replica reads.
    for _ in 0..3 {
        assert_eq!(host_for(&cluster, ClusterHostType::Slave).await, SYNC_REPLICA);
    }

    // Back online: a fresh pool is created for it.
    connector.set_role(REPLICA, HostRole::Slave);
    assert!(cluster.discover_topology().await);
    assert!(cluster.statistics().unavailable.is_empty());
    assert_eq!(connector.connect_attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_discovery() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(1)).await;

    connector.set_roles(&[(MASTER, HostRole::Slave), (REPLICA, HostRole::Master)]);
    tokio::time::sleep(Duration::from_millis(1_500)).await;

    assert_eq!(
        cluster.topology().role_of(&Dsn::new(REPLICA)),
        Some(HostRole::Master)
    );
    assert_eq!(host_for(&cluster, ClusterHostType::Master).await, REPLICA);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_discovery_runs_once() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(60)).await;
    connector.set_connect_delay(Duration::from_millis(100));

    let probes_before = connector.probes();
    let (first, second) = tokio::join!(cluster.discover_topology(), cluster.discover_topology());
    assert!(first ^ second);
    assert_eq!(connector.probes(), probes_before + 3);

    // The flag is released afterwards.
    assert!(cluster.discover_topology().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_always_see_a_complete_topology() {
    let connector = MockConnector::new();
    connector.set_roles(&[(MASTER, HostRole::Master), (REPLICA, HostRole::Slave)]);
    let cluster = Arc::new(
        Cluster::builder(ClusterDescription::new([MASTER, REPLICA]), connector.clone())
            .settings(settings(Duration::from_secs(60)))
            .build()
            .await
            .unwrap(),
    );

    let flipper = {
        let cluster = Arc::clone(&cluster);
        let connector = connector.clone();
        tokio::spawn(async move {
            for i in 0..20 {
                if i % 2 == 0 {
                    connector.set_roles(&[(MASTER, HostRole::Slave), (REPLICA, HostRole::Master)]);
                } else {
                    connector.set_roles(&[(MASTER, HostRole::Master), (REPLICA, HostRole::Slave)]);
                }
                cluster.discover_topology().await;
            }
        })
    };

    while !flipper.is_finished() {
        let topology = cluster.topology();
        assert_eq!(topology.hosts().len(), 2);
        assert_eq!(topology.hosts_of(ClusterHostType::Master).count(), 1);
        tokio::task::yield_now().await;
    }
    flipper.await.unwrap();
}

// =============================================================================
// Command control and statistics
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_command_control_propagates_to_pools() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(60)).await;

    let session = cluster.start(ClusterHostType::Master, deadline()).await.unwrap();
    let applied = connector.last_command_control();
    assert_eq!(applied, Some(CommandControl::default()));
    drop(session);

    // An equal value is not published to any pool or connection.
    assert!(!cluster.set_default_command_control(CommandControl::default()));
    assert_eq!(cluster.default_command_control(), CommandControl::default());
    assert_eq!(command_control_changes(&listener), 0);
    let session = cluster.start(ClusterHostType::SyncSlave, deadline()).await.unwrap();
    assert_eq!(connector.last_command_control(), applied);
    drop(session);

    let updated = CommandControl::new(Duration::from_millis(300), Duration::from_secs(10));
    assert!(cluster.set_default_command_control(updated));
    assert_eq!(cluster.default_command_control(), updated);
    assert_eq!(command_control_changes(&listener), 3);
    assert!(!cluster.set_default_command_control(updated));
    assert_eq!(command_control_changes(&listener), 3);

    for host_type in [ClusterHostType::Master, ClusterHostType::SyncSlave] {
        let _session = cluster.start(host_type, deadline()).await.unwrap();
        assert_eq!(connector.last_command_control(), Some(updated));
    }

    // Pools created later start with the current value.
    connector.set_role(REPLICA, HostRole::Unavailable);
    assert!(cluster.discover_topology().await);
    connector.set_role(REPLICA, HostRole::Slave);
    assert!(cluster.discover_topology().await);
    let mut replicas = HashSet::new();
    for _ in 0..2 {
        let session = cluster.start(ClusterHostType::Slave, deadline()).await.unwrap();
        assert_eq!(connector.last_command_control(), Some(updated));
        replicas.insert(session.connection().host().to_string());
    }
    assert!(replicas.contains(REPLICA));
}

#[tokio::test(start_paused = true)]
async fn test_command_control_set_during_discovery_reaches_new_pools() {
    let connector = three_hosts();
    let listener = RecordingListener::new();
    let cluster = build_cluster(&connector, &listener, Duration::from_secs(60)).await;

    connector.set_role(REPLICA, HostRole::Unavailable);
    assert!(cluster.discover_topology().await);
    connector.set_role(REPLICA, HostRole::Slave);
    connector.set_connect_delay(Duration::from_millis(100));

    let updated = CommandControl::new(Duration::from_millis(300), Duration::from_secs(10));
    let attempts = connector.connect_attempts();
    let (discovered, ()) = tokio::join!(cluster.discover_topology(), async {
        // Change the default while the replica pool is warming up.
        assert!(
            wait_until(Duration::from_millis(500), || connector.connect_attempts() > attempts)
                .await
        );
        assert!(cluster.set_default_command_control(updated));
    });
    assert!(discovered);
    connector.set_connect_delay(Duration::ZERO);

    for _ in 0..4 {
        let session = cluster.start(ClusterHostType::Slave, deadline()).await.unwrap();
        if session.connection().host() == REPLICA {
            assert_eq!(connector.last_command_control(), Some(updated));
            return;
        }
    }
    panic!("replica pool was never used");
}

#[tokio::test(start_paused = true)]
async fn test_statistics_grouped_by_role_without_credentials() {
    let master = "host=a password=s3cret";
    let replica = "postgresql://app:s3cret@b/main";
    let sync_replica = "host=c password=s3cret";
    let connector = MockConnector::new();
    connector.set_roles(&[
        (master, HostRole::Master),
        (replica, HostRole::Slave),
        (sync_replica, HostRole::SyncSlave),
    ]);
    let cluster = Cluster::builder(
        ClusterDescription::new([master, replica, sync_replica]),
        connector.clone(),
    )
    .settings(settings(Duration::from_secs(60)))
    .build()
    .await
    .unwrap();

    let stats = cluster.statistics();
    let primary = stats.master.as_ref().unwrap();
    assert_eq!(primary.host, "host=a");
    assert_eq!(primary.role, HostRole::Master);
    assert_eq!(primary.statistics.connection.active, 1);
    assert_eq!(stats.slaves.len(), 1);
    assert_eq!(stats.slaves[0].host, "postgresql://app@b/main");
    assert_eq!(stats.sync_slaves.len(), 1);
    assert_eq!(stats.sync_slaves[0].host, "host=c");
    assert!(!format!("{stats:?}").contains("s3cret"));
}

#[tokio::test(start_paused = true)]
async fn test_second_primary_is_reported_with_replicas() {
    let connector = MockConnector::new();
    let cluster = Cluster::builder(ClusterDescription::new([MASTER, REPLICA]), connector.clone())
        .settings(settings(Duration::from_secs(60)))
        .build()
        .await
        .unwrap();

    let stats = cluster.statistics();
    assert_eq!(stats.master.as_ref().unwrap().host, MASTER);
    assert_eq!(stats.slaves.len(), 1);
    assert_eq!(stats.slaves[0].host, REPLICA);
    assert_eq!(stats.slaves[0].role, HostRole::Master);
}
