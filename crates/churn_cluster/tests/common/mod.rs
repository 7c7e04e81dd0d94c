//! Shared helpers for controller integration tests against the simulated cluster.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use churn_cluster::{
    AdminTransport, ClusterController, ControllerConfig, MigrationConfig, Provisioner,
    RegistryConfig, SimCluster, Slot, DEFAULT_TOTAL_SLOTS,
};

pub type SimController = ClusterController<SimCluster, SimCluster>;

/// Controller settings with short backoffs so paused-clock tests stay quick.
pub fn fast_config() -> ControllerConfig {
    ControllerConfig {
        registry: RegistryConfig {
            discovery_attempts: 3,
            discovery_backoff: Duration::from_millis(10),
            poll_interval: Duration::from_millis(10),
            ..RegistryConfig::default()
        },
        migration: MigrationConfig {
            retry_backoff: Duration::from_millis(1),
            key_batch: 16,
            ..MigrationConfig::default()
        },
        join_timeout: Duration::from_millis(200),
        ..ControllerConfig::default()
    }
}

/// Start a sharded cluster of `size` members on a fresh simulation.
pub async fn started(size: usize) -> (Arc<SimCluster>, SimController) {
    let sim = Arc::new(SimCluster::new());
    let mut ctl = ClusterController::new(sim.clone(), sim.clone(), fast_config());
    ctl.start(size).await.expect("start cluster");
    (sim, ctl)
}

/// Put `per_slot` keys into every `stride`-th slot. Returns the keys written.
pub fn seed_keys(sim: &SimCluster, stride: usize, per_slot: usize) -> usize {
    let mut written = 0;
    for slot in (0..DEFAULT_TOTAL_SLOTS as usize).step_by(stride) {
        assert!(sim.seed_keys(slot as Slot, per_slot), "slot {slot} has no owner");
        written += per_slot;
    }
    written
}

/// Total, non-overlapping and balanced across the controller's members.
pub fn assert_partition<P: Provisioner, A: AdminTransport>(ctl: &ClusterController<P, A>) {
    let cluster = ctl.cluster();
    let map = cluster.slots.as_ref().expect("sharded cluster has a slot map");
    assert_eq!(map.owned_total(), DEFAULT_TOTAL_SLOTS as usize);
    assert!(map.in_flight().is_empty());
    map.check_balanced(&cluster.node_ids())
        .expect("balanced partition");
}

/// Every member's own view of slot ownership matches the controller's map.
pub fn assert_views_agree<P: Provisioner, A: AdminTransport>(
    sim: &SimCluster,
    ctl: &ClusterController<P, A>,
) {
    let cluster = ctl.cluster();
    let expected = cluster
        .slots
        .as_ref()
        .expect("sharded cluster has a slot map")
        .counts();
    for node in &cluster.nodes {
        assert_eq!(
            sim.slot_counts_seen_by(&node.instance),
            expected,
            "view of {} diverges",
            node.id
        );
    }
}
