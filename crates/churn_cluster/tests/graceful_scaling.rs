//! Graceful scaling against the simulated cluster.
//!
//! Test flow:
//! 1) Start a 3-node cluster and seed keys across the slot space.
//! 2) Scale up to 5, then down to 2 with graceful removal.
//!
//! Verification:
//! - After each step the partition is total and balanced and every member agrees.
//! - No key is lost and only the minimal number of slots moves.
//! - Survivors never lose slots during a scale-down.

mod common;

use churn_cluster::{ControllerState, RemovalMode, DEFAULT_TOTAL_SLOTS};
use common::{assert_partition, assert_views_agree, seed_keys, started};

#[tokio::test(start_paused = true)]
async fn scale_up_then_down_keeps_keys_and_partition() {
    let (sim, mut ctl) = started(3).await;
    let keys = seed_keys(&sim, 64, 3);
    assert_eq!(sim.total_keys(), keys);

    let report = ctl.scale(5, RemovalMode::Graceful).await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Stable(5));
    assert_eq!(report.added.len(), 2);
    assert!(report.removed.is_empty());
    // 16384 / 5 = 3276 rem 4: the two newcomers need 6553 or 6552 between them.
    assert!((6552..=6554).contains(&report.slots_moved));
    assert_partition(&ctl);
    assert_views_agree(&sim, &ctl);
    assert_eq!(sim.total_keys(), keys);
    assert_eq!(sim.open_slots(), 0);

    let before = ctl.cluster().slots.as_ref().unwrap().counts();
    let report = ctl.scale(2, RemovalMode::Graceful).await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Stable(2));
    assert_eq!(report.removed.len(), 3);
    assert_partition(&ctl);
    assert_views_agree(&sim, &ctl);
    assert_eq!(sim.total_keys(), keys);
    assert_eq!(sim.instances_of("redis-master").len(), 2);

    let after = ctl.cluster().slots.as_ref().unwrap().counts();
    for node in &ctl.cluster().nodes {
        assert!(after[&node.id] >= before[&node.id]);
    }
    assert_eq!(after.values().sum::<usize>(), DEFAULT_TOTAL_SLOTS as usize);
}

#[tokio::test(start_paused = true)]
async fn departing_members_are_forgotten_by_survivors() {
    let (sim, mut ctl) = started(4).await;
    let victim = ctl.cluster().nodes[3].clone();
    ctl.scale(3, RemovalMode::Graceful).await.unwrap();
    for node in &ctl.cluster().nodes {
        assert!(!sim.membership_of(&node.instance).contains(&victim.id));
    }
    assert!(!sim.is_alive(&victim.instance));
}

#[tokio::test(start_paused = true)]
async fn scaling_to_the_current_size_does_nothing() {
    let (sim, mut ctl) = started(3).await;
    sim.clear_command_log();
    let report = ctl.scale(3, RemovalMode::Graceful).await.unwrap();
    assert!(report.skipped);
    assert!(sim.command_log().is_empty());
}
