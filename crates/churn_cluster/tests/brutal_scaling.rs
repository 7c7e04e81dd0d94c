//! Brutal removal: members are killed before their slots are handed off.
//!
//! Test flow:
//! 1) Start a 4-node cluster and seed keys.
//! 2) Remove one member brutally, with and without a working cluster fix.
//! 3) Grow the cluster again.
//!
//! Verification:
//! - The victim leaves the registry and every survivor's membership view.
//! - Nothing addresses the victim after it was shut down, except FORGET.
//! - The partition is total and balanced again once the operation returns.

mod common;

use churn_cluster::{AdminCommand, ControllerState, NodeAddr, NodeId, RemovalMode, SimCluster};
use churn_cluster::admin::SetSlotState;
use common::{assert_partition, assert_views_agree, seed_keys, started};

fn mentions(cmd: &AdminCommand, id: &NodeId) -> bool {
    match cmd {
        AdminCommand::SetSlot { state, .. } => matches!(
            state,
            SetSlotState::Importing(n) | SetSlotState::Migrating(n) | SetSlotState::Node(n) if n == id
        ),
        _ => false,
    }
}

/// Commands sent after the victim's SHUTDOWN that still target or name it.
fn stray_commands(sim: &SimCluster, addr: &NodeAddr, id: &NodeId) -> Vec<(NodeAddr, AdminCommand)> {
    let log = sim.command_log();
    let shutdown = log
        .iter()
        .position(|(target, cmd)| target == addr && *cmd == AdminCommand::Shutdown)
        .map(|idx| idx + 1)
        .unwrap_or(0);
    log[shutdown..]
        .iter()
        .filter(|(target, cmd)| target == addr || mentions(cmd, id))
        .cloned()
        .collect()
}

#[tokio::test(start_paused = true)]
async fn brutal_removal_forgets_victim_and_rebalances() {
    let (sim, mut ctl) = started(4).await;
    let keys = seed_keys(&sim, 64, 2);
    let victim = ctl.cluster().nodes[3].clone();
    let lost = sim.keys_on(&victim.instance);
    assert!(lost > 0);
    sim.clear_command_log();

    let report = ctl.scale(3, RemovalMode::Brutal).await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Stable(3));
    assert_eq!(report.removed, vec![victim.id.clone()]);
    assert!(sim.repairs() >= 1);
    assert_partition(&ctl);
    assert_views_agree(&sim, &ctl);

    assert!(ctl.cluster().nodes.iter().all(|n| n.id != victim.id));
    for node in &ctl.cluster().nodes {
        assert!(!sim.membership_of(&node.instance).contains(&victim.id));
    }
    assert!(sim.instances_of("redis-master").iter().all(|i| *i != victim.instance));
    assert_eq!(sim.total_keys(), keys - lost);
    assert!(stray_commands(&sim, &victim.addr, &victim.id).is_empty());

    sim.clear_command_log();
    ctl.scale(4, RemovalMode::Brutal).await.unwrap();
    assert_partition(&ctl);
    assert_views_agree(&sim, &ctl);
    assert!(sim
        .command_log()
        .iter()
        .all(|(target, cmd)| *target != victim.addr
            && !mentions(cmd, &victim.id)
            && *cmd != AdminCommand::Forget(victim.id.clone())));
}

#[tokio::test(start_paused = true)]
async fn failed_fix_falls_back_to_addslots() {
    let (sim, mut ctl) = started(4).await;
    let victim_slots = ctl
        .cluster()
        .slots
        .as_ref()
        .unwrap()
        .slots_of(&ctl.cluster().nodes[3].id)
        .len();
    sim.fail_next_repairs(1);

    let report = ctl.scale(3, RemovalMode::Brutal).await.unwrap();
    assert_eq!(report.slots_assigned, victim_slots);
    assert_partition(&ctl);
    assert_views_agree(&sim, &ctl);
}

#[tokio::test(start_paused = true)]
async fn unanswered_shutdown_does_not_block_removal() {
    let (sim, mut ctl) = started(3).await;
    sim.fail_next("SHUTDOWN", 1);
    ctl.scale(2, RemovalMode::Brutal).await.unwrap();
    assert_eq!(ctl.state(), ControllerState::Stable(2));
    assert_eq!(sim.instances_of("redis-master").len(), 2);
    assert_partition(&ctl);
}
