//! Shutdown requested while a scale operation is migrating slots.
//!
//! Test flow:
//! 1) Replay a synthetic trace, scaling the cluster at each step.
//! 2) Flip the shutdown flag from inside the admin transport the first time a
//!    slot is announced, i.e. in the middle of `Scaling`.
//! 3) The replay loop only checks the flag between steps.
//!
//! Verification:
//! - The in-flight scale runs to completion; no further step starts.
//! - The slot map still covers all 16384 slots with nothing in flight.
//! - Stopping afterwards deprovisions every member.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use churn_cluster::{
    AdminCommand, AdminReply, AdminTransport, ClusterController, ControllerState, NodeAddr,
    RemovalMode, SimCluster, SyntheticTrace, TraceReplayer, DEFAULT_TOTAL_SLOTS,
};
use common::{assert_partition, fast_config};
use tokio::sync::watch;

/// Forwards to the simulation and raises the shutdown flag on the first SETSLOT.
struct SignalOnMigration {
    sim: Arc<SimCluster>,
    shutdown: watch::Sender<bool>,
    fired: AtomicBool,
}

#[async_trait]
impl AdminTransport for SignalOnMigration {
    async fn execute(&self, target: &NodeAddr, cmd: AdminCommand) -> churn_cluster::Result<AdminReply> {
        if matches!(cmd, AdminCommand::SetSlot { .. }) && !self.fired.swap(true, Ordering::SeqCst) {
            self.shutdown.send_replace(true);
        }
        self.sim.execute(target, cmd).await
    }

    async fn repair(&self, target: &NodeAddr) -> churn_cluster::Result<()> {
        self.sim.repair(target).await
    }
}

#[tokio::test(start_paused = true)]
async fn interrupt_during_scaling_leaves_a_full_partition() {
    let sim = Arc::new(SimCluster::new());
    let (tx, mut rx) = watch::channel(false);
    let admin = Arc::new(SignalOnMigration {
        sim: sim.clone(),
        shutdown: tx,
        fired: AtomicBool::new(false),
    });
    let mut ctl = ClusterController::new(sim.clone(), admin, fast_config());
    let mut trace = SyntheticTrace::new(vec![3, 5, 2, 4]);

    ctl.start(trace.initial_size()).await.unwrap();
    let mut applied = Vec::new();
    while let Some(step) = trace.next_step().await.unwrap() {
        if *rx.borrow_and_update() {
            break;
        }
        let report = ctl.scale(step.size, RemovalMode::Graceful).await.unwrap();
        applied.push(report.to);
    }

    // Step 0 (size 3) is a no-op; step 1 (size 5) is interrupted but finishes.
    assert_eq!(applied, vec![3, 5]);
    assert!(*rx.borrow());
    assert_eq!(ctl.state(), ControllerState::Stable(5));
    assert_partition(&ctl);
    let map = ctl.cluster().slots.as_ref().unwrap();
    assert_eq!(map.owned_total(), DEFAULT_TOTAL_SLOTS as usize);

    ctl.stop().await.unwrap();
    assert!(sim.instances_of("redis-master").is_empty());
}
