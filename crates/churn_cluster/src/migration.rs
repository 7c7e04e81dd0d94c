//! Slot transfers between two members.
//!
//! A transfer runs the usual sharded-KV handshake: announce (`IMPORTING` at
//! the destination, `MIGRATING` at the source), move keys in bounded batches,
//! then hand ownership to the destination on every member. The local
//! [`SlotMap`] only flips a slot after the final `SETSLOT NODE` has been
//! accepted everywhere.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::{self, Instant};

use crate::admin::{AdminCommand, AdminExt, AdminReply, AdminTransport, SetSlotState};
use crate::error::{ClusterError, Result};
use crate::node::{Node, NodeAddr, NodeId};
use crate::slot_map::{Slot, SlotAssignment, SlotMap, SlotTransfer};

/// Configuration for [`MigrationEngine`].
#[derive(Clone, Debug)]
pub struct MigrationConfig {
    /// Retries after the first attempt, for the announce phase and for key moves.
    pub retries: u32,
    pub retry_backoff: Duration,
    /// Keys fetched per `CLUSTER GETKEYSINSLOT`.
    pub key_batch: usize,
    /// Timeout handed to `MIGRATE`.
    pub migrate_timeout_ms: u64,
    /// Slots per `CLUSTER ADDSLOTS` call.
    pub addslots_chunk: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_backoff: Duration::from_millis(500),
            key_batch: 100,
            migrate_timeout_ms: 5000,
            addslots_chunk: 1024,
        }
    }
}

/// Result of one confirmed transfer, kept for reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TransferOutcome {
    pub from: NodeId,
    pub to: NodeId,
    pub slots: usize,
    pub keys_moved: usize,
    /// Retries spent across announce and key moves.
    pub retries: u32,
    pub elapsed_ms: u64,
}

pub struct MigrationEngine<A> {
    admin: Arc<A>,
    cfg: MigrationConfig,
}

impl<A: AdminTransport> MigrationEngine<A> {
    pub fn new(admin: Arc<A>, cfg: MigrationConfig) -> Self {
        Self { admin, cfg }
    }

    pub fn config(&self) -> &MigrationConfig {
        &self.cfg
    }

    /// Best-effort cluster-wide fix before a batch of transfers. Failures are
    /// logged and otherwise ignored.
    pub async fn prepare(&self, anchor: &NodeAddr) -> bool {
        match self.admin.repair(anchor).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(anchor = %anchor, error = %err, "cluster fix failed; continuing");
                false
            }
        }
    }

    /// Hand unowned slots to a member with `CLUSTER ADDSLOTS`.
    pub async fn assign_slots(
        &self,
        map: &mut SlotMap,
        members: &[Node],
        assignment: &SlotAssignment,
    ) -> Result<()> {
        let node = member(members, &assignment.node)?;
        for chunk in assignment.slots.chunks(self.cfg.addslots_chunk.max(1)) {
            self.admin
                .expect_ok(&node.addr, AdminCommand::AddSlots(chunk.to_vec()))
                .await?;
            map.assign(&node.id, chunk)?;
        }
        tracing::info!(node = %node.id, slots = assignment.slots.len(), "assigned unowned slots");
        Ok(())
    }

    /// Move `transfer.slots` from `transfer.from` to `transfer.to`.
    ///
    /// `members` is every node that must learn the new owner. On error the
    /// slot map keeps the old owner for every slot that was not finalized.
    pub async fn transfer_slots(
        &self,
        map: &mut SlotMap,
        members: &[Node],
        transfer: &SlotTransfer,
    ) -> Result<TransferOutcome> {
        let started = Instant::now();
        let from = member(members, &transfer.from)?;
        let to = member(members, &transfer.to)?;
        map.begin_transfer(&from.id, &to.id, &transfer.slots)?;

        let mut retries = 0u32;
        if let Err(err) = self.announce(from, to, &transfer.slots, &mut retries).await {
            return Err(self.abort(map, from, to, &transfer.slots, None, err).await);
        }

        let mut keys_moved = 0usize;
        let mut idx = 0usize;
        while idx < transfer.slots.len() {
            let slot = transfer.slots[idx];
            match self.drain_slot(from, to, slot).await {
                Ok(moved) => {
                    keys_moved += moved;
                    idx += 1;
                }
                Err(err) if retries < self.cfg.retries => {
                    retries += 1;
                    tracing::warn!(
                        from = %from.id,
                        to = %to.id,
                        slot,
                        retry = retries,
                        error = %err,
                        "key migration failed; retrying"
                    );
                    time::sleep(self.cfg.retry_backoff).await;
                }
                Err(err) => {
                    return Err(self.abort(map, from, to, &transfer.slots, Some(slot), err).await);
                }
            }
        }

        for (done, &slot) in transfer.slots.iter().enumerate() {
            if let Err(err) = self.finalize(members, from, to, slot).await {
                let rest = &transfer.slots[done..];
                return Err(self.abort(map, from, to, rest, Some(slot), err).await);
            }
            map.apply_slot(slot, &from.id, &to.id)?;
        }

        let outcome = TransferOutcome {
            from: from.id.clone(),
            to: to.id.clone(),
            slots: transfer.slots.len(),
            keys_moved,
            retries,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            from = %outcome.from,
            to = %outcome.to,
            slots = outcome.slots,
            keys = outcome.keys_moved,
            retries = outcome.retries,
            "slot transfer complete"
        );
        Ok(outcome)
    }

    /// Announce every slot; any failure restarts the whole announce phase.
    async fn announce(&self, from: &Node, to: &Node, slots: &[Slot], retries: &mut u32) -> Result<()> {
        loop {
            match self.announce_once(from, to, slots).await {
                Ok(()) => return Ok(()),
                Err(err) if *retries < self.cfg.retries => {
                    *retries += 1;
                    tracing::warn!(
                        from = %from.id,
                        to = %to.id,
                        retry = *retries,
                        error = %err,
                        "announce failed; re-announcing"
                    );
                    time::sleep(self.cfg.retry_backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn announce_once(&self, from: &Node, to: &Node, slots: &[Slot]) -> Result<()> {
        for &slot in slots {
            self.admin
                .expect_ok(
                    &to.addr,
                    AdminCommand::SetSlot {
                        slot,
                        state: SetSlotState::Importing(from.id.clone()),
                    },
                )
                .await?;
            self.admin
                .expect_ok(
                    &from.addr,
                    AdminCommand::SetSlot {
                        slot,
                        state: SetSlotState::Migrating(to.id.clone()),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Move every key of `slot` still resident at the source.
    async fn drain_slot(&self, from: &Node, to: &Node, slot: Slot) -> Result<usize> {
        let mut moved = 0usize;
        loop {
            let keys = self
                .admin
                .execute(
                    &from.addr,
                    AdminCommand::GetKeysInSlot {
                        slot,
                        count: self.cfg.key_batch.max(1),
                    },
                )
                .await?
                .into_keys(&from.addr)?;
            if keys.is_empty() {
                return Ok(moved);
            }
            let batch = keys.len();
            let reply = self
                .admin
                .execute(
                    &from.addr,
                    AdminCommand::Migrate {
                        dest: to.addr.clone(),
                        keys,
                        timeout_ms: self.cfg.migrate_timeout_ms,
                    },
                )
                .await?;
            match reply {
                AdminReply::Ok => moved += batch,
                // Keys expired or were deleted between the two calls.
                AdminReply::NoKey => {}
                other => {
                    return Err(ClusterError::protocol(
                        &from.addr,
                        format!("MIGRATE: unexpected reply {other:?}"),
                    ))
                }
            }
        }
    }

    /// Name the destination as owner on every member, destination and
    /// source first.
    async fn finalize(&self, members: &[Node], from: &Node, to: &Node, slot: Slot) -> Result<()> {
        let others = members.iter().filter(|n| n.id != from.id && n.id != to.id);
        for node in [to, from].into_iter().chain(others) {
            self.admin
                .expect_ok(
                    &node.addr,
                    AdminCommand::SetSlot {
                        slot,
                        state: SetSlotState::Node(to.id.clone()),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Keep the old owner for `slots` locally and clear any importing or
    /// migrating markers left at either end.
    async fn abort(
        &self,
        map: &mut SlotMap,
        from: &Node,
        to: &Node,
        slots: &[Slot],
        at: Option<Slot>,
        err: ClusterError,
    ) -> ClusterError {
        map.abort_transfer(slots);
        for node in [to, from] {
            for &slot in slots {
                let stable = AdminCommand::SetSlot {
                    slot,
                    state: SetSlotState::Stable,
                };
                if let Err(clear_err) = self.admin.expect_ok(&node.addr, stable).await {
                    tracing::warn!(
                        node = %node.id,
                        slot,
                        error = %clear_err,
                        "could not clear slot markers; leaving them to the next cluster fix"
                    );
                    break;
                }
            }
        }
        failed(from, to, at, err)
    }
}

fn member<'a>(members: &'a [Node], id: &NodeId) -> Result<&'a Node> {
    members
        .iter()
        .find(|n| n.id == *id)
        .ok_or_else(|| ClusterError::UnknownNode(id.to_string()))
}

fn failed(from: &Node, to: &Node, slot: Option<Slot>, err: ClusterError) -> ClusterError {
    ClusterError::MigrationFailed {
        from: from.id.to_string(),
        to: to.id.to_string(),
        slot,
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::Provisioner;
    use crate::sim::SimCluster;

    struct Fixture {
        sim: Arc<SimCluster>,
        nodes: Vec<Node>,
        map: SlotMap,
    }

    /// Two members; the first owns every slot.
    async fn two_members(total: u16) -> Fixture {
        let sim = Arc::new(SimCluster::with_slots(total));
        sim.scale_to("m", 2).await.unwrap();
        let mut nodes = Vec::new();
        for instance in sim.list_instances("m").await.unwrap() {
            let id = sim.my_id(&instance.addr).await.unwrap();
            nodes.push(Node {
                id,
                instance: instance.id,
                addr: instance.addr,
                is_primary: nodes.is_empty(),
            });
        }
        sim.expect_ok(&nodes[0].addr, AdminCommand::Meet(nodes[1].addr.clone()))
            .await
            .unwrap();
        let all: Vec<Slot> = (0..total).collect();
        sim.expect_ok(&nodes[0].addr, AdminCommand::AddSlots(all.clone()))
            .await
            .unwrap();
        let mut map = SlotMap::new(total);
        map.assign(&nodes[0].id, &all).unwrap();
        Fixture { sim, nodes, map }
    }

    fn engine(sim: &Arc<SimCluster>) -> MigrationEngine<SimCluster> {
        MigrationEngine::new(
            sim.clone(),
            MigrationConfig {
                retry_backoff: Duration::from_millis(1),
                key_batch: 7,
                ..MigrationConfig::default()
            },
        )
    }

    fn transfer(fx: &Fixture, slots: Vec<Slot>) -> SlotTransfer {
        SlotTransfer {
            from: fx.nodes[0].id.clone(),
            to: fx.nodes[1].id.clone(),
            slots,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn moves_keys_and_flips_ownership_everywhere() {
        let mut fx = two_members(16).await;
        assert!(fx.sim.seed_keys(3, 20));
        assert!(fx.sim.seed_keys(4, 5));
        let engine = engine(&fx.sim);
        let t = transfer(&fx, vec![3, 4, 5]);
        let outcome = engine
            .transfer_slots(&mut fx.map, &fx.nodes, &t)
            .await
            .unwrap();
        assert_eq!(outcome.keys_moved, 25);
        assert_eq!(outcome.slots, 3);
        assert_eq!(fx.sim.keys_on(&fx.nodes[1].instance), 25);
        assert_eq!(fx.map.owner_of(4).unwrap(), Some(&fx.nodes[1].id));
        assert!(fx.map.in_flight().is_empty());
        assert_eq!(fx.sim.open_slots(), 0);
        for node in &fx.nodes {
            let seen = fx.sim.slot_counts_seen_by(&node.instance);
            assert_eq!(seen[&fx.nodes[1].id], 3);
            assert_eq!(seen[&fx.nodes[0].id], 13);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn announce_failure_is_retried_as_a_whole() {
        let mut fx = two_members(8).await;
        fx.sim.fail_next("CLUSTER SETSLOT", 2);
        let engine = engine(&fx.sim);
        let t = transfer(&fx, vec![0, 1]);
        let outcome = engine
            .transfer_slots(&mut fx.map, &fx.nodes, &t)
            .await
            .unwrap();
        assert_eq!(outcome.retries, 2);
        assert_eq!(fx.map.slots_of(&fx.nodes[1].id), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn key_moves_retry_from_the_failed_batch() {
        let mut fx = two_members(8).await;
        assert!(fx.sim.seed_keys(2, 30));
        fx.sim.fail_next("MIGRATE", 1);
        let engine = engine(&fx.sim);
        let t = transfer(&fx, vec![2]);
        let outcome = engine
            .transfer_slots(&mut fx.map, &fx.nodes, &t)
            .await
            .unwrap();
        assert_eq!(outcome.keys_moved, 30);
        assert_eq!(outcome.retries, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_fails_without_flipping() {
        let mut fx = two_members(8).await;
        assert!(fx.sim.seed_keys(1, 10));
        fx.sim.fail_next("MIGRATE", 10);
        let engine = engine(&fx.sim);
        let t = transfer(&fx, vec![1]);
        let err = engine
            .transfer_slots(&mut fx.map, &fx.nodes, &t)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClusterError::MigrationFailed { slot: Some(1), .. }
        ));
        assert_eq!(fx.map.owner_of(1).unwrap(), Some(&fx.nodes[0].id));
        assert!(fx.map.in_flight().is_empty());
        assert_eq!(fx.map.owned_total(), 8);
        assert_eq!(fx.sim.open_slots(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_transfer_clears_markers_on_both_ends() {
        let mut fx = two_members(8).await;
        assert!(fx.sim.seed_keys(0, 3));
        fx.sim.fail_next("MIGRATE", 10);
        let engine = engine(&fx.sim);
        let t = transfer(&fx, vec![0, 1, 2]);
        fx.sim.clear_command_log();

        engine
            .transfer_slots(&mut fx.map, &fx.nodes, &t)
            .await
            .unwrap_err();

        assert_eq!(fx.sim.open_slots(), 0);
        let stable: Vec<_> = fx
            .sim
            .command_log()
            .into_iter()
            .filter(|(_, cmd)| {
                matches!(
                    cmd,
                    AdminCommand::SetSlot {
                        state: SetSlotState::Stable,
                        ..
                    }
                )
            })
            .map(|(addr, _)| addr)
            .collect();
        assert_eq!(stable.len(), 6);
        assert!(stable[..3].iter().all(|a| *a == fx.nodes[1].addr));
        assert!(stable[3..].iter().all(|a| *a == fx.nodes[0].addr));
        // Keys never left the source.
        assert_eq!(fx.sim.keys_on(&fx.nodes[0].instance), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_member_is_rejected_before_any_command() {
        let mut fx = two_members(4).await;
        fx.sim.clear_command_log();
        let engine = engine(&fx.sim);
        let t = SlotTransfer {
            from: fx.nodes[0].id.clone(),
            to: NodeId::new("ghost"),
            slots: vec![0],
        };
        let err = engine.transfer_slots(&mut fx.map, &fx.nodes, &t).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownNode(_)));
        assert!(fx.sim.command_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn prepare_tolerates_fix_failure() {
        let fx = two_members(4).await;
        fx.sim.fail_next_repairs(1);
        let engine = engine(&fx.sim);
        assert!(!engine.prepare(&fx.nodes[0].addr).await);
        assert!(engine.prepare(&fx.nodes[0].addr).await);
    }
}
