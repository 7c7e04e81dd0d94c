//! Hash-slot ownership and rebalance planning.
//!
//! The slot space is fixed at construction (16384 by default, matching the
//! sharded KV target). At any stable point every slot has exactly one owner;
//! ownership only flips through [`SlotMap::apply_slot`] once a migration has
//! been confirmed by the cluster.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::error::{ClusterError, Result};
use crate::node::NodeId;

/// Slot index in `[0, total_slots)`.
pub type Slot = u16;

/// Slot count of the target system.
pub const DEFAULT_TOTAL_SLOTS: u16 = 16384;

/// A slot currently being moved between two nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InFlight {
    pub from: NodeId,
    pub to: NodeId,
}

/// Ownership move of explicit slots from one node to another.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotTransfer {
    pub from: NodeId,
    pub to: NodeId,
    pub slots: Vec<Slot>,
}

/// Slots without an owner handed to a node (no keys to move).
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SlotAssignment {
    pub node: NodeId,
    pub slots: Vec<Slot>,
}

/// Ordered set of changes that turns the current map into an even split
/// across a new node set.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MigrationPlan {
    pub assignments: Vec<SlotAssignment>,
    pub transfers: Vec<SlotTransfer>,
}

impl MigrationPlan {
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.transfers.is_empty()
    }

    /// Slots that change hands through a migration (assignments excluded).
    pub fn slots_moved(&self) -> usize {
        self.transfers.iter().map(|t| t.slots.len()).sum()
    }

    pub fn slots_assigned(&self) -> usize {
        self.assignments.iter().map(|a| a.slots.len()).sum()
    }
}

/// Ownership of the whole slot space.
#[derive(Clone, Debug)]
pub struct SlotMap {
    owners: Vec<Option<NodeId>>,
    in_flight: BTreeMap<Slot, InFlight>,
}

impl Default for SlotMap {
    fn default() -> Self {
        Self::new(DEFAULT_TOTAL_SLOTS)
    }
}

impl SlotMap {
    /// Empty map: every slot unowned.
    pub fn new(total_slots: u16) -> Self {
        Self {
            owners: vec![None; total_slots as usize],
            in_flight: BTreeMap::new(),
        }
    }

    /// Build a map from per-node slot ranges (inclusive), as reported by
    /// `CLUSTER NODES`. Overlapping claims are rejected.
    pub fn from_ranges<I>(total_slots: u16, ranges: I) -> Result<Self>
    where
        I: IntoIterator<Item = (NodeId, Vec<(Slot, Slot)>)>,
    {
        let mut map = Self::new(total_slots);
        for (node, node_ranges) in ranges {
            for (start, end) in node_ranges {
                for slot in start..=end {
                    map.check_slot(slot)?;
                    let entry = &mut map.owners[slot as usize];
                    if let Some(existing) = entry {
                        if *existing != node {
                            return Err(ClusterError::PartitionViolated(format!(
                                "slot {slot} claimed by both {existing} and {node}"
                            )));
                        }
                    }
                    *entry = Some(node.clone());
                }
            }
        }
        Ok(map)
    }

    pub fn total_slots(&self) -> u16 {
        self.owners.len() as u16
    }

    fn check_slot(&self, slot: Slot) -> Result<()> {
        if (slot as usize) < self.owners.len() {
            Ok(())
        } else {
            Err(ClusterError::UnknownSlot {
                slot: slot as u32,
                total: self.owners.len() as u32,
            })
        }
    }

    /// Current owner of `slot`; `None` only while a brutal removal has
    /// left it orphaned.
    pub fn owner_of(&self, slot: Slot) -> Result<Option<&NodeId>> {
        self.check_slot(slot)?;
        Ok(self.owners[slot as usize].as_ref())
    }

    pub fn slots_of(&self, node: &NodeId) -> Vec<Slot> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_ref() == Some(node))
            .map(|(slot, _)| slot as Slot)
            .collect()
    }

    pub fn unowned(&self) -> Vec<Slot> {
        self.owners
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.is_none())
            .map(|(slot, _)| slot as Slot)
            .collect()
    }

    /// Owned-slot count per node.
    pub fn counts(&self) -> BTreeMap<NodeId, usize> {
        let mut out = BTreeMap::new();
        for owner in self.owners.iter().flatten() {
            *out.entry(owner.clone()).or_insert(0) += 1;
        }
        out
    }

    pub fn owned_total(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }

    pub fn in_flight(&self) -> &BTreeMap<Slot, InFlight> {
        &self.in_flight
    }

    /// Even split targets: `total / n` each, the remainder going one slot
    /// apiece to the lowest ids.
    pub fn even_targets(&self, nodes: &[NodeId]) -> BTreeMap<NodeId, usize> {
        let ids: BTreeSet<NodeId> = nodes.iter().cloned().collect();
        if ids.is_empty() {
            return BTreeMap::new();
        }
        let total = self.owners.len();
        let base = total / ids.len();
        let rem = total % ids.len();
        ids.into_iter()
            .enumerate()
            .map(|(idx, id)| (id, base + usize::from(idx < rem)))
            .collect()
    }

    /// Hand unowned slots to `node`. Fails if any slot is already owned.
    pub fn assign(&mut self, node: &NodeId, slots: &[Slot]) -> Result<()> {
        for &slot in slots {
            self.check_slot(slot)?;
            if let Some(owner) = &self.owners[slot as usize] {
                return Err(ClusterError::PartitionViolated(format!(
                    "slot {slot} already owned by {owner}"
                )));
            }
        }
        for &slot in slots {
            self.owners[slot as usize] = Some(node.clone());
        }
        Ok(())
    }

    /// Compute the transfers that bring the map to an even split across
    /// `new_nodes`, moving only each node's surplus/deficit.
    ///
    /// The old node set is whatever currently owns slots. Retained nodes keep
    /// their lowest-numbered slots; departing nodes give up everything.
    /// Unowned slots fill deficits first since they carry no keys. The result
    /// depends only on the current map and the node set.
    pub fn plan_rebalance(&self, new_nodes: &[NodeId]) -> Result<MigrationPlan> {
        let targets = self.even_targets(new_nodes);
        if targets.is_empty() {
            return Err(ClusterError::PartitionViolated(
                "cannot rebalance onto an empty node set".into(),
            ));
        }

        let mut owned: BTreeMap<NodeId, Vec<Slot>> = BTreeMap::new();
        let mut orphans = Vec::new();
        for (slot, owner) in self.owners.iter().enumerate() {
            match owner {
                Some(node) => owned.entry(node.clone()).or_default().push(slot as Slot),
                None => orphans.push(slot as Slot),
            }
        }

        // Unowned slots carry no keys, so they are handed out before any transfer.
        let mut donors: Vec<(Option<NodeId>, Vec<Slot>)> = Vec::new();
        if !orphans.is_empty() {
            donors.push((None, orphans));
        }
        for (node, slots) in &owned {
            if !targets.contains_key(node) {
                donors.push((Some(node.clone()), slots.clone()));
            }
        }
        for (node, slots) in &owned {
            if let Some(&target) = targets.get(node) {
                if slots.len() > target {
                    donors.push((Some(node.clone()), slots[target..].to_vec()));
                }
            }
        }

        let mut receivers: Vec<(NodeId, usize)> = targets
            .iter()
            .filter_map(|(node, &target)| {
                let have = owned.get(node).map(Vec::len).unwrap_or(0);
                (have < target).then(|| (node.clone(), target - have))
            })
            .collect();

        let mut plan = MigrationPlan::default();
        let mut receiver_idx = 0;
        for (donor, slots) in donors {
            let mut rest = slots.as_slice();
            while !rest.is_empty() {
                let Some((receiver, need)) = receivers.get_mut(receiver_idx) else {
                    return Err(ClusterError::PartitionViolated(format!(
                        "{} surplus slots have no receiver",
                        rest.len()
                    )));
                };
                let take = (*need).min(rest.len());
                let (chunk, tail) = rest.split_at(take);
                match &donor {
                    None => push_assignment(&mut plan.assignments, receiver, chunk),
                    Some(from) => push_transfer(&mut plan.transfers, from, receiver, chunk),
                }
                *need -= take;
                if *need == 0 {
                    receiver_idx += 1;
                }
                rest = tail;
            }
        }
        Ok(plan)
    }

    /// Record that `slots` are being announced for a move `from -> to`.
    pub fn begin_transfer(&mut self, from: &NodeId, to: &NodeId, slots: &[Slot]) -> Result<()> {
        for &slot in slots {
            self.expect_owner(slot, from)?;
        }
        for &slot in slots {
            self.in_flight.insert(
                slot,
                InFlight {
                    from: from.clone(),
                    to: to.clone(),
                },
            );
        }
        Ok(())
    }

    /// Forget in-flight markers without changing ownership.
    pub fn abort_transfer(&mut self, slots: &[Slot]) {
        for slot in slots {
            self.in_flight.remove(slot);
        }
    }

    /// Flip ownership of one slot after the cluster confirmed the move.
    pub fn apply_slot(&mut self, slot: Slot, from: &NodeId, to: &NodeId) -> Result<()> {
        self.expect_owner(slot, from)?;
        self.owners[slot as usize] = Some(to.clone());
        self.in_flight.remove(&slot);
        Ok(())
    }

    /// Flip ownership of every slot in a confirmed transfer.
    pub fn apply_transfer(&mut self, transfer: &SlotTransfer) -> Result<()> {
        for &slot in &transfer.slots {
            self.expect_owner(slot, &transfer.from)?;
        }
        for &slot in &transfer.slots {
            self.apply_slot(slot, &transfer.from, &transfer.to)?;
        }
        Ok(())
    }

    /// Drop a node that was removed without handoff; returns its orphaned slots.
    pub fn drop_node(&mut self, node: &NodeId) -> Vec<Slot> {
        let mut orphaned = Vec::new();
        for (slot, owner) in self.owners.iter_mut().enumerate() {
            if owner.as_ref() == Some(node) {
                *owner = None;
                orphaned.push(slot as Slot);
            }
        }
        self.in_flight
            .retain(|_, mv| mv.from != *node && mv.to != *node);
        orphaned
    }

    fn expect_owner(&self, slot: Slot, node: &NodeId) -> Result<()> {
        match self.owner_of(slot)? {
            Some(owner) if owner == node => Ok(()),
            Some(owner) => Err(ClusterError::PartitionViolated(format!(
                "slot {slot} owned by {owner}, not {node}"
            ))),
            None => Err(ClusterError::PartitionViolated(format!(
                "slot {slot} has no owner (expected {node})"
            ))),
        }
    }

    /// Every slot owned, and only by members of `nodes`.
    pub fn check_partition(&self, nodes: &[NodeId]) -> Result<()> {
        let members: BTreeSet<&NodeId> = nodes.iter().collect();
        let mut unowned = 0usize;
        for (slot, owner) in self.owners.iter().enumerate() {
            match owner {
                None => unowned += 1,
                Some(owner) if !members.contains(owner) => {
                    return Err(ClusterError::PartitionViolated(format!(
                        "slot {slot} owned by non-member {owner}"
                    )));
                }
                Some(_) => {}
            }
        }
        if unowned > 0 {
            return Err(ClusterError::PartitionViolated(format!(
                "{unowned} slots have no owner"
            )));
        }
        Ok(())
    }

    /// Partition check plus: every node's count within one of `total / n`.
    pub fn check_balanced(&self, nodes: &[NodeId]) -> Result<()> {
        self.check_partition(nodes)?;
        let counts = self.counts();
        let targets = self.even_targets(nodes);
        for (node, target) in targets {
            let have = counts.get(&node).copied().unwrap_or(0);
            if have.abs_diff(target) > 1 {
                return Err(ClusterError::PartitionViolated(format!(
                    "node {node} owns {have} slots, expected about {target}"
                )));
            }
        }
        Ok(())
    }

    /// Contiguous inclusive ranges owned by `node`.
    pub fn ranges_of(&self, node: &NodeId) -> Vec<(Slot, Slot)> {
        compress_ranges(&self.slots_of(node))
    }
}

/// Collapse sorted slots into inclusive ranges.
pub fn compress_ranges(slots: &[Slot]) -> Vec<(Slot, Slot)> {
    let mut out: Vec<(Slot, Slot)> = Vec::new();
    for &slot in slots {
        match out.last_mut() {
            Some((_, end)) if end.checked_add(1) == Some(slot) => *end = slot,
            _ => out.push((slot, slot)),
        }
    }
    out
}

fn push_transfer(transfers: &mut Vec<SlotTransfer>, from: &NodeId, to: &NodeId, slots: &[Slot]) {
    if let Some(last) = transfers.last_mut() {
        if last.from == *from && last.to == *to {
            last.slots.extend_from_slice(slots);
            return;
        }
    }
    transfers.push(SlotTransfer {
        from: from.clone(),
        to: to.clone(),
        slots: slots.to_vec(),
    });
}

fn push_assignment(assignments: &mut Vec<SlotAssignment>, node: &NodeId, slots: &[Slot]) {
    if let Some(last) = assignments.last_mut() {
        if last.node == *node {
            last.slots.extend_from_slice(slots);
            return;
        }
    }
    assignments.push(SlotAssignment {
        node: node.clone(),
        slots: slots.to_vec(),
    });
}
