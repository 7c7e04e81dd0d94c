//! In-process simulated cluster.
//!
//! [`SimCluster`] implements both [`Provisioner`] and [`AdminTransport`] so
//! the controller can be driven end to end without containers. Each member
//! keeps its own membership view, its own slot-ownership view and its own
//! keys, which makes "sent the final SETSLOT to every node" and "every
//! survivor forgot the victim" observable. Faults can be injected per
//! command name.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;

use crate::admin::{AdminCommand, AdminReply, AdminTransport, SetSlotState};
use crate::error::{ClusterError, Result};
use crate::node::{InstanceId, NodeAddr, NodeId};
use crate::provision::{Instance, Provisioner};
use crate::slot_map::{compress_ranges, Slot, DEFAULT_TOTAL_SLOTS};

const SIM_PORT: u16 = 6379;

#[derive(Debug)]
struct SimNode {
    id: NodeId,
    role: String,
    addr: NodeAddr,
    alive: bool,
    reachable: bool,
    known: BTreeSet<NodeId>,
    view: Vec<Option<NodeId>>,
    importing: BTreeMap<Slot, NodeId>,
    migrating: BTreeMap<Slot, NodeId>,
    keys: BTreeMap<Slot, BTreeSet<Bytes>>,
}

impl SimNode {
    fn key_count(&self) -> usize {
        self.keys.values().map(BTreeSet::len).sum()
    }

    fn owns(&self, slot: Slot) -> bool {
        self.view[slot as usize].as_ref() == Some(&self.id)
    }
}

#[derive(Debug, Default)]
struct SimState {
    seq: u64,
    roles: BTreeMap<String, Vec<InstanceId>>,
    nodes: BTreeMap<InstanceId, SimNode>,
    by_addr: HashMap<NodeAddr, InstanceId>,
    dropped_scales: u32,
    failing_scales: u32,
    faults: HashMap<&'static str, u32>,
    failing_repairs: u32,
    repairs: u32,
    log: Vec<(NodeAddr, AdminCommand)>,
}

/// Simulated provisioning layer plus cluster members.
#[derive(Debug)]
pub struct SimCluster {
    total_slots: u16,
    inner: Mutex<SimState>,
}

impl Default for SimCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimCluster {
    pub fn new() -> Self {
        Self::with_slots(DEFAULT_TOTAL_SLOTS)
    }

    pub fn with_slots(total_slots: u16) -> Self {
        Self {
            total_slots,
            inner: Mutex::new(SimState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Silently ignore the next `n` `scale_to` requests.
    pub fn drop_next_scale_requests(&self, n: u32) {
        self.state().dropped_scales = n;
    }

    /// Fail the next `n` `scale_to` requests with a provisioning error.
    pub fn fail_next_scale_requests(&self, n: u32) {
        self.state().failing_scales = n;
    }

    /// Make the next `n` commands named `command` (see [`AdminCommand::name`]) time out.
    pub fn fail_next(&self, command: &'static str, n: u32) {
        self.state().faults.insert(command, n);
    }

    pub fn fail_next_repairs(&self, n: u32) {
        self.state().failing_repairs = n;
    }

    pub fn repairs(&self) -> u32 {
        self.state().repairs
    }

    pub fn set_reachable(&self, id: &InstanceId, reachable: bool) {
        if let Some(node) = self.state().nodes.get_mut(id) {
            node.reachable = reachable;
        }
    }

    pub fn instances_of(&self, role: &str) -> Vec<InstanceId> {
        self.state().roles.get(role).cloned().unwrap_or_default()
    }

    pub fn node_id_of(&self, id: &InstanceId) -> Option<NodeId> {
        self.state().nodes.get(id).map(|n| n.id.clone())
    }

    pub fn is_alive(&self, id: &InstanceId) -> bool {
        self.state().nodes.get(id).map(|n| n.alive).unwrap_or(false)
    }

    /// Membership view of one member.
    pub fn membership_of(&self, id: &InstanceId) -> BTreeSet<NodeId> {
        self.state()
            .nodes
            .get(id)
            .map(|n| n.known.clone())
            .unwrap_or_default()
    }

    /// Slot counts per owner as seen by one member.
    pub fn slot_counts_seen_by(&self, id: &InstanceId) -> BTreeMap<NodeId, usize> {
        let state = self.state();
        let mut out = BTreeMap::new();
        if let Some(node) = state.nodes.get(id) {
            for owner in node.view.iter().flatten() {
                *out.entry(owner.clone()).or_insert(0) += 1;
            }
        }
        out
    }

    /// Open importing/migrating markers across all alive members.
    pub fn open_slots(&self) -> usize {
        self.state()
            .nodes
            .values()
            .filter(|n| n.alive)
            .map(|n| n.importing.len() + n.migrating.len())
            .sum()
    }

    /// Store `count` keys in `slot` at whichever alive member owns it.
    pub fn seed_keys(&self, slot: Slot, count: usize) -> bool {
        let mut state = self.state();
        let Some(owner) = state
            .nodes
            .values_mut()
            .find(|n| n.alive && n.owns(slot))
        else {
            return false;
        };
        let set = owner.keys.entry(slot).or_default();
        for i in 0..count {
            set.insert(Bytes::from(format!("key:{slot}:{i}")));
        }
        true
    }

    pub fn keys_on(&self, id: &InstanceId) -> usize {
        self.state().nodes.get(id).map(SimNode::key_count).unwrap_or(0)
    }

    /// Keys stored on alive members.
    pub fn total_keys(&self) -> usize {
        self.state()
            .nodes
            .values()
            .filter(|n| n.alive)
            .map(SimNode::key_count)
            .sum()
    }

    /// Every administrative command received so far, in order.
    pub fn command_log(&self) -> Vec<(NodeAddr, AdminCommand)> {
        self.state().log.clone()
    }

    pub fn clear_command_log(&self) {
        self.state().log.clear();
    }

    fn spawn_instance(&self, state: &mut SimState, role: &str) -> InstanceId {
        state.seq += 1;
        let seq = state.seq;
        let instance = InstanceId(format!("sim{seq:04}"));
        let id = NodeId::new(format!("{seq:040x}"));
        let addr = NodeAddr::new(format!("sim-{seq}"), SIM_PORT);
        let node = SimNode {
            id: id.clone(),
            role: role.to_string(),
            addr: addr.clone(),
            alive: true,
            reachable: true,
            known: BTreeSet::from([id]),
            view: vec![None; self.total_slots as usize],
            importing: BTreeMap::new(),
            migrating: BTreeMap::new(),
            keys: BTreeMap::new(),
        };
        state.nodes.insert(instance.clone(), node);
        state.by_addr.insert(addr, instance.clone());
        state
            .roles
            .entry(role.to_string())
            .or_default()
            .push(instance.clone());
        instance
    }

    fn remove_instance(state: &mut SimState, id: &InstanceId) {
        if let Some(node) = state.nodes.remove(id) {
            state.by_addr.remove(&node.addr);
            if let Some(list) = state.roles.get_mut(&node.role) {
                list.retain(|i| i != id);
            }
        }
    }
}

fn unreachable(target: &NodeAddr) -> ClusterError {
    ClusterError::Io(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("{target} refused connection"),
    ))
}

fn reply_err(target: &NodeAddr, msg: impl Into<String>) -> ClusterError {
    ClusterError::protocol(target, msg)
}

fn find_by_id<'a>(state: &'a SimState, id: &NodeId) -> Option<&'a InstanceId> {
    state
        .nodes
        .iter()
        .find(|(_, n)| n.id == *id)
        .map(|(instance, _)| instance)
}

fn render_nodes(state: &SimState, me: &SimNode) -> String {
    let mut out = String::new();
    for known in &me.known {
        let Some(node) = find_by_id(state, known).and_then(|i| state.nodes.get(i)) else {
            continue;
        };
        let mut flags = Vec::new();
        if node.id == me.id {
            flags.push("myself");
        }
        flags.push("master");
        if !node.alive {
            flags.push("fail");
        }
        let link = if node.alive { "connected" } else { "disconnected" };
        let owned: Vec<Slot> = me
            .view
            .iter()
            .enumerate()
            .filter(|(_, owner)| owner.as_ref() == Some(&node.id))
            .map(|(slot, _)| slot as Slot)
            .collect();
        let mut line = format!(
            "{} {}@{} {} - 0 0 0 {}",
            node.id,
            node.addr,
            node.addr.port as u32 + 10000,
            flags.join(","),
            link
        );
        for (start, end) in compress_ranges(&owned) {
            if start == end {
                line.push_str(&format!(" {start}"));
            } else {
                line.push_str(&format!(" {start}-{end}"));
            }
        }
        if node.id == me.id {
            for (slot, dest) in &me.migrating {
                line.push_str(&format!(" [{slot}->-{dest}]"));
            }
            for (slot, src) in &me.importing {
                line.push_str(&format!(" [{slot}-<-{src}]"));
            }
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

impl SimCluster {
    fn apply(&self, state: &mut SimState, target: &NodeAddr, cmd: AdminCommand) -> Result<AdminReply> {
        let Some(instance) = state.by_addr.get(target).cloned() else {
            return Err(unreachable(target));
        };
        let (alive, reachable, me_id) = match state.nodes.get(&instance) {
            Some(n) => (n.alive, n.reachable, n.id.clone()),
            None => return Err(unreachable(target)),
        };
        if !alive || !reachable {
            return Err(unreachable(target));
        }

        match cmd {
            AdminCommand::Ping => Ok(AdminReply::Text("PONG".into())),
            AdminCommand::ClusterMyId => Ok(AdminReply::Text(me_id.to_string())),
            AdminCommand::ClusterNodes => {
                let me = &state.nodes[&instance];
                Ok(AdminReply::Text(render_nodes(state, me)))
            }
            AdminCommand::Meet(addr) => {
                let Some(other) = state.by_addr.get(&addr).cloned() else {
                    // MEET is fire-and-forget; an unknown address just never joins.
                    return Ok(AdminReply::Ok);
                };
                if !state.nodes.get(&other).map(|n| n.alive).unwrap_or(false) {
                    return Ok(AdminReply::Ok);
                }
                // Gossip: both sides end up with the union of what they knew.
                let mut everyone: BTreeSet<NodeId> = state.nodes[&instance].known.clone();
                everyone.extend(state.nodes[&other].known.iter().cloned());
                let anchor_view = state.nodes[&instance].view.clone();
                let members: Vec<InstanceId> = state
                    .nodes
                    .iter()
                    .filter(|(_, n)| everyone.contains(&n.id))
                    .map(|(i, _)| i.clone())
                    .collect();
                for member in members {
                    if let Some(node) = state.nodes.get_mut(&member) {
                        node.known.extend(everyone.iter().cloned());
                        for (slot, owner) in anchor_view.iter().enumerate() {
                            if node.view[slot].is_none() {
                                node.view[slot] = owner.clone();
                            }
                        }
                    }
                }
                Ok(AdminReply::Ok)
            }
            AdminCommand::Forget(id) => {
                let me = state.nodes.get_mut(&instance).ok_or_else(|| unreachable(target))?;
                if id == me.id {
                    return Err(reply_err(target, "ERR I tried hard but I can't forget myself..."));
                }
                if !me.known.remove(&id) {
                    return Err(reply_err(target, format!("ERR Unknown node {id}")));
                }
                for owner in me.view.iter_mut() {
                    if owner.as_ref() == Some(&id) {
                        *owner = None;
                    }
                }
                me.importing.retain(|_, src| *src != id);
                me.migrating.retain(|_, dst| *dst != id);
                Ok(AdminReply::Ok)
            }
            AdminCommand::AddSlots(slots) => {
                {
                    let me = &state.nodes[&instance];
                    for &slot in &slots {
                        if slot >= self.total_slots {
                            return Err(reply_err(target, "ERR Invalid or out of range slot"));
                        }
                        if me.view[slot as usize].is_some() {
                            return Err(reply_err(target, format!("ERR Slot {slot} is already busy")));
                        }
                    }
                }
                for node in state.nodes.values_mut() {
                    if !node.alive || !node.known.contains(&me_id) {
                        continue;
                    }
                    for &slot in &slots {
                        if node.id == me_id || node.view[slot as usize].is_none() {
                            node.view[slot as usize] = Some(me_id.clone());
                        }
                    }
                }
                Ok(AdminReply::Ok)
            }
            AdminCommand::SetSlot { slot, state: slot_state } => {
                if slot >= self.total_slots {
                    return Err(reply_err(target, "ERR Invalid or out of range slot"));
                }
                let me = state.nodes.get_mut(&instance).ok_or_else(|| unreachable(target))?;
                match slot_state {
                    SetSlotState::Importing(src) => {
                        if me.owns(slot) {
                            return Err(reply_err(
                                target,
                                format!("ERR I'm already the owner of hash slot {slot}"),
                            ));
                        }
                        if !me.known.contains(&src) {
                            return Err(reply_err(target, format!("ERR I don't know about node {src}")));
                        }
                        me.importing.insert(slot, src);
                    }
                    SetSlotState::Migrating(dst) => {
                        if !me.owns(slot) {
                            return Err(reply_err(
                                target,
                                format!("ERR I'm not the owner of hash slot {slot}"),
                            ));
                        }
                        if !me.known.contains(&dst) {
                            return Err(reply_err(target, format!("ERR I don't know about node {dst}")));
                        }
                        me.migrating.insert(slot, dst);
                    }
                    SetSlotState::Node(owner) => {
                        if !me.known.contains(&owner) {
                            return Err(reply_err(target, format!("ERR Unknown node {owner}")));
                        }
                        let holds_keys = me.keys.get(&slot).map(|k| !k.is_empty()).unwrap_or(false);
                        if me.owns(slot) && owner != me.id && holds_keys {
                            return Err(reply_err(
                                target,
                                "ERR Can't assign hashslot to a different node while I still hold keys for this hash slot.",
                            ));
                        }
                        me.view[slot as usize] = Some(owner);
                        me.importing.remove(&slot);
                        me.migrating.remove(&slot);
                    }
                    SetSlotState::Stable => {
                        me.importing.remove(&slot);
                        me.migrating.remove(&slot);
                    }
                }
                Ok(AdminReply::Ok)
            }
            AdminCommand::GetKeysInSlot { slot, count } => {
                let me = &state.nodes[&instance];
                let keys = me
                    .keys
                    .get(&slot)
                    .map(|set| set.iter().take(count).cloned().collect())
                    .unwrap_or_default();
                Ok(AdminReply::Keys(keys))
            }
            AdminCommand::Migrate { dest, keys, .. } => {
                let Some(dest_instance) = state.by_addr.get(&dest).cloned() else {
                    return Err(reply_err(target, "IOERR error or timeout connecting to the client"));
                };
                let dest_ok = state
                    .nodes
                    .get(&dest_instance)
                    .map(|n| n.alive && n.reachable)
                    .unwrap_or(false);
                if !dest_ok {
                    return Err(reply_err(target, "IOERR error or timeout connecting to the client"));
                }
                let mut moved: Vec<(Slot, Bytes)> = Vec::new();
                if let Some(me) = state.nodes.get_mut(&instance) {
                    for key in &keys {
                        let slot = me
                            .keys
                            .iter()
                            .find(|(_, set)| set.contains(key))
                            .map(|(slot, _)| *slot);
                        if let Some(slot) = slot {
                            if let Some(set) = me.keys.get_mut(&slot) {
                                set.remove(key);
                            }
                            moved.push((slot, key.clone()));
                        }
                    }
                    me.keys.retain(|_, set| !set.is_empty());
                }
                if moved.is_empty() {
                    return Ok(AdminReply::NoKey);
                }
                if let Some(dest_node) = state.nodes.get_mut(&dest_instance) {
                    for (slot, key) in moved {
                        dest_node.keys.entry(slot).or_default().insert(key);
                    }
                }
                Ok(AdminReply::Ok)
            }
            AdminCommand::Shutdown => {
                if let Some(me) = state.nodes.get_mut(&instance) {
                    me.alive = false;
                }
                Ok(AdminReply::Ok)
            }
        }
    }

    /// `--cluster fix`: close open slots and give uncovered slots an owner,
    /// then make every alive member agree with the anchor's view.
    fn fix(&self, state: &mut SimState, target: &NodeAddr) -> Result<()> {
        let Some(anchor) = state.by_addr.get(target).cloned() else {
            return Err(unreachable(target));
        };
        let anchor_node = state.nodes.get(&anchor).ok_or_else(|| unreachable(target))?;
        if !anchor_node.alive || !anchor_node.reachable {
            return Err(unreachable(target));
        }
        let members: BTreeSet<NodeId> = anchor_node.known.clone();
        let alive_members: Vec<NodeId> = state
            .nodes
            .values()
            .filter(|n| n.alive && members.contains(&n.id))
            .map(|n| n.id.clone())
            .collect();
        let mut view = anchor_node.view.clone();
        for owner in view.iter_mut() {
            if owner.as_ref().map(|o| !alive_members.contains(o)).unwrap_or(false) {
                *owner = None;
            }
        }

        let mut load: BTreeMap<NodeId, usize> =
            alive_members.iter().map(|id| (id.clone(), 0)).collect();
        for owner in view.iter().flatten() {
            if let Some(count) = load.get_mut(owner) {
                *count += 1;
            }
        }
        for slot in 0..self.total_slots {
            if view[slot as usize].is_some() {
                continue;
            }
            // Prefer a member that holds keys for the slot, else the least loaded.
            let with_keys = state
                .nodes
                .values()
                .filter(|n| n.alive && alive_members.contains(&n.id))
                .find(|n| n.keys.get(&slot).map(|k| !k.is_empty()).unwrap_or(false))
                .map(|n| n.id.clone());
            let chosen = with_keys.or_else(|| {
                load.iter()
                    .min_by_key(|(id, count)| (**count, (*id).clone()))
                    .map(|(id, _)| id.clone())
            });
            if let Some(owner) = &chosen {
                if let Some(count) = load.get_mut(owner) {
                    *count += 1;
                }
            }
            view[slot as usize] = chosen;
        }

        for node in state.nodes.values_mut() {
            if node.alive && alive_members.contains(&node.id) {
                node.view = view.clone();
                node.importing.clear();
                node.migrating.clear();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AdminTransport for SimCluster {
    async fn execute(&self, target: &NodeAddr, cmd: AdminCommand) -> Result<AdminReply> {
        let mut state = self.state();
        state.log.push((target.clone(), cmd.clone()));
        if let Some(remaining) = state.faults.get_mut(cmd.name()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(ClusterError::CommandTimeout {
                    command: cmd.name().to_string(),
                    target: target.to_string(),
                });
            }
        }
        self.apply(&mut state, target, cmd)
    }

    async fn repair(&self, target: &NodeAddr) -> Result<()> {
        let mut state = self.state();
        if state.failing_repairs > 0 {
            state.failing_repairs -= 1;
            return Err(ClusterError::CommandTimeout {
                command: "--cluster fix".to_string(),
                target: target.to_string(),
            });
        }
        state.repairs += 1;
        self.fix(&mut state, target)
    }
}

#[async_trait]
impl Provisioner for SimCluster {
    async fn scale_to(&self, role: &str, count: usize) -> Result<()> {
        let mut state = self.state();
        if state.failing_scales > 0 {
            state.failing_scales -= 1;
            return Err(ClusterError::Provision(format!(
                "scale {role}={count} rejected"
            )));
        }
        if state.dropped_scales > 0 {
            state.dropped_scales -= 1;
            return Ok(());
        }
        let current = state.roles.get(role).map(Vec::len).unwrap_or(0);
        if current < count {
            for _ in current..count {
                self.spawn_instance(&mut state, role);
            }
        } else {
            let excess: Vec<InstanceId> = state
                .roles
                .get(role)
                .map(|list| list[count..].to_vec())
                .unwrap_or_default();
            for id in excess {
                Self::remove_instance(&mut state, &id);
            }
        }
        Ok(())
    }

    async fn list_instances(&self, role: &str) -> Result<Vec<Instance>> {
        let state = self.state();
        let ids = state.roles.get(role).cloned().unwrap_or_default();
        Ok(ids
            .into_iter()
            .filter_map(|id| {
                state.nodes.get(&id).map(|n| Instance {
                    id: id.clone(),
                    addr: n.addr.clone(),
                })
            })
            .collect())
    }

    async fn stop(&self, id: &InstanceId) -> Result<()> {
        let mut state = self.state();
        match state.nodes.get_mut(id) {
            Some(node) => {
                node.alive = false;
                Ok(())
            }
            None => Err(ClusterError::Provision(format!("no such instance {id}"))),
        }
    }

    async fn remove(&self, id: &InstanceId) -> Result<()> {
        let mut state = self.state();
        if !state.nodes.contains_key(id) {
            return Err(ClusterError::Provision(format!("no such instance {id}")));
        }
        Self::remove_instance(&mut state, id);
        Ok(())
    }
}
