//! Cluster lifecycle state machine.
//!
//! The controller is the only writer of [`ClusterState`]. Every operation runs
//! to completion (or to its own retry budget) before returning, so the caller
//! only ever observes `Stopped`, `Stable` or `Failed` between calls.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{self, Instant};

use crate::admin::{AdminCommand, AdminExt, AdminTransport};
use crate::error::{ClusterError, Result};
use crate::migration::{MigrationConfig, MigrationEngine, TransferOutcome};
use crate::node::{Node, NodeAddr, NodeId};
use crate::provision::Provisioner;
use crate::registry::{NodeRegistry, RegistryConfig};
use crate::slot_map::{MigrationPlan, SlotMap, DEFAULT_TOTAL_SLOTS};

/// How departing members leave the cluster.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemovalMode {
    /// Drain slots first, then deprovision.
    #[default]
    Graceful,
    /// Kill first, repair afterwards.
    Brutal,
}

impl fmt::Display for RemovalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalMode::Graceful => f.write_str("graceful"),
            RemovalMode::Brutal => f.write_str("brutal"),
        }
    }
}

impl FromStr for RemovalMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "graceful" => Ok(RemovalMode::Graceful),
            "brutal" => Ok(RemovalMode::Brutal),
            other => Err(format!("unknown removal mode {other:?} (expected graceful|brutal)")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Stopped,
    Starting,
    Stable(usize),
    Scaling {
        from: usize,
        to: usize,
        mode: RemovalMode,
    },
    Failed,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Stopped => f.write_str("stopped"),
            ControllerState::Starting => f.write_str("starting"),
            ControllerState::Stable(n) => write!(f, "stable({n})"),
            ControllerState::Scaling { from, to, mode } => {
                write!(f, "scaling({from} -> {to}, {mode})")
            }
            ControllerState::Failed => f.write_str("failed"),
        }
    }
}

/// Configuration for [`ClusterController`].
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub registry: RegistryConfig,
    pub migration: MigrationConfig,
    pub total_slots: u16,
    /// Provisioning role of the single non-sharded node.
    pub standalone_role: String,
    /// Largest provisioning request issued at once during start.
    pub start_batch: usize,
    /// Whole-sequence retries after the first start attempt.
    pub start_retries: u32,
    /// How long start and scale-up wait for members to answer.
    pub join_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            registry: RegistryConfig::default(),
            migration: MigrationConfig::default(),
            total_slots: DEFAULT_TOTAL_SLOTS,
            standalone_role: "redis-standalone".to_string(),
            start_batch: 30,
            start_retries: 3,
            join_timeout: Duration::from_secs(120),
        }
    }
}

/// Current topology as seen by the controller.
#[derive(Clone, Debug, Default)]
pub struct ClusterState {
    /// Sharded members, primary first. Empty for standalone.
    pub nodes: Vec<Node>,
    pub size: usize,
    /// Absent unless the cluster is sharded.
    pub slots: Option<SlotMap>,
    standalone: Option<NodeAddr>,
}

impl ClusterState {
    /// Address handed to clients: the primary, or the standalone node.
    pub fn primary_address(&self) -> Option<&NodeAddr> {
        self.nodes
            .first()
            .map(|n| &n.addr)
            .or(self.standalone.as_ref())
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id.clone()).collect()
    }
}

/// What one `scale` call did.
#[derive(Clone, Debug, Serialize)]
pub struct ScaleReport {
    pub from: usize,
    pub to: usize,
    pub mode: RemovalMode,
    /// No topology change was attempted.
    pub skipped: bool,
    pub added: Vec<NodeId>,
    pub removed: Vec<NodeId>,
    pub transfers: Vec<TransferOutcome>,
    pub slots_moved: usize,
    pub slots_assigned: usize,
    pub elapsed_ms: u64,
}

impl ScaleReport {
    fn new(from: usize, to: usize, mode: RemovalMode) -> Self {
        Self {
            from,
            to,
            mode,
            skipped: false,
            added: Vec::new(),
            removed: Vec::new(),
            transfers: Vec::new(),
            slots_moved: 0,
            slots_assigned: 0,
            elapsed_ms: 0,
        }
    }
}

pub struct ClusterController<P, A> {
    provisioner: Arc<P>,
    admin: Arc<A>,
    registry: NodeRegistry<P, A>,
    engine: MigrationEngine<A>,
    cfg: ControllerConfig,
    state: ControllerState,
    cluster: ClusterState,
}

impl<P: Provisioner, A: AdminTransport> ClusterController<P, A> {
    pub fn new(provisioner: Arc<P>, admin: Arc<A>, cfg: ControllerConfig) -> Self {
        let registry = NodeRegistry::new(provisioner.clone(), admin.clone(), cfg.registry.clone());
        let engine = MigrationEngine::new(admin.clone(), cfg.migration.clone());
        Self {
            provisioner,
            admin,
            registry,
            engine,
            cfg,
            state: ControllerState::Stopped,
            cluster: ClusterState::default(),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn cluster(&self) -> &ClusterState {
        &self.cluster
    }

    pub fn primary_address(&self) -> Option<&NodeAddr> {
        self.cluster.primary_address()
    }

    fn invalid(&self, op: &'static str) -> ClusterError {
        ClusterError::InvalidTransition {
            op,
            state: self.state.to_string(),
        }
    }

    /// Bring up a cluster of `size` members from `Stopped`.
    pub async fn start(&mut self, size: usize) -> Result<()> {
        if self.state != ControllerState::Stopped {
            return Err(self.invalid("start"));
        }
        if size == 0 {
            tracing::info!("empty cluster requested; nothing to start");
            return Ok(());
        }
        self.state = ControllerState::Starting;
        let res = if size == 1 {
            self.start_standalone().await
        } else {
            self.start_sharded(size).await
        };
        match res {
            Ok(()) => {
                self.state = ControllerState::Stable(size);
                tracing::info!(size, "cluster started");
                Ok(())
            }
            Err(err) => {
                self.state = ControllerState::Failed;
                tracing::error!(size, error = %err, "cluster start failed");
                Err(err)
            }
        }
    }

    async fn start_standalone(&mut self) -> Result<()> {
        let role = self.cfg.standalone_role.clone();
        let attempts = self.cfg.registry.discovery_attempts.max(1);
        for attempt in 1..=attempts {
            if let Err(err) = self.provisioner.scale_to(&role, 1).await {
                tracing::warn!(attempt, error = %err, "standalone provisioning failed");
            } else if let Some(addr) = self.standalone_addr(&role).await {
                self.cluster = ClusterState {
                    nodes: Vec::new(),
                    size: 1,
                    slots: None,
                    standalone: Some(addr),
                };
                return Ok(());
            }
            if attempt < attempts {
                time::sleep(self.cfg.registry.discovery_backoff).await;
            }
        }
        Err(ClusterError::ClusterStartFailed {
            attempts,
            reached: 0,
            wanted: 1,
        })
    }

    async fn standalone_addr(&self, role: &str) -> Option<NodeAddr> {
        let instances = match self.provisioner.list_instances(role).await {
            Ok(instances) => instances,
            Err(err) => {
                tracing::debug!(error = %err, "listing standalone instance failed");
                return None;
            }
        };
        for instance in instances {
            if self.admin.execute(&instance.addr, AdminCommand::Ping).await.is_ok() {
                return Some(instance.addr);
            }
        }
        None
    }

    async fn start_sharded(&mut self, size: usize) -> Result<()> {
        let attempts = 1 + self.cfg.start_retries;
        let mut reached = 0;
        for attempt in 1..=attempts {
            match self.provision_and_create(size).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    reached = self.registry.nodes().len();
                    tracing::warn!(attempt, attempts, reached, wanted = size, error = %err, "cluster start attempt failed");
                    self.teardown().await;
                }
            }
        }
        Err(ClusterError::ClusterStartFailed {
            attempts,
            reached,
            wanted: size,
        })
    }

    async fn provision_and_create(&mut self, size: usize) -> Result<()> {
        let batch = self.cfg.start_batch.max(1);
        let mut requested = 0;
        while requested < size {
            requested = (requested + batch).min(size);
            tracing::info!(requested, wanted = size, "provisioning members");
            self.registry.request_size(requested).await?;
        }
        let reached = self.registry.wait_for_size(size, self.cfg.join_timeout).await;
        if reached != size {
            return Err(ClusterError::Provision(format!(
                "only {reached} of {size} members answered"
            )));
        }
        let nodes = self.registry.nodes().to_vec();
        self.meet_all(&nodes[0], &nodes[1..]).await?;

        let mut map = SlotMap::new(self.cfg.total_slots);
        let plan = map.plan_rebalance(&ids(&nodes))?;
        self.execute_plan(&mut map, &nodes, &plan, &mut ScaleReport::new(0, size, RemovalMode::Graceful))
            .await?;
        map.check_balanced(&ids(&nodes))?;
        self.cluster = ClusterState {
            nodes,
            size,
            slots: Some(map),
            standalone: None,
        };
        Ok(())
    }

    async fn meet_all(&self, primary: &Node, others: &[Node]) -> Result<()> {
        for node in others {
            self.admin
                .expect_ok(&primary.addr, AdminCommand::Meet(node.addr.clone()))
                .await?;
        }
        Ok(())
    }

    /// Move the cluster to `size` members.
    ///
    /// Sizes of 0 or 1 are not a sharded cluster: requests at or below that
    /// threshold are ignored while sharded, and growing from a non-sharded
    /// state is a fresh start.
    pub async fn scale(&mut self, size: usize, mode: RemovalMode) -> Result<ScaleReport> {
        let started = Instant::now();
        if self.state == ControllerState::Failed {
            self.recover().await?;
        }
        let current = match self.state {
            ControllerState::Stopped => 0,
            ControllerState::Stable(n) => n,
            _ => return Err(self.invalid("scale")),
        };
        let mut report = ScaleReport::new(current, size, mode);

        if size <= 1 || size == current {
            if size != current {
                tracing::info!(from = current, to = size, "scale below sharding threshold ignored");
            }
            report.skipped = true;
            report.to = current;
            return Ok(report);
        }

        if current <= 1 {
            tracing::info!(from = current, to = size, "bootstrapping sharded cluster");
            self.stop().await?;
            self.start(size).await?;
            report.added = self.cluster.node_ids();
            report.slots_assigned = self.cfg.total_slots as usize;
            report.elapsed_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        self.state = ControllerState::Scaling {
            from: current,
            to: size,
            mode,
        };
        tracing::info!(from = current, to = size, %mode, "scaling cluster");
        let res = if size > current {
            self.scale_up(size, &mut report).await
        } else {
            match mode {
                RemovalMode::Graceful => self.scale_down_graceful(size, &mut report).await,
                RemovalMode::Brutal => self.scale_down_brutal(size, &mut report).await,
            }
        };
        let res = res.and_then(|()| self.verify());
        report.elapsed_ms = started.elapsed().as_millis() as u64;
        match res {
            Ok(()) => {
                self.state = ControllerState::Stable(size);
                tracing::info!(
                    from = current,
                    to = size,
                    moved = report.slots_moved,
                    assigned = report.slots_assigned,
                    elapsed_ms = report.elapsed_ms,
                    "scale complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.state = ControllerState::Failed;
                tracing::error!(from = current, to = size, error = %err, "scale failed");
                Err(err)
            }
        }
    }

    async fn scale_up(&mut self, size: usize, report: &mut ScaleReport) -> Result<()> {
        self.registry.request_size(size).await?;
        let reached = self.registry.wait_for_size(size, self.cfg.join_timeout).await;
        if reached != size {
            return Err(ClusterError::Provision(format!(
                "only {reached} of {size} members answered"
            )));
        }
        let nodes = self.registry.nodes().to_vec();
        let newcomers: Vec<Node> = nodes
            .iter()
            .filter(|n| !self.cluster.nodes.iter().any(|old| old.id == n.id))
            .cloned()
            .collect();
        self.meet_all(&nodes[0], &newcomers).await?;
        report.added = ids(&newcomers);

        self.engine.prepare(&nodes[0].addr).await;
        let mut map = self.take_map()?;
        let res = match map.plan_rebalance(&ids(&nodes)) {
            Ok(plan) => self.execute_plan(&mut map, &nodes, &plan, report).await,
            Err(err) => Err(err),
        };
        self.cluster.slots = Some(map);
        res?;
        self.cluster.nodes = nodes;
        self.cluster.size = size;
        Ok(())
    }

    async fn scale_down_graceful(&mut self, size: usize, report: &mut ScaleReport) -> Result<()> {
        let members = self.cluster.nodes.clone();
        let (survivors, victims) = members.split_at(size);

        let mut map = self.take_map()?;
        let res = match map.plan_rebalance(&ids(survivors)) {
            Ok(plan) => self.execute_plan(&mut map, &members, &plan, report).await,
            Err(err) => Err(err),
        };
        self.cluster.slots = Some(map);
        res?;

        for victim in victims {
            self.deprovision(victim).await;
        }
        self.forget_on(survivors, victims).await;
        self.finish_removal(survivors, victims, report);
        Ok(())
    }

    async fn scale_down_brutal(&mut self, size: usize, report: &mut ScaleReport) -> Result<()> {
        let members = self.cluster.nodes.clone();
        let (survivors, victims) = members.split_at(size);

        let mut map = self.take_map()?;
        for victim in victims {
            if let Err(err) = self.admin.expect_ok(&victim.addr, AdminCommand::Shutdown).await {
                tracing::warn!(node = %victim.id, error = %err, "shutdown failed; deprovisioning anyway");
            }
            self.deprovision(victim).await;
            let orphaned = map.drop_node(&victim.id);
            tracing::warn!(node = %victim.id, orphaned = orphaned.len(), "member killed");
        }
        self.cluster.slots = Some(map);
        self.forget_on(survivors, victims).await;
        self.finish_removal(survivors, victims, report);
        self.reconcile(report).await
    }

    /// Repair, refresh the slot map from the primary, re-home orphans and
    /// rebalance across the current members.
    async fn reconcile(&mut self, report: &mut ScaleReport) -> Result<()> {
        let nodes = self.cluster.nodes.clone();
        let Some(primary) = nodes.first() else {
            return Err(ClusterError::DiscoveryUnavailable { attempts: 0 });
        };
        self.engine.prepare(&primary.addr).await;
        let refreshed = self.refresh_map(primary, &nodes).await;
        let mut map = match refreshed {
            Ok(map) => map,
            Err(err) => {
                tracing::warn!(error = %err, "could not refresh slot map from primary; using local view");
                self.take_map()?
            }
        };
        let res = match map.plan_rebalance(&ids(&nodes)) {
            Ok(plan) => self.execute_plan(&mut map, &nodes, &plan, report).await,
            Err(err) => Err(err),
        };
        self.cluster.slots = Some(map);
        res
    }

    /// Slot map as the primary sees it, restricted to `members`.
    async fn refresh_map(&self, primary: &Node, members: &[Node]) -> Result<SlotMap> {
        let view = self.admin.cluster_nodes(&primary.addr).await?;
        let ranges = view
            .into_iter()
            .filter(|info| members.iter().any(|m| m.id == info.id))
            .map(|info| (info.id, info.slots));
        SlotMap::from_ranges(self.cfg.total_slots, ranges)
    }

    async fn execute_plan(
        &self,
        map: &mut SlotMap,
        members: &[Node],
        plan: &MigrationPlan,
        report: &mut ScaleReport,
    ) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        tracing::info!(
            assignments = plan.assignments.len(),
            transfers = plan.transfers.len(),
            slots = plan.slots_moved(),
            "executing migration plan"
        );
        for assignment in &plan.assignments {
            self.engine.assign_slots(map, members, assignment).await?;
            report.slots_assigned += assignment.slots.len();
        }
        for transfer in &plan.transfers {
            let outcome = self.engine.transfer_slots(map, members, transfer).await?;
            report.slots_moved += outcome.slots;
            report.transfers.push(outcome);
        }
        Ok(())
    }

    async fn deprovision(&self, node: &Node) {
        if let Err(err) = self.provisioner.stop(&node.instance).await {
            tracing::warn!(node = %node.id, instance = %node.instance, error = %err, "stop failed");
        }
        if let Err(err) = self.provisioner.remove(&node.instance).await {
            tracing::warn!(node = %node.id, instance = %node.instance, error = %err, "remove failed");
        }
    }

    async fn forget_on(&self, survivors: &[Node], victims: &[Node]) {
        for survivor in survivors {
            for victim in victims {
                if let Err(err) = self
                    .admin
                    .expect_ok(&survivor.addr, AdminCommand::Forget(victim.id.clone()))
                    .await
                {
                    tracing::warn!(on = %survivor.id, node = %victim.id, error = %err, "forget failed");
                }
            }
        }
    }

    fn finish_removal(&mut self, survivors: &[Node], victims: &[Node], report: &mut ScaleReport) {
        for victim in victims {
            self.registry.forget(&victim.id);
        }
        self.registry.set_desired(survivors.len());
        self.cluster.nodes = self.registry.nodes().to_vec();
        self.cluster.size = survivors.len();
        report.removed = ids(victims);
    }

    fn take_map(&mut self) -> Result<SlotMap> {
        self.cluster
            .slots
            .take()
            .ok_or_else(|| ClusterError::PartitionViolated("no slot map for sharded cluster".into()))
    }

    fn verify(&self) -> Result<()> {
        let map = self
            .cluster
            .slots
            .as_ref()
            .ok_or_else(|| ClusterError::PartitionViolated("no slot map after scale".into()))?;
        if !map.in_flight().is_empty() {
            return Err(ClusterError::PartitionViolated(format!(
                "{} slots still in flight",
                map.in_flight().len()
            )));
        }
        map.check_balanced(&self.cluster.node_ids())
    }

    /// Rebuild the controller's view after a failed operation: re-discover
    /// members, fix the cluster, refresh the slot map from the primary and
    /// rebalance.
    pub async fn recover(&mut self) -> Result<()> {
        if self.cluster.standalone.is_some() || self.cluster.nodes.is_empty() {
            tracing::info!("nothing to recover; resetting");
            self.stop().await?;
            return Ok(());
        }
        tracing::warn!(state = %self.state, "recovering cluster");
        let nodes = self.registry.discover().await?;
        if nodes.len() < 2 {
            self.stop().await?;
            return Err(ClusterError::DiscoveryUnavailable {
                attempts: self.cfg.registry.discovery_attempts,
            });
        }
        self.meet_all(&nodes[0], &nodes[1..]).await?;
        self.cluster.nodes = nodes;
        self.cluster.size = self.cluster.nodes.len();
        let mut report = ScaleReport::new(self.cluster.size, self.cluster.size, RemovalMode::Graceful);
        let res = self.reconcile(&mut report).await;
        match res.and_then(|()| self.verify()) {
            Ok(()) => {
                self.state = ControllerState::Stable(self.cluster.size);
                tracing::info!(size = self.cluster.size, "cluster recovered");
                Ok(())
            }
            Err(err) => {
                self.state = ControllerState::Failed;
                Err(err)
            }
        }
    }

    /// Deprovision every member. Idempotent.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == ControllerState::Stopped {
            return Ok(());
        }
        let res = self.teardown_checked().await;
        self.state = ControllerState::Stopped;
        tracing::info!("cluster stopped");
        res
    }

    async fn teardown(&mut self) {
        if let Err(err) = self.teardown_checked().await {
            tracing::warn!(error = %err, "teardown failed");
        }
    }

    async fn teardown_checked(&mut self) -> Result<()> {
        let sharded = self.provisioner.scale_to(self.registry.role(), 0).await;
        let standalone = self.provisioner.scale_to(&self.cfg.standalone_role, 0).await;
        self.registry.reset();
        self.cluster = ClusterState::default();
        sharded.and(standalone)
    }
}

fn ids(nodes: &[Node]) -> Vec<NodeId> {
    nodes.iter().map(|n| n.id.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimCluster;

    fn fast_cfg() -> ControllerConfig {
        ControllerConfig {
            registry: RegistryConfig {
                discovery_attempts: 3,
                discovery_backoff: Duration::from_millis(10),
                poll_interval: Duration::from_millis(10),
                ..RegistryConfig::default()
            },
            migration: MigrationConfig {
                retry_backoff: Duration::from_millis(1),
                ..MigrationConfig::default()
            },
            join_timeout: Duration::from_millis(100),
            ..ControllerConfig::default()
        }
    }

    fn controller(sim: &Arc<SimCluster>) -> ClusterController<SimCluster, SimCluster> {
        ClusterController::new(sim.clone(), sim.clone(), fast_cfg())
    }

    #[tokio::test(start_paused = true)]
    async fn start_zero_stays_stopped() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(0).await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stopped);
        assert!(sim.instances_of("redis-master").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn start_one_is_standalone() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(1).await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stable(1));
        assert!(ctl.cluster().slots.is_none());
        assert_eq!(sim.instances_of("redis-standalone").len(), 1);
        assert!(sim.instances_of("redis-master").is_empty());
        assert!(ctl.primary_address().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn start_provisions_in_batches() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = ClusterController::new(
            sim.clone(),
            sim.clone(),
            ControllerConfig {
                start_batch: 2,
                ..fast_cfg()
            },
        );
        ctl.start(5).await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stable(5));
        let map = ctl.cluster().slots.as_ref().unwrap();
        map.check_balanced(&ctl.cluster().node_ids()).unwrap();
        assert!(ctl.cluster().nodes[0].is_primary);
    }

    #[tokio::test(start_paused = true)]
    async fn start_gives_up_after_bounded_attempts() {
        let sim = Arc::new(SimCluster::new());
        sim.fail_next_scale_requests(100);
        let mut ctl = controller(&sim);
        let err = ctl.start(3).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::ClusterStartFailed {
                attempts: 3,
                wanted: 3,
                ..
            }
        ));
        assert_eq!(ctl.state(), ControllerState::Failed);
        ctl.stop().await.ok();
        assert_eq!(ctl.state(), ControllerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn start_twice_is_rejected() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(2).await.unwrap();
        assert!(matches!(
            ctl.start(2).await,
            Err(ClusterError::InvalidTransition { op: "start", .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn scale_below_threshold_is_a_noop() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(3).await.unwrap();
        sim.clear_command_log();
        let report = ctl.scale(1, RemovalMode::Brutal).await.unwrap();
        assert!(report.skipped);
        assert_eq!(ctl.state(), ControllerState::Stable(3));
        assert!(sim.command_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scaling_from_standalone_bootstraps() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(1).await.unwrap();
        let report = ctl.scale(3, RemovalMode::Graceful).await.unwrap();
        assert_eq!(report.added.len(), 3);
        assert_eq!(ctl.state(), ControllerState::Stable(3));
        assert!(sim.instances_of("redis-standalone").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_scale_down_removes_tail_members() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(4).await.unwrap();
        let before = ctl.cluster().nodes.clone();
        let report = ctl.scale(3, RemovalMode::Graceful).await.unwrap();
        assert_eq!(report.removed, vec![before[3].id.clone()]);
        assert_eq!(ctl.cluster().nodes, before[..3].to_vec());
        assert_eq!(sim.instances_of("redis-master").len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_scale_is_recovered_on_next_scale() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(2).await.unwrap();
        for slot in (0..16384).step_by(512) {
            assert!(sim.seed_keys(slot, 1));
        }
        sim.fail_next("MIGRATE", 100);
        let err = ctl.scale(3, RemovalMode::Graceful).await.unwrap_err();
        assert!(matches!(err, ClusterError::MigrationFailed { .. }));
        assert_eq!(ctl.state(), ControllerState::Failed);

        sim.fail_next("MIGRATE", 0);
        ctl.scale(3, RemovalMode::Graceful).await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stable(3));
        ctl.cluster()
            .slots
            .as_ref()
            .unwrap()
            .check_balanced(&ctl.cluster().node_ids())
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let sim = Arc::new(SimCluster::new());
        let mut ctl = controller(&sim);
        ctl.start(2).await.unwrap();
        ctl.stop().await.unwrap();
        ctl.stop().await.unwrap();
        assert_eq!(ctl.state(), ControllerState::Stopped);
        assert!(sim.instances_of("redis-master").is_empty());
        assert!(ctl.primary_address().is_none());
    }

    #[test]
    fn removal_mode_parses() {
        assert_eq!("Brutal".parse::<RemovalMode>().unwrap(), RemovalMode::Brutal);
        assert_eq!("graceful".parse::<RemovalMode>().unwrap(), RemovalMode::Graceful);
        assert!("gentle".parse::<RemovalMode>().is_err());
    }
}
