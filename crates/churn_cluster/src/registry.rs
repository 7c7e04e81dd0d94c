//! Discovery of the live member set.
//!
//! The registry is a read-only projection of provisioning-layer state: it
//! lists instances of the member role and confirms each one by asking it for
//! its cluster id. Node order is stable across discoveries (known members
//! keep their position, newcomers are appended in provisioning order) and the
//! first entry is the primary.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant};

use crate::admin::{AdminExt, AdminTransport};
use crate::error::{ClusterError, Result};
use crate::node::{Node, NodeId};
use crate::provision::Provisioner;

/// Configuration for [`NodeRegistry`].
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Provisioning role of sharded members.
    pub role: String,
    pub discovery_attempts: u32,
    pub discovery_backoff: Duration,
    /// Re-issue the last provisioning request after this many consecutive
    /// empty discoveries.
    pub reprovision_after: u32,
    /// Poll interval for [`NodeRegistry::wait_for_size`].
    pub poll_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            role: "redis-master".to_string(),
            discovery_attempts: 5,
            discovery_backoff: Duration::from_secs(5),
            reprovision_after: 2,
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct NodeRegistry<P, A> {
    provisioner: Arc<P>,
    admin: Arc<A>,
    cfg: RegistryConfig,
    desired: Option<usize>,
    known: Vec<Node>,
}

impl<P: Provisioner, A: AdminTransport> NodeRegistry<P, A> {
    pub fn new(provisioner: Arc<P>, admin: Arc<A>, cfg: RegistryConfig) -> Self {
        Self {
            provisioner,
            admin,
            cfg,
            desired: None,
            known: Vec::new(),
        }
    }

    pub fn role(&self) -> &str {
        &self.cfg.role
    }

    /// Members from the last successful discovery, primary first.
    pub fn nodes(&self) -> &[Node] {
        &self.known
    }

    pub fn primary(&self) -> Option<&Node> {
        self.known.first()
    }

    pub fn get(&self, id: &NodeId) -> Option<&Node> {
        self.known.iter().find(|n| n.id == *id)
    }

    /// Ask the provisioning layer for `count` members and remember the
    /// request so discovery can re-issue it.
    pub async fn request_size(&mut self, count: usize) -> Result<()> {
        self.desired = Some(count);
        self.provisioner.scale_to(&self.cfg.role, count).await
    }

    /// Record the size the provisioning layer now holds without issuing a
    /// request (members were removed one by one).
    pub fn set_desired(&mut self, count: usize) {
        self.desired = Some(count);
    }

    /// Drop a member from the registry after it has been deprovisioned.
    pub fn forget(&mut self, id: &NodeId) {
        self.known.retain(|n| n.id != *id);
        self.reflag_primary();
    }

    /// Clear everything (cluster stopped).
    pub fn reset(&mut self) {
        self.desired = None;
        self.known.clear();
    }

    /// Discover the live member set with a bounded retry loop.
    pub async fn discover(&mut self) -> Result<Vec<Node>> {
        let attempts = self.cfg.discovery_attempts.max(1);
        let mut empty_streak = 0u32;
        for attempt in 1..=attempts {
            match self.probe().await {
                Ok(nodes) if !nodes.is_empty() => {
                    self.merge(nodes);
                    return Ok(self.known.clone());
                }
                Ok(_) => {
                    tracing::warn!(attempt, attempts, "discovery found no reachable member");
                }
                Err(err) => {
                    tracing::warn!(attempt, attempts, error = %err, "discovery failed");
                }
            }
            empty_streak += 1;
            if empty_streak >= self.cfg.reprovision_after {
                empty_streak = 0;
                if let Some(count) = self.desired {
                    tracing::info!(role = %self.cfg.role, count, "re-issuing provisioning request");
                    if let Err(err) = self.provisioner.scale_to(&self.cfg.role, count).await {
                        tracing::warn!(error = %err, "re-provisioning failed");
                    }
                }
            }
            if attempt < attempts {
                time::sleep(self.cfg.discovery_backoff).await;
            }
        }
        Err(ClusterError::DiscoveryUnavailable { attempts })
    }

    /// Poll discovery until `count` members answer or `timeout` elapses.
    /// Returns the count actually reached.
    pub async fn wait_for_size(&mut self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut last_report = None;
        loop {
            let reached = match self.probe().await {
                Ok(nodes) => {
                    let reached = nodes.len();
                    self.merge(nodes);
                    reached
                }
                Err(err) => {
                    tracing::debug!(error = %err, "discovery probe failed");
                    0
                }
            };
            if last_report != Some(reached) {
                last_report = Some(reached);
                tracing::info!(reached, wanted = count, "member discovery");
            }
            if reached == count || Instant::now() >= deadline {
                return reached;
            }
            time::sleep(self.cfg.poll_interval).await;
        }
    }

    /// One pass: list instances and confirm each by its cluster id.
    async fn probe(&self) -> Result<Vec<Node>> {
        let instances = self.provisioner.list_instances(&self.cfg.role).await?;
        let mut nodes = Vec::with_capacity(instances.len());
        for instance in instances {
            match self.admin.my_id(&instance.addr).await {
                Ok(id) => nodes.push(Node {
                    id,
                    instance: instance.id,
                    addr: instance.addr,
                    is_primary: false,
                }),
                Err(err) => {
                    tracing::debug!(
                        instance = %instance.id,
                        addr = %instance.addr,
                        error = %err,
                        "instance not reachable yet"
                    );
                }
            }
        }
        Ok(nodes)
    }

    /// Replace the known set with `fresh`, keeping known members in place.
    fn merge(&mut self, fresh: Vec<Node>) {
        let mut merged: Vec<Node> = self
            .known
            .iter()
            .filter_map(|old| fresh.iter().find(|n| n.id == old.id).cloned())
            .collect();
        for node in fresh {
            if !merged.iter().any(|n| n.id == node.id) {
                merged.push(node);
            }
        }
        self.known = merged;
        self.reflag_primary();
    }

    fn reflag_primary(&mut self) {
        for (idx, node) in self.known.iter_mut().enumerate() {
            node.is_primary = idx == 0;
        }
    }
}
