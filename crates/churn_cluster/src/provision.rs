//! Provisioning layer: starting and stopping member instances.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{ClusterError, Result};
use crate::node::{InstanceId, NodeAddr};

/// A running instance as reported by the provisioning layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub addr: NodeAddr,
}

/// Provisioning operations the controller needs. Failures are treated as
/// retryable up to the caller's budgets.
#[async_trait]
pub trait Provisioner: Send + Sync + 'static {
    /// Ensure exactly `count` running instances of `role`.
    async fn scale_to(&self, role: &str, count: usize) -> Result<()>;

    /// Running instances of `role`, in provisioning order.
    async fn list_instances(&self, role: &str) -> Result<Vec<Instance>>;

    async fn stop(&self, id: &InstanceId) -> Result<()>;

    async fn remove(&self, id: &InstanceId) -> Result<()>;
}

/// Configuration for [`ComposeProvisioner`].
#[derive(Clone, Debug)]
pub struct ComposeConfig {
    pub compose_bin: PathBuf,
    pub docker_bin: PathBuf,
    /// Compose network the members are attached to.
    pub network: String,
    /// Client port the members listen on.
    pub node_port: u16,
    /// Graceful stop timeout handed to `docker-compose scale -t`.
    pub stop_timeout_secs: u32,
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            compose_bin: PathBuf::from("docker-compose"),
            docker_bin: PathBuf::from("docker"),
            network: "erasuretester_default".to_string(),
            node_port: 6379,
            stop_timeout_secs: 2,
        }
    }
}

/// Provisioner backed by `docker-compose` services.
#[derive(Clone, Debug, Default)]
pub struct ComposeProvisioner {
    cfg: ComposeConfig,
}

impl ComposeProvisioner {
    pub fn new(cfg: ComposeConfig) -> Self {
        Self { cfg }
    }

    async fn run(&self, program: &PathBuf, args: &[String]) -> Result<String> {
        tracing::debug!(program = %program.display(), ?args, "provisioning command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|err| {
                ClusterError::Provision(format!("spawn {}: {err}", program.display()))
            })?;
        if !output.status.success() {
            return Err(ClusterError::Provision(format!(
                "{} {} exited with {}: {}",
                program.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn container_ip(&self, id: &str) -> Result<String> {
        let template = format!(
            "{{{{(index .NetworkSettings.Networks \"{}\").IPAddress}}}}",
            self.cfg.network
        );
        let out = self
            .run(
                &self.cfg.docker_bin,
                &["inspect".into(), "-f".into(), template, id.to_string()],
            )
            .await?;
        let ip = out.trim().to_string();
        if ip.is_empty() {
            return Err(ClusterError::Provision(format!(
                "container {id} has no address on network {}",
                self.cfg.network
            )));
        }
        Ok(ip)
    }
}

#[async_trait]
impl Provisioner for ComposeProvisioner {
    async fn scale_to(&self, role: &str, count: usize) -> Result<()> {
        let args = vec![
            "scale".to_string(),
            "-t".to_string(),
            self.cfg.stop_timeout_secs.to_string(),
            format!("{role}={count}"),
        ];
        self.run(&self.cfg.compose_bin, &args).await?;
        Ok(())
    }

    async fn list_instances(&self, role: &str) -> Result<Vec<Instance>> {
        let out = self
            .run(
                &self.cfg.compose_bin,
                &["ps".into(), "-q".into(), role.to_string()],
            )
            .await?;
        let mut instances = Vec::new();
        for id in out.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let ip = self.container_ip(id).await?;
            instances.push(Instance {
                id: InstanceId(id.to_string()),
                addr: NodeAddr::new(ip, self.cfg.node_port),
            });
        }
        Ok(instances)
    }

    async fn stop(&self, id: &InstanceId) -> Result<()> {
        self.run(
            &self.cfg.docker_bin,
            &["stop".into(), "-t".into(), "0".into(), id.0.clone()],
        )
        .await?;
        Ok(())
    }

    async fn remove(&self, id: &InstanceId) -> Result<()> {
        self.run(&self.cfg.docker_bin, &["rm".into(), "-f".into(), id.0.clone()])
            .await?;
        Ok(())
    }
}
