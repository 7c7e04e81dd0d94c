//! The storage-under-test: a subprocess driven over a line-oriented
//! stdin/stdout protocol.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use churn_cluster::ClusterError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time;

/// Commands understood by the storage-under-test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageCommand {
    ClearCache,
    RepairAll,
    Repair(String),
}

impl fmt::Display for StorageCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageCommand::ClearCache => f.write_str("clearCache"),
            StorageCommand::RepairAll => f.write_str("repairAll"),
            StorageCommand::Repair(path) => write!(f, "repair {path}"),
        }
    }
}

/// Capability interface over the process being benchmarked.
#[async_trait]
pub trait StorageUnderTest: Send {
    /// Start (or restart) with run-specific arguments and environment.
    async fn start(&mut self, args: Vec<String>, env: Vec<(String, String)>) -> anyhow::Result<()>;

    /// Stop the process. Stopping a stopped process is a no-op.
    async fn stop(&mut self) -> anyhow::Result<()>;

    async fn send_command(&mut self, command: &StorageCommand) -> anyhow::Result<()>;

    /// Wait for the completion line of the last command. Not observing it
    /// within the poll budget yields [`ClusterError::CommandTimeout`].
    async fn await_completion(&mut self) -> anyhow::Result<()>;

    /// Whether the process is still alive. A process found to have exited
    /// is forgotten, so the next `start` spawns a fresh one.
    fn is_running(&mut self) -> bool;

    async fn run_command(&mut self, command: &StorageCommand) -> anyhow::Result<()> {
        self.send_command(command).await?;
        self.await_completion().await
    }
}

/// Configuration for [`SubprocessStorage`].
#[derive(Clone, Debug)]
pub struct SubprocessConfig {
    pub program: PathBuf,
    /// Arguments placed before the run-specific ones.
    pub base_args: Vec<String>,
    pub workdir: Option<PathBuf>,
    /// Pause after spawning before the process is considered ready.
    pub settle: Duration,
    /// Literal stdout line that signals command completion.
    pub done_marker: String,
    /// Poll intervals allowed for the completion line. Output other than the
    /// marker does not extend the wait.
    pub completion_polls: u32,
    pub poll_interval: Duration,
    /// Time between SIGTERM and SIGKILL on stop.
    pub kill_grace: Duration,
}

impl Default for SubprocessConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("java"),
            base_args: ["-cp", "*", "ch.unine.vauchers.erasuretester.Main", "/mnt/erasure"]
                .into_iter()
                .map(String::from)
                .collect(),
            workdir: None,
            settle: Duration::from_secs(10),
            done_marker: "Done".to_string(),
            completion_polls: 10,
            poll_interval: Duration::from_secs(1),
            kill_grace: Duration::from_secs(10),
        }
    }
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

/// [`StorageUnderTest`] backed by a spawned child process.
pub struct SubprocessStorage {
    cfg: SubprocessConfig,
    running: Option<Running>,
    last_command: Option<StorageCommand>,
}

impl SubprocessStorage {
    pub fn new(cfg: SubprocessConfig) -> Self {
        Self {
            cfg,
            running: None,
            last_command: None,
        }
    }

    fn program(&self) -> String {
        self.cfg.program.display().to_string()
    }

    fn timeout_error(&self) -> anyhow::Error {
        let command = self
            .last_command
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        ClusterError::CommandTimeout {
            command,
            target: self.program(),
        }
        .into()
    }

    /// SIGTERM, wait up to the grace period, then SIGKILL.
    async fn terminate(&self, running: &mut Running) -> anyhow::Result<()> {
        let Some(pid) = running.child.id() else {
            // Already reaped.
            return Ok(());
        };
        tracing::info!(pid, "terminating storage process");
        let status = Command::new("kill")
            .args(["-TERM", &pid.to_string()])
            .status()
            .await;
        if let Err(err) = status {
            tracing::warn!(pid, error = %err, "SIGTERM failed");
        }

        let deadline = time::Instant::now() + self.cfg.kill_grace;
        loop {
            if let Some(status) = running.child.try_wait().context("poll storage process")? {
                tracing::debug!(pid, %status, "storage process exited");
                return Ok(());
            }
            if time::Instant::now() >= deadline {
                break;
            }
            time::sleep(Duration::from_secs(1).min(self.cfg.kill_grace)).await;
        }

        tracing::warn!(pid, "storage process still alive, sending SIGKILL");
        running.child.kill().await.context("kill storage process")?;
        Ok(())
    }
}

#[async_trait]
impl StorageUnderTest for SubprocessStorage {
    async fn start(&mut self, args: Vec<String>, env: Vec<(String, String)>) -> anyhow::Result<()> {
        self.stop().await?;

        let mut cmd = Command::new(&self.cfg.program);
        cmd.args(&self.cfg.base_args)
            .args(&args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cfg.workdir {
            cmd.current_dir(dir);
        }
        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", self.program()))?;
        let stdin = child.stdin.take().context("storage stdin not piped")?;
        let stdout = child.stdout.take().context("storage stdout not piped")?;
        tracing::info!(pid = child.id(), ?args, "storage process started");
        self.running = Some(Running {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        });
        time::sleep(self.cfg.settle).await;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        let Some(mut running) = self.running.take() else {
            return Ok(());
        };
        self.terminate(&mut running).await
    }

    async fn send_command(&mut self, command: &StorageCommand) -> anyhow::Result<()> {
        let running = self
            .running
            .as_mut()
            .context("storage process not running")?;
        let line = format!("{command}\n");
        running
            .stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("send {command}"))?;
        running.stdin.flush().await.context("flush storage stdin")?;
        tracing::debug!(%command, "storage command sent");
        self.last_command = Some(command.clone());
        Ok(())
    }

    async fn await_completion(&mut self) -> anyhow::Result<()> {
        let marker = self.cfg.done_marker.clone();
        let interval = self.cfg.poll_interval;
        let polls = self.cfg.completion_polls;
        let running = self
            .running
            .as_mut()
            .context("storage process not running")?;
        let deadline = time::Instant::now() + interval * polls;
        loop {
            match time::timeout_at(deadline, running.stdout.next_line()).await {
                Ok(Ok(Some(line))) if line.trim() == marker => return Ok(()),
                Ok(Ok(Some(line))) => tracing::debug!(%line, "storage output"),
                Ok(Ok(None)) => {
                    anyhow::bail!("storage process closed stdout before completing")
                }
                Ok(Err(err)) => return Err(err).context("read storage stdout"),
                Err(_) => return Err(self.timeout_error()),
            }
        }
    }

    fn is_running(&mut self) -> bool {
        let Some(running) = self.running.as_mut() else {
            return false;
        };
        match running.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(%status, "storage process exited on its own");
                self.running = None;
                false
            }
            Err(err) => {
                tracing::warn!(error = %err, "cannot poll storage process; treating it as gone");
                self.running = None;
                false
            }
        }
    }
}

/// Stand-in used by dry runs: records nothing, completes every command.
#[derive(Debug, Default)]
pub struct NoopStorage {
    running: bool,
}

#[async_trait]
impl StorageUnderTest for NoopStorage {
    async fn start(&mut self, args: Vec<String>, env: Vec<(String, String)>) -> anyhow::Result<()> {
        tracing::info!(?args, ?env, "dry run: storage start");
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        self.running = false;
        Ok(())
    }

    async fn send_command(&mut self, command: &StorageCommand) -> anyhow::Result<()> {
        tracing::info!(%command, "dry run: storage command");
        Ok(())
    }

    async fn await_completion(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.running
    }
}
