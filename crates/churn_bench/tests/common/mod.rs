//! Fakes for driving the benchmark loops against the simulated cluster.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use churn_bench::{
    BenchConfig, BenchRecord, Benchmark, Driver, DriverConfig, ResultRecord, ResultSink,
    StepRecord, StorageCommand, StorageUnderTest,
};
use churn_cluster::{
    ClusterController, ClusterError, ControllerConfig, MigrationConfig, RegistryConfig,
    SimCluster,
};
use tokio::sync::watch;

pub type SimDriver = Driver<SimCluster, SimCluster, FakeStorage>;

/// Controller settings with short backoffs so paused-clock tests stay quick.
pub fn fast_config() -> ControllerConfig {
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
        join_timeout: Duration::from_millis(200),
        ..ControllerConfig::default()
    }
}

/// What the driver did to the storage-under-test.
#[derive(Debug, Default)]
pub struct StorageLog {
    pub starts: Vec<(Vec<String>, Vec<(String, String)>)>,
    pub commands: Vec<StorageCommand>,
    pub stops: usize,
}

impl StorageLog {
    pub fn count(&self, command: &StorageCommand) -> usize {
        self.commands.iter().filter(|c| *c == command).count()
    }
}

/// In-memory storage-under-test that records every call.
#[derive(Clone, Default)]
pub struct FakeStorage {
    pub log: Arc<Mutex<StorageLog>>,
    pub running: bool,
    /// Never acknowledge commands.
    pub silent: bool,
    /// Exit on its own once this many commands have been received.
    pub exit_after_commands: Option<usize>,
}

impl FakeStorage {
    pub fn silent() -> Self {
        Self {
            silent: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl StorageUnderTest for FakeStorage {
    async fn start(&mut self, args: Vec<String>, env: Vec<(String, String)>) -> anyhow::Result<()> {
        self.log.lock().unwrap().starts.push((args, env));
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) -> anyhow::Result<()> {
        if self.running {
            self.log.lock().unwrap().stops += 1;
        }
        self.running = false;
        Ok(())
    }

    async fn send_command(&mut self, command: &StorageCommand) -> anyhow::Result<()> {
        anyhow::ensure!(self.running, "not running");
        let received = {
            let mut log = self.log.lock().unwrap();
            log.commands.push(command.clone());
            log.commands.len()
        };
        if self.exit_after_commands.is_some_and(|n| received >= n) {
            self.exit_after_commands = None;
            self.running = false;
        }
        Ok(())
    }

    async fn await_completion(&mut self) -> anyhow::Result<()> {
        if self.silent {
            return Err(ClusterError::CommandTimeout {
                command: "fake".to_string(),
                target: "fake".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn is_running(&mut self) -> bool {
        self.running
    }
}

/// Benchmark that reports the cluster size it ran against.
#[derive(Default)]
pub struct FakeBench {
    pub runs: Arc<AtomicUsize>,
    /// Fail when run against this cluster size.
    pub fail_at_size: Option<usize>,
    /// Raised after the first run.
    pub shutdown: Option<watch::Sender<bool>>,
}

#[async_trait]
impl Benchmark for FakeBench {
    fn name(&self) -> &str {
        "bench_fake"
    }

    async fn run(&self, cfg: &BenchConfig) -> anyhow::Result<serde_json::Value> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if let Some(tx) = &self.shutdown {
            tx.send_replace(true);
        }
        anyhow::ensure!(
            self.fail_at_size != Some(cfg.cluster_size),
            "bench exploded at size {}",
            cfg.cluster_size
        );
        Ok(serde_json::json!({ "size": cfg.cluster_size }))
    }
}

/// Driver over a fresh simulation writing to `dir/out.json`.
pub fn sim_driver(
    dir: &Path,
    storage: FakeStorage,
    bench: FakeBench,
    cfg: DriverConfig,
    shutdown: watch::Receiver<bool>,
) -> (Arc<SimCluster>, SimDriver) {
    let sim = Arc::new(SimCluster::new());
    let controller = ClusterController::new(sim.clone(), sim.clone(), fast_config());
    let sink = ResultSink::with_path(dir.join("out.json"));
    let driver = Driver::new(controller, storage, vec![Box::new(bench)], sink, cfg, shutdown);
    (sim, driver)
}

pub fn bench_records(sink: &ResultSink) -> Vec<BenchRecord> {
    sink.records()
        .iter()
        .filter_map(|r| match r {
            ResultRecord::Bench(b) => Some(b.clone()),
            ResultRecord::Step(_) => None,
        })
        .collect()
}

pub fn step_records(sink: &ResultSink) -> Vec<StepRecord> {
    sink.records()
        .iter()
        .filter_map(|r| match r {
            ResultRecord::Step(s) => Some(s.clone()),
            ResultRecord::Bench(_) => None,
        })
        .collect()
}

/// Parse the persisted result file.
pub fn saved(dir: &Path) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(dir.join("out.json")).expect("result file written");
    serde_json::from_str(&raw).expect("valid json")
}

/// No member of either role is left provisioned.
pub fn assert_torn_down(sim: &SimCluster) {
    assert!(sim.instances_of("redis-master").is_empty());
    assert!(sim.instances_of("redis-standalone").is_empty());
}
