//! Churn benchmark driver.
//!
//! Runs the storage-under-test against a sharded cluster, either over a
//! fixed configuration matrix or while replaying a membership trace that
//! grows and shrinks the cluster, and writes the results as JSON.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use churn_bench::{
    BenchConfig, Benchmark, DdBench, Driver, DriverConfig, MatrixConfig, NoopStorage, ResultSink,
    StorageUnderTest, SubprocessConfig, SubprocessStorage,
};
use churn_cluster::{
    AdminTransport, ClusterController, ComposeConfig, ComposeProvisioner, ControllerConfig,
    EventLog, MigrationConfig, Provisioner, RecordedTrace, RegistryConfig, RemovalMode,
    ReplayConfig, RespAdmin, RespAdminConfig, SimCluster, SyntheticTrace, TraceReplayer,
    WallClock, DEFAULT_TOTAL_SLOTS,
};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "churn-bench")]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run every benchmark against every configuration, each on a fresh cluster.
    Matrix(MatrixArgs),
    /// Replay a membership trace and benchmark after every step.
    Churn(ChurnArgs),
}

/// Options shared by both subcommands.
#[derive(Parser, Debug, Clone)]
struct CommonArgs {
    /// Directory receiving `result_<timestamp>.json`.
    #[arg(long, env = "CHURN_RESULTS_DIR", default_value = "results")]
    results_dir: PathBuf,

    /// Lower log verbosity and pass `-q` to the storage-under-test.
    #[arg(short, long, env = "CHURN_QUIET")]
    quiet: bool,

    /// Use an in-process simulated cluster and a no-op storage-under-test.
    #[arg(long, env = "CHURN_DRY_RUN")]
    dry_run: bool,

    /// Mount point the storage-under-test exposes.
    #[arg(long, env = "CHURN_MOUNT", default_value = "/mnt/erasure")]
    mount: PathBuf,

    /// Storage-under-test command line (whitespace separated).
    #[arg(
        long,
        env = "CHURN_STORAGE_CMD",
        default_value = "java -cp * ch.unine.vauchers.erasuretester.Main /mnt/erasure"
    )]
    storage_cmd: String,

    /// Working directory for the storage-under-test.
    #[arg(long, env = "CHURN_STORAGE_WORKDIR")]
    storage_workdir: Option<PathBuf>,

    /// Pause after starting the storage-under-test.
    #[arg(long, env = "CHURN_STORAGE_SETTLE", default_value = "10s")]
    storage_settle: humantime::Duration,

    /// Line the storage-under-test prints when a command completes.
    #[arg(long, env = "CHURN_DONE_MARKER", default_value = "Done")]
    done_marker: String,

    /// Silent polls tolerated while waiting for the completion line.
    #[arg(long, env = "CHURN_COMPLETION_POLLS", default_value_t = 10)]
    completion_polls: u32,

    #[arg(long, env = "CHURN_COMPLETION_POLL_INTERVAL", default_value = "1s")]
    completion_poll_interval: humantime::Duration,

    /// Grace period between SIGTERM and SIGKILL.
    #[arg(long, env = "CHURN_KILL_GRACE", default_value = "10s")]
    kill_grace: humantime::Duration,

    /// Per-command deadline for cluster administration.
    #[arg(long, env = "CHURN_COMMAND_TIMEOUT", default_value = "10s")]
    command_timeout: humantime::Duration,

    /// `redis-cli` used for the cluster-wide fix.
    #[arg(long, env = "CHURN_FIX_TOOL", default_value = "redis-cli")]
    fix_tool: PathBuf,

    #[arg(long, env = "CHURN_DISCOVERY_BACKOFF", default_value = "5s")]
    discovery_backoff: humantime::Duration,

    #[arg(long, env = "CHURN_DISCOVERY_ATTEMPTS", default_value_t = 5)]
    discovery_attempts: u32,

    /// How long a new member set may take to become reachable.
    #[arg(long, env = "CHURN_JOIN_TIMEOUT", default_value = "120s")]
    join_timeout: humantime::Duration,

    /// Slot transfer retries after the first attempt.
    #[arg(long, env = "CHURN_MIGRATION_RETRIES", default_value_t = 3)]
    migration_retries: u32,

    #[arg(long, env = "CHURN_SLOTS", default_value_t = DEFAULT_TOTAL_SLOTS)]
    slots: u16,

    #[arg(long, env = "CHURN_COMPOSE_BIN", default_value = "docker-compose")]
    compose_bin: PathBuf,

    #[arg(long, env = "CHURN_DOCKER_BIN", default_value = "docker")]
    docker_bin: PathBuf,

    /// Compose network the members are attached to.
    #[arg(long, env = "CHURN_NETWORK", default_value = "erasuretester_default")]
    network: String,

    #[arg(long, env = "CHURN_NODE_PORT", default_value_t = 6379)]
    node_port: u16,
}

/// Options for the configuration matrix.
#[derive(Parser, Debug, Clone)]
struct MatrixArgs {
    /// Cluster sizes; 0 runs in memory, 1 against a standalone node.
    #[arg(long, env = "CHURN_SIZES", value_delimiter = ',', default_value = "5,1,0")]
    sizes: Vec<usize>,

    #[arg(long, env = "CHURN_CODES", value_delimiter = ',', default_value = "Null")]
    codes: Vec<String>,

    #[arg(long, env = "CHURN_STRIPES", value_delimiter = ',', default_value = "10")]
    stripes: Vec<usize>,

    #[arg(long, env = "CHURN_PARITIES", value_delimiter = ',', default_value = "2")]
    parities: Vec<usize>,

    #[arg(long, env = "CHURN_SRCS", value_delimiter = ',', default_value = "5")]
    srcs: Vec<usize>,
}

/// Options for churn replay.
#[derive(Parser, Debug, Clone)]
struct ChurnArgs {
    /// Synthetic trace: comma-separated cluster sizes.
    #[arg(
        long,
        env = "CHURN_TRACE_SIZES",
        value_delimiter = ',',
        required_unless_present = "trace_file",
        conflicts_with = "trace_file"
    )]
    trace_sizes: Vec<usize>,

    /// Recorded trace: JSON lines of `{node_id, event_type, event_start_time}`.
    #[arg(long, env = "CHURN_TRACE_FILE")]
    trace_file: Option<PathBuf>,

    /// Trace seconds replayed per wall-clock second.
    #[arg(long, env = "CHURN_TIME_FACTOR", default_value_t = 1.0)]
    time_factor: f64,

    /// Override the trace start time.
    #[arg(long, env = "CHURN_MIN_TIME")]
    min_time: Option<f64>,

    /// Override the trace end time.
    #[arg(long, env = "CHURN_MAX_TIME")]
    max_time: Option<f64>,

    /// Wall-clock interval between trace polls.
    #[arg(long, env = "CHURN_TICK", default_value = "1s")]
    tick: humantime::Duration,

    /// How departing members leave: graceful or brutal.
    #[arg(long, env = "CHURN_MODE", default_value = "graceful")]
    mode: RemovalMode,

    #[arg(long, env = "CHURN_CODE", default_value = "Null")]
    code: String,

    #[arg(long, env = "CHURN_STRIPE", default_value_t = 10)]
    stripe: usize,

    #[arg(long, env = "CHURN_PARITY", default_value_t = 2)]
    parity: usize,

    #[arg(long, env = "CHURN_SRC", default_value_t = 5)]
    src: usize,

    /// Do not ask the storage-under-test to clear its cache before benchmarks.
    #[arg(long, env = "CHURN_NO_CLEAR_CACHE")]
    no_clear_cache: bool,
}

impl ChurnArgs {
    fn bench_config(&self, initial: usize) -> BenchConfig {
        BenchConfig {
            stripe: Some(self.stripe),
            parity: Some(self.parity),
            src: Some(self.src),
            ..BenchConfig::new(self.code.clone(), initial)
        }
    }

    fn replayer(&self) -> anyhow::Result<Box<dyn TraceReplayer>> {
        let Some(path) = &self.trace_file else {
            return Ok(Box::new(SyntheticTrace::new(self.trace_sizes.clone())));
        };
        anyhow::ensure!(
            self.time_factor > 0.0,
            "--time-factor must be positive (got {})",
            self.time_factor
        );
        let log = EventLog::load_jsonl(path)
            .with_context(|| format!("load trace {}", path.display()))?
            .with_bounds(self.min_time, self.max_time);
        anyhow::ensure!(!log.is_empty(), "trace {} has no events", path.display());
        let cfg = ReplayConfig {
            time_factor: self.time_factor,
            poll_interval: self.tick.into(),
        };
        Ok(Box::new(RecordedTrace::new(log, WallClock::default(), cfg)))
    }
}

impl CommonArgs {
    fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            registry: RegistryConfig {
                discovery_attempts: self.discovery_attempts,
                discovery_backoff: self.discovery_backoff.into(),
                ..RegistryConfig::default()
            },
            migration: MigrationConfig {
                retries: self.migration_retries,
                ..MigrationConfig::default()
            },
            total_slots: self.slots,
            join_timeout: self.join_timeout.into(),
            ..ControllerConfig::default()
        }
    }

    fn subprocess_config(&self) -> anyhow::Result<SubprocessConfig> {
        let mut parts = self.storage_cmd.split_whitespace().map(String::from);
        let program = parts.next().context("--storage-cmd is empty")?;
        Ok(SubprocessConfig {
            program: PathBuf::from(program),
            base_args: parts.collect(),
            workdir: self.storage_workdir.clone(),
            settle: self.storage_settle.into(),
            done_marker: self.done_marker.clone(),
            completion_polls: self.completion_polls,
            poll_interval: self.completion_poll_interval.into(),
            kill_grace: self.kill_grace.into(),
        })
    }
}

#[tokio::main]
/// Parse CLI args, initialize logging, and run the requested subcommand.
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Enable ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    let default_filter = if args.common.quiet { "warn" } else { "info" };
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(forward_signals(shutdown_tx));

    let common = args.common;
    if common.dry_run {
        let sim = Arc::new(SimCluster::with_slots(common.slots));
        run(args.cmd, &common, sim.clone(), sim, NoopStorage::default(), Vec::new(), shutdown_rx)
            .await
    } else {
        let provisioner = Arc::new(ComposeProvisioner::new(ComposeConfig {
            compose_bin: common.compose_bin.clone(),
            docker_bin: common.docker_bin.clone(),
            network: common.network.clone(),
            node_port: common.node_port,
            ..ComposeConfig::default()
        }));
        let admin = Arc::new(RespAdmin::new(RespAdminConfig {
            command_timeout: common.command_timeout.into(),
            fix_tool: common.fix_tool.clone(),
            ..RespAdminConfig::default()
        }));
        let storage = SubprocessStorage::new(common.subprocess_config()?);
        let benches: Vec<Box<dyn Benchmark>> = vec![Box::new(DdBench::new(&common.mount))];
        run(args.cmd, &common, provisioner, admin, storage, benches, shutdown_rx).await
    }
}

async fn run<P, A, S>(
    cmd: Command,
    common: &CommonArgs,
    provisioner: Arc<P>,
    admin: Arc<A>,
    storage: S,
    benches: Vec<Box<dyn Benchmark>>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    P: Provisioner,
    A: AdminTransport,
    S: StorageUnderTest,
{
    let controller = ClusterController::new(provisioner, admin, common.controller_config());
    let sink = ResultSink::new(&common.results_dir);
    match cmd {
        Command::Matrix(matrix) => {
            let cfg = DriverConfig {
                matrix: MatrixConfig {
                    cluster_sizes: matrix.sizes,
                    erasure_codes: matrix.codes,
                    stripes: matrix.stripes,
                    parities: matrix.parities,
                    srcs: matrix.srcs,
                },
                quiet: common.quiet,
                ..DriverConfig::default()
            };
            let mut driver = Driver::new(controller, storage, benches, sink, cfg, shutdown);
            driver.run_matrix().await
        }
        Command::Churn(churn) => {
            let mut trace = churn.replayer()?;
            let base = churn.bench_config(trace.initial_size());
            let cfg = DriverConfig {
                removal_mode: churn.mode,
                quiet: common.quiet,
                clear_cache: !churn.no_clear_cache,
                ..DriverConfig::default()
            };
            let mut driver = Driver::new(controller, storage, benches, sink, cfg, shutdown);
            driver.run_churn(trace.as_mut(), &base).await
        }
    }
}

/// Raise the shutdown flag on the first SIGINT or SIGTERM; exit at once on
/// the second.
async fn forward_signals(shutdown: watch::Sender<bool>) {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(listen_for_signals(tx));
    if relay_signals(rx, &shutdown).await {
        tracing::error!("second shutdown signal; exiting without tearing down");
        std::process::exit(130);
    }
}

/// True once a second signal arrives after the flag went up.
async fn relay_signals(mut signals: mpsc::Receiver<()>, shutdown: &watch::Sender<bool>) -> bool {
    if signals.recv().await.is_none() {
        return false;
    }
    tracing::warn!("shutdown requested; finishing the current step before tearing down (signal again to force quit)");
    shutdown.send_replace(true);
    signals.recv().await.is_some()
}

async fn listen_for_signals(tx: mpsc::Sender<()>) {
    #[cfg(unix)]
    let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(term) => Some(term),
        Err(err) => {
            tracing::warn!(error = %err, "cannot listen for SIGTERM");
            None
        }
    };
    loop {
        #[cfg(unix)]
        let received = match term.as_mut() {
            Some(term) => tokio::select! {
                res = tokio::signal::ctrl_c() => res.is_ok(),
                res = term.recv() => res.is_some(),
            },
            None => tokio::signal::ctrl_c().await.is_ok(),
        };
        #[cfg(not(unix))]
        let received = tokio::signal::ctrl_c().await.is_ok();
        if !received || tx.send(()).await.is_err() {
            return;
        }
    }
}
