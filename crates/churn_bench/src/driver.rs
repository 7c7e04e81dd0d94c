//! The benchmark loops: a configuration matrix, and churn replay over a
//! membership trace.
//!
//! Both loops catch per-run failures, record them and move on, so one bad
//! configuration or step does not lose the rest of the experiment. Results
//! are persisted before the cluster is torn down, on normal completion and
//! after a shutdown request alike. Shutdown is only observed between runs or
//! steps; a scale operation in progress always runs to `Stable` or `Failed`.

use std::time::Instant;

use anyhow::Context;
use churn_cluster::{
    AdminTransport, ClusterController, ControllerState, Provisioner, TraceReplayer, TraceStep,
};
use tokio::sync::watch;

use crate::bench::Benchmark;
use crate::config::{BenchConfig, DriverConfig};
use crate::results::{BenchRecord, ResultSink, StepRecord};
use crate::storage::{StorageCommand, StorageUnderTest};

pub struct Driver<P, A, S> {
    controller: ClusterController<P, A>,
    storage: S,
    benches: Vec<Box<dyn Benchmark>>,
    sink: ResultSink,
    cfg: DriverConfig,
    shutdown: watch::Receiver<bool>,
}

impl<P, A, S> Driver<P, A, S>
where
    P: Provisioner,
    A: AdminTransport,
    S: StorageUnderTest,
{
    pub fn new(
        controller: ClusterController<P, A>,
        storage: S,
        benches: Vec<Box<dyn Benchmark>>,
        sink: ResultSink,
        cfg: DriverConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            controller,
            storage,
            benches,
            sink,
            cfg,
            shutdown,
        }
    }

    pub fn controller(&self) -> &ClusterController<P, A> {
        &self.controller
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn sink(&self) -> &ResultSink {
        &self.sink
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Every matrix configuration x every benchmark, each on a fresh cluster.
    pub async fn run_matrix(&mut self) -> anyhow::Result<()> {
        let outcome = self.matrix_loop().await;
        let finished = self.finish().await;
        outcome.and(finished)
    }

    /// Start at the trace's first size, then scale through every step,
    /// repairing and benchmarking after each one.
    pub async fn run_churn<T>(&mut self, trace: &mut T, base: &BenchConfig) -> anyhow::Result<()>
    where
        T: TraceReplayer + ?Sized,
    {
        let outcome = self.churn_loop(trace, base).await;
        let finished = self.finish().await;
        outcome.and(finished)
    }

    async fn matrix_loop(&mut self) -> anyhow::Result<()> {
        let configs = self.cfg.matrix.configs();
        'configs: for config in configs {
            for idx in 0..self.benches.len() {
                if self.shutdown_requested() {
                    tracing::warn!("shutdown requested, skipping remaining configurations");
                    break 'configs;
                }
                let bench = self.benches[idx].name().to_string();
                tracing::info!(
                    %bench,
                    code = %config.erasure_code,
                    size = config.cluster_size,
                    storage = config.storage.as_str(),
                    "running benchmark"
                );
                let record = match self.run_once(idx, &config).await {
                    Ok(results) => BenchRecord {
                        bench,
                        config: config.clone(),
                        results: Some(results),
                        error: None,
                    },
                    Err(err) => {
                        tracing::error!(%bench, error = ?err, "benchmark crashed, continuing with the rest");
                        BenchRecord {
                            bench,
                            config: config.clone(),
                            results: None,
                            error: Some(format!("{err:#}")),
                        }
                    }
                };
                self.sink.push_bench(record);
                self.teardown().await;
            }
        }
        Ok(())
    }

    async fn run_once(
        &mut self,
        idx: usize,
        config: &BenchConfig,
    ) -> anyhow::Result<serde_json::Value> {
        self.controller
            .start(config.cluster_size)
            .await
            .with_context(|| format!("start cluster of {}", config.cluster_size))?;
        self.restart_storage(config).await?;
        self.benches[idx].run(config).await
    }

    async fn churn_loop<T>(&mut self, trace: &mut T, base: &BenchConfig) -> anyhow::Result<()>
    where
        T: TraceReplayer + ?Sized,
    {
        tracing::info!(initial = trace.initial_size(), "starting churn run");
        loop {
            if self.shutdown_requested() {
                tracing::warn!("shutdown requested, leaving the trace");
                break;
            }
            let next = tokio::select! {
                step = trace.next_step() => step.context("read next trace step")?,
                _ = wait_for_shutdown(self.shutdown.clone()) => continue,
            };
            let Some(step) = next else {
                tracing::info!("trace exhausted");
                break;
            };
            let record = self.apply_step(&step, base).await;
            self.sink.push_step(record);
            if let Err(err) = self.sink.persist() {
                tracing::warn!(error = ?err, "could not save intermediate results");
            }
        }
        Ok(())
    }

    async fn apply_step(&mut self, step: &TraceStep, base: &BenchConfig) -> StepRecord {
        tracing::info!(
            index = step.index,
            size = step.size,
            joining = step.joining.len(),
            leaving = step.leaving.len(),
            "trace step"
        );
        let mut record = StepRecord {
            index: step.index,
            at: step.at,
            target_size: step.size,
            cluster_size: 0,
            joining: step.joining.len(),
            leaving: step.leaving.len(),
            scale: None,
            repaired: false,
            repair_ms: 0,
            benches: Vec::new(),
            error: None,
        };

        let primary_before = self.controller.primary_address().cloned();
        let scaled = if self.controller.state() == ControllerState::Stopped {
            self.controller.start(step.size).await.map(|()| None)
        } else {
            self.controller
                .scale(step.size, self.cfg.removal_mode)
                .await
                .map(Some)
        };
        record.cluster_size = self.controller.cluster().size;
        match scaled {
            Ok(report) => record.scale = report,
            Err(err) => {
                tracing::error!(index = step.index, error = %err, "scale step failed, continuing with the next one");
                record.error = Some(err.to_string());
                return record;
            }
        }

        let config = base.with_cluster_size(record.cluster_size);
        let primary_moved = self.controller.primary_address() != primary_before.as_ref();
        if primary_moved || !self.storage.is_running() {
            if let Err(err) = self.restart_storage(&config).await {
                tracing::error!(error = ?err, "storage restart failed");
                record.error = Some(format!("{err:#}"));
                return record;
            }
        } else {
            let started = Instant::now();
            match self.storage.run_command(&StorageCommand::RepairAll).await {
                Ok(()) => record.repaired = true,
                Err(err) => tracing::warn!(error = ?err, "repair did not complete"),
            }
            record.repair_ms = started.elapsed().as_millis() as u64;
        }

        for bench in &self.benches {
            if self.cfg.clear_cache {
                if let Err(err) = self.storage.run_command(&StorageCommand::ClearCache).await {
                    tracing::warn!(error = ?err, "cache clear did not complete");
                }
            }
            let results = bench.run(&config).await;
            if let Err(err) = &results {
                tracing::error!(bench = bench.name(), error = ?err, "benchmark crashed");
            }
            record.benches.push(BenchRecord {
                bench: bench.name().to_string(),
                config: config.clone(),
                error: results.as_ref().err().map(|err| format!("{err:#}")),
                results: results.ok(),
            });
        }
        record
    }

    async fn restart_storage(&mut self, config: &BenchConfig) -> anyhow::Result<()> {
        let args = config.storage_args(self.cfg.quiet);
        let env = config.storage_env(self.controller.primary_address());
        self.storage
            .start(args, env)
            .await
            .context("start storage-under-test")
    }

    /// Stop the storage-under-test and the cluster. Failures are logged.
    async fn teardown(&mut self) {
        if let Err(err) = self.storage.stop().await {
            tracing::warn!(error = ?err, "storage stop failed");
        }
        if let Err(err) = self.controller.stop().await {
            tracing::warn!(error = %err, "cluster stop failed");
        }
    }

    async fn finish(&mut self) -> anyhow::Result<()> {
        let saved = self.sink.persist().map(|_| ());
        self.teardown().await;
        saved
    }
}

/// Resolves once the flag is raised. A dropped sender never resolves.
async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
