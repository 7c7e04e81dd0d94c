//! Workload benchmarks run against the storage-under-test's mount point.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::process::Command;

use crate::config::BenchConfig;

/// A benchmark producing a JSON result for one configuration.
#[async_trait]
pub trait Benchmark: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cfg: &BenchConfig) -> anyhow::Result<serde_json::Value>;
}

/// Best write and read throughput in kB/s.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct DdResult {
    pub read: f64,
    pub write: f64,
}

/// Sequential `dd` write then read of a fresh file.
#[derive(Clone, Debug)]
pub struct DdBench {
    pub mount: PathBuf,
    pub dd_bin: PathBuf,
    pub runs: usize,
    pub block_size: String,
    pub count: usize,
}

impl DdBench {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
            dd_bin: PathBuf::from("dd"),
            runs: 3,
            block_size: "128kB".to_string(),
            count: 100,
        }
    }

    /// A file name of 12 random lowercase letters under the mount point.
    fn fresh_file(&self) -> PathBuf {
        let mut rng = SmallRng::from_entropy();
        let name: String = (0..12)
            .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
            .collect();
        self.mount.join(name)
    }

    async fn dd(&self, input: &str, output: &str) -> anyhow::Result<f64> {
        let out = Command::new(&self.dd_bin)
            .arg(format!("if={input}"))
            .arg(format!("of={output}"))
            .arg(format!("bs={}", self.block_size))
            .arg(format!("count={}", self.count))
            .output()
            .await
            .with_context(|| format!("spawn {}", self.dd_bin.display()))?;
        anyhow::ensure!(
            out.status.success(),
            "dd if={input} of={output} exited with {}",
            out.status
        );
        // dd reports on stderr.
        let report = String::from_utf8_lossy(&out.stderr);
        parse_throughput(&report)
    }
}

#[async_trait]
impl Benchmark for DdBench {
    fn name(&self) -> &str {
        "bench_dd"
    }

    async fn run(&self, _cfg: &BenchConfig) -> anyhow::Result<serde_json::Value> {
        let mut best = DdResult {
            read: 0.0,
            write: 0.0,
        };
        for run in 0..self.runs {
            let file = self.fresh_file();
            let path = file.display().to_string();
            let write = self.dd("/dev/zero", &path).await?;
            let read = self.dd(&path, "/dev/null").await?;
            tracing::debug!(run, write, read, "dd run");
            best.write = best.write.max(write);
            best.read = best.read.max(read);
        }
        Ok(serde_json::to_value(best)?)
    }
}

/// Extract the trailing `<number> <unit>/s` figure of a dd report, in kB/s.
pub fn parse_throughput(report: &str) -> anyhow::Result<f64> {
    let line = report
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .context("empty dd report")?;
    let mut tokens = line.rsplit(' ');
    let unit = tokens.next().unwrap_or_default();
    let value = tokens.next().unwrap_or_default();
    let value: f64 = value
        .parse()
        .with_context(|| format!("no throughput figure in {line:?}"))?;
    to_kilobytes(value, unit).with_context(|| format!("no throughput unit in {line:?}"))
}

fn to_kilobytes(value: f64, unit: &str) -> anyhow::Result<f64> {
    let factor = match unit {
        "GB/s" => 1_000_000.0,
        "MB/s" => 1_000.0,
        "kB/s" => 1.0,
        "B/s" => 0.001,
        other => anyhow::bail!("unknown unit {other:?}"),
    };
    Ok(value * factor)
}
