//! Accumulates benchmark and churn-step records and writes them as JSON.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use churn_cluster::ScaleReport;
use serde::Serialize;

use crate::config::BenchConfig;

/// One benchmark run against one configuration.
#[derive(Clone, Debug, Serialize)]
pub struct BenchRecord {
    pub bench: String,
    pub config: BenchConfig,
    /// Absent when the benchmark failed.
    pub results: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One trace step of a churn run.
#[derive(Clone, Debug, Serialize)]
pub struct StepRecord {
    pub index: usize,
    /// Logical trace time, for recorded traces.
    pub at: Option<f64>,
    pub target_size: usize,
    /// Size the cluster actually reached.
    pub cluster_size: usize,
    pub joining: usize,
    pub leaving: usize,
    pub scale: Option<ScaleReport>,
    pub repaired: bool,
    pub repair_ms: u64,
    pub benches: Vec<BenchRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultRecord {
    Bench(BenchRecord),
    Step(StepRecord),
}

/// Collects records and persists them to `<dir>/result_<timestamp>.json`.
#[derive(Debug)]
pub struct ResultSink {
    path: PathBuf,
    records: Vec<ResultRecord>,
}

impl ResultSink {
    /// Sink writing under `dir`, named after the current time.
    pub fn new(dir: &Path) -> Self {
        let stamp = humantime::format_rfc3339_seconds(SystemTime::now());
        Self::with_path(dir.join(format!("result_{stamp}.json")))
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            path,
            records: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn records(&self) -> &[ResultRecord] {
        &self.records
    }

    pub fn push_bench(&mut self, record: BenchRecord) {
        self.records.push(ResultRecord::Bench(record));
    }

    pub fn push_step(&mut self, record: StepRecord) {
        self.records.push(ResultRecord::Step(record));
    }

    /// Write everything collected so far. Safe to call repeatedly; each call
    /// rewrites the file.
    pub fn persist(&self) -> anyhow::Result<&Path> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(&self.records).context("serialize results")?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("write {}", self.path.display()))?;
        tracing::info!(path = %self.path.display(), records = self.records.len(), "results saved");
        Ok(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_carries_a_timestamp() {
        let sink = ResultSink::new(Path::new("/tmp/results"));
        let name = sink.path().file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("result_"));
        assert!(name.ends_with("Z.json"));
        assert_eq!(sink.path().parent(), Some(Path::new("/tmp/results")));
    }

    #[test]
    fn persists_tagged_records() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::with_path(dir.path().join("nested/out.json"));
        sink.push_bench(BenchRecord {
            bench: "bench_dd".to_string(),
            config: BenchConfig::new("Null", 5),
            results: Some(serde_json::json!({"read": 1.0, "write": 2.0})),
            error: None,
        });
        sink.push_step(StepRecord {
            index: 0,
            at: None,
            target_size: 3,
            cluster_size: 3,
            joining: 3,
            leaving: 0,
            scale: None,
            repaired: false,
            repair_ms: 0,
            benches: Vec::new(),
            error: Some("boom".to_string()),
        });
        let path = sink.persist().unwrap().to_path_buf();

        let raw = std::fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        let records = value.as_array().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["kind"], "bench");
        assert_eq!(records[0]["config"]["storage"], "Jedis");
        assert!(records[0].get("error").is_none());
        assert_eq!(records[1]["kind"], "step");
        assert_eq!(records[1]["error"], "boom");
    }
}
