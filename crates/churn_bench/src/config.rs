//! Benchmark configuration: the matrix of runs and the arguments each run
//! hands to the storage-under-test.

use churn_cluster::{NodeAddr, RemovalMode};
use serde::{Deserialize, Serialize};

/// Storage backend the storage-under-test uses for one run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageBackend {
    /// Redis-backed (standalone or cluster).
    Jedis,
    /// In-process memory, no cluster at all.
    Memory,
}

impl StorageBackend {
    pub fn for_cluster_size(size: usize) -> Self {
        if size > 0 {
            StorageBackend::Jedis
        } else {
            StorageBackend::Memory
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Jedis => "Jedis",
            StorageBackend::Memory => "Memory",
        }
    }
}

/// One point of the benchmark matrix.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchConfig {
    pub erasure_code: String,
    pub cluster_size: usize,
    pub storage: StorageBackend,
    pub stripe: Option<usize>,
    pub parity: Option<usize>,
    pub src: Option<usize>,
}

impl BenchConfig {
    pub fn new(erasure_code: impl Into<String>, cluster_size: usize) -> Self {
        Self {
            erasure_code: erasure_code.into(),
            cluster_size,
            storage: StorageBackend::for_cluster_size(cluster_size),
            stripe: None,
            parity: None,
            src: None,
        }
    }

    /// Same coding parameters against a cluster of another size.
    pub fn with_cluster_size(&self, cluster_size: usize) -> Self {
        Self {
            cluster_size,
            storage: StorageBackend::for_cluster_size(cluster_size),
            ..self.clone()
        }
    }

    /// Command-line arguments for the storage-under-test.
    pub fn storage_args(&self, quiet: bool) -> Vec<String> {
        let mut args = vec![
            "--erasure-code".to_string(),
            self.erasure_code.clone(),
            "--storage".to_string(),
            self.storage.as_str().to_string(),
        ];
        if quiet {
            args.push("-q".to_string());
        }
        for (flag, value) in [
            ("--stripe", self.stripe),
            ("--parity", self.parity),
            ("--src", self.src),
        ] {
            if let Some(value) = value {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        if self.cluster_size > 1 {
            args.push("--redis-cluster".to_string());
        }
        args
    }

    /// Environment for the storage-under-test.
    pub fn storage_env(&self, primary: Option<&NodeAddr>) -> Vec<(String, String)> {
        primary
            .map(|addr| vec![("REDIS_ADDRESS".to_string(), addr.to_string())])
            .unwrap_or_default()
    }
}

/// Cartesian product of run parameters.
#[derive(Clone, Debug)]
pub struct MatrixConfig {
    /// Cluster sizes. 0 runs against memory, 1 against a standalone node.
    pub cluster_sizes: Vec<usize>,
    pub erasure_codes: Vec<String>,
    pub stripes: Vec<usize>,
    pub parities: Vec<usize>,
    pub srcs: Vec<usize>,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            cluster_sizes: vec![5, 1, 0],
            erasure_codes: vec!["Null".to_string()],
            stripes: vec![10],
            parities: vec![2],
            srcs: vec![5],
        }
    }
}

impl MatrixConfig {
    /// All configurations, cluster size outermost.
    pub fn configs(&self) -> Vec<BenchConfig> {
        let mut out = Vec::new();
        for &size in &self.cluster_sizes {
            for code in &self.erasure_codes {
                for &stripe in &self.stripes {
                    for &parity in &self.parities {
                        for &src in &self.srcs {
                            out.push(BenchConfig {
                                stripe: Some(stripe),
                                parity: Some(parity),
                                src: Some(src),
                                ..BenchConfig::new(code.clone(), size)
                            });
                        }
                    }
                }
            }
        }
        out
    }
}

/// Driver-level knobs that are not part of a single run's identity.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub matrix: MatrixConfig,
    /// Removal mode for shrinking steps in churn mode.
    pub removal_mode: RemovalMode,
    /// Forwarded to the storage-under-test as `-q`.
    pub quiet: bool,
    /// Ask the storage-under-test to drop its cache before each benchmark
    /// in churn mode.
    pub clear_cache: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            matrix: MatrixConfig::default(),
            removal_mode: RemovalMode::Graceful,
            quiet: true,
            clear_cache: true,
        }
    }
}
