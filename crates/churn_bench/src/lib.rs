//! Benchmark driver for an erasure-coded storage layer running on a cluster
//! under churn.

pub mod bench;
pub mod config;
pub mod driver;
pub mod results;
pub mod storage;

pub use bench::{Benchmark, DdBench, DdResult};
pub use config::{BenchConfig, DriverConfig, MatrixConfig, StorageBackend};
pub use driver::Driver;
pub use results::{BenchRecord, ResultRecord, ResultSink, StepRecord};
pub use storage::{NoopStorage, StorageCommand, StorageUnderTest, SubprocessConfig, SubprocessStorage};
