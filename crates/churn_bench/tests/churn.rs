//! Churn replay: the driver scales the simulated cluster through a trace,
//! repairing and benchmarking after every step.

mod common;

use std::sync::atomic::Ordering;

use churn_bench::{BenchConfig, DriverConfig, StorageCommand};
use churn_cluster::{ControllerState, RemovalMode, SyntheticTrace, TraceReplayer};
use common::{assert_torn_down, saved, sim_driver, step_records, FakeBench, FakeStorage};
use tokio::sync::watch;

fn churn(mode: RemovalMode) -> DriverConfig {
    DriverConfig {
        removal_mode: mode,
        ..DriverConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn every_step_scales_repairs_and_benchmarks() {
    let dir = tempfile::tempdir().unwrap();
    let (_tx, rx) = watch::channel(false);
    let storage = FakeStorage::default();
    let log = storage.log.clone();
    let bench = FakeBench::default();
    let runs = bench.runs.clone();
    let (sim, mut driver) =
        sim_driver(dir.path(), storage, bench, churn(RemovalMode::Graceful), rx);
    let mut trace = SyntheticTrace::new(vec![3, 5, 2]);
    let base = BenchConfig::new("Null", trace.initial_size());

    driver.run_churn(&mut trace, &base).await.unwrap();

    let steps = step_records(driver.sink());
    let sizes: Vec<_> = steps.iter().map(|s| s.cluster_size).collect();
    assert_eq!(sizes, vec![3, 5, 2]);
    assert!(steps.iter().all(|s| s.error.is_none()));

    // The first step bootstraps; later ones scale and repair.
    assert!(steps[0].scale.is_none());
    assert!(!steps[0].repaired);
    assert_eq!(steps[0].joining, 3);
    let grow = steps[1].scale.as_ref().unwrap();
    assert_eq!((grow.from, grow.to), (3, 5));
    assert!(grow.slots_moved > 0);
    let shrink = steps[2].scale.as_ref().unwrap();
    assert_eq!((shrink.from, shrink.to, shrink.mode), (5, 2, RemovalMode::Graceful));
    assert_eq!(steps[2].leaving, 3);
    assert!(steps[1].repaired && steps[2].repaired);

    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(steps[2].benches[0].config.cluster_size, 2);

    {
        let log = log.lock().unwrap();
        assert_eq!(log.starts.len(), 1);
        assert_eq!(log.count(&StorageCommand::RepairAll), 2);
        assert_eq!(log.count(&StorageCommand::ClearCache), 3);
    }

    let file = saved(dir.path());
    assert_eq!(file.len(), 3);
    assert_eq!(file[1]["kind"], "step");
    assert_eq!(file[1]["scale"]["to"], 5);

    assert_eq!(driver.controller().state(), ControllerState::Stopped);
    assert_torn_down(&sim);
}

#[tokio::test(start_paused = true)]
async fn storage_that_exited_is_restarted_instead_of_repaired() {
    let dir = tempfile::tempdir().unwrap();
    let (_tx, rx) = watch::channel(false);
    // Dies right after the first step's cache clear.
    let storage = FakeStorage {
        exit_after_commands: Some(1),
        ..FakeStorage::default()
    };
    let log = storage.log.clone();
    let (_sim, mut driver) =
        sim_driver(dir.path(), storage, FakeBench::default(), churn(RemovalMode::Brutal), rx);
    let mut trace = SyntheticTrace::new(vec![4, 3, 3]);
    let base = BenchConfig::new("Null", trace.initial_size());

    driver.run_churn(&mut trace, &base).await.unwrap();

    let steps = step_records(driver.sink());
    assert_eq!(steps.len(), 3);
    assert!(steps.iter().all(|s| s.error.is_none()));
    assert!(!steps[1].repaired);
    assert!(steps[2].repaired);
    let log = log.lock().unwrap();
    assert_eq!(log.starts.len(), 2);
    assert_eq!(log.count(&StorageCommand::RepairAll), 1);
    assert_eq!(log.count(&StorageCommand::ClearCache), 3);
}

#[tokio::test(start_paused = true)]
async fn brutal_steps_survive_an_unresponsive_storage() {
    let dir = tempfile::tempdir().unwrap();
    let (_tx, rx) = watch::channel(false);
    let (_sim, mut driver) = sim_driver(
        dir.path(),
        FakeStorage::silent(),
        FakeBench::default(),
        churn(RemovalMode::Brutal),
        rx,
    );
    let mut trace = SyntheticTrace::new(vec![4, 3]);
    let base = BenchConfig::new("Null", trace.initial_size());

    driver.run_churn(&mut trace, &base).await.unwrap();

    let steps = step_records(driver.sink());
    assert_eq!(steps.len(), 2);
    let shrink = &steps[1];
    assert!(shrink.error.is_none());
    assert!(!shrink.repaired);
    assert_eq!(shrink.cluster_size, 3);
    assert_eq!(shrink.scale.as_ref().unwrap().removed.len(), 1);
    assert_eq!(shrink.benches.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn steps_below_two_members_leave_the_cluster_alone() {
    let dir = tempfile::tempdir().unwrap();
    let (_tx, rx) = watch::channel(false);
    let (_sim, mut driver) = sim_driver(
        dir.path(),
        FakeStorage::default(),
        FakeBench::default(),
        churn(RemovalMode::Graceful),
        rx,
    );
    let mut trace = SyntheticTrace::new(vec![3, 1, 4]);
    let base = BenchConfig::new("Null", trace.initial_size());

    driver.run_churn(&mut trace, &base).await.unwrap();

    let steps = step_records(driver.sink());
    assert!(steps[1].scale.as_ref().unwrap().skipped);
    assert_eq!(steps[1].cluster_size, 3);
    assert_eq!(steps[2].cluster_size, 4);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_honoured_between_steps() {
    let dir = tempfile::tempdir().unwrap();
    let (tx, rx) = watch::channel(false);
    let bench = FakeBench {
        shutdown: Some(tx),
        ..FakeBench::default()
    };
    let (sim, mut driver) = sim_driver(
        dir.path(),
        FakeStorage::default(),
        bench,
        churn(RemovalMode::Graceful),
        rx,
    );
    let mut trace = SyntheticTrace::new(vec![3, 5, 2]);
    let base = BenchConfig::new("Null", trace.initial_size());

    driver.run_churn(&mut trace, &base).await.unwrap();

    // The flag went up during the first step's benchmark; that step is
    // recorded in full and nothing after it starts.
    let steps = step_records(driver.sink());
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].benches.len(), 1);
    assert_eq!(saved(dir.path()).len(), 1);
    assert_eq!(driver.controller().state(), ControllerState::Stopped);
    assert_torn_down(&sim);
}
