// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker registry behaviour against scripted runners.

mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use benchmesh_core::error::RegistryError;
use benchmesh_core::registry::{Backpressure, WorkerRegistry, WorkerRequirements};
use benchmesh_core::worker::WorkerStatus;
use benchmesh_core::{Capability, JobId};
use common::{eventually, registry_options, template, Behavior, ScriptedLauncher};

fn embedding() -> WorkerRequirements {
    WorkerRequirements::new(Capability::Embedding)
}

fn registry(
    launcher: ScriptedLauncher,
    pool_size: usize,
) -> (Arc<WorkerRegistry>, Arc<ScriptedLauncher>) {
    let launcher = Arc::new(launcher);
    let registry = WorkerRegistry::new(
        vec![template("pool", vec![Capability::Embedding])],
        launcher.clone(),
        registry_options(pool_size, Backpressure::Block),
    );
    (registry, launcher)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_worker_is_shared() {
    let (registry, launcher) = registry(ScriptedLauncher::new(Behavior::Hang), 3);
    let held = Arc::new(Mutex::new(HashSet::new()));

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let registry = registry.clone();
        let held = held.clone();
        tasks.push(tokio::spawn(async move {
            let lease = registry.acquire(embedding(), JobId::new()).await.unwrap();
            let id = lease.worker_id().clone();
            assert!(held.lock().unwrap().insert(id.clone()), "{} handed out twice", id);
            tokio::time::sleep(Duration::from_millis(5)).await;
            held.lock().unwrap().remove(&id);
            lease.release();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(launcher.launches() <= 3);
    let stats = registry.stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.waiters, 0);
    assert_eq!(stats.idle, stats.total);
}

#[tokio::test]
async fn test_release_is_idempotent() {
    let (registry, launcher) = registry(ScriptedLauncher::new(Behavior::Hang), 2);

    let lease = registry.acquire(embedding(), JobId::new()).await.unwrap();
    let id = lease.worker_id().clone();
    assert_eq!(lease.handle().status(), WorkerStatus::Busy);

    lease.release();
    registry.release(&id);
    registry.release(&id);

    let stats = registry.stats();
    assert_eq!((stats.total, stats.idle, stats.busy), (1, 1, 0));

    // The idle worker is reused rather than a new one launched
    let again = registry.acquire(embedding(), JobId::new()).await.unwrap();
    assert_eq!(again.worker_id(), &id);
    assert_eq!(launcher.launches(), 1);
}

#[tokio::test]
async fn test_waiters_served_in_order() {
    let (registry, _) = registry(ScriptedLauncher::new(Behavior::Hang), 1);

    let first = registry.acquire(embedding(), JobId::new()).await.unwrap();
    let worker = first.worker_id().clone();

    let second = registry
        .reserve(embedding(), JobId::new(), Backpressure::Block)
        .unwrap();
    let third = registry
        .reserve(embedding(), JobId::new(), Backpressure::Block)
        .unwrap();
    assert_eq!(registry.stats().waiters, 2);

    let third = tokio::spawn(third.wait());
    first.release();

    let second = second.wait().await.unwrap();
    assert_eq!(second.worker_id(), &worker);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!third.is_finished());

    second.release();
    let third = third.await.unwrap().unwrap();
    assert_eq!(third.worker_id(), &worker);
}

#[tokio::test]
async fn test_fail_fast_when_full() {
    let (registry, _) = registry(ScriptedLauncher::new(Behavior::Hang), 1);

    let _lease = registry.acquire(embedding(), JobId::new()).await.unwrap();
    let result = registry.reserve(embedding(), JobId::new(), Backpressure::FailFast);
    assert!(matches!(
        result,
        Err(RegistryError::NoCapacity { pool_size: 1, .. })
    ));
    assert_eq!(registry.stats().waiters, 0);
}

#[tokio::test]
async fn test_eviction_frees_capacity() {
    let (registry, launcher) = registry(ScriptedLauncher::new(Behavior::Hang), 1);

    let lease = registry.acquire(embedding(), JobId::new()).await.unwrap();
    let evicted = lease.worker_id().clone();
    let handle = lease.handle().clone();

    let waiting = registry
        .reserve(embedding(), JobId::new(), Backpressure::Block)
        .unwrap();
    lease.evict("test");

    let replacement = waiting.wait().await.unwrap();
    assert_ne!(replacement.worker_id(), &evicted);
    assert_eq!(launcher.launches(), 2);

    // Evicting again is a no-op
    assert!(!registry.evict(&evicted, "again"));
    assert!(eventually(Duration::from_secs(2), || handle.status() == WorkerStatus::Terminated).await);
}

#[tokio::test]
async fn test_idle_worker_of_other_capability_makes_room() {
    let launcher = Arc::new(ScriptedLauncher::new(Behavior::Hang));
    let registry = WorkerRegistry::new(
        vec![
            template("embed", vec![Capability::Embedding]),
            template("gen", vec![Capability::Generation]),
        ],
        launcher.clone(),
        registry_options(1, Backpressure::Block),
    );

    registry
        .acquire(embedding(), JobId::new())
        .await
        .unwrap()
        .release();
    assert_eq!(registry.stats().idle, 1);

    let lease = registry
        .acquire(WorkerRequirements::new(Capability::Generation), JobId::new())
        .await
        .unwrap();
    assert_eq!(lease.handle().template().as_str(), "gen");
    assert_eq!(launcher.launches(), 2);
    assert_eq!(registry.stats().total, 1);
}

#[tokio::test]
async fn test_health_monitor_evicts_silent_worker() {
    let (registry, _) = registry(ScriptedLauncher::new(Behavior::Silent), 1);
    let monitor = registry.spawn_health_monitor();

    registry
        .acquire(embedding(), JobId::new())
        .await
        .unwrap()
        .release();
    assert_eq!(registry.stats().total, 1);

    assert!(eventually(Duration::from_secs(2), || registry.stats().total == 0).await);

    registry.shutdown().await;
    monitor.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_terminates_workers() {
    let (registry, _) = registry(ScriptedLauncher::new(Behavior::Hang), 2);

    let lease = registry.acquire(embedding(), JobId::new()).await.unwrap();
    let handle = lease.handle().clone();
    lease.release();

    registry.shutdown().await;

    assert_eq!(registry.stats().total, 0);
    assert_eq!(handle.status(), WorkerStatus::Terminated);
    assert!(matches!(
        registry.reserve(embedding(), JobId::new(), Backpressure::Block),
        Err(RegistryError::ShutDown)
    ));
    assert!(registry.workers().is_empty());
}
