// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Scripted fake runners for integration tests.
//!
//! Each launch pops the next [`Behavior`] (or falls back to the default) and
//! serves it over an in-memory duplex pipe using the runner-side session.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use benchmesh_core::config::{EndpointConfig, SpawnConfig, WorkerTemplate};
use benchmesh_core::error::SpawnError;
use benchmesh_core::registry::{Backpressure, RegistryOptions, WorkerRegistry};
use benchmesh_core::retry::RetryPolicy;
use benchmesh_core::scheduler::{Scheduler, SchedulerOptions};
use benchmesh_core::store::MemoryStore;
use benchmesh_core::transport::{ControlMessage, ProgressEvent, RunReport, RunnerSession};
use benchmesh_core::worker::{WorkerEndpoint, WorkerHandle, WorkerLauncher};
use benchmesh_core::{BenchmarkJob, BenchmarkSuite, Capability, JobId, ModelTarget, WorkerId};
use serde_json::json;
use tokio::io::DuplexStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

/// What a fake runner does with each job it is given.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Report `steps` progress events, then succeed.
    Succeed { steps: u64, step_delay: Duration },
    /// Start, then report a benchmark failure.
    FailBenchmark,
    /// Refuse every job.
    Reject,
    /// Start and never finish; acknowledges stop.
    Hang,
    /// Start, then stop answering health checks.
    Mute,
    /// Start, then close the connection.
    DropAfterStart,
    /// Start, then send a progress sequence that goes backwards.
    CorruptAfterStart,
    /// Start and never finish; never acknowledges stop.
    IgnoreStop,
    /// Never answer health checks, even when idle.
    Silent,
    /// Accept the job but never start it; acknowledges stop.
    Stall,
}

impl Behavior {
    pub fn succeed() -> Self {
        Self::Succeed {
            steps: 3,
            step_delay: Duration::from_millis(10),
        }
    }
}

/// Counters shared by every runner of one launcher.
#[derive(Debug, Default)]
pub struct RunnerStats {
    pub launches: AtomicUsize,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    /// A runner received `start` while already running a job.
    pub overlapping_starts: AtomicUsize,
}

/// Launcher that serves each worker with an in-process scripted runner.
///
/// Runners advertise exactly their template's capabilities.
pub struct ScriptedLauncher {
    script: Mutex<VecDeque<Behavior>>,
    default: Behavior,
    pub stats: Arc<RunnerStats>,
}

impl ScriptedLauncher {
    pub fn new(default: Behavior) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default,
            stats: Arc::new(RunnerStats::default()),
        }
    }

    /// Behaviors for the first launches, in order.
    pub fn with_script(self, script: impl IntoIterator<Item = Behavior>) -> Self {
        self.script.lock().unwrap().extend(script);
        self
    }

    pub fn launches(&self) -> usize {
        self.stats.launches.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl WorkerLauncher for ScriptedLauncher {
    async fn launch(
        &self,
        template: &WorkerTemplate,
        worker_id: WorkerId,
    ) -> Result<WorkerHandle, SpawnError> {
        self.stats.launches.fetch_add(1, Ordering::SeqCst);

        let (core, runner) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve(
            runner,
            self.next_behavior(),
            template.capabilities.clone(),
            Arc::clone(&self.stats),
        ));

        WorkerHandle::from_io(
            template,
            worker_id.clone(),
            WorkerEndpoint::Local {
                label: worker_id.to_string(),
            },
            core,
            Duration::from_secs(1),
        )
        .await
    }
}

type Writer = Arc<AsyncMutex<benchmesh_core::transport::RunnerWriter<DuplexStream>>>;

/// Serve control messages until goodbye or disconnect.
async fn serve(
    io: DuplexStream,
    behavior: Behavior,
    capabilities: Vec<Capability>,
    stats: Arc<RunnerStats>,
) {
    let Ok(session) = RunnerSession::accept(io, "scripted", capabilities).await else {
        return;
    };
    let (mut reader, writer) = session.into_split();
    let writer: Writer = Arc::new(AsyncMutex::new(writer));
    let muted = Arc::new(AtomicBool::new(matches!(behavior, Behavior::Silent)));
    let mut running: Option<(JobId, JoinHandle<()>)> = None;

    while let Ok(message) = reader.recv().await {
        match message {
            ControlMessage::Start { job } => {
                stats.starts.fetch_add(1, Ordering::SeqCst);
                if let Some((_, task)) = &running {
                    if !task.is_finished() {
                        stats.overlapping_starts.fetch_add(1, Ordering::SeqCst);
                    }
                }

                let job_id = job.id;
                let task = tokio::spawn(run(
                    job_id,
                    behavior.clone(),
                    Arc::clone(&writer),
                    Arc::clone(&muted),
                ));
                running = Some((job_id, task));

                if matches!(behavior, Behavior::DropAfterStart) {
                    // Let `started` go out, then hang up.
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    break;
                }
            }
            ControlMessage::Stop { job_id } => {
                stats.stops.fetch_add(1, Ordering::SeqCst);
                if let Some((_, task)) = running.take() {
                    task.abort();
                }
                if !matches!(behavior, Behavior::IgnoreStop) {
                    let _ = writer.lock().await.stopped(job_id).await;
                }
            }
            ControlMessage::HealthCheck { nonce } => {
                if !muted.load(Ordering::SeqCst) {
                    let _ = writer.lock().await.health_ok(nonce).await;
                }
            }
            ControlMessage::Goodbye => break,
        }
    }

    if let Some((_, task)) = running {
        task.abort();
    }
}

async fn run(job_id: JobId, behavior: Behavior, writer: Writer, muted: Arc<AtomicBool>) {
    let send_started = !matches!(behavior, Behavior::Reject | Behavior::Stall);
    if send_started && writer.lock().await.started(job_id).await.is_err() {
        return;
    }

    match behavior {
        Behavior::Succeed { steps, step_delay } => {
            for seq in 1..=steps {
                tokio::time::sleep(step_delay).await;
                let event = ProgressEvent::new(seq, seq, Some(steps));
                if writer.lock().await.progress(job_id, event).await.is_err() {
                    return;
                }
            }
            let report = RunReport::success(json!({ "score": 0.87, "tasks": steps }));
            let _ = writer.lock().await.finished(job_id, report).await;
        }
        Behavior::FailBenchmark => {
            let _ = writer
                .lock()
                .await
                .finished(job_id, RunReport::failure("dataset download failed"))
                .await;
        }
        Behavior::Reject => {
            let _ = writer
                .lock()
                .await
                .rejected(job_id, "model not served here")
                .await;
        }
        Behavior::CorruptAfterStart => {
            let mut writer = writer.lock().await;
            let _ = writer.progress(job_id, ProgressEvent::new(2, 2, None)).await;
            let _ = writer.progress(job_id, ProgressEvent::new(1, 1, None)).await;
        }
        Behavior::Mute => muted.store(true, Ordering::SeqCst),
        Behavior::Hang
        | Behavior::IgnoreStop
        | Behavior::DropAfterStart
        | Behavior::Silent
        | Behavior::Stall => {
            std::future::pending::<()>().await;
        }
    }
}

/// Attached-style template for in-process runners.
pub fn template(name: &str, capabilities: Vec<Capability>) -> WorkerTemplate {
    WorkerTemplate {
        name: WorkerId::new(name).unwrap(),
        capabilities,
        endpoint: EndpointConfig::Spawn(SpawnConfig {
            program: "scripted".to_string(),
            args: Vec::new(),
            environment: Default::default(),
        }),
    }
}

pub fn registry_options(pool_size: usize, backpressure: Backpressure) -> RegistryOptions {
    RegistryOptions {
        pool_size,
        backpressure,
        health_check_interval: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(40),
        terminate_grace: Duration::from_millis(100),
    }
}

pub fn scheduler_options() -> SchedulerOptions {
    SchedulerOptions {
        retry: RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(40)),
        health_check_interval: Duration::from_millis(50),
        ping_timeout: Duration::from_millis(40),
        cancel_grace: Duration::from_millis(200),
        job_timeout: None,
        retain_finished: 64,
    }
}

pub struct Harness {
    pub scheduler: Scheduler,
    pub registry: Arc<WorkerRegistry>,
    pub launcher: Arc<ScriptedLauncher>,
    pub store: Arc<MemoryStore>,
}

pub fn harness(launcher: ScriptedLauncher, pool_size: usize, backpressure: Backpressure) -> Harness {
    harness_with(launcher, pool_size, backpressure, scheduler_options())
}

pub fn harness_with(
    launcher: ScriptedLauncher,
    pool_size: usize,
    backpressure: Backpressure,
    options: SchedulerOptions,
) -> Harness {
    let launcher = Arc::new(launcher);
    let registry = WorkerRegistry::new(
        vec![template("scripted", Capability::ALL.to_vec())],
        launcher.clone(),
        registry_options(pool_size, backpressure),
    );
    let store = Arc::new(MemoryStore::new());
    let scheduler = Scheduler::new(registry.clone(), store.clone(), options);

    Harness {
        scheduler,
        registry,
        launcher,
        store,
    }
}

pub fn mteb_job() -> BenchmarkJob {
    BenchmarkJob::new(
        BenchmarkSuite::Mteb,
        ModelTarget::new("gpt-3.5-turbo", None).unwrap(),
    )
}

/// Poll `check` every few milliseconds until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
