// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Job scheduler.
//!
//! Accepts run requests, drives each job through its state machine on its own
//! task, and persists exactly one [`RunResult`] per admitted job.
//!
//! Job records live in a DashMap keyed by job id. Each record is mutated only
//! by its own task and by [`Scheduler::cancel`]. Once a job settles its record
//! stays queryable until `retain_finished` newer jobs have settled after it;
//! the [`ResultStore`] holds the durable copy.

mod attempt;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{RegistryError, SchedulerError};
use crate::job::BenchmarkJob;
use crate::registry::{WorkerRegistry, WorkerRequirements};
use crate::result::RunResult;
use crate::retry::RetryPolicy;
use crate::state::{JobState, JobStateMachine, TransitionRecord};
use crate::store::ResultStore;
use crate::transport::ProgressEvent;
use crate::types::JobId;

/// Progress events buffered per subscriber before it starts lagging.
const PROGRESS_CAPACITY: usize = 256;

/// Scheduler tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    pub retry: RetryPolicy,
    /// Ping period of the per-attempt watchdog.
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
    /// How long a stopped runner has to acknowledge before it is evicted.
    pub cancel_grace: Duration,
    /// Overrides the suite's default timeout when set.
    pub job_timeout: Option<Duration>,
    /// Finished jobs kept in memory for state and history queries.
    pub retain_finished: usize,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            health_check_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            cancel_grace: Duration::from_secs(10),
            job_timeout: None,
            retain_finished: 256,
        }
    }
}

/// Everything the scheduler knows about one job.
struct JobEntry {
    job: Arc<BenchmarkJob>,
    submitted_at: DateTime<Utc>,
    machine: Mutex<JobStateMachine>,
    cancel: CancellationToken,
    progress: broadcast::Sender<ProgressEvent>,
    outcome: watch::Sender<Option<RunResult>>,
}

impl JobEntry {
    fn new(job: BenchmarkJob, cancel: CancellationToken) -> Self {
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        let (outcome, _) = watch::channel(None);
        Self {
            machine: Mutex::new(JobStateMachine::new(job.id)),
            job: Arc::new(job),
            submitted_at: Utc::now(),
            cancel,
            progress,
            outcome,
        }
    }

    fn machine(&self) -> MutexGuard<'_, JobStateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> JobState {
        self.machine().state()
    }

    fn attempt(&self) -> u32 {
        self.machine().attempt()
    }

    /// Apply a transition the job task has already decided on.
    fn transition(&self, target: JobState) {
        if let Err(e) = self.machine().transition_to(target) {
            tracing::error!(job_id = %self.job.id, error = %e, "Rejected job transition");
        }
    }

    fn retry(&self) -> u32 {
        let mut machine = self.machine();
        match machine.retry() {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::error!(job_id = %self.job.id, error = %e, "Rejected job retry");
                machine.attempt()
            }
        }
    }

    fn ticket(&self) -> JobTicket {
        JobTicket {
            job_id: self.job.id,
            outcome: self.outcome.subscribe(),
        }
    }
}

/// Handle to an admitted job.
#[derive(Debug, Clone)]
pub struct JobTicket {
    job_id: JobId,
    outcome: watch::Receiver<Option<RunResult>>,
}

impl JobTicket {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Wait for the job's terminal result.
    pub async fn wait(mut self) -> Result<RunResult, SchedulerError> {
        let job_id = self.job_id;
        let result = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| SchedulerError::ResultDropped(job_id))?;
        result.clone().ok_or(SchedulerError::ResultDropped(job_id))
    }
}

pub(crate) struct Inner {
    registry: Arc<WorkerRegistry>,
    store: Arc<dyn ResultStore>,
    options: SchedulerOptions,
    jobs: DashMap<JobId, Arc<JobEntry>>,
    /// Settled jobs still in `jobs`, oldest first.
    finished: Mutex<VecDeque<JobId>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Inner {
    /// Record that a job settled, dropping the oldest settled jobs past the retention.
    fn retire(&self, job_id: JobId) {
        let expired: Vec<JobId> = {
            let mut finished = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
            finished.push_back(job_id);
            let excess = finished.len().saturating_sub(self.options.retain_finished);
            finished.drain(..excess).collect()
        };

        for job_id in expired {
            self.jobs.remove(&job_id);
            tracing::trace!(job_id = %job_id, "Finished job dropped from scheduler");
        }
    }
}

/// Entry point for running benchmark jobs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        registry: Arc<WorkerRegistry>,
        store: Arc<dyn ResultStore>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry,
                store,
                options,
                jobs: DashMap::new(),
                finished: Mutex::new(VecDeque::new()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.inner.registry
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.inner.options
    }

    /// Admit a job and start driving it.
    ///
    /// The job's place in the worker queue is fixed before this returns. With
    /// fail-fast backpressure and a full pool the job is handed back in
    /// [`SchedulerError::NoCapacity`], still Pending.
    pub fn submit(&self, job: BenchmarkJob) -> Result<JobTicket, SchedulerError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SchedulerError::ShuttingDown);
        }

        job.validate()?;

        let capability = job.suite.capability();
        if !self.inner.registry.supports(capability) {
            return Err(SchedulerError::Unsupported {
                suite: job.suite,
                capability,
            });
        }

        let vacant = match self.inner.jobs.entry(job.id) {
            Entry::Occupied(_) => return Err(SchedulerError::DuplicateJob(job.id)),
            Entry::Vacant(vacant) => vacant,
        };

        let registry = &self.inner.registry;
        let pending = match registry.reserve(
            WorkerRequirements::new(capability),
            job.id,
            registry.options().backpressure,
        ) {
            Ok(pending) => pending,
            Err(RegistryError::NoCapacity { .. }) => {
                tracing::warn!(job_id = %job.id, suite = %job.suite, "No capacity, job not admitted");
                return Err(SchedulerError::NoCapacity { job: Box::new(job) });
            }
            Err(RegistryError::Unsupported { .. }) => {
                return Err(SchedulerError::Unsupported {
                    suite: job.suite,
                    capability,
                })
            }
            // reserve never launches, so a spawn error cannot surface here
            Err(RegistryError::ShutDown | RegistryError::Spawn(_)) => {
                return Err(SchedulerError::ShuttingDown)
            }
        };

        tracing::info!(
            job_id = %job.id,
            suite = %job.suite,
            model = %job.model,
            "Job submitted"
        );

        let entry = Arc::new(JobEntry::new(job, self.inner.shutdown.child_token()));
        vacant.insert(Arc::clone(&entry));

        let ticket = entry.ticket();
        self.inner
            .tracker
            .spawn(attempt::run_job(Arc::clone(&self.inner), entry, pending));
        Ok(ticket)
    }

    /// Request cancellation. The job settles Cancelled once the runner stops.
    pub fn cancel(&self, job_id: JobId) -> Result<(), SchedulerError> {
        let entry = self.entry(job_id)?;
        if entry.state().is_terminal() {
            return Err(SchedulerError::AlreadyFinished(job_id));
        }

        tracing::info!(job_id = %job_id, "Cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    pub fn state(&self, job_id: JobId) -> Option<JobState> {
        self.inner.jobs.get(&job_id).map(|entry| entry.state())
    }

    /// Attempt number the job is on (1-based).
    pub fn attempt(&self, job_id: JobId) -> Option<u32> {
        self.inner.jobs.get(&job_id).map(|entry| entry.attempt())
    }

    /// Transition log of the job.
    pub fn history(&self, job_id: JobId) -> Option<Vec<TransitionRecord>> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|entry| entry.machine().history().to_vec())
    }

    /// Live progress of the job, from the moment of subscription.
    pub fn subscribe_progress(&self, job_id: JobId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|entry| entry.progress.subscribe())
    }

    pub fn ticket(&self, job_id: JobId) -> Option<JobTicket> {
        self.inner.jobs.get(&job_id).map(|entry| entry.ticket())
    }

    /// Wait for the job's terminal result.
    pub async fn wait(&self, job_id: JobId) -> Result<RunResult, SchedulerError> {
        self.entry(job_id)?.ticket().wait().await
    }

    /// Ids and states of in-flight jobs and recently finished ones.
    pub fn jobs(&self) -> Vec<(JobId, JobState)> {
        self.inner
            .jobs
            .iter()
            .map(|entry| (*entry.key(), entry.value().state()))
            .collect()
    }

    /// Cancel every in-flight job, wait for their results, then drain the registry.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler shutting down");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.registry.shutdown().await;
    }

    fn entry(&self, job_id: JobId) -> Result<Arc<JobEntry>, SchedulerError> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(SchedulerError::JobNotFound(job_id))
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.inner.jobs.len())
            .field("options", &self.inner.options)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, WorkerTemplate};
    use crate::error::SpawnError;
    use crate::registry::{Backpressure, RegistryOptions};
    use crate::result::{ErrorKind, RunStatus};
    use crate::store::MemoryStore;
    use crate::suite::{BenchmarkSuite, Capability};
    use crate::types::{ModelTarget, WorkerId};
    use crate::worker::{WorkerHandle, WorkerLauncher};
    use async_trait::async_trait;

    struct NoLauncher;

    #[async_trait]
    impl WorkerLauncher for NoLauncher {
        async fn launch(
            &self,
            template: &WorkerTemplate,
            _worker_id: WorkerId,
        ) -> Result<WorkerHandle, SpawnError> {
            Err(SpawnError::ProgramNotFound {
                program: template.name.to_string(),
            })
        }
    }

    fn scheduler(backpressure: Backpressure) -> Scheduler {
        let template = WorkerTemplate {
            name: WorkerId::new("embed").unwrap(),
            capabilities: vec![Capability::Embedding],
            endpoint: EndpointConfig::Connect {
                address: "127.0.0.1:1".to_string(),
            },
        };
        let registry = WorkerRegistry::new(
            vec![template],
            Arc::new(NoLauncher),
            RegistryOptions {
                pool_size: 1,
                backpressure,
                ..Default::default()
            },
        );
        Scheduler::new(
            registry,
            Arc::new(MemoryStore::new()),
            SchedulerOptions {
                retry: RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(1)),
                ..Default::default()
            },
        )
    }

    fn mteb_job() -> BenchmarkJob {
        BenchmarkJob::new(
            BenchmarkSuite::Mteb,
            ModelTarget::new("gpt-3.5-turbo", None).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_unsupported_suite_rejected() {
        let scheduler = scheduler(Backpressure::Block);
        let job = BenchmarkJob::new(
            BenchmarkSuite::Mmlu,
            ModelTarget::new("gpt-3.5-turbo", None).unwrap(),
        );
        assert!(matches!(
            scheduler.submit(job),
            Err(SchedulerError::Unsupported { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_parameters_rejected() {
        let scheduler = scheduler(Backpressure::Block);
        let job = mteb_job().with_parameter("samples_per_task", 0);
        assert!(matches!(
            scheduler.submit(job),
            Err(SchedulerError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_spawn_failures_exhaust_retries() {
        let scheduler = scheduler(Backpressure::Block);
        let ticket = scheduler.submit(mteb_job()).unwrap();
        let job_id = ticket.job_id();

        let result = ticket.wait().await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.error.unwrap().kind, ErrorKind::Spawn);
        assert!(result.worker_id.is_none());

        let history = scheduler.history(job_id).unwrap();
        assert_eq!(history.last().unwrap().to, JobState::Failed);
        assert!(history.iter().all(|t| t.to != JobState::Assigned));
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_finished() {
        let scheduler = scheduler(Backpressure::Block);
        assert!(matches!(
            scheduler.cancel(JobId::new()),
            Err(SchedulerError::JobNotFound(_))
        ));

        let ticket = scheduler.submit(mteb_job()).unwrap();
        let job_id = ticket.job_id();
        ticket.wait().await.unwrap();
        assert!(matches!(
            scheduler.cancel(job_id),
            Err(SchedulerError::AlreadyFinished(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_submission() {
        let scheduler = scheduler(Backpressure::Block);
        let job = mteb_job();
        scheduler.submit(job.clone()).unwrap();
        assert!(matches!(
            scheduler.submit(job),
            Err(SchedulerError::DuplicateJob(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let scheduler = scheduler(Backpressure::Block);
        scheduler.shutdown().await;
        assert!(matches!(
            scheduler.submit(mteb_job()),
            Err(SchedulerError::ShuttingDown)
        ));
    }
}
