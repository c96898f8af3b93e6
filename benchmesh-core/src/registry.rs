// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker registry: the pool of live workers and the queue of callers waiting for one.
//!
//! All pool mutations happen under one `std::sync::Mutex` critical section that
//! is never held across an await. Enqueueing is synchronous ([`WorkerRegistry::reserve`]),
//! so the order of reservations is the order of assignment.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::WorkerTemplate;
use crate::error::RegistryError;
use crate::metrics;
use crate::stats::{PoolStats, WorkerSnapshot};
use crate::suite::Capability;
use crate::types::{JobId, WorkerId};
use crate::worker::{WorkerHandle, WorkerLauncher, WorkerStatus};

/// What `acquire` does when the pool is at its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Queue the caller until a worker frees up.
    Block,
    /// Fail immediately with `NoCapacity`.
    FailFast,
}

/// Registry tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryOptions {
    /// Maximum live workers, launches in flight included.
    pub pool_size: usize,
    pub backpressure: Backpressure,
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
    /// Grace period for evicted workers before they are killed.
    pub terminate_grace: Duration,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            pool_size: 4,
            backpressure: Backpressure::Block,
            health_check_interval: Duration::from_secs(5),
            ping_timeout: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(5),
        }
    }
}

/// What a job needs from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerRequirements {
    pub capability: Capability,
}

impl WorkerRequirements {
    pub fn new(capability: Capability) -> Self {
        Self { capability }
    }
}

struct WorkerSlot {
    handle: Arc<WorkerHandle>,
    assigned: Option<JobId>,
}

struct Waiter {
    id: u64,
    requirements: WorkerRequirements,
    job_id: JobId,
    tx: oneshot::Sender<Grant>,
}

/// Handed to a waiter: a worker, or permission to launch one.
enum Grant {
    Worker(WorkerLease),
    Spawn(SpawnTicket),
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<WorkerId, WorkerSlot>,
    /// Idle workers, least recently released first.
    idle: VecDeque<WorkerId>,
    spawning: usize,
    /// Attached templates with a live or launching session.
    attached: HashSet<WorkerId>,
    waiters: VecDeque<Waiter>,
    next_index: HashMap<WorkerId, u32>,
    shut_down: bool,
}

impl PoolState {
    fn live(&self) -> usize {
        self.workers.len() + self.spawning
    }
}

/// Pool of workers shared by every job.
pub struct WorkerRegistry {
    templates: Vec<WorkerTemplate>,
    launcher: Arc<dyn WorkerLauncher>,
    options: RegistryOptions,
    state: Mutex<PoolState>,
    next_waiter: AtomicU64,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    weak_self: Weak<WorkerRegistry>,
}

impl WorkerRegistry {
    /// Create a registry wrapped in an Arc for sharing across tasks.
    pub fn new(
        templates: Vec<WorkerTemplate>,
        launcher: Arc<dyn WorkerLauncher>,
        options: RegistryOptions,
    ) -> Arc<Self> {
        metrics::init();
        Arc::new_cyclic(|weak_self| Self {
            templates,
            launcher,
            options,
            state: Mutex::new(PoolState::default()),
            next_waiter: AtomicU64::new(1),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            weak_self: weak_self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn templates(&self) -> &[WorkerTemplate] {
        &self.templates
    }

    /// Whether any template can serve the capability.
    pub fn supports(&self, capability: Capability) -> bool {
        self.templates.iter().any(|t| t.supports(capability))
    }

    /// Join the queue for a worker.
    ///
    /// Returns immediately; the caller's place in line is fixed here. With
    /// [`Backpressure::FailFast`] a reservation that cannot be served at once
    /// fails with [`RegistryError::NoCapacity`] instead of queueing.
    pub fn reserve(
        &self,
        requirements: WorkerRequirements,
        job_id: JobId,
        backpressure: Backpressure,
    ) -> Result<PendingAcquire, RegistryError> {
        if !self.supports(requirements.capability) {
            return Err(RegistryError::Unsupported {
                capability: requirements.capability,
            });
        }

        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let mut state = self.lock();
        if state.shut_down {
            return Err(RegistryError::ShutDown);
        }

        state.waiters.push_back(Waiter {
            id: waiter_id,
            requirements,
            job_id,
            tx,
        });
        self.dispatch_locked(&mut state);

        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            if backpressure == Backpressure::FailFast {
                state.waiters.remove(pos);
                self.publish_locked(&state);
                return Err(RegistryError::NoCapacity {
                    capability: requirements.capability,
                    pool_size: self.options.pool_size,
                });
            }

            tracing::debug!(
                job_id = %job_id,
                capability = %requirements.capability,
                position = pos,
                "Queued for worker"
            );
        }

        Ok(PendingAcquire {
            rx,
            waiter_id,
            registry: self.weak_self.clone(),
            completed: false,
        })
    }

    /// Reserve with the configured backpressure and wait for the worker.
    pub async fn acquire(
        &self,
        requirements: WorkerRequirements,
        job_id: JobId,
    ) -> Result<WorkerLease, RegistryError> {
        self.reserve(requirements, job_id, self.options.backpressure)?
            .wait()
            .await
    }

    /// Return a worker to the idle set.
    ///
    /// No-op for workers that are already idle or no longer in the pool. A
    /// worker whose connection has closed is evicted instead.
    pub fn release(&self, worker_id: &WorkerId) {
        let mut state = self.lock();

        let Some(slot) = state.workers.get_mut(worker_id) else {
            return;
        };
        let Some(job_id) = slot.assigned.take() else {
            return;
        };

        let handle = Arc::clone(&slot.handle);
        if state.shut_down {
            self.evict_locked(&mut state, worker_id, "registry shutting down");
        } else if !handle.is_connected() || handle.status() == WorkerStatus::Unresponsive {
            self.evict_locked(&mut state, worker_id, "unhealthy on release");
        } else {
            handle.set_status(WorkerStatus::Idle);
            state.idle.push_back(worker_id.clone());
            tracing::debug!(worker_id = %worker_id, job_id = %job_id, "Worker released");
        }

        self.dispatch_locked(&mut state);
    }

    /// Remove a worker from the pool and terminate it in the background.
    ///
    /// Returns false if the worker was not in the pool.
    pub fn evict(&self, worker_id: &WorkerId, reason: &str) -> bool {
        let mut state = self.lock();
        let evicted = self.evict_locked(&mut state, worker_id, reason);
        self.dispatch_locked(&mut state);
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        self.stats_locked(&state)
    }

    pub fn workers(&self) -> Vec<WorkerSnapshot> {
        let state = self.lock();
        let mut snapshots: Vec<_> = state
            .workers
            .values()
            .map(|slot| WorkerSnapshot {
                id: slot.handle.id().clone(),
                template: slot.handle.template().clone(),
                endpoint: slot.handle.endpoint().clone(),
                status: slot.handle.status(),
                capabilities: slot.handle.capabilities().to_vec(),
                job_id: slot.assigned,
                last_health_check: slot.handle.last_health_check(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.id.cmp(&b.id));
        snapshots
    }

    /// Ping idle workers every `health_check_interval`; evict those that miss.
    pub fn spawn_health_monitor(&self) -> JoinHandle<()> {
        let registry = self.weak_self.clone();
        let shutdown = self.shutdown.clone();
        let interval = self.options.health_check_interval;
        let ping_timeout = self.options.ping_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(registry) = registry.upgrade() else {
                    break;
                };

                let idle: Vec<Arc<WorkerHandle>> = {
                    let state = registry.lock();
                    state
                        .idle
                        .iter()
                        .filter_map(|id| state.workers.get(id))
                        .map(|slot| Arc::clone(&slot.handle))
                        .collect()
                };

                let checks = idle.iter().map(|handle| handle.ping(ping_timeout));
                let results = futures::future::join_all(checks).await;

                for (handle, health) in idle.iter().zip(results) {
                    if !health.is_healthy() {
                        registry.evict_if_idle(handle.id(), "missed health check");
                    }
                }
            }
        })
    }

    /// Fail every waiter, terminate every worker and wait for terminations.
    pub async fn shutdown(&self) {
        {
            let mut state = self.lock();
            if !state.shut_down {
                state.shut_down = true;
                // Dropping the senders fails each pending acquire with ShutDown.
                state.waiters.clear();

                let ids: Vec<WorkerId> = state.workers.keys().cloned().collect();
                for id in ids {
                    self.evict_locked(&mut state, &id, "registry shutting down");
                }
                self.publish_locked(&state);
                tracing::info!("Worker registry shutting down");
            }
        }

        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn evict_if_idle(&self, worker_id: &WorkerId, reason: &str) {
        let mut state = self.lock();
        let idle = state
            .workers
            .get(worker_id)
            .is_some_and(|slot| slot.assigned.is_none());
        if idle {
            self.evict_locked(&mut state, worker_id, reason);
            self.dispatch_locked(&mut state);
        }
    }

    fn cancel_waiter(&self, waiter_id: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == waiter_id) {
            state.waiters.remove(pos);
            // The head of the queue may have changed.
            self.dispatch_locked(&mut state);
        }
    }

    fn evict_locked(&self, state: &mut PoolState, worker_id: &WorkerId, reason: &str) -> bool {
        let Some(slot) = state.workers.remove(worker_id) else {
            return false;
        };
        state.idle.retain(|id| id != worker_id);
        state.attached.remove(slot.handle.template());

        metrics::WORKER_EVICTIONS.inc();
        tracing::warn!(
            worker_id = %worker_id,
            job_id = ?slot.assigned,
            reason,
            "Evicting worker"
        );

        self.terminate_in_background(slot.handle);
        true
    }

    fn terminate_in_background(&self, handle: Arc<WorkerHandle>) {
        let grace = self.options.terminate_grace;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                self.tracker.spawn_on(
                    async move {
                        if let Err(e) = handle.terminate(grace).await {
                            tracing::warn!(worker_id = %handle.id(), error = %e, "Worker terminate");
                        }
                    },
                    &runtime,
                );
            }
            Err(_) => {
                // No runtime: dropping the handle kills a spawned process.
                handle.client().abort();
            }
        }
    }

    /// Serve queued callers in FIFO order for as long as the head can be served.
    fn dispatch_locked(&self, state: &mut PoolState) {
        loop {
            let Some(head) = state.waiters.front() else {
                break;
            };
            if head.tx.is_closed() {
                state.waiters.pop_front();
                continue;
            }
            let capability = head.requirements.capability;

            // 1. An idle worker with the capability
            let idle_match = state.idle.iter().position(|id| {
                state
                    .workers
                    .get(id)
                    .is_some_and(|slot| slot.handle.supports(capability))
            });

            if let Some(pos) = idle_match {
                let Some(worker_id) = state.idle.remove(pos) else {
                    break;
                };
                let Some(waiter) = state.waiters.pop_front() else {
                    break;
                };
                self.grant_worker_locked(state, worker_id, waiter);
                continue;
            }

            // 2. Launch a new worker if a template can and there is room
            let Some(template) = self.spawnable_template(state, capability) else {
                break;
            };

            if state.live() >= self.options.pool_size {
                // 3. Pool full: make room by evicting an idle worker of the wrong kind
                let Some(victim) = state.idle.front().cloned() else {
                    break;
                };
                self.evict_locked(state, &victim, "making room for another capability");
                continue;
            }

            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            self.grant_spawn_locked(state, template, waiter);
        }

        self.publish_locked(state);
    }

    fn spawnable_template(&self, state: &PoolState, capability: Capability) -> Option<WorkerTemplate> {
        self.templates
            .iter()
            .find(|t| t.supports(capability) && !(t.is_attached() && state.attached.contains(&t.name)))
            .cloned()
    }

    fn grant_worker_locked(&self, state: &mut PoolState, worker_id: WorkerId, waiter: Waiter) {
        let Some(slot) = state.workers.get_mut(&worker_id) else {
            return;
        };
        slot.assigned = Some(waiter.job_id);
        slot.handle.set_status(WorkerStatus::Busy);

        let lease = WorkerLease {
            handle: Arc::clone(&slot.handle),
            job_id: waiter.job_id,
            registry: self.weak_self.clone(),
            armed: true,
        };

        tracing::info!(worker_id = %worker_id, job_id = %waiter.job_id, "Worker assigned");

        if let Err(Grant::Worker(mut lease)) = waiter.tx.send(Grant::Worker(lease)) {
            // Waiter vanished between the closed check and the send
            lease.armed = false;
            if let Some(slot) = state.workers.get_mut(&worker_id) {
                slot.assigned = None;
                slot.handle.set_status(WorkerStatus::Idle);
            }
            state.idle.push_front(worker_id);
        }
    }

    fn grant_spawn_locked(&self, state: &mut PoolState, template: WorkerTemplate, waiter: Waiter) {
        state.spawning += 1;
        if template.is_attached() {
            state.attached.insert(template.name.clone());
        }

        let counter = state.next_index.entry(template.name.clone()).or_insert(0);
        let index = *counter;
        *counter = counter.wrapping_add(1);

        tracing::debug!(template = %template.name, job_id = %waiter.job_id, "Granting worker launch");

        let ticket = SpawnTicket {
            template,
            index,
            job_id: waiter.job_id,
            registry: self.weak_self.clone(),
            armed: true,
        };

        if let Err(Grant::Spawn(mut ticket)) = waiter.tx.send(Grant::Spawn(ticket)) {
            ticket.armed = false;
            Self::undo_spawn_locked(state, &ticket.template);
        }
    }

    fn undo_spawn_locked(state: &mut PoolState, template: &WorkerTemplate) {
        state.spawning = state.spawning.saturating_sub(1);
        if template.is_attached() {
            state.attached.remove(&template.name);
        }
    }

    fn spawn_abandoned(&self, template: &WorkerTemplate) {
        let mut state = self.lock();
        Self::undo_spawn_locked(&mut state, template);
        self.dispatch_locked(&mut state);
    }

    fn install(&self, handle: WorkerHandle, job_id: JobId, template: &WorkerTemplate) -> Result<WorkerLease, RegistryError> {
        let handle = Arc::new(handle);
        let mut state = self.lock();
        state.spawning = state.spawning.saturating_sub(1);

        if state.shut_down {
            if template.is_attached() {
                state.attached.remove(&template.name);
            }
            self.terminate_in_background(handle);
            return Err(RegistryError::ShutDown);
        }

        handle.set_status(WorkerStatus::Busy);
        state.workers.insert(
            handle.id().clone(),
            WorkerSlot {
                handle: Arc::clone(&handle),
                assigned: Some(job_id),
            },
        );
        self.publish_locked(&state);

        tracing::info!(worker_id = %handle.id(), job_id = %job_id, "Worker assigned");

        Ok(WorkerLease {
            handle,
            job_id,
            registry: self.weak_self.clone(),
            armed: true,
        })
    }

    fn stats_locked(&self, state: &PoolState) -> PoolStats {
        let idle = state.idle.len();
        PoolStats {
            total: state.live(),
            idle,
            busy: state.workers.len() - idle,
            spawning: state.spawning,
            waiters: state.waiters.len(),
            pool_size: self.options.pool_size,
        }
    }

    fn publish_locked(&self, state: &PoolState) {
        metrics::record_pool(&self.stats_locked(state));
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("templates", &self.templates.len())
            .field("stats", &self.stats())
            .finish()
    }
}

/// A place in the queue for a worker.
///
/// Dropping it before completion leaves the queue and gives back anything
/// already granted.
pub struct PendingAcquire {
    rx: oneshot::Receiver<Grant>,
    waiter_id: u64,
    registry: Weak<WorkerRegistry>,
    completed: bool,
}

impl PendingAcquire {
    /// Wait for a worker, launching one if granted a spawn.
    pub async fn wait(mut self) -> Result<WorkerLease, RegistryError> {
        let grant = (&mut self.rx).await.map_err(|_| RegistryError::ShutDown)?;
        self.completed = true;

        match grant {
            Grant::Worker(lease) => Ok(lease),
            Grant::Spawn(ticket) => ticket.launch().await,
        }
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.cancel_waiter(self.waiter_id);
        }
        // A grant already in the channel is dropped with `rx` and returns itself.
    }
}

/// Permission to launch one worker toward the pool ceiling.
struct SpawnTicket {
    template: WorkerTemplate,
    index: u32,
    job_id: JobId,
    registry: Weak<WorkerRegistry>,
    armed: bool,
}

impl SpawnTicket {
    fn worker_id(&self) -> Result<WorkerId, RegistryError> {
        if self.template.is_attached() {
            return Ok(self.template.name.clone());
        }
        WorkerId::new(format!("{}-{}", self.template.name, self.index)).map_err(|e| {
            RegistryError::Spawn(crate::error::SpawnError::LaunchFailed {
                program: self.template.name.to_string(),
                reason: e.to_string(),
            })
        })
    }

    async fn launch(mut self) -> Result<WorkerLease, RegistryError> {
        let registry = self.registry.upgrade().ok_or(RegistryError::ShutDown)?;
        let worker_id = self.worker_id()?;

        tracing::info!(worker_id = %worker_id, template = %self.template.name, "Launching worker");

        let launched = registry.launcher.launch(&self.template, worker_id).await;
        self.armed = false;

        match launched {
            Ok(handle) => registry.install(handle, self.job_id, &self.template),
            Err(e) => {
                tracing::warn!(template = %self.template.name, error = %e, "Worker launch failed");
                registry.spawn_abandoned(&self.template);
                Err(RegistryError::Spawn(e))
            }
        }
    }
}

impl Drop for SpawnTicket {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.spawn_abandoned(&self.template);
        }
    }
}

/// Exclusive use of one worker for one job.
///
/// Settle it with [`release`](Self::release) or [`evict`](Self::evict);
/// dropping it releases.
pub struct WorkerLease {
    handle: Arc<WorkerHandle>,
    job_id: JobId,
    registry: Weak<WorkerRegistry>,
    armed: bool,
}

impl WorkerLease {
    pub fn handle(&self) -> &Arc<WorkerHandle> {
        &self.handle
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.handle.id()
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Return the worker to the idle set.
    pub fn release(mut self) {
        self.armed = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.handle.id());
        }
    }

    /// Remove the worker from the pool and terminate it.
    pub fn evict(mut self, reason: &str) {
        self.armed = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.evict(self.handle.id(), reason);
        }
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", self.handle.id())
            .field("job_id", &self.job_id)
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.release(self.handle.id());
        }
    }
}
