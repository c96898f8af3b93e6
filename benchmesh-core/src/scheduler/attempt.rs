// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! The per-job task: acquire, execute, watch, retry, settle.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Inner, JobEntry};
use crate::error::{RegistryError, TransportError};
use crate::metrics;
use crate::registry::{Backpressure, PendingAcquire, WorkerLease, WorkerRequirements};
use crate::result::{ErrorDetail, ErrorKind, RunResult};
use crate::state::JobState;
use crate::transport::{CancelOutcome, ExecutionEvent, ExecutionStream, ReportOutcome};
use crate::types::WorkerId;

/// How one attempt ended.
#[derive(Debug)]
enum Settle {
    Succeeded(Value),
    Failed { error: ErrorDetail, metrics: Value },
    Cancelled(ErrorDetail),
    /// Transient failure; the job may run again on another worker.
    Retry(ErrorDetail),
}

impl Settle {
    fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failed {
            error: ErrorDetail::new(kind, message),
            metrics: Value::Null,
        }
    }
}

enum Step {
    Cancel,
    Event(Option<Result<ExecutionEvent, TransportError>>),
    Deadline,
    Watchdog,
}

pub(super) async fn run_job(inner: Arc<Inner>, entry: Arc<JobEntry>, first: PendingAcquire) {
    let job_id = entry.job.id;
    let requirements = WorkerRequirements::new(entry.job.suite.capability());
    let mut pending = Some(first);
    let mut last_worker: Option<WorkerId> = None;

    let settle = loop {
        let acquire = match pending.take() {
            Some(acquire) => acquire,
            // Retries always queue, whatever the admission backpressure
            None => match inner.registry.reserve(requirements, job_id, Backpressure::Block) {
                Ok(acquire) => acquire,
                Err(RegistryError::ShutDown) => break Settle::Cancelled(shutdown_detail()),
                Err(e) => break Settle::failed(ErrorKind::Rejected, e.to_string()),
            },
        };

        match run_attempt(&inner, &entry, acquire, &mut last_worker).await {
            Settle::Retry(error) => {
                let attempt = entry.attempt();
                if !inner.options.retry.should_retry(attempt) {
                    tracing::error!(
                        job_id = %job_id,
                        attempts = attempt,
                        error = %error,
                        "Retries exhausted"
                    );
                    break Settle::Failed {
                        error,
                        metrics: Value::Null,
                    };
                }

                let delay = inner.options.retry.backoff_for(attempt);
                let next = entry.retry();
                tracing::warn!(
                    job_id = %job_id,
                    attempt = next,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying job"
                );

                tokio::select! {
                    _ = entry.cancel.cancelled() => break Settle::Cancelled(cancel_detail(&inner)),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            settled => break settled,
        }
    };

    finalize(&inner, &entry, settle, last_worker).await;
}

async fn run_attempt(
    inner: &Inner,
    entry: &JobEntry,
    acquire: PendingAcquire,
    last_worker: &mut Option<WorkerId>,
) -> Settle {
    let job = &entry.job;
    let options = &inner.options;

    let lease = tokio::select! {
        biased;
        _ = entry.cancel.cancelled() => return Settle::Cancelled(cancel_detail(inner)),
        acquired = acquire.wait() => match acquired {
            Ok(lease) => lease,
            Err(RegistryError::Spawn(e)) => {
                return Settle::Retry(ErrorDetail::new(ErrorKind::Spawn, e.to_string()))
            }
            Err(RegistryError::ShutDown) => return Settle::Cancelled(shutdown_detail()),
            Err(e) => return Settle::failed(ErrorKind::Rejected, e.to_string()),
        },
    };

    entry.transition(JobState::Assigned);
    *last_worker = Some(lease.worker_id().clone());
    metrics::JOB_ATTEMPTS.inc();

    let handle = Arc::clone(lease.handle());
    let mut stream = match handle.client().start(job) {
        Ok(stream) => stream,
        Err(e) => return settle_transport_error(lease, e),
    };

    let timeout = options
        .job_timeout
        .unwrap_or_else(|| job.suite.profile().default_timeout);
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    let mut watchdog = tokio::time::interval_at(
        Instant::now() + options.health_check_interval,
        options.health_check_interval,
    );
    watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let step = tokio::select! {
            biased;
            _ = entry.cancel.cancelled() => Step::Cancel,
            event = stream.next() => Step::Event(event),
            _ = &mut deadline => Step::Deadline,
            _ = watchdog.tick() => Step::Watchdog,
        };

        match step {
            Step::Cancel => {
                stop_remote(stream, lease, options.cancel_grace).await;
                return Settle::Cancelled(cancel_detail(inner));
            }
            Step::Deadline => {
                tracing::warn!(
                    job_id = %job.id,
                    timeout_secs = timeout.as_secs(),
                    "Job timed out"
                );
                stop_remote(stream, lease, options.cancel_grace).await;
                return Settle::failed(
                    ErrorKind::Timeout,
                    format!("job exceeded its {}s timeout", timeout.as_secs()),
                );
            }
            Step::Watchdog => {
                let health = handle.ping(options.ping_timeout).await;
                if !health.is_healthy() {
                    drop(stream);
                    lease.evict("missed health check during run");
                    return Settle::Retry(ErrorDetail::new(
                        ErrorKind::Unresponsive,
                        format!("worker {} missed its health check", handle.id()),
                    ));
                }
            }
            Step::Event(Some(Ok(event))) => match event {
                ExecutionEvent::Started => {
                    entry.transition(JobState::Running);
                    tracing::info!(job_id = %job.id, worker_id = %handle.id(), "Job running");
                }
                ExecutionEvent::Progress(progress) => {
                    tracing::debug!(
                        job_id = %job.id,
                        seq = progress.seq,
                        completed = progress.completed,
                        "Progress"
                    );
                    // No subscribers is fine
                    let _ = entry.progress.send(progress);
                }
                ExecutionEvent::Finished(report) => {
                    lease.release();
                    return match report.outcome {
                        ReportOutcome::Success => Settle::Succeeded(report.metrics),
                        ReportOutcome::Failure => Settle::Failed {
                            error: ErrorDetail::new(
                                ErrorKind::Benchmark,
                                report
                                    .error
                                    .unwrap_or_else(|| "benchmark reported failure".to_string()),
                            ),
                            metrics: report.metrics,
                        },
                    };
                }
                ExecutionEvent::Rejected(reason) => {
                    lease.release();
                    return Settle::failed(ErrorKind::Rejected, reason);
                }
            },
            Step::Event(Some(Err(e))) => return settle_transport_error(lease, e),
            Step::Event(None) => {
                return settle_transport_error(
                    lease,
                    TransportError::connection_lost("execution stream ended without a report"),
                )
            }
        }
    }
}

/// Classify a transport failure and settle the worker accordingly.
fn settle_transport_error(lease: WorkerLease, error: TransportError) -> Settle {
    match &error {
        TransportError::ConnectionLost { .. } => {
            lease.evict("connection lost");
            Settle::Retry(ErrorDetail::new(ErrorKind::ConnectionLost, error.to_string()))
        }
        TransportError::Timeout { .. } => {
            lease.evict("transport timeout");
            Settle::Retry(ErrorDetail::new(ErrorKind::Unresponsive, error.to_string()))
        }
        TransportError::Protocol { .. } | TransportError::Busy { .. } => {
            tracing::warn!(worker_id = %lease.worker_id(), error = %error, "Protocol error");
            lease.release();
            Settle::failed(ErrorKind::Protocol, error.to_string())
        }
    }
}

/// Stop the remote run; keep the worker only if it acknowledged in time.
async fn stop_remote(stream: ExecutionStream, lease: WorkerLease, grace: std::time::Duration) {
    let job_id = stream.job_id();
    match stream.cancel(grace).await {
        CancelOutcome::Acknowledged => lease.release(),
        outcome => {
            tracing::warn!(
                job_id = %job_id,
                worker_id = %lease.worker_id(),
                outcome = ?outcome,
                "Runner did not acknowledge stop"
            );
            lease.evict("stop not acknowledged");
        }
    }
}

fn cancel_detail(inner: &Inner) -> ErrorDetail {
    if inner.shutdown.is_cancelled() {
        shutdown_detail()
    } else {
        ErrorDetail::new(ErrorKind::Cancelled, "cancelled by request")
    }
}

fn shutdown_detail() -> ErrorDetail {
    ErrorDetail::new(ErrorKind::Shutdown, "scheduler shutting down")
}

/// Move the job to its terminal state and record exactly one result.
async fn finalize(inner: &Inner, entry: &JobEntry, settle: Settle, worker_id: Option<WorkerId>) {
    let (state, payload, error) = match settle {
        Settle::Succeeded(payload) => (JobState::Succeeded, payload, None),
        Settle::Failed { error, metrics } => (JobState::Failed, metrics, Some(error)),
        Settle::Cancelled(error) => (JobState::Cancelled, Value::Null, Some(error)),
        Settle::Retry(error) => (JobState::Failed, Value::Null, Some(error)),
    };

    entry.transition(state);

    let job = entry.job.as_ref().clone();
    let Some(status) = state.run_status() else {
        inner.retire(job.id);
        return;
    };
    let result = RunResult {
        job_id: job.id,
        fingerprint: job.fingerprint(),
        status,
        metrics: payload,
        error,
        attempts: entry.attempt(),
        worker_id,
        started_at: entry.submitted_at,
        finished_at: Utc::now(),
        job,
    };

    metrics::record_result(&result);

    if let Err(e) = inner.store.append(result.clone()).await {
        tracing::error!(job_id = %result.job_id, error = %e, "Failed to persist result");
    }

    tracing::info!(
        job_id = %result.job_id,
        status = %result.status,
        attempts = result.attempts,
        "Job finished"
    );

    // A resolved ticket must see the table already trimmed
    inner.retire(result.job_id);
    entry.outcome.send_replace(Some(result));
}
