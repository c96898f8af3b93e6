// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Prometheus collectors for jobs and the worker pool.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge_vec, Encoder, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec,
};

use crate::result::RunResult;
use crate::stats::PoolStats;

lazy_static! {
    pub static ref JOBS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "benchmesh_jobs_finished_total",
        "Jobs that reached a terminal state",
        &["status"]
    )
    .unwrap();
    pub static ref JOB_ATTEMPTS: IntCounter = register_int_counter!(
        "benchmesh_job_attempts_total",
        "Job attempts dispatched to a worker, retries included"
    )
    .unwrap();
    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "benchmesh_job_duration_seconds",
        "Time from submission to terminal state",
        &["suite"],
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]
    )
    .unwrap();
    pub static ref WORKER_EVICTIONS: IntCounter = register_int_counter!(
        "benchmesh_worker_evictions_total",
        "Workers removed from the pool and terminated"
    )
    .unwrap();
    pub static ref WORKERS: IntGaugeVec = register_int_gauge_vec!(
        "benchmesh_workers",
        "Workers in the pool by state",
        &["state"]
    )
    .unwrap();
}

/// Force registration so every series shows up before first use.
pub fn init() {
    lazy_static::initialize(&JOBS_FINISHED);
    lazy_static::initialize(&JOB_ATTEMPTS);
    lazy_static::initialize(&JOB_DURATION);
    lazy_static::initialize(&WORKER_EVICTIONS);
    lazy_static::initialize(&WORKERS);
}

pub fn record_result(result: &RunResult) {
    JOBS_FINISHED
        .with_label_values(&[result.status.name()])
        .inc();

    let seconds = result.duration().num_milliseconds().max(0) as f64 / 1000.0;
    JOB_DURATION
        .with_label_values(&[result.job.suite.name()])
        .observe(seconds);
}

pub fn record_pool(stats: &PoolStats) {
    WORKERS.with_label_values(&["idle"]).set(stats.idle as i64);
    WORKERS.with_label_values(&["busy"]).set(stats.busy as i64);
    WORKERS
        .with_label_values(&["spawning"])
        .set(stats.spawning as i64);
}

/// Text exposition of every registered metric.
pub fn render() -> String {
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("Encoding error"))
}
