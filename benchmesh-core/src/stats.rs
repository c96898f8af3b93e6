// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::suite::Capability;
use crate::types::{JobId, WorkerId};
use crate::worker::{WorkerEndpoint, WorkerStatus};

/// Point-in-time counters of the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct PoolStats {
    /// Live workers plus launches in flight.
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub spawning: usize,
    /// Callers queued in `acquire`.
    pub waiters: usize,
    pub pool_size: usize,
}

/// One worker as shown by `benchmesh workers` and in logs.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub template: WorkerId,
    pub endpoint: WorkerEndpoint,
    pub status: WorkerStatus,
    pub capabilities: Vec<Capability>,
    pub job_id: Option<JobId>,
    pub last_health_check: Option<DateTime<Utc>>,
}
