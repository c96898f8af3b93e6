// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Terminal outcome of a benchmark job.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::BenchmarkJob;
use crate::types::{JobId, WorkerId};

/// Final status recorded for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Classification of the error that ended a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ConnectionLost,
    Unresponsive,
    Protocol,
    /// The benchmark itself reported failure.
    Benchmark,
    Rejected,
    Spawn,
    Timeout,
    Cancelled,
    Shutdown,
}

impl ErrorKind {
    /// Failures that warrant another attempt on a fresh worker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionLost | ErrorKind::Unresponsive | ErrorKind::Spawn
        )
    }

    /// Failures after which the worker must not be handed out again.
    pub fn indicates_unhealthy_worker(&self) -> bool {
        matches!(self, ErrorKind::ConnectionLost | ErrorKind::Unresponsive)
    }
}

/// Error attached to a failed or cancelled result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
        }
    }
}

impl fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Exactly one per completed or cancelled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub job_id: JobId,
    pub job: BenchmarkJob,
    pub status: RunStatus,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fingerprint: String,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Wall-clock time from submission to the terminal state.
    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}
