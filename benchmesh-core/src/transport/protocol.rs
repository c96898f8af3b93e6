// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Messages exchanged between the orchestrator and a benchmark runner.
//!
//! Every message is a JSON object tagged by `type`, carried in one frame.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::BenchmarkJob;
use crate::suite::Capability;
use crate::types::JobId;

/// Wire protocol version announced in `ready`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Orchestrator → runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Start { job: BenchmarkJob },
    Stop { job_id: JobId },
    HealthCheck { nonce: u64 },
    /// Orderly shutdown; the runner should exit.
    Goodbye,
}

/// Runner → orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunnerMessage {
    Ready {
        runner: String,
        capabilities: Vec<Capability>,
        protocol_version: u32,
    },
    Started {
        job_id: JobId,
    },
    Progress {
        job_id: JobId,
        event: ProgressEvent,
    },
    Finished {
        job_id: JobId,
        report: RunReport,
    },
    Rejected {
        job_id: JobId,
        reason: String,
    },
    Stopped {
        job_id: JobId,
    },
    HealthOk {
        nonce: u64,
    },
}

impl RunnerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Finished { .. } => "finished",
            Self::Rejected { .. } => "rejected",
            Self::Stopped { .. } => "stopped",
            Self::HealthOk { .. } => "health_ok",
        }
    }
}

/// One progress update of a running job. `seq` strictly increases per job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub seq: u64,
    pub completed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(seq: u64, completed: u64, total: Option<u64>) -> Self {
        Self {
            seq,
            completed,
            total,
            message: None,
            at: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Completed fraction in `[0, 1]` when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.total {
            Some(0) | None => None,
            Some(total) => Some((self.completed as f64 / total as f64).min(1.0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportOutcome {
    Success,
    Failure,
}

/// Terminal report of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: ReportOutcome,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunReport {
    pub fn success(metrics: Value) -> Self {
        Self {
            outcome: ReportOutcome::Success,
            metrics,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            outcome: ReportOutcome::Failure,
            metrics: Value::Null,
            error: Some(error.into()),
        }
    }
}
