// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Custom error types for benchmesh.
//!
//! One explicit enum per concern, chained into [`BenchError`] with `#[from]`.
//! No `Box<dyn Error>`, no `anyhow::Result` in the library.

use std::path::PathBuf;

use thiserror::Error;

use crate::job::BenchmarkJob;
use crate::suite::{BenchmarkSuite, Capability};
use crate::types::{JobId, WorkerId};

/// Top-level error type for the orchestration core.
#[derive(Debug, Error)]
pub enum BenchError {
    // =========================================================================
    // Configuration Errors - Fail-Fast on Invalid Config
    // =========================================================================
    #[error("Hard validation error: {0}")]
    HardValidation(#[from] HardValidationError),

    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    #[error("Configuration parse error: {message}")]
    ConfigParse { message: String },

    // =========================================================================
    // Job Lifecycle Errors
    // =========================================================================
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(#[from] StateTransitionError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    // =========================================================================
    // Worker Errors
    // =========================================================================
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Terminate error: {0}")]
    Terminate(#[from] TerminateError),

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Result store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Hard validation errors reject a configuration or a job before anything runs.
#[derive(Debug, Error)]
pub enum HardValidationError {
    #[error("Missing required field: {field} in {context}")]
    MissingRequiredField {
        field: &'static str,
        context: String,
    },

    #[error("Invalid field value: {field} = {value} - {reason}")]
    InvalidFieldValue {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Duplicate worker name: {name}")]
    DuplicateWorkerName { name: String },

    #[error("Unknown benchmark suite: {name}")]
    UnknownSuite { name: String },

    #[error("Unknown capability: {name}")]
    UnknownCapability { name: String },

    #[error("Suite {suite} requires parameter '{parameter}'")]
    MissingParameter {
        suite: BenchmarkSuite,
        parameter: &'static str,
    },

    #[error("Suite {suite} parameter '{parameter}' is invalid: {reason}")]
    InvalidParameter {
        suite: BenchmarkSuite,
        parameter: String,
        reason: String,
    },

    #[error("Schema validation failed: {message}")]
    SchemaValidation { message: String },
}

/// State transition errors for the job state machine.
#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("Cannot transition from {from} to {to} for job {job_id}")]
    InvalidTransition {
        job_id: JobId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Job {job_id} is in terminal state: {state}")]
    TerminalState {
        job_id: JobId,
        state: &'static str,
    },
}

/// A worker process or remote session could not be brought up.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Runner program not found: {program}")]
    ProgramNotFound { program: String },

    #[error("Failed to launch {program}: {reason}")]
    LaunchFailed { program: String, reason: String },

    #[error("Runner {worker_id} exited before READY: {status}")]
    ExitedEarly { worker_id: WorkerId, status: String },

    #[error("Control socket error: {reason}")]
    Socket { reason: String },

    #[error("Failed to connect to {address}: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("Runner {worker_id} did not send READY within {timeout_ms}ms")]
    ReadyTimeout { worker_id: WorkerId, timeout_ms: u64 },

    #[error("Handshake failed: {reason}")]
    Handshake { reason: String },
}

/// Wire-level framing errors.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Connection closed by peer")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame size exceeds maximum: {size} > {max}")]
    Oversized { size: usize, max: usize },

    #[error("Frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Undecodable message: {0}")]
    Decode(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the byte stream can no longer be trusted after this error.
    ///
    /// Checksum and decode failures consume exactly one frame, so the
    /// connection stays in sync; everything else ends it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FrameError::Closed | FrameError::Io(_) | FrameError::Oversized { .. }
        )
    }
}

/// Errors surfaced by the transport client while talking to a worker.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The connection dropped. Transient: the job may be retried elsewhere.
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    /// The worker sent something the protocol does not allow. Fatal to the job.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    #[error("Worker {worker_id} is already executing job {job_id}")]
    Busy { worker_id: WorkerId, job_id: JobId },

    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

impl TransportError {
    pub fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost {
            reason: reason.into(),
        }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Check if this error is eligible for a retry on another worker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionLost { .. } | TransportError::Timeout { .. }
        )
    }
}

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No worker capacity for {capability}: all {pool_size} slots in use")]
    NoCapacity {
        capability: Capability,
        pool_size: usize,
    },

    #[error("No worker template advertises capability {capability}")]
    Unsupported { capability: Capability },

    #[error("Worker registry is shut down")]
    ShutDown,

    #[error("Worker spawn failed: {0}")]
    Spawn(#[from] SpawnError),
}

/// Graceful shutdown of a worker failed; the worker was force-killed.
#[derive(Debug, Error)]
pub enum TerminateError {
    #[error("Worker {worker_id} did not exit within {grace_ms}ms grace, killed")]
    GraceExpired { worker_id: WorkerId, grace_ms: u64 },

    #[error("Failed to signal worker {worker_id}: {reason}")]
    Signal { worker_id: WorkerId, reason: String },
}

/// Result store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("A result for job {job_id} was already recorded")]
    Duplicate { job_id: JobId },

    #[error("IO error: {context} - {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Corrupt record at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Errors returned synchronously by the scheduler API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Fail-fast backpressure: the job was not admitted and is handed back.
    #[error("No worker capacity for job {}", job.id)]
    NoCapacity { job: Box<BenchmarkJob> },

    #[error("No worker can run suite {suite} (needs {capability})")]
    Unsupported {
        suite: BenchmarkSuite,
        capability: Capability,
    },

    #[error("Invalid job: {0}")]
    Validation(#[from] HardValidationError),

    #[error("Job already submitted: {0}")]
    DuplicateJob(JobId),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    #[error("Job already finished: {0}")]
    AlreadyFinished(JobId),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Job {0} ended without producing a result")]
    ResultDropped(JobId),
}

/// Result type alias using BenchError.
pub type BenchResult<T> = Result<T, BenchError>;
