//! Benchmesh Core Library
//!
//! Core orchestration library for distributed benchmark runs.
//! Provides the worker registry, job scheduler and state machine, framed RPC
//! transport to benchmark runners, configuration parsing and result storage.

pub mod config;
pub mod error;
pub mod job;
pub mod metrics;
pub mod registry;
pub mod result;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod stats;
pub mod store;
pub mod suite;
pub mod transport;
pub mod types;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, EndpointConfig, OrchestratorConfig, WorkerTemplate};
pub use error::{BenchError, BenchResult, HardValidationError, SchedulerError};
pub use job::BenchmarkJob;
pub use registry::{Backpressure, WorkerRegistry};
pub use result::{ErrorDetail, ErrorKind, RunResult, RunStatus};
pub use scheduler::{JobTicket, Scheduler, SchedulerOptions};
pub use state::{JobState, JobStateMachine};
pub use store::{JsonlStore, MemoryStore, ResultFilter, ResultStore};
pub use suite::{BenchmarkSuite, Capability};
pub use types::{JobId, ModelTarget, WorkerId};
pub use worker::{EndpointLauncher, WorkerHandle, WorkerLauncher};
