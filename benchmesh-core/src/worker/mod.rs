// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Worker processes and sessions.
//!
//! Provides:
//! - Runner process spawning with a socket handshake
//! - Worker handles with health checks and graceful termination
//! - The [`WorkerLauncher`] seam the registry launches workers through

pub mod handle;
pub mod process;

use async_trait::async_trait;

pub use handle::{HealthStatus, LaunchOptions, WorkerEndpoint, WorkerHandle, WorkerStatus};
pub use process::RunnerProcess;

use crate::config::WorkerTemplate;
use crate::error::SpawnError;
use crate::types::WorkerId;

/// Brings up a worker for a template.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(
        &self,
        template: &WorkerTemplate,
        worker_id: WorkerId,
    ) -> Result<WorkerHandle, SpawnError>;
}

/// Launches workers as configured: spawn a process or connect over TCP.
#[derive(Debug, Clone, Default)]
pub struct EndpointLauncher {
    options: LaunchOptions,
}

impl EndpointLauncher {
    pub fn new(options: LaunchOptions) -> Self {
        Self { options }
    }
}

#[async_trait]
impl WorkerLauncher for EndpointLauncher {
    async fn launch(
        &self,
        template: &WorkerTemplate,
        worker_id: WorkerId,
    ) -> Result<WorkerHandle, SpawnError> {
        WorkerHandle::spawn_or_attach(template, worker_id, &self.options).await
    }
}
