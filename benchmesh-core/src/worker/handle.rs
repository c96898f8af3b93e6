// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Handle to one live runner: a spawned process or an attached session.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::config::{EndpointConfig, WorkerTemplate};
use crate::error::{SpawnError, TerminateError};
use crate::suite::Capability;
use crate::transport::client::RpcClient;
use crate::types::{ProcessId, WorkerId};
use crate::worker::process::RunnerProcess;

/// Options shared by every launch.
#[derive(Debug, Clone)]
pub struct LaunchOptions {
    /// Directory holding control sockets of spawned runners.
    pub socket_dir: PathBuf,
    /// Budget for process start (or TCP connect) plus the `ready` handshake.
    pub ready_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            socket_dir: PathBuf::from("/tmp/benchmesh"),
            ready_timeout: Duration::from_secs(30),
        }
    }
}

/// Where a worker lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerEndpoint {
    Spawned { program: String, pid: ProcessId },
    Attached { address: String },
    /// In-process connection; used by embedders and tests.
    Local { label: String },
}

impl fmt::Display for WorkerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawned { program, pid } => write!(f, "{} (pid {})", program, pid),
            Self::Attached { address } => write!(f, "tcp://{}", address),
            Self::Local { label } => write!(f, "local:{}", label),
        }
    }
}

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Unresponsive,
    Terminating,
    Terminated,
}

impl WorkerStatus {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Unresponsive => "unresponsive",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a single ping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy { latency: Duration },
    Unresponsive { reason: String },
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy { .. })
    }
}

/// One runner process or session.
///
/// Owned by the registry; everything else sees it through a lease.
pub struct WorkerHandle {
    id: WorkerId,
    template: WorkerId,
    endpoint: WorkerEndpoint,
    capabilities: Vec<Capability>,
    client: RpcClient,
    process: Option<tokio::sync::Mutex<RunnerProcess>>,
    status: Mutex<WorkerStatus>,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl WorkerHandle {
    /// Spawn the template's program or connect to its address, then handshake.
    pub async fn spawn_or_attach(
        template: &WorkerTemplate,
        id: WorkerId,
        options: &LaunchOptions,
    ) -> Result<Self, SpawnError> {
        let deadline = Instant::now() + options.ready_timeout;

        match &template.endpoint {
            EndpointConfig::Spawn(spec) => {
                let (process, stream) =
                    RunnerProcess::spawn(&id, spec, &options.socket_dir, options.ready_timeout)
                        .await?;
                let endpoint = WorkerEndpoint::Spawned {
                    program: spec.program.clone(),
                    pid: process.pid(),
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                Self::handshake(template, id, endpoint, stream, remaining, Some(process)).await
            }
            EndpointConfig::Connect { address } => {
                let stream = tokio::time::timeout(options.ready_timeout, TcpStream::connect(address))
                    .await
                    .map_err(|_| SpawnError::ConnectFailed {
                        address: address.clone(),
                        reason: format!("timed out after {}ms", options.ready_timeout.as_millis()),
                    })?
                    .map_err(|e| SpawnError::ConnectFailed {
                        address: address.clone(),
                        reason: e.to_string(),
                    })?;
                let endpoint = WorkerEndpoint::Attached {
                    address: address.clone(),
                };
                let remaining = deadline.saturating_duration_since(Instant::now());
                Self::handshake(template, id, endpoint, stream, remaining, None).await
            }
        }
    }

    /// Handshake over an already established connection.
    pub async fn from_io<S>(
        template: &WorkerTemplate,
        id: WorkerId,
        endpoint: WorkerEndpoint,
        io: S,
        ready_timeout: Duration,
    ) -> Result<Self, SpawnError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::handshake(template, id, endpoint, io, ready_timeout, None).await
    }

    async fn handshake<S>(
        template: &WorkerTemplate,
        id: WorkerId,
        endpoint: WorkerEndpoint,
        io: S,
        ready_timeout: Duration,
        process: Option<RunnerProcess>,
    ) -> Result<Self, SpawnError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let started = Instant::now();
        let (client, handshake) = RpcClient::handshake(io, id.clone(), ready_timeout).await?;

        if let Some(missing) = template
            .capabilities
            .iter()
            .find(|c| !handshake.capabilities.contains(c))
        {
            client.abort();
            return Err(SpawnError::Handshake {
                reason: format!(
                    "runner '{}' does not advertise capability {} required by template {}",
                    handshake.runner, missing, template.name
                ),
            });
        }

        tracing::info!(
            worker_id = %id,
            endpoint = %endpoint,
            runner = %handshake.runner,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Worker ready"
        );

        Ok(Self {
            id,
            template: template.name.clone(),
            endpoint,
            capabilities: handshake.capabilities,
            client,
            process: process.map(tokio::sync::Mutex::new),
            status: Mutex::new(WorkerStatus::Idle),
            last_health_check: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Name of the template this worker was launched from.
    pub fn template(&self) -> &WorkerId {
        &self.template
    }

    pub fn endpoint(&self) -> &WorkerEndpoint {
        &self.endpoint
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Whether the connection to the runner is still open.
    pub fn is_connected(&self) -> bool {
        !self.client.is_closed()
    }

    pub fn status(&self) -> WorkerStatus {
        *lock(&self.status)
    }

    /// Move to `status` only if the worker is still `expected`.
    fn replace_status(&self, expected: WorkerStatus, status: WorkerStatus) {
        let mut current = lock(&self.status);
        if *current == expected && expected != status {
            tracing::debug!(worker_id = %self.id, from = %expected, to = %status, "Worker status");
            *current = status;
        }
    }

    pub fn set_status(&self, status: WorkerStatus) {
        let mut current = lock(&self.status);
        let from = *current;
        if from != status {
            tracing::debug!(worker_id = %self.id, from = %from, to = %status, "Worker status");
            *current = status;
        }
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_health_check)
    }

    /// Send a health check and wait up to `timeout` for the reply.
    ///
    /// A miss marks the worker Unresponsive, unless its status moved while
    /// the check was in flight (an idle worker leased to a job stays Busy).
    pub async fn ping(&self, timeout: Duration) -> HealthStatus {
        let observed = self.status();
        match self.client.health_check(timeout).await {
            Ok(latency) => {
                *lock(&self.last_health_check) = Some(Utc::now());
                HealthStatus::Healthy { latency }
            }
            Err(e) => {
                if matches!(observed, WorkerStatus::Idle | WorkerStatus::Busy) {
                    self.replace_status(observed, WorkerStatus::Unresponsive);
                }
                tracing::warn!(worker_id = %self.id, error = %e, "Health check failed");
                HealthStatus::Unresponsive {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Shut the worker down: `goodbye`, wait `grace`, then SIGTERM, then SIGKILL.
    ///
    /// Returns [`TerminateError::GraceExpired`] if the worker had to be
    /// force-killed (or, for attached sessions, force-disconnected).
    pub async fn terminate(&self, grace: Duration) -> Result<(), TerminateError> {
        if self.status() == WorkerStatus::Terminated {
            return Ok(());
        }
        self.set_status(WorkerStatus::Terminating);

        let _ = self.client.goodbye();

        let result = match &self.process {
            Some(process) => {
                let mut process = process.lock().await;
                self.stop_process(&mut process, grace).await
            }
            None => {
                if tokio::time::timeout(grace, self.client.closed()).await.is_ok() {
                    Ok(())
                } else {
                    Err(TerminateError::GraceExpired {
                        worker_id: self.id.clone(),
                        grace_ms: grace.as_millis() as u64,
                    })
                }
            }
        };

        self.client.abort();
        self.set_status(WorkerStatus::Terminated);
        result
    }

    async fn stop_process(
        &self,
        process: &mut RunnerProcess,
        grace: Duration,
    ) -> Result<(), TerminateError> {
        if process.wait_exit(grace).await.is_some() {
            return Ok(());
        }

        tracing::debug!(worker_id = %self.id, pid = process.pid().value(), "Sending SIGTERM");
        if process.terminate().is_ok() && process.wait_exit(grace).await.is_some() {
            return Ok(());
        }

        tracing::warn!(worker_id = %self.id, pid = process.pid().value(), "Force killing runner");
        process.kill().await?;
        Err(TerminateError::GraceExpired {
            worker_id: self.id.clone(),
            grace_ms: grace.as_millis() as u64,
        })
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::session::RunnerSession;
    use crate::transport::ControlMessage;

    fn template(capabilities: Vec<Capability>) -> WorkerTemplate {
        WorkerTemplate {
            name: WorkerId::new("local").unwrap(),
            capabilities,
            endpoint: EndpointConfig::Connect {
                address: "127.0.0.1:1".to_string(),
            },
        }
    }

    fn endpoint() -> WorkerEndpoint {
        WorkerEndpoint::Local {
            label: "duplex".to_string(),
        }
    }

    #[tokio::test]
    async fn test_missing_capability_rejected() {
        let (core, runner) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let _session = RunnerSession::accept(runner, "gen", vec![Capability::Generation])
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let result = WorkerHandle::from_io(
            &template(vec![Capability::Embedding]),
            WorkerId::new("local-1").unwrap(),
            endpoint(),
            core,
            Duration::from_secs(1),
        )
        .await;
        assert!(matches!(result, Err(SpawnError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_ping_unresponsive_marks_status() {
        let (core, runner) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            // Never answers health checks
            let mut session = RunnerSession::accept(runner, "mute", vec![Capability::Embedding])
                .await
                .unwrap();
            while session.recv().await.is_ok() {}
        });

        let handle = WorkerHandle::from_io(
            &template(vec![Capability::Embedding]),
            WorkerId::new("local-1").unwrap(),
            endpoint(),
            core,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert_eq!(handle.status(), WorkerStatus::Idle);
        let health = handle.ping(Duration::from_millis(20)).await;
        assert!(!health.is_healthy());
        assert_eq!(handle.status(), WorkerStatus::Unresponsive);
        assert!(handle.last_health_check().is_none());
    }

    #[tokio::test]
    async fn test_missed_ping_keeps_status_set_mid_check() {
        let (core, runner) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut session = RunnerSession::accept(runner, "mute", vec![Capability::Embedding])
                .await
                .unwrap();
            while session.recv().await.is_ok() {}
        });

        let handle = WorkerHandle::from_io(
            &template(vec![Capability::Embedding]),
            WorkerId::new("local-1").unwrap(),
            endpoint(),
            core,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        // Leased to a job while an idle check is still waiting
        let lease = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.set_status(WorkerStatus::Busy);
        };
        let (health, ()) = tokio::join!(handle.ping(Duration::from_millis(100)), lease);

        assert!(!health.is_healthy());
        assert_eq!(handle.status(), WorkerStatus::Busy);

        // A check that starts while Busy still marks the miss
        let health = handle.ping(Duration::from_millis(20)).await;
        assert!(!health.is_healthy());
        assert_eq!(handle.status(), WorkerStatus::Unresponsive);
    }

    #[tokio::test]
    async fn test_terminate_attached_session() {
        let (core, runner) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let mut session = RunnerSession::accept(runner, "polite", vec![Capability::Embedding])
                .await
                .unwrap();
            loop {
                match session.recv().await {
                    Ok(ControlMessage::Goodbye) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        });

        let handle = WorkerHandle::from_io(
            &template(vec![Capability::Embedding]),
            WorkerId::new("local-1").unwrap(),
            endpoint(),
            core,
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        assert!(handle.terminate(Duration::from_secs(1)).await.is_ok());
        assert_eq!(handle.status(), WorkerStatus::Terminated);
        assert!(!handle.is_connected());
    }
}
