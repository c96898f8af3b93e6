// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Runner side of the connection.
//!
//! A runner process reads `BENCHMESH_SOCKET` from its environment, connects,
//! announces itself with `ready` and then answers control messages. A runner
//! must reply `stopped` to every `stop`, including one for a job it already
//! finished.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};

use crate::error::{FrameError, SpawnError};
use crate::suite::Capability;
use crate::transport::frame::{read_frame, write_frame, write_payload};
use crate::transport::protocol::{
    ControlMessage, ProgressEvent, RunReport, RunnerMessage, PROTOCOL_VERSION,
};
use crate::types::JobId;

/// Environment variable holding the control socket path of a spawned runner.
pub const SOCKET_ENV: &str = "BENCHMESH_SOCKET";

/// Environment variable holding the worker id assigned by the orchestrator.
pub const WORKER_ID_ENV: &str = "BENCHMESH_WORKER_ID";

/// A connected runner that has already sent `ready`.
pub struct RunnerSession<S> {
    reader: RunnerReader<S>,
    writer: RunnerWriter<S>,
}

impl<S> RunnerSession<S>
where
    S: AsyncRead + AsyncWrite,
{
    /// Announce the runner on an established connection.
    pub async fn accept(
        io: S,
        runner: impl Into<String>,
        capabilities: Vec<Capability>,
    ) -> Result<Self, FrameError> {
        let (reader, writer) = tokio::io::split(io);
        let mut writer = RunnerWriter { inner: writer };

        writer
            .send(&RunnerMessage::Ready {
                runner: runner.into(),
                capabilities,
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;

        Ok(Self {
            reader: RunnerReader { inner: reader },
            writer,
        })
    }

    /// Next control message from the orchestrator.
    pub async fn recv(&mut self) -> Result<ControlMessage, FrameError> {
        self.reader.recv().await
    }

    /// Split into halves so progress can be written while control messages are read.
    pub fn into_split(self) -> (RunnerReader<S>, RunnerWriter<S>) {
        (self.reader, self.writer)
    }
}

impl RunnerSession<tokio::net::UnixStream> {
    /// Connect to the control socket named by [`SOCKET_ENV`].
    pub async fn connect_from_env(
        runner: impl Into<String>,
        capabilities: Vec<Capability>,
        timeout: Duration,
    ) -> Result<Self, SpawnError> {
        let path = std::env::var(SOCKET_ENV).map_err(|_| SpawnError::Socket {
            reason: format!("{} is not set", SOCKET_ENV),
        })?;

        let stream = tokio::time::timeout(timeout, tokio::net::UnixStream::connect(&path))
            .await
            .map_err(|_| SpawnError::ConnectFailed {
                address: path.clone(),
                reason: format!("timed out after {}ms", timeout.as_millis()),
            })?
            .map_err(|e| SpawnError::ConnectFailed {
                address: path.clone(),
                reason: e.to_string(),
            })?;

        Self::accept(stream, runner, capabilities)
            .await
            .map_err(|e| SpawnError::Handshake {
                reason: e.to_string(),
            })
    }
}

/// Inbound half of a runner session.
pub struct RunnerReader<S> {
    inner: ReadHalf<S>,
}

impl<S: AsyncRead> RunnerReader<S> {
    pub async fn recv(&mut self) -> Result<ControlMessage, FrameError> {
        read_frame(&mut self.inner).await
    }
}

/// Outbound half of a runner session.
pub struct RunnerWriter<S> {
    inner: WriteHalf<S>,
}

impl<S: AsyncWrite> RunnerWriter<S> {
    pub async fn send(&mut self, message: &RunnerMessage) -> Result<(), FrameError> {
        write_frame(&mut self.inner, message).await
    }

    /// Write raw bytes as one frame, bypassing message encoding.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        write_payload(&mut self.inner, payload).await
    }

    pub async fn started(&mut self, job_id: JobId) -> Result<(), FrameError> {
        self.send(&RunnerMessage::Started { job_id }).await
    }

    pub async fn progress(&mut self, job_id: JobId, event: ProgressEvent) -> Result<(), FrameError> {
        self.send(&RunnerMessage::Progress { job_id, event }).await
    }

    pub async fn finished(&mut self, job_id: JobId, report: RunReport) -> Result<(), FrameError> {
        self.send(&RunnerMessage::Finished { job_id, report }).await
    }

    pub async fn rejected(
        &mut self,
        job_id: JobId,
        reason: impl Into<String>,
    ) -> Result<(), FrameError> {
        self.send(&RunnerMessage::Rejected {
            job_id,
            reason: reason.into(),
        })
        .await
    }

    pub async fn stopped(&mut self, job_id: JobId) -> Result<(), FrameError> {
        self.send(&RunnerMessage::Stopped { job_id }).await
    }

    pub async fn health_ok(&mut self, nonce: u64) -> Result<(), FrameError> {
        self.send(&RunnerMessage::HealthOk { nonce }).await
    }
}
