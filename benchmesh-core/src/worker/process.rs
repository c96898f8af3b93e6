// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Runner process management.
//!
//! Spawns runner processes and waits for them to connect back on a Unix socket.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, Command};

use crate::config::SpawnConfig;
use crate::error::{SpawnError, TerminateError};
use crate::transport::session::{SOCKET_ENV, WORKER_ID_ENV};
use crate::types::{ProcessId, WorkerId};

/// Runner process wrapper.
///
/// Owns the child process and its control socket path. The child is killed
/// and the socket removed when this is dropped.
pub struct RunnerProcess {
    worker_id: WorkerId,
    child: Child,
    socket_path: PathBuf,
    pid: ProcessId,
}

impl RunnerProcess {
    /// Spawn a runner process and wait for it to connect.
    ///
    /// Binds `{socket_dir}/{worker_id}.sock`, launches the program with the
    /// socket path in its environment and accepts one connection within
    /// `ready_timeout`. The caller performs the `ready` handshake on the
    /// returned stream.
    ///
    /// # Errors
    /// Returns SpawnError if the program cannot be launched, exits early, or
    /// does not connect in time. The child is killed in every error case.
    pub async fn spawn(
        worker_id: &WorkerId,
        spec: &SpawnConfig,
        socket_dir: &Path,
        ready_timeout: Duration,
    ) -> Result<(Self, UnixStream), SpawnError> {
        tokio::fs::create_dir_all(socket_dir)
            .await
            .map_err(|e| SpawnError::Socket {
                reason: format!("Failed to create {}: {}", socket_dir.display(), e),
            })?;

        let socket_path = socket_dir.join(format!("{}.sock", worker_id));

        // Remove stale socket from a previous run
        let _ = std::fs::remove_file(&socket_path);

        let listener = UnixListener::bind(&socket_path).map_err(|e| SpawnError::Socket {
            reason: format!("Failed to bind socket {}: {}", socket_path.display(), e),
        })?;

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .envs(&spec.environment)
            .env(SOCKET_ENV, &socket_path)
            .env(WORKER_ID_ENV, worker_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                let _ = std::fs::remove_file(&socket_path);
                if e.kind() == std::io::ErrorKind::NotFound {
                    SpawnError::ProgramNotFound {
                        program: spec.program.clone(),
                    }
                } else {
                    SpawnError::LaunchFailed {
                        program: spec.program.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let pid = child
            .id()
            .and_then(|raw| ProcessId::new(raw).ok())
            .ok_or_else(|| SpawnError::LaunchFailed {
                program: spec.program.clone(),
                reason: "process exited before its pid could be read".to_string(),
            })?;

        tracing::debug!(
            worker_id = %worker_id,
            pid = pid.value(),
            program = %spec.program,
            "Spawned runner process"
        );

        let accepted = tokio::select! {
            accepted = tokio::time::timeout(ready_timeout, listener.accept()) => accepted,
            status = child.wait() => {
                let _ = std::fs::remove_file(&socket_path);
                return Err(SpawnError::ExitedEarly {
                    worker_id: worker_id.clone(),
                    status: match status {
                        Ok(status) => status.to_string(),
                        Err(e) => e.to_string(),
                    },
                });
            }
        };

        let stream = match accepted {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                let _ = std::fs::remove_file(&socket_path);
                return Err(SpawnError::Socket {
                    reason: format!("Accept error: {}", e),
                });
            }
            Err(_) => {
                // Kill the process since it never connected
                let _ = child.kill().await;
                let _ = std::fs::remove_file(&socket_path);
                return Err(SpawnError::ReadyTimeout {
                    worker_id: worker_id.clone(),
                    timeout_ms: ready_timeout.as_millis() as u64,
                });
            }
        };

        Ok((
            Self {
                worker_id: worker_id.clone(),
                child,
                socket_path,
                pid,
            },
            stream,
        ))
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Wait up to `grace` for the process to exit on its own.
    pub async fn wait_exit(&mut self, grace: Duration) -> Option<ExitStatus> {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(worker_id = %self.worker_id, error = %e, "Failed to wait on runner");
                None
            }
            Err(_) => None,
        }
    }

    /// Send SIGTERM.
    pub fn terminate(&self) -> Result<(), TerminateError> {
        kill(Pid::from_raw(self.pid.value() as i32), Signal::SIGTERM).map_err(|e| {
            TerminateError::Signal {
                worker_id: self.worker_id.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// SIGKILL and reap.
    pub async fn kill(&mut self) -> Result<(), TerminateError> {
        self.child
            .kill()
            .await
            .map_err(|e| TerminateError::Signal {
                worker_id: self.worker_id.clone(),
                reason: format!("Failed to kill process: {}", e),
            })
    }
}

impl Drop for RunnerProcess {
    fn drop(&mut self) {
        // Clean up socket; kill_on_drop takes care of the child
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
