// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Orchestrator side of the runner connection.
//!
//! One reader task demultiplexes inbound frames (health replies, stop
//! acknowledgements, execution events) and one writer task serializes
//! outbound control messages. A connection serves one execution at a time.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{SpawnError, TransportError};
use crate::job::BenchmarkJob;
use crate::suite::Capability;
use crate::transport::frame::{read_frame, write_frame};
use crate::transport::protocol::{
    ControlMessage, ProgressEvent, RunReport, RunnerMessage, PROTOCOL_VERSION,
};
use crate::types::{JobId, WorkerId};

/// What the runner announced in its `ready` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub runner: String,
    pub capabilities: Vec<Capability>,
    pub protocol_version: u32,
}

/// Events yielded by an [`ExecutionStream`], in execution order.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Started,
    Progress(ProgressEvent),
    /// Terminal.
    Finished(RunReport),
    /// Terminal. The runner refused the job before starting it.
    Rejected(String),
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Rejected(_))
    }
}

/// How a cancelled execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The runner confirmed with `stopped`.
    Acknowledged,
    /// No `stopped` within the grace period.
    TimedOut,
    /// The connection dropped before the runner confirmed.
    ConnectionLost,
}

type EventSender = mpsc::UnboundedSender<Result<RunnerMessage, TransportError>>;
type EventReceiver = mpsc::UnboundedReceiver<Result<RunnerMessage, TransportError>>;

struct ActiveExecution {
    job_id: JobId,
    events: EventSender,
}

#[derive(Default)]
struct ClientState {
    active: Option<ActiveExecution>,
    pings: HashMap<u64, oneshot::Sender<()>>,
    stop_acks: HashMap<JobId, oneshot::Sender<()>>,
}

struct Shared {
    worker_id: WorkerId,
    closed: AtomicBool,
    closed_signal: watch::Sender<bool>,
    state: Mutex<ClientState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the connection dead and fail everything waiting on it.
    fn close(&self, reason: &str) {
        let mut state = self.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        tracing::debug!(worker_id = %self.worker_id, reason, "Runner connection closed");
        self.closed_signal.send_replace(true);

        if let Some(active) = state.active.take() {
            let _ = active
                .events
                .send(Err(TransportError::connection_lost(reason)));
        }
        // Dropping the senders wakes every waiter with a RecvError.
        state.pings.clear();
        state.stop_acks.clear();
    }

    fn dispatch(&self, message: RunnerMessage) {
        let mut state = self.lock();

        let job_id = match &message {
            RunnerMessage::HealthOk { nonce } => {
                if let Some(tx) = state.pings.remove(nonce) {
                    let _ = tx.send(());
                } else {
                    tracing::debug!(worker_id = %self.worker_id, nonce, "Late health_ok ignored");
                }
                return;
            }
            RunnerMessage::Stopped { job_id } => {
                if state.active.as_ref().is_some_and(|a| a.job_id == *job_id) {
                    state.active = None;
                }
                if let Some(tx) = state.stop_acks.remove(job_id) {
                    let _ = tx.send(());
                }
                return;
            }
            RunnerMessage::Ready { .. } => {
                tracing::warn!(worker_id = %self.worker_id, "Unexpected ready after handshake");
                if let Some(active) = state.active.take() {
                    let _ = active.events.send(Err(TransportError::protocol(
                        "unexpected ready after handshake",
                    )));
                }
                return;
            }
            RunnerMessage::Started { job_id }
            | RunnerMessage::Progress { job_id, .. }
            | RunnerMessage::Finished { job_id, .. }
            | RunnerMessage::Rejected { job_id, .. } => *job_id,
        };

        let terminal = matches!(
            message,
            RunnerMessage::Finished { .. } | RunnerMessage::Rejected { .. }
        );

        match state.active.as_ref() {
            Some(active) if active.job_id == job_id => {
                let _ = active.events.send(Ok(message));
                if terminal {
                    state.active = None;
                }
            }
            _ => {
                tracing::debug!(
                    worker_id = %self.worker_id,
                    job_id = %job_id,
                    kind = message.kind(),
                    "Event for inactive job ignored"
                );
            }
        }
    }

    /// Deliver a non-fatal frame error to the active execution, if any.
    fn fail_active(&self, error: TransportError) {
        let mut state = self.lock();
        if let Some(active) = state.active.take() {
            let _ = active.events.send(Err(error));
        }
    }

    fn clear_active(&self, job_id: JobId) {
        let mut state = self.lock();
        if state.active.as_ref().is_some_and(|a| a.job_id == job_id) {
            state.active = None;
        }
    }
}

/// Cloneable sending half shared by the client and its execution streams.
#[derive(Clone)]
struct Link {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<ControlMessage>,
}

impl Link {
    fn send(&self, message: ControlMessage) -> Result<(), TransportError> {
        if self.shared.is_closed() {
            return Err(TransportError::connection_lost("connection already closed"));
        }
        self.outbound
            .send(message)
            .map_err(|_| TransportError::connection_lost("writer task stopped"))
    }

    /// Detach the stream from the connection and tell the runner to stop.
    fn abandon(&self, job_id: JobId) {
        self.shared.clear_active(job_id);
        if let Err(e) = self.send(ControlMessage::Stop { job_id }) {
            tracing::debug!(job_id = %job_id, error = %e, "Could not send stop for abandoned job");
        }
    }
}

/// RPC client for one runner connection.
pub struct RpcClient {
    link: Link,
    next_nonce: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RpcClient {
    /// Wait for the runner's `ready` on a fresh connection and start the I/O tasks.
    pub async fn handshake<S>(
        io: S,
        worker_id: WorkerId,
        ready_timeout: Duration,
    ) -> Result<(Self, Handshake), SpawnError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(io);

        let first = tokio::time::timeout(ready_timeout, read_frame::<_, RunnerMessage>(&mut reader))
            .await
            .map_err(|_| SpawnError::ReadyTimeout {
                worker_id: worker_id.clone(),
                timeout_ms: ready_timeout.as_millis() as u64,
            })?
            .map_err(|e| SpawnError::Handshake {
                reason: format!("reading ready: {}", e),
            })?;

        let handshake = match first {
            RunnerMessage::Ready {
                runner,
                capabilities,
                protocol_version,
            } => Handshake {
                runner,
                capabilities,
                protocol_version,
            },
            other => {
                return Err(SpawnError::Handshake {
                    reason: format!("expected ready, got {}", other.kind()),
                })
            }
        };

        if handshake.protocol_version != PROTOCOL_VERSION {
            return Err(SpawnError::Handshake {
                reason: format!(
                    "protocol version mismatch: runner speaks {}, orchestrator speaks {}",
                    handshake.protocol_version, PROTOCOL_VERSION
                ),
            });
        }

        tracing::debug!(
            worker_id = %worker_id,
            runner = %handshake.runner,
            capabilities = ?handshake.capabilities,
            "Runner ready"
        );

        let shared = Arc::new(Shared {
            worker_id,
            closed: AtomicBool::new(false),
            closed_signal: watch::channel(false).0,
            state: Mutex::new(ClientState::default()),
        });
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ControlMessage>();

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame::<_, RunnerMessage>(&mut reader).await {
                    Ok(message) => {
                        tracing::trace!(
                            worker_id = %reader_shared.worker_id,
                            kind = message.kind(),
                            "Frame received"
                        );
                        reader_shared.dispatch(message);
                    }
                    Err(e) if !e.is_fatal() => {
                        tracing::warn!(
                            worker_id = %reader_shared.worker_id,
                            error = %e,
                            "Protocol error on runner connection"
                        );
                        reader_shared.fail_active(TransportError::protocol(e.to_string()));
                    }
                    Err(e) => {
                        reader_shared.close(&e.to_string());
                        break;
                    }
                }
            }
        });

        let writer_shared = Arc::clone(&shared);
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if let Err(e) = write_frame(&mut writer, &message).await {
                    writer_shared.close(&format!("write failed: {}", e));
                    break;
                }
            }
        });

        let client = Self {
            link: Link { shared, outbound },
            next_nonce: AtomicU64::new(1),
            reader,
            writer,
        };

        Ok((client, handshake))
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.link.shared.worker_id
    }

    pub fn is_closed(&self) -> bool {
        self.link.shared.is_closed()
    }

    /// Resolves once the connection is closed, by either side.
    pub async fn closed(&self) {
        let mut rx = self.link.shared.closed_signal.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Tear the connection down without waiting for the runner.
    pub fn abort(&self) {
        self.link.shared.close("aborted by orchestrator");
        self.reader.abort();
        self.writer.abort();
    }

    /// Job currently bound to this connection, if any.
    pub fn active_job(&self) -> Option<JobId> {
        self.link.shared.lock().active.as_ref().map(|a| a.job_id)
    }

    /// Send `health_check` and wait for the matching `health_ok`.
    ///
    /// Returns the round-trip latency.
    pub async fn health_check(&self, timeout: Duration) -> Result<Duration, TransportError> {
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.link.shared.lock();
            if self.link.shared.is_closed() {
                return Err(TransportError::connection_lost("connection already closed"));
            }
            state.pings.insert(nonce, tx);
        }

        let sent_at = Instant::now();
        if let Err(e) = self.link.send(ControlMessage::HealthCheck { nonce }) {
            self.link.shared.lock().pings.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(sent_at.elapsed()),
            Ok(Err(_)) => Err(TransportError::connection_lost(
                "connection closed awaiting health_ok",
            )),
            Err(_) => {
                self.link.shared.lock().pings.remove(&nonce);
                Err(TransportError::Timeout {
                    operation: "health_check",
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send `start` and return the job's event stream.
    ///
    /// Fails with [`TransportError::Busy`] while another execution is bound.
    pub fn start(&self, job: &BenchmarkJob) -> Result<ExecutionStream, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();

        {
            let mut state = self.link.shared.lock();
            if self.link.shared.is_closed() {
                return Err(TransportError::connection_lost("connection already closed"));
            }
            if let Some(active) = &state.active {
                return Err(TransportError::Busy {
                    worker_id: self.link.shared.worker_id.clone(),
                    job_id: active.job_id,
                });
            }
            state.active = Some(ActiveExecution {
                job_id: job.id,
                events: tx,
            });
        }

        if let Err(e) = self.link.send(ControlMessage::Start { job: job.clone() }) {
            self.link.shared.clear_active(job.id);
            return Err(e);
        }

        tracing::debug!(worker_id = %self.worker_id(), job_id = %job.id, "Start sent");

        Ok(ExecutionStream {
            job_id: job.id,
            link: self.link.clone(),
            events: rx,
            started: false,
            last_seq: None,
            finished: false,
        })
    }

    /// Ask the runner to exit.
    pub fn goodbye(&self) -> Result<(), TransportError> {
        self.link.send(ControlMessage::Goodbye)
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.reader.abort();
        // The writer drains queued messages (e.g. goodbye) once the last
        // sender is gone, then drops its half of the connection.
        if self.link.shared.is_closed() {
            self.writer.abort();
        }
    }
}

/// Lazy, one-shot sequence of events for a single execution.
///
/// Ends after the terminal event or the first error. Dropping an unfinished
/// stream sends `stop` to the runner.
pub struct ExecutionStream {
    job_id: JobId,
    link: Link,
    events: EventReceiver,
    started: bool,
    last_seq: Option<u64>,
    finished: bool,
}

impl ExecutionStream {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Abort the remote execution and wait up to `grace` for `stopped`.
    pub async fn cancel(mut self, grace: Duration) -> CancelOutcome {
        let job_id = self.job_id;
        let (tx, rx) = oneshot::channel();

        {
            let mut state = self.link.shared.lock();
            if self.link.shared.is_closed() {
                self.finished = true;
                return CancelOutcome::ConnectionLost;
            }
            state.stop_acks.insert(job_id, tx);
        }

        self.link.shared.clear_active(job_id);
        self.finished = true;

        if self.link.send(ControlMessage::Stop { job_id }).is_err() {
            return CancelOutcome::ConnectionLost;
        }

        match tokio::time::timeout(grace, rx).await {
            Ok(Ok(())) => CancelOutcome::Acknowledged,
            Ok(Err(_)) => CancelOutcome::ConnectionLost,
            Err(_) => {
                self.link.shared.lock().stop_acks.remove(&job_id);
                CancelOutcome::TimedOut
            }
        }
    }

    fn check(&mut self, message: RunnerMessage) -> Result<ExecutionEvent, TransportError> {
        match message {
            RunnerMessage::Started { .. } => {
                if self.started {
                    return Err(TransportError::protocol("duplicate started"));
                }
                self.started = true;
                Ok(ExecutionEvent::Started)
            }
            RunnerMessage::Progress { event, .. } => {
                if !self.started {
                    return Err(TransportError::protocol("progress before started"));
                }
                if let Some(last) = self.last_seq {
                    if event.seq <= last {
                        return Err(TransportError::protocol(format!(
                            "progress seq regressed from {} to {}",
                            last, event.seq
                        )));
                    }
                }
                self.last_seq = Some(event.seq);
                Ok(ExecutionEvent::Progress(event))
            }
            RunnerMessage::Finished { report, .. } => {
                if !self.started {
                    return Err(TransportError::protocol("finished before started"));
                }
                Ok(ExecutionEvent::Finished(report))
            }
            RunnerMessage::Rejected { reason, .. } => {
                if self.started {
                    return Err(TransportError::protocol("rejected after started"));
                }
                Ok(ExecutionEvent::Rejected(reason))
            }
            other => Err(TransportError::protocol(format!(
                "unexpected {} in execution stream",
                other.kind()
            ))),
        }
    }
}

impl Stream for ExecutionStream {
    type Item = Result<ExecutionEvent, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let item = match this.events.poll_recv(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(None) => Err(TransportError::connection_lost("execution channel closed")),
            Poll::Ready(Some(Err(e))) => Err(e),
            Poll::Ready(Some(Ok(message))) => this.check(message),
        };

        match &item {
            Ok(event) if !event.is_terminal() => {}
            Ok(_) => this.finished = true,
            Err(e) => {
                this.finished = true;
                if !e.is_transient() {
                    tracing::warn!(job_id = %this.job_id, error = %e, "Execution stream protocol error");
                    this.link.abandon(this.job_id);
                }
            }
        }

        Poll::Ready(Some(item))
    }
}

impl Drop for ExecutionStream {
    fn drop(&mut self) {
        if !self.finished {
            self.link.abandon(self.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::suite::BenchmarkSuite;
    use crate::transport::frame::write_payload;
    use crate::types::ModelTarget;
    use futures::StreamExt;
    use tokio::io::DuplexStream;

    fn worker_id() -> WorkerId {
        WorkerId::new("test-0").unwrap()
    }

    fn job() -> BenchmarkJob {
        BenchmarkJob::new(
            BenchmarkSuite::Mteb,
            ModelTarget::new("gpt-3.5-turbo", None).unwrap(),
        )
    }

    async fn ready(runner: &mut DuplexStream, version: u32) {
        write_frame(
            runner,
            &RunnerMessage::Ready {
                runner: "fake".to_string(),
                capabilities: vec![Capability::Embedding],
                protocol_version: version,
            },
        )
        .await
        .unwrap();
    }

    async fn connect() -> (RpcClient, DuplexStream) {
        let (core, mut runner) = tokio::io::duplex(64 * 1024);
        ready(&mut runner, PROTOCOL_VERSION).await;
        let (client, handshake) = RpcClient::handshake(core, worker_id(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(handshake.capabilities, vec![Capability::Embedding]);
        (client, runner)
    }

    #[tokio::test]
    async fn test_handshake_version_mismatch() {
        let (core, mut runner) = tokio::io::duplex(4096);
        ready(&mut runner, PROTOCOL_VERSION + 1).await;
        let result = RpcClient::handshake(core, worker_id(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(SpawnError::Handshake { .. })));
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let (core, _runner) = tokio::io::duplex(4096);
        let result = RpcClient::handshake(core, worker_id(), Duration::from_millis(20)).await;
        assert!(matches!(result, Err(SpawnError::ReadyTimeout { .. })));
    }

    #[tokio::test]
    async fn test_health_check_round_trip() {
        let (client, mut runner) = connect().await;

        let responder = tokio::spawn(async move {
            let msg: ControlMessage = read_frame(&mut runner).await.unwrap();
            let ControlMessage::HealthCheck { nonce } = msg else {
                panic!("expected health_check, got {:?}", msg);
            };
            write_frame(&mut runner, &RunnerMessage::HealthOk { nonce })
                .await
                .unwrap();
            runner
        });

        assert!(client.health_check(Duration::from_secs(1)).await.is_ok());
        let _runner = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_timeout() {
        let (client, _runner) = connect().await;
        let err = client
            .health_check(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_execution_stream_happy_path() {
        let (client, mut runner) = connect().await;
        let job = job();
        let mut stream = client.start(&job).unwrap();

        let msg: ControlMessage = read_frame(&mut runner).await.unwrap();
        assert!(matches!(msg, ControlMessage::Start { .. }));

        for message in [
            RunnerMessage::Started { job_id: job.id },
            RunnerMessage::Progress {
                job_id: job.id,
                event: ProgressEvent::new(1, 1, Some(2)),
            },
            RunnerMessage::Finished {
                job_id: job.id,
                report: RunReport::success(serde_json::json!({"score": 0.9})),
            },
        ] {
            write_frame(&mut runner, &message).await.unwrap();
        }

        let events: Vec<_> = (&mut stream).collect().await;
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], Ok(ExecutionEvent::Started)));
        assert!(matches!(events[2], Ok(ExecutionEvent::Finished(_))));
        assert!(stream.is_finished());
        assert_eq!(client.active_job(), None);
    }

    #[tokio::test]
    async fn test_busy_connection() {
        let (client, _runner) = connect().await;
        let _stream = client.start(&job()).unwrap();
        let err = client.start(&job()).err().unwrap();
        assert!(matches!(err, TransportError::Busy { .. }));
    }

    #[tokio::test]
    async fn test_seq_regression_is_protocol_error() {
        let (client, mut runner) = connect().await;
        let job = job();
        let mut stream = client.start(&job).unwrap();
        let _: ControlMessage = read_frame(&mut runner).await.unwrap();

        write_frame(&mut runner, &RunnerMessage::Started { job_id: job.id })
            .await
            .unwrap();
        for seq in [2, 1] {
            write_frame(
                &mut runner,
                &RunnerMessage::Progress {
                    job_id: job.id,
                    event: ProgressEvent::new(seq, seq, None),
                },
            )
            .await
            .unwrap();
        }

        assert!(matches!(stream.next().await, Some(Ok(ExecutionEvent::Started))));
        assert!(matches!(stream.next().await, Some(Ok(ExecutionEvent::Progress(_)))));
        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::Protocol { .. }))
        ));
        assert!(stream.next().await.is_none());

        // The stream abandoned the job: the runner is told to stop.
        let msg: ControlMessage = read_frame(&mut runner).await.unwrap();
        assert_eq!(msg, ControlMessage::Stop { job_id: job.id });
    }

    #[tokio::test]
    async fn test_corrupt_frame_fails_job_not_connection() {
        let (client, mut runner) = connect().await;
        let job = job();
        let mut stream = client.start(&job).unwrap();
        let _: ControlMessage = read_frame(&mut runner).await.unwrap();

        write_payload(&mut runner, b"{ not json").await.unwrap();

        assert!(matches!(
            stream.next().await,
            Some(Err(TransportError::Protocol { .. }))
        ));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_connection_lost_mid_stream() {
        let (client, mut runner) = connect().await;
        let job = job();
        let mut stream = client.start(&job).unwrap();
        let _: ControlMessage = read_frame(&mut runner).await.unwrap();
        write_frame(&mut runner, &RunnerMessage::Started { job_id: job.id })
            .await
            .unwrap();
        drop(runner);

        assert!(matches!(stream.next().await, Some(Ok(ExecutionEvent::Started))));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(err.is_transient());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_acknowledged() {
        let (client, mut runner) = connect().await;
        let job = job();
        let stream = client.start(&job).unwrap();
        let _: ControlMessage = read_frame(&mut runner).await.unwrap();

        let responder = tokio::spawn(async move {
            let msg: ControlMessage = read_frame(&mut runner).await.unwrap();
            let ControlMessage::Stop { job_id } = msg else {
                panic!("expected stop, got {:?}", msg);
            };
            write_frame(&mut runner, &RunnerMessage::Stopped { job_id })
                .await
                .unwrap();
            runner
        });

        let outcome = stream.cancel(Duration::from_secs(1)).await;
        assert_eq!(outcome, CancelOutcome::Acknowledged);
        assert_eq!(client.active_job(), None);
        let _runner = responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_times_out() {
        let (client, _runner) = connect().await;
        let stream = client.start(&job()).unwrap();
        let outcome = stream.cancel(Duration::from_millis(20)).await;
        assert_eq!(outcome, CancelOutcome::TimedOut);
    }
}
