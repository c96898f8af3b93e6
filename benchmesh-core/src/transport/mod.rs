// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Framed RPC between the orchestrator and benchmark runners.
//!
//! - [`frame`]: length + CRC32 framing
//! - [`protocol`]: control and runner messages
//! - [`client`]: orchestrator-side client and execution streams
//! - [`session`]: runner-side helper

pub mod client;
pub mod frame;
pub mod protocol;
pub mod session;

pub use client::{CancelOutcome, ExecutionEvent, ExecutionStream, Handshake, RpcClient};
pub use frame::MAX_FRAME_SIZE;
pub use protocol::{
    ControlMessage, ProgressEvent, ReportOutcome, RunReport, RunnerMessage, PROTOCOL_VERSION,
};
pub use session::{RunnerReader, RunnerSession, RunnerWriter, SOCKET_ENV, WORKER_ID_ENV};
