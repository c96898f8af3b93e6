// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Minimal HTTP endpoint for the core's Prometheus collectors.
//!
//! `GET /metrics` returns the text exposition and `GET /healthz` a liveness
//! line. Anything else gets a 404 or 405.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on the request head we are willing to read.
const MAX_REQUEST_HEAD: u64 = 8 * 1024;

const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Bind the metrics port and serve it from a background task.
///
/// Returns the bound address; port 0 picks a free one.
pub async fn start_metrics_server(port: u16) -> io::Result<SocketAddr> {
    benchmesh_core::metrics::init();

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Metrics endpoint listening");

    tokio::spawn(accept_loop(listener));
    Ok(addr)
}

async fn accept_loop(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                tokio::spawn(async move {
                    if let Err(e) = handle(socket).await {
                        tracing::debug!(peer = %peer, error = %e, "Metrics request failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "Metrics accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn handle(socket: TcpStream) -> io::Result<()> {
    let (read, mut write) = socket.into_split();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_HEAD));

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    // Drain the headers so closing does not reset the connection
    let mut header = String::new();
    loop {
        header.clear();
        if reader.read_line(&mut header).await? == 0 || header.trim().is_empty() {
            break;
        }
    }

    let response = Response::for_request(&request_line);
    write.write_all(response.encode().as_bytes()).await?;
    write.shutdown().await
}

#[derive(Debug, PartialEq, Eq)]
struct Response {
    status: &'static str,
    content_type: &'static str,
    body: String,
}

impl Response {
    fn for_request(request_line: &str) -> Self {
        let mut parts = request_line.split_whitespace();
        let (method, target) = (parts.next(), parts.next());

        // Query strings are ignored
        let path = target.map(|t| t.split('?').next().unwrap_or(t));

        match (method, path) {
            (Some("GET"), Some("/metrics")) => Self {
                status: "200 OK",
                content_type: EXPOSITION_CONTENT_TYPE,
                body: benchmesh_core::metrics::render(),
            },
            (Some("GET"), Some("/healthz")) => Self::text("200 OK", "ok\n"),
            (Some("GET"), Some(_)) => Self::text("404 Not Found", "not found\n"),
            (Some(_), Some(_)) => Self::text("405 Method Not Allowed", "method not allowed\n"),
            _ => Self::text("400 Bad Request", "bad request\n"),
        }
    }

    fn text(status: &'static str, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.to_string(),
        }
    }

    fn encode(&self) -> String {
        format!(
            "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            self.status,
            self.content_type,
            self.body.len(),
            self.body
        )
    }
}
