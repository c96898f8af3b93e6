// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Append-only result persistence.
//!
//! One [`RunResult`] per job; a second append for the same job is rejected.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::result::{RunResult, RunStatus};
use crate::suite::BenchmarkSuite;
use crate::types::JobId;

/// Query over stored results. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultFilter {
    pub job_id: Option<JobId>,
    pub suite: Option<BenchmarkSuite>,
    /// Model name, ignoring endpoint.
    pub model: Option<String>,
    pub status: Option<RunStatus>,
    pub fingerprint: Option<String>,
    /// Results finished at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Keep only the newest `limit` matches.
    pub limit: Option<usize>,
}

impl ResultFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn suite(mut self, suite: BenchmarkSuite) -> Self {
        self.suite = Some(suite);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.fingerprint = Some(fingerprint.into());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, result: &RunResult) -> bool {
        self.job_id.map_or(true, |id| result.job_id == id)
            && self.suite.map_or(true, |suite| result.job.suite == suite)
            && self
                .model
                .as_deref()
                .map_or(true, |model| result.job.model.name() == model)
            && self.status.map_or(true, |status| result.status == status)
            && self
                .fingerprint
                .as_deref()
                .map_or(true, |fp| result.fingerprint == fp)
            && self.since.map_or(true, |since| result.finished_at >= since)
    }

    /// Filter results given in append order, applying `limit`.
    fn apply<'a>(&self, results: impl Iterator<Item = &'a RunResult>) -> Vec<RunResult> {
        let mut matched: Vec<RunResult> = results.filter(|r| self.matches(r)).cloned().collect();
        if let Some(limit) = self.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }
}

/// Where finished runs go.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a result. Fails with [`StoreError::Duplicate`] if the job already has one.
    async fn append(&self, result: RunResult) -> Result<(), StoreError>;

    /// Matching results in append order.
    async fn query(&self, filter: &ResultFilter) -> Result<Vec<RunResult>, StoreError>;
}

/// Results kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    results: RwLock<Vec<RunResult>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn append(&self, result: RunResult) -> Result<(), StoreError> {
        let mut results = self.results.write().await;
        if results.iter().any(|r| r.job_id == result.job_id) {
            return Err(StoreError::Duplicate {
                job_id: result.job_id,
            });
        }
        results.push(result);
        Ok(())
    }

    async fn query(&self, filter: &ResultFilter) -> Result<Vec<RunResult>, StoreError> {
        let results = self.results.read().await;
        Ok(filter.apply(results.iter()))
    }
}

/// Results as JSON lines in one file, one result per line.
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    /// Jobs already recorded; the lock also serializes appends.
    recorded: Mutex<HashSet<JobId>>,
}

impl JsonlStore {
    /// Open (or create on first append) the file at `path`.
    ///
    /// Existing records are scanned so duplicates are rejected across restarts.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|e| StoreError::Io {
                context: "creating results directory",
                source: e,
            })?;
        }

        let records = match read_file(&path).await? {
            Some(content) => {
                let (records, tail) = parse_records(&content)?;
                repair_tail(&path, tail).await?;
                records
            }
            None => Vec::new(),
        };
        let recorded = records.into_iter().map(|r| r.job_id).collect();

        Ok(Self {
            path,
            recorded: Mutex::new(recorded),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ResultStore for JsonlStore {
    async fn append(&self, result: RunResult) -> Result<(), StoreError> {
        let mut recorded = self.recorded.lock().await;
        if recorded.contains(&result.job_id) {
            return Err(StoreError::Duplicate {
                job_id: result.job_id,
            });
        }

        let mut line = serde_json::to_vec(&result)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::Io {
                context: "opening results file",
                source: e,
            })?;
        let start = file
            .metadata()
            .await
            .map_err(|e| StoreError::Io {
                context: "reading results file metadata",
                source: e,
            })?
            .len();
        // tokio writes in the background, so a failure may only show at flush
        let written = match file.write_all(&line).await {
            Ok(()) => file
                .flush()
                .await
                .map_err(|e| ("flushing results file", e)),
            Err(e) => Err(("appending result", e)),
        };
        if let Err((context, source)) = written {
            // Drop whatever part of the line made it to disk
            if let Err(e) = file.set_len(start).await {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to roll back partial append"
                );
            }
            return Err(StoreError::Io { context, source });
        }

        recorded.insert(result.job_id);
        tracing::debug!(job_id = %result.job_id, path = %self.path.display(), "Result appended");
        Ok(())
    }

    async fn query(&self, filter: &ResultFilter) -> Result<Vec<RunResult>, StoreError> {
        let results = read_all(&self.path).await?;
        Ok(filter.apply(results.iter()))
    }
}

/// State of the bytes after the last newline in a results file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    /// File is empty or ends with a newline.
    Clean,
    /// Last record parsed but has no trailing newline.
    Unterminated,
    /// Last line is an interrupted append; complete records end at `offset`.
    Torn { offset: u64 },
}

async fn read_file(path: &Path) -> Result<Option<String>, StoreError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io {
            context: "reading results file",
            source: e,
        }),
    }
}

async fn read_all(path: &Path) -> Result<Vec<RunResult>, StoreError> {
    let Some(content) = read_file(path).await? else {
        return Ok(Vec::new());
    };

    let (records, tail) = parse_records(&content)?;
    if let Tail::Torn { offset } = tail {
        tracing::warn!(
            path = %path.display(),
            offset,
            "Skipping interrupted record at end of results file"
        );
    }
    Ok(records)
}

/// Parse every complete line. Only the final, newline-less line may be torn.
fn parse_records(content: &str) -> Result<(Vec<RunResult>, Tail), StoreError> {
    let (body, last) = match content.rfind('\n') {
        Some(end) => content.split_at(end + 1),
        None => ("", content),
    };

    let mut records = body
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line).map_err(|e| StoreError::Corrupt {
                line: index + 1,
                reason: e.to_string(),
            })
        })
        .collect::<Result<Vec<RunResult>, _>>()?;

    if last.trim().is_empty() {
        return Ok((records, Tail::Clean));
    }

    let tail = match serde_json::from_str(last) {
        Ok(record) => {
            records.push(record);
            Tail::Unterminated
        }
        Err(_) => Tail::Torn {
            offset: body.len() as u64,
        },
    };
    Ok((records, tail))
}

/// Leave the file ending on a newline so the next append starts a fresh line.
async fn repair_tail(path: &Path, tail: Tail) -> Result<(), StoreError> {
    let open_err = |e| StoreError::Io {
        context: "opening results file for repair",
        source: e,
    };

    match tail {
        Tail::Clean => Ok(()),
        Tail::Torn { offset } => {
            tracing::warn!(
                path = %path.display(),
                offset,
                "Truncating interrupted record at end of results file"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(open_err)?;
            file.set_len(offset).await.map_err(|e| StoreError::Io {
                context: "truncating results file",
                source: e,
            })
        }
        Tail::Unterminated => {
            let mut file = OpenOptions::new()
                .append(true)
                .open(path)
                .await
                .map_err(open_err)?;
            file.write_all(b"\n").await.map_err(|e| StoreError::Io {
                context: "terminating last record",
                source: e,
            })?;
            file.flush().await.map_err(|e| StoreError::Io {
                context: "flushing results file",
                source: e,
            })
        }
    }
}
