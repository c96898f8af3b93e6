// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Benchmark jobs: the unit of work the scheduler dispatches.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::HardValidationError;
use crate::suite::BenchmarkSuite;
use crate::types::{JobId, ModelTarget};

/// A request to run one benchmark suite against one model.
///
/// Immutable once submitted; the scheduler shares it behind an `Arc` and
/// embeds a snapshot in the final `RunResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkJob {
    pub id: JobId,
    pub suite: BenchmarkSuite,
    pub model: ModelTarget,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl BenchmarkJob {
    pub fn new(suite: BenchmarkSuite, model: ModelTarget) -> Self {
        Self {
            id: JobId::new(),
            suite,
            model,
            parameters: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Builder-style parameter setter.
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Validate the parameters for this job's suite.
    pub fn validate(&self) -> Result<(), HardValidationError> {
        self.suite.validate_parameters(&self.parameters)
    }

    /// Hex SHA-256 over suite, model and parameters.
    ///
    /// Two jobs with identical configuration share a fingerprint regardless
    /// of id or creation time. `BTreeMap` keeps parameter order canonical.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!({
            "suite": self.suite,
            "model": self.model,
            "parameters": self.parameters,
        });

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}
