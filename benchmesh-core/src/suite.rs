// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Benchmark suites and the worker capabilities they require.
//!
//! The suite set is closed: each variant resolves at dispatch time to a
//! [`Capability`] a worker must advertise and a [`SuiteProfile`] describing
//! its parameters and default timeout.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HardValidationError;

/// A feature a worker advertises in its READY handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Embedding models (retrieval, clustering, STS).
    Embedding,
    /// Text generation / chat completion.
    Generation,
    /// Sandboxed execution of generated code.
    CodeExecution,
    /// Request load generation against a serving endpoint.
    LoadTest,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Embedding,
        Capability::Generation,
        Capability::CodeExecution,
        Capability::LoadTest,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Generation => "generation",
            Self::CodeExecution => "code_execution",
            Self::LoadTest => "load_test",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Capability {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.name() == s)
            .ok_or_else(|| HardValidationError::UnknownCapability {
                name: s.to_string(),
            })
    }
}

/// Benchmark suites the orchestrator knows how to dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkSuite {
    /// Massive Text Embedding Benchmark.
    Mteb,
    /// Massive Multitask Language Understanding.
    Mmlu,
    /// Functional correctness of generated Python.
    HumanEval,
    /// Grade-school math word problems.
    Gsm8k,
    /// Serving throughput / latency under load.
    Throughput,
}

/// Dispatch-time description of a suite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteProfile {
    pub capability: Capability,
    pub required_parameters: &'static [&'static str],
    pub default_timeout: Duration,
}

const HOUR: Duration = Duration::from_secs(60 * 60);

impl BenchmarkSuite {
    pub const ALL: [BenchmarkSuite; 5] = [
        BenchmarkSuite::Mteb,
        BenchmarkSuite::Mmlu,
        BenchmarkSuite::HumanEval,
        BenchmarkSuite::Gsm8k,
        BenchmarkSuite::Throughput,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mteb => "mteb",
            Self::Mmlu => "mmlu",
            Self::HumanEval => "human_eval",
            Self::Gsm8k => "gsm8k",
            Self::Throughput => "throughput",
        }
    }

    /// Capability a worker must advertise to run this suite.
    pub const fn capability(&self) -> Capability {
        match self {
            Self::Mteb => Capability::Embedding,
            Self::Mmlu | Self::Gsm8k => Capability::Generation,
            Self::HumanEval => Capability::CodeExecution,
            Self::Throughput => Capability::LoadTest,
        }
    }

    pub fn profile(&self) -> SuiteProfile {
        let (required_parameters, default_timeout): (&'static [&'static str], Duration) =
            match self {
                Self::Mteb => (&[], 2 * HOUR),
                Self::Mmlu | Self::HumanEval | Self::Gsm8k => (&[], HOUR),
                Self::Throughput => (&["requests"], HOUR / 2),
            };

        SuiteProfile {
            capability: self.capability(),
            required_parameters,
            default_timeout,
        }
    }

    /// Check a job's parameters against this suite.
    ///
    /// Required parameters must be present. Known numeric parameters must hold
    /// integers in range. Anything else is passed through to the runner.
    pub fn validate_parameters(
        &self,
        parameters: &BTreeMap<String, Value>,
    ) -> Result<(), HardValidationError> {
        for &required in self.profile().required_parameters {
            if !parameters.contains_key(required) {
                return Err(HardValidationError::MissingParameter {
                    suite: *self,
                    parameter: required,
                });
            }
        }

        for (key, value) in parameters {
            let minimum = match key.as_str() {
                "requests" | "concurrency" | "samples_per_task" => 1,
                "shots" => 0,
                _ => continue,
            };

            match value.as_u64() {
                Some(n) if n >= minimum => {}
                _ => {
                    return Err(HardValidationError::InvalidParameter {
                        suite: *self,
                        parameter: key.clone(),
                        reason: format!("expected an integer >= {}, got {}", minimum, value),
                    })
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for BenchmarkSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BenchmarkSuite {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.to_ascii_lowercase().replace('-', "_");
        BenchmarkSuite::ALL
            .into_iter()
            .find(|suite| suite.name() == normalized)
            .ok_or_else(|| HardValidationError::UnknownSuite {
                name: s.to_string(),
            })
    }
}
