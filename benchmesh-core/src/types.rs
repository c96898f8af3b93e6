// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HardValidationError;

/// Maximum length of worker identifiers.
const MAX_WORKER_ID_LEN: usize = 64;
/// Maximum length of model names.
const MAX_MODEL_NAME_LEN: usize = 128;

/// Unique identifier of a benchmark job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generate a fresh random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = HardValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| HardValidationError::InvalidFieldValue {
                field: "job_id",
                value: s.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Validated worker identifier.
/// Must be non-empty, alphanumeric with hyphens/underscores/dots, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a new WorkerId with validation.
    pub fn new(id: impl Into<String>) -> Result<Self, HardValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "worker_id",
                value: id,
                reason: "Worker ID cannot be empty".to_string(),
            });
        }

        if id.len() > MAX_WORKER_ID_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "worker_id",
                value: id.clone(),
                reason: format!(
                    "Worker ID too long: {} chars (max {})",
                    id.len(),
                    MAX_WORKER_ID_LEN
                ),
            });
        }

        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(HardValidationError::InvalidFieldValue {
                field: "worker_id",
                value: id,
                reason: "Worker ID must contain only alphanumeric characters, hyphens, underscores and dots".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for WorkerId {
    type Error = HardValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WorkerId> for String {
    fn from(id: WorkerId) -> Self {
        id.0
    }
}

/// Validated process ID of a spawned runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(u32);

impl ProcessId {
    /// Create a new ProcessId with validation.
    pub fn new(pid: u32) -> Result<Self, HardValidationError> {
        if pid == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "process_id",
                value: "0".to_string(),
                reason: "Process ID 0 is reserved".to_string(),
            });
        }
        Ok(Self(pid))
    }

    /// Get the inner PID value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The model a benchmark targets: a model name and an optional API endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelTarget {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    endpoint: Option<String>,
}

impl ModelTarget {
    /// Create a model target with validation.
    ///
    /// The name must be non-empty without whitespace; an endpoint, when given,
    /// must be an http(s) URL.
    pub fn new(
        name: impl Into<String>,
        endpoint: Option<String>,
    ) -> Result<Self, HardValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > MAX_MODEL_NAME_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "model",
                value: name,
                reason: format!("Model name must be 1-{} characters", MAX_MODEL_NAME_LEN),
            });
        }

        if name.chars().any(char::is_whitespace) {
            return Err(HardValidationError::InvalidFieldValue {
                field: "model",
                value: name,
                reason: "Model name cannot contain whitespace".to_string(),
            });
        }

        if let Some(url) = &endpoint {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "endpoint",
                    value: url.clone(),
                    reason: "Endpoint must be an http:// or https:// URL".to_string(),
                });
            }
        }

        Ok(Self { name, endpoint })
    }

    /// Model name, e.g. `gpt-3.5-turbo`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// API endpoint the runner should call, if not the runner's default.
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

impl fmt::Display for ModelTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Some(url) => write!(f, "{}@{}", self.name, url),
            None => write!(f, "{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_parse() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<JobId>().is_err());
    }

    #[test]
    fn test_worker_id_valid() {
        assert!(WorkerId::new("local-0").is_ok());
        assert!(WorkerId::new("gpu_box.2").is_ok());
    }

    #[test]
    fn test_worker_id_invalid() {
        assert!(WorkerId::new("").is_err());
        assert!(WorkerId::new("a".repeat(65)).is_err());
        assert!(WorkerId::new("worker one").is_err());
        assert!(WorkerId::new("worker@host").is_err());
    }

    #[test]
    fn test_process_id_invalid() {
        assert!(ProcessId::new(0).is_err());
        assert_eq!(ProcessId::new(42).unwrap().value(), 42);
    }

    #[test]
    fn test_model_target() {
        let model = ModelTarget::new("gpt-3.5-turbo", None).unwrap();
        assert_eq!(model.to_string(), "gpt-3.5-turbo");

        let model =
            ModelTarget::new("llama-3-8b", Some("http://localhost:8000/v1".into())).unwrap();
        assert_eq!(model.endpoint(), Some("http://localhost:8000/v1"));

        assert!(ModelTarget::new("", None).is_err());
        assert!(ModelTarget::new("gpt 4", None).is_err());
        assert!(ModelTarget::new("gpt-4", Some("localhost:8000".into())).is_err());
    }
}
