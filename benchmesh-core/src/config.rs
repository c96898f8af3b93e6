// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Validates orchestrator settings and worker templates at start-up.
//! Any invalid field results in a HardValidationError that prevents startup.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BenchError, BenchResult, HardValidationError};
use crate::registry::{Backpressure, RegistryOptions};
use crate::retry::RetryPolicy;
use crate::scheduler::SchedulerOptions;
use crate::suite::Capability;
use crate::types::WorkerId;
use crate::worker::LaunchOptions;

/// Upper bound on concurrently live workers.
const MAX_POOL_SIZE: usize = 256;
/// Upper bound on retries per job.
const MAX_RETRIES: u32 = 100;
const MAX_TEMPLATE_NAME_LEN: usize = 48;

/// Raw worker template as parsed from YAML (before validation).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawWorkerConfig {
    name: String,
    #[serde(default)]
    capabilities: Vec<String>,
    spawn: Option<RawSpawnConfig>,
    connect: Option<RawConnectConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSpawnConfig {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    environment: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnectConfig {
    address: String,
}

/// Raw orchestrator configuration.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOrchestratorConfig {
    #[serde(default = "default_pool_size")]
    pool_size: usize,
    #[serde(default = "default_backpressure")]
    backpressure: String,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    retry_backoff_ms: u64,
    #[serde(default = "default_max_retry_backoff_ms")]
    max_retry_backoff_ms: u64,
    #[serde(default = "default_health_check_interval_ms")]
    health_check_interval_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    ping_timeout_ms: u64,
    #[serde(default = "default_ready_timeout_ms")]
    ready_timeout_ms: u64,
    #[serde(default = "default_cancel_grace_ms")]
    cancel_grace_ms: u64,
    #[serde(default = "default_terminate_grace_ms")]
    terminate_grace_ms: u64,
    #[serde(default)]
    job_timeout_ms: Option<u64>,
    #[serde(default = "default_retain_finished_jobs")]
    retain_finished_jobs: usize,
    #[serde(default = "default_socket_dir")]
    socket_dir: String,
    #[serde(default = "default_results_path")]
    results_path: String,
}

fn default_pool_size() -> usize {
    4
}

fn default_backpressure() -> String {
    "block".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_max_retry_backoff_ms() -> u64 {
    30_000
}

fn default_health_check_interval_ms() -> u64 {
    5_000
}

fn default_ping_timeout_ms() -> u64 {
    2_000
}

fn default_ready_timeout_ms() -> u64 {
    30_000
}

fn default_cancel_grace_ms() -> u64 {
    10_000
}

fn default_terminate_grace_ms() -> u64 {
    5_000
}

fn default_retain_finished_jobs() -> usize {
    256
}

fn default_socket_dir() -> String {
    "/tmp/benchmesh".to_string()
}

fn default_results_path() -> String {
    "benchmesh-results.jsonl".to_string()
}

impl Default for RawOrchestratorConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            backpressure: default_backpressure(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retry_backoff_ms: default_max_retry_backoff_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ready_timeout_ms: default_ready_timeout_ms(),
            cancel_grace_ms: default_cancel_grace_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            job_timeout_ms: None,
            retain_finished_jobs: default_retain_finished_jobs(),
            socket_dir: default_socket_dir(),
            results_path: default_results_path(),
        }
    }
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    orchestrator: RawOrchestratorConfig,
    #[serde(default)]
    workers: Vec<RawWorkerConfig>,
}

/// How to launch a runner process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub program: String,
    pub args: Vec<String>,
    pub environment: HashMap<String, String>,
}

/// How a worker is reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointConfig {
    /// Spawn a local runner process per worker.
    Spawn(SpawnConfig),
    /// Attach to a runner already listening on `host:port`.
    Connect { address: String },
}

/// Validated worker template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerTemplate {
    pub name: WorkerId,
    pub capabilities: Vec<Capability>,
    pub endpoint: EndpointConfig,
}

impl WorkerTemplate {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Attached endpoints hold a single session at a time.
    pub fn is_attached(&self) -> bool {
        matches!(self.endpoint, EndpointConfig::Connect { .. })
    }
}

/// Validated orchestrator configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub pool_size: usize,
    pub backpressure: Backpressure,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub max_retry_backoff: Duration,
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
    pub ready_timeout: Duration,
    pub cancel_grace: Duration,
    pub terminate_grace: Duration,
    pub job_timeout: Option<Duration>,
    /// Finished jobs kept queryable by the scheduler.
    pub retain_finished_jobs: usize,
    pub socket_dir: PathBuf,
    pub results_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let ms = Duration::from_millis;
        Self {
            pool_size: default_pool_size(),
            backpressure: Backpressure::Block,
            max_retries: default_max_retries(),
            retry_backoff: ms(default_retry_backoff_ms()),
            max_retry_backoff: ms(default_max_retry_backoff_ms()),
            health_check_interval: ms(default_health_check_interval_ms()),
            ping_timeout: ms(default_ping_timeout_ms()),
            ready_timeout: ms(default_ready_timeout_ms()),
            cancel_grace: ms(default_cancel_grace_ms()),
            terminate_grace: ms(default_terminate_grace_ms()),
            job_timeout: None,
            retain_finished_jobs: default_retain_finished_jobs(),
            socket_dir: PathBuf::from(default_socket_dir()),
            results_path: PathBuf::from(default_results_path()),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_backoff, self.max_retry_backoff)
    }

    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            pool_size: self.pool_size,
            backpressure: self.backpressure,
            health_check_interval: self.health_check_interval,
            ping_timeout: self.ping_timeout,
            terminate_grace: self.terminate_grace,
        }
    }

    pub fn scheduler_options(&self) -> SchedulerOptions {
        SchedulerOptions {
            retry: self.retry_policy(),
            health_check_interval: self.health_check_interval,
            ping_timeout: self.ping_timeout,
            cancel_grace: self.cancel_grace,
            job_timeout: self.job_timeout,
            retain_finished: self.retain_finished_jobs,
        }
    }

    pub fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            socket_dir: self.socket_dir.clone(),
            ready_timeout: self.ready_timeout,
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub orchestrator: OrchestratorConfig,
    pub workers: Vec<WorkerTemplate>,
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    /// Returns HardValidationError for any invalid fields.
    pub fn load_file(path: impl AsRef<Path>) -> BenchResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BenchError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| BenchError::Io {
            context: "reading config file",
            source: e,
        })?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> BenchResult<Config> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| BenchError::ConfigParse {
                message: format!("YAML parse error: {}", e),
            })?;

        Self::validate(raw)
    }

    /// Validate raw configuration and convert to validated types.
    fn validate(raw: RawConfig) -> BenchResult<Config> {
        let orchestrator = Self::validate_orchestrator(raw.orchestrator)?;

        let mut workers = Vec::with_capacity(raw.workers.len());
        let mut seen_names = HashSet::new();

        for (index, raw_worker) in raw.workers.into_iter().enumerate() {
            let worker = Self::validate_worker(raw_worker, index)?;

            if !seen_names.insert(worker.name.clone()) {
                return Err(HardValidationError::DuplicateWorkerName {
                    name: worker.name.to_string(),
                }
                .into());
            }

            workers.push(worker);
        }

        if workers.is_empty() {
            return Err(HardValidationError::SchemaValidation {
                message: "At least one worker must be defined".to_string(),
            }
            .into());
        }

        Ok(Config {
            orchestrator,
            workers,
        })
    }

    /// Validate orchestrator configuration.
    fn validate_orchestrator(
        raw: RawOrchestratorConfig,
    ) -> Result<OrchestratorConfig, HardValidationError> {
        if raw.pool_size == 0 || raw.pool_size > MAX_POOL_SIZE {
            return Err(HardValidationError::InvalidFieldValue {
                field: "pool_size",
                value: raw.pool_size.to_string(),
                reason: format!("Must be between 1 and {}", MAX_POOL_SIZE),
            });
        }

        let backpressure = match raw.backpressure.as_str() {
            "block" => Backpressure::Block,
            "fail_fast" => Backpressure::FailFast,
            other => {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "backpressure",
                    value: other.to_string(),
                    reason: "Must be 'block' or 'fail_fast'".to_string(),
                })
            }
        };

        if raw.max_retries > MAX_RETRIES {
            return Err(HardValidationError::InvalidFieldValue {
                field: "max_retries",
                value: raw.max_retries.to_string(),
                reason: format!("Must not exceed {}", MAX_RETRIES),
            });
        }

        let retry_backoff = non_zero_ms("retry_backoff_ms", raw.retry_backoff_ms)?;
        let max_retry_backoff = non_zero_ms("max_retry_backoff_ms", raw.max_retry_backoff_ms)?;
        if max_retry_backoff < retry_backoff {
            return Err(HardValidationError::InvalidFieldValue {
                field: "max_retry_backoff_ms",
                value: raw.max_retry_backoff_ms.to_string(),
                reason: "Must be at least retry_backoff_ms".to_string(),
            });
        }

        let health_check_interval =
            non_zero_ms("health_check_interval_ms", raw.health_check_interval_ms)?;
        let ping_timeout = non_zero_ms("ping_timeout_ms", raw.ping_timeout_ms)?;
        if ping_timeout >= health_check_interval {
            return Err(HardValidationError::InvalidFieldValue {
                field: "ping_timeout_ms",
                value: raw.ping_timeout_ms.to_string(),
                reason: "Must be shorter than health_check_interval_ms".to_string(),
            });
        }

        let job_timeout = raw
            .job_timeout_ms
            .map(|ms| non_zero_ms("job_timeout_ms", ms))
            .transpose()?;

        if raw.socket_dir.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "socket_dir",
                value: String::new(),
                reason: "Socket directory cannot be empty".to_string(),
            });
        }

        if raw.results_path.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "results_path",
                value: String::new(),
                reason: "Results path cannot be empty".to_string(),
            });
        }

        Ok(OrchestratorConfig {
            pool_size: raw.pool_size,
            backpressure,
            max_retries: raw.max_retries,
            retry_backoff,
            max_retry_backoff,
            health_check_interval,
            ping_timeout,
            ready_timeout: non_zero_ms("ready_timeout_ms", raw.ready_timeout_ms)?,
            cancel_grace: non_zero_ms("cancel_grace_ms", raw.cancel_grace_ms)?,
            terminate_grace: non_zero_ms("terminate_grace_ms", raw.terminate_grace_ms)?,
            job_timeout,
            retain_finished_jobs: raw.retain_finished_jobs,
            socket_dir: PathBuf::from(raw.socket_dir),
            results_path: PathBuf::from(raw.results_path),
        })
    }

    /// Validate a single worker template.
    fn validate_worker(
        raw: RawWorkerConfig,
        index: usize,
    ) -> Result<WorkerTemplate, HardValidationError> {
        let context = format!("worker at index {}", index);

        // Validate worker name
        let name = WorkerId::new(&raw.name).map_err(|mut e| {
            if let HardValidationError::InvalidFieldValue { ref mut field, .. } = e {
                *field = "name";
            }
            e
        })?;

        // Spawned workers are named `{template}-{n}`
        if name.as_str().len() > MAX_TEMPLATE_NAME_LEN {
            return Err(HardValidationError::InvalidFieldValue {
                field: "name",
                value: raw.name,
                reason: format!("Must be at most {} characters", MAX_TEMPLATE_NAME_LEN),
            });
        }

        if raw.capabilities.is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "capabilities",
                context,
            });
        }

        let mut capabilities = Vec::with_capacity(raw.capabilities.len());
        for raw_capability in &raw.capabilities {
            let capability: Capability = raw_capability.parse()?;
            if !capabilities.contains(&capability) {
                capabilities.push(capability);
            }
        }

        let endpoint = match (raw.spawn, raw.connect) {
            (Some(spawn), None) => EndpointConfig::Spawn(Self::validate_spawn(spawn, &context)?),
            (None, Some(connect)) => EndpointConfig::Connect {
                address: Self::validate_address(connect.address)?,
            },
            (None, None) => {
                return Err(HardValidationError::MissingRequiredField {
                    field: "spawn or connect",
                    context,
                })
            }
            (Some(_), Some(_)) => {
                return Err(HardValidationError::SchemaValidation {
                    message: format!("{} sets both spawn and connect", context),
                })
            }
        };

        Ok(WorkerTemplate {
            name,
            capabilities,
            endpoint,
        })
    }

    fn validate_spawn(
        raw: RawSpawnConfig,
        context: &str,
    ) -> Result<SpawnConfig, HardValidationError> {
        if raw.program.trim().is_empty() {
            return Err(HardValidationError::MissingRequiredField {
                field: "spawn.program",
                context: context.to_string(),
            });
        }

        // Validate environment variables
        for key in raw.environment.keys() {
            if key.is_empty() || key.contains('=') {
                return Err(HardValidationError::InvalidFieldValue {
                    field: "environment",
                    value: format!("'{}' in {}", key, context),
                    reason: "Environment variable names must be non-empty without '='"
                        .to_string(),
                });
            }
        }

        Ok(SpawnConfig {
            program: raw.program,
            args: raw.args,
            environment: raw.environment,
        })
    }

    fn validate_address(address: String) -> Result<String, HardValidationError> {
        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(HardValidationError::InvalidFieldValue {
                field: "connect.address",
                value: address,
                reason: "Expected host:port".to_string(),
            });
        };

        if host.is_empty() {
            return Err(HardValidationError::InvalidFieldValue {
                field: "connect.address",
                value: address.clone(),
                reason: "Host cannot be empty".to_string(),
            });
        }

        let port: u16 = port
            .parse()
            .map_err(|_| HardValidationError::InvalidFieldValue {
                field: "connect.address",
                value: address.clone(),
                reason: format!("'{}' is not a port number", port),
            })?;
        if port == 0 {
            return Err(HardValidationError::InvalidFieldValue {
                field: "connect.address",
                value: address.clone(),
                reason: "Port 0 cannot be connected to".to_string(),
            });
        }

        Ok(address)
    }
}

fn non_zero_ms(field: &'static str, ms: u64) -> Result<Duration, HardValidationError> {
    if ms == 0 {
        return Err(HardValidationError::InvalidFieldValue {
            field,
            value: "0".to_string(),
            reason: "Must be greater than 0".to_string(),
        });
    }
    Ok(Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_CONFIG: &str = r#"
orchestrator:
  pool_size: 2
  backpressure: fail_fast
  max_retries: 5
  health_check_interval_ms: 1000
  ping_timeout_ms: 250
  job_timeout_ms: 600000

workers:
  - name: local-embed
    capabilities: [embedding, generation]
    spawn:
      program: python3
      args: ["runners/mteb_runner.py"]
      environment:
        HF_HOME: /data/hf
  - name: gpu-box
    capabilities: [load_test]
    connect:
      address: 10.0.0.7:7700
"#;

    #[test]
    fn test_valid_config() {
        let config = ConfigLoader::load_string(VALID_CONFIG).unwrap();
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[0].name.as_str(), "local-embed");
        assert!(config.workers[0].supports(Capability::Generation));
        assert!(config.workers[1].is_attached());

        let orchestrator = &config.orchestrator;
        assert_eq!(orchestrator.pool_size, 2);
        assert_eq!(orchestrator.backpressure, Backpressure::FailFast);
        assert_eq!(orchestrator.max_retries, 5);
        assert_eq!(orchestrator.job_timeout, Some(Duration::from_secs(600)));
        // Untouched fields fall back to defaults
        assert_eq!(orchestrator.cancel_grace, Duration::from_secs(10));
    }

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.pool_size, 4);
        assert_eq!(config.backpressure, Backpressure::Block);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.ping_timeout, Duration::from_secs(2));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert!(config.job_timeout.is_none());
        assert_eq!(config.retain_finished_jobs, 256);
        assert_eq!(config.scheduler_options().retain_finished, 256);

        let parsed = ConfigLoader::validate_orchestrator(RawOrchestratorConfig::default()).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_missing_workers() {
        let yaml = r#"
orchestrator:
  pool_size: 2
workers: []
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_pool_size_bounds() {
        for size in [0, 257] {
            let yaml = format!(
                "orchestrator:\n  pool_size: {}\nworkers:\n  - name: w\n    capabilities: [embedding]\n    spawn:\n      program: /bin/true\n",
                size
            );
            assert!(ConfigLoader::load_string(&yaml).is_err());
        }
    }

    #[test]
    fn test_ping_timeout_must_be_shorter_than_interval() {
        let yaml = r#"
orchestrator:
  health_check_interval_ms: 1000
  ping_timeout_ms: 1000
workers:
  - name: w
    capabilities: [embedding]
    spawn:
      program: /bin/true
"#;
        let err = ConfigLoader::load_string(yaml).unwrap_err();
        assert!(err.to_string().contains("ping_timeout_ms"));
    }

    #[test]
    fn test_duplicate_worker_names() {
        let yaml = r#"
workers:
  - name: same
    capabilities: [embedding]
    spawn:
      program: /bin/true
  - name: same
    capabilities: [generation]
    connect:
      address: localhost:7700
"#;
        let err = ConfigLoader::load_string(yaml).unwrap_err();
        assert!(matches!(
            err,
            BenchError::HardValidation(HardValidationError::DuplicateWorkerName { .. })
        ));
    }

    #[test]
    fn test_spawn_and_connect_exclusive() {
        let both = r#"
workers:
  - name: w
    capabilities: [embedding]
    spawn:
      program: /bin/true
    connect:
      address: localhost:7700
"#;
        assert!(ConfigLoader::load_string(both).is_err());

        let neither = r#"
workers:
  - name: w
    capabilities: [embedding]
"#;
        assert!(ConfigLoader::load_string(neither).is_err());
    }

    #[test]
    fn test_unknown_capability() {
        let yaml = r#"
workers:
  - name: w
    capabilities: [telepathy]
    spawn:
      program: /bin/true
"#;
        let err = ConfigLoader::load_string(yaml).unwrap_err();
        assert!(matches!(
            err,
            BenchError::HardValidation(HardValidationError::UnknownCapability { .. })
        ));
    }

    #[test]
    fn test_missing_capabilities() {
        let yaml = r#"
workers:
  - name: w
    spawn:
      program: /bin/true
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_invalid_connect_address() {
        for address in ["localhost", ":7700", "localhost:0", "localhost:http", "localhost:70000"] {
            let yaml = format!(
                "workers:\n  - name: w\n    capabilities: [embedding]\n    connect:\n      address: \"{}\"\n",
                address
            );
            assert!(
                ConfigLoader::load_string(&yaml).is_err(),
                "address {} should be rejected",
                address
            );
        }
    }

    #[test]
    fn test_connect_port_zero() {
        let yaml = "workers:\n  - name: w\n    capabilities: [embedding]\n    connect:\n      address: \"10.0.0.7:0\"\n";
        let err = ConfigLoader::load_string(yaml).unwrap_err();
        assert!(matches!(
            err,
            BenchError::HardValidation(HardValidationError::InvalidFieldValue {
                field: "connect.address",
                ..
            })
        ));
    }

    #[test]
    fn test_unknown_backpressure() {
        let yaml = r#"
orchestrator:
  backpressure: drop
workers:
  - name: w
    capabilities: [embedding]
    spawn:
      program: /bin/true
"#;
        assert!(ConfigLoader::load_string(yaml).is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(VALID_CONFIG.as_bytes()).unwrap();

        let config = ConfigLoader::load_file(file.path()).unwrap();
        assert_eq!(config.workers.len(), 2);

        let missing = ConfigLoader::load_file("/nonexistent/benchmesh.yaml");
        assert!(matches!(missing, Err(BenchError::ConfigNotFound { .. })));
    }
}
