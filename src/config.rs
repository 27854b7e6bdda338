//! Orchestrator configuration.
//!
//! Every option is read from the environment; unset variables keep their
//! defaults. `from_env()` validates before returning.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::coordinator::{CoordinatorSettings, PipelineSettings};
use crate::health::{HealthThresholds, ScalingPolicy};
use crate::notify::ChannelMap;
use crate::queue::Backoff;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the coordinator, the controller and the router.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Broker
    pub broker_host: String,
    pub broker_port: u16,
    /// Attempts per broker operation before the process gives up.
    pub broker_retry_ceiling: u32,
    pub max_retries: u32,

    // Scaling
    pub min_workers: usize,
    pub max_workers: usize,
    pub scaling_cooldown: Duration,
    pub high_watermark: f64,
    pub idle_margin: usize,
    pub idle_grace: Duration,
    pub idle_cpu_percent: f32,

    // Health
    pub health_check_interval: Duration,
    pub health_failure_threshold: u32,
    pub max_restart_attempts: u32,
    pub restart_window: Duration,
    pub worker_memory_limit_mb: f64,
    pub worker_cpu_limit_percent: f32,
    pub poll_timeout: Duration,

    // Workers
    /// Command that starts one worker; `--worker-id <id>` is appended.
    pub worker_command: String,
    /// Regex matched against process command lines to find workers.
    pub worker_pattern: String,

    // Git pipeline
    pub repo_path: PathBuf,
    /// Worker output directory, relative to `repo_path`.
    pub output_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    /// How long forwarded ledger entries are kept.
    pub ledger_retention: Duration,
    pub git_base_branch: String,
    pub pr_enabled: bool,
    pub git_auto_merge: bool,
    pub test_gate_enabled: bool,
    pub test_timeout: Duration,
    pub test_command: String,

    // Notifications
    pub channels: ChannelMap,
    pub dedup_window: Duration,

    pub metrics_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 6379,
            broker_retry_ceiling: 1000,
            max_retries: 3,

            min_workers: 1,
            max_workers: 10,
            scaling_cooldown: Duration::from_secs(60),
            high_watermark: 20.0,
            idle_margin: 1,
            idle_grace: Duration::from_secs(300),
            idle_cpu_percent: 5.0,

            health_check_interval: Duration::from_secs(30),
            health_failure_threshold: 3,
            max_restart_attempts: 10,
            restart_window: Duration::from_secs(3600),
            worker_memory_limit_mb: 2048.0,
            worker_cpu_limit_percent: 90.0,
            poll_timeout: Duration::from_secs(5),

            worker_command: "fleet-worker".to_string(),
            worker_pattern: "--worker-id".to_string(),

            repo_path: PathBuf::from("."),
            output_dir: PathBuf::from("."),
            state_file: None,
            ledger_retention: Duration::from_secs(7 * 24 * 3600),
            git_base_branch: "main".to_string(),
            pr_enabled: true,
            git_auto_merge: false,
            test_gate_enabled: true,
            test_timeout: Duration::from_secs(300),
            test_command: "pytest -q".to_string(),

            channels: ChannelMap::default(),
            dedup_window: Duration::from_secs(3600),

            metrics_file: None,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the result does
    /// not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str| -> Result<Option<Duration>, ConfigError> {
            get(key)
                .map(|v| parse_env_value::<u64>(&v, key).map(Duration::from_secs))
                .transpose()
        };

        // Broker
        if let Some(val) = get("BROKER_HOST") {
            config.broker_host = val;
        }
        if let Some(val) = get("BROKER_PORT") {
            config.broker_port = parse_env_value(&val, "BROKER_PORT")?;
        }
        if let Some(val) = get("BROKER_RETRY_CEILING") {
            config.broker_retry_ceiling = parse_env_value(&val, "BROKER_RETRY_CEILING")?;
        }
        if let Some(val) = get("MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "MAX_RETRIES")?;
        }

        // Scaling
        if let Some(val) = get("MIN_WORKERS") {
            config.min_workers = parse_env_value(&val, "MIN_WORKERS")?;
        }
        if let Some(val) = get("MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "MAX_WORKERS")?;
        }
        if let Some(d) = secs("SCALING_COOLDOWN_SECONDS")? {
            config.scaling_cooldown = d;
        }
        if let Some(val) = get("HIGH_WATERMARK") {
            config.high_watermark = parse_env_value(&val, "HIGH_WATERMARK")?;
        }
        if let Some(val) = get("IDLE_MARGIN") {
            config.idle_margin = parse_env_value(&val, "IDLE_MARGIN")?;
        }
        if let Some(d) = secs("IDLE_GRACE_SECONDS")? {
            config.idle_grace = d;
        }
        if let Some(val) = get("IDLE_CPU_PERCENT") {
            config.idle_cpu_percent = parse_env_value(&val, "IDLE_CPU_PERCENT")?;
        }

        // Health
        if let Some(d) = secs("HEALTH_CHECK_INTERVAL_SECONDS")? {
            config.health_check_interval = d;
        }
        if let Some(val) = get("HEALTH_FAILURE_THRESHOLD") {
            config.health_failure_threshold = parse_env_value(&val, "HEALTH_FAILURE_THRESHOLD")?;
        }
        if let Some(val) = get("MAX_RESTART_ATTEMPTS") {
            config.max_restart_attempts = parse_env_value(&val, "MAX_RESTART_ATTEMPTS")?;
        }
        if let Some(d) = secs("RESTART_WINDOW_SECONDS")? {
            config.restart_window = d;
        }
        if let Some(val) = get("WORKER_MEMORY_LIMIT_MB") {
            config.worker_memory_limit_mb = parse_env_value(&val, "WORKER_MEMORY_LIMIT_MB")?;
        }
        if let Some(val) = get("WORKER_CPU_LIMIT_PERCENT") {
            config.worker_cpu_limit_percent = parse_env_value(&val, "WORKER_CPU_LIMIT_PERCENT")?;
        }
        if let Some(d) = secs("POLL_TIMEOUT_SECONDS")? {
            config.poll_timeout = d;
        }

        // Workers
        if let Some(val) = get("WORKER_COMMAND") {
            config.worker_command = val;
        }
        if let Some(val) = get("WORKER_PATTERN") {
            config.worker_pattern = val;
        }

        // Git pipeline
        if let Some(val) = get("REPO_PATH") {
            config.repo_path = PathBuf::from(val);
        }
        if let Some(val) = get("OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }
        if let Some(val) = get("STATE_FILE") {
            config.state_file = Some(PathBuf::from(val));
        }
        if let Some(d) = secs("LEDGER_RETENTION_SECONDS")? {
            config.ledger_retention = d;
        }
        if let Some(val) = get("GIT_BASE_BRANCH") {
            config.git_base_branch = val;
        }
        if let Some(val) = get("PR_ENABLED") {
            config.pr_enabled = parse_env_bool(&val, "PR_ENABLED")?;
        }
        if let Some(val) = get("GIT_AUTO_MERGE") {
            config.git_auto_merge = parse_env_bool(&val, "GIT_AUTO_MERGE")?;
        }
        if let Some(val) = get("TEST_GATE_ENABLED") {
            config.test_gate_enabled = parse_env_bool(&val, "TEST_GATE_ENABLED")?;
        }
        if let Some(d) = secs("TEST_TIMEOUT_SECONDS")? {
            config.test_timeout = d;
        }
        if let Some(val) = get("TEST_COMMAND") {
            config.test_command = val;
        }

        // Notifications; an explicitly empty channel disables the category.
        if let Some(val) = lookup("NOTIFY_SCALING_CHANNEL") {
            config.channels.scaling = val.trim().to_string();
        }
        if let Some(val) = lookup("NOTIFY_HEALTH_CHANNEL") {
            config.channels.health = val.trim().to_string();
        }
        if let Some(val) = lookup("NOTIFY_TASK_CHANNEL") {
            config.channels.task_completion = val.trim().to_string();
        }
        if let Some(val) = lookup("NOTIFY_ERROR_CHANNEL") {
            config.channels.error = val.trim().to_string();
        }
        if let Some(d) = secs("DEDUP_WINDOW_SECONDS")? {
            config.dedup_window = d;
        }

        if let Some(val) = get("METRICS_FILE") {
            config.metrics_file = Some(PathBuf::from(val));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "broker_host cannot be empty".to_string(),
            ));
        }

        if self.broker_retry_ceiling == 0 {
            return Err(ConfigError::ValidationFailed(
                "broker_retry_ceiling must be greater than 0".to_string(),
            ));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(
                "min_workers cannot exceed max_workers".to_string(),
            ));
        }

        if self.high_watermark.is_nan() || self.high_watermark <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "high_watermark must be greater than 0".to_string(),
            ));
        }

        if self.health_check_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "health_check_interval must be greater than 0".to_string(),
            ));
        }

        if self.health_failure_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "health_failure_threshold must be greater than 0".to_string(),
            ));
        }

        if self.poll_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_timeout must be greater than 0".to_string(),
            ));
        }

        if self.test_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "test_timeout must be greater than 0".to_string(),
            ));
        }

        if self.test_gate_enabled && self.test_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "test_command cannot be empty when the test gate is enabled".to_string(),
            ));
        }

        if self.output_dir.is_absolute()
            || self
                .output_dir
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(ConfigError::ValidationFailed(
                "output_dir must be a relative path inside the repository".to_string(),
            ));
        }

        if self.git_base_branch.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "git_base_branch cannot be empty".to_string(),
            ));
        }

        if self.git_auto_merge && !self.pr_enabled {
            return Err(ConfigError::ValidationFailed(
                "git_auto_merge requires pr_enabled".to_string(),
            ));
        }

        self.worker_regex()?;
        Ok(())
    }

    /// Broker connection URL.
    pub fn broker_url(&self) -> String {
        format!("redis://{}:{}/", self.broker_host, self.broker_port)
    }

    /// Backoff for broker operations, bounded by the retry ceiling.
    pub fn broker_backoff(&self) -> Backoff {
        Backoff::with_max_attempts(self.broker_retry_ceiling)
    }

    /// Compiled worker pattern.
    pub fn worker_regex(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.worker_pattern).map_err(|e| ConfigError::InvalidValue {
            key: "WORKER_PATTERN".to_string(),
            message: e.to_string(),
        })
    }

    pub fn scaling_policy(&self) -> ScalingPolicy {
        ScalingPolicy {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            high_watermark: self.high_watermark,
            idle_margin: self.idle_margin,
            idle_grace: self.idle_grace,
            idle_cpu_percent: self.idle_cpu_percent,
            cooldown: self.scaling_cooldown,
        }
    }

    pub fn health_thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            memory_limit_mb: self.worker_memory_limit_mb,
            cpu_limit_percent: self.worker_cpu_limit_percent,
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            base_branch: self.git_base_branch.clone(),
            test_gate_enabled: self.test_gate_enabled,
            pr_enabled: self.pr_enabled,
            auto_merge: self.git_auto_merge,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        let settings = CoordinatorSettings::new(&self.repo_path)
            .with_output_dir(&self.output_dir)
            .with_ledger_retention(self.ledger_retention)
            .with_backoff(self.broker_backoff());
        match &self.state_file {
            Some(path) => settings.with_state_file(path),
            None => settings,
        }
    }

    /// Builder method to set the worker bounds.
    pub fn with_workers(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Builder method to set the repository path.
    pub fn with_repo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_path = path.into();
        self
    }

    /// Builder method to enable or disable the test gate.
    pub fn with_test_gate(mut self, enabled: bool) -> Self {
        self.test_gate_enabled = enabled;
        self
    }

    /// Builder method to set the worker command.
    pub fn with_worker_command(mut self, command: impl Into<String>) -> Self {
        self.worker_command = command.into();
        self
    }

    /// Builder method to set the metrics textfile.
    pub fn with_metrics_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.metrics_file = Some(path.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
