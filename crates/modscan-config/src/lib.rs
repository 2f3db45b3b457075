// SPDX-License-Identifier: MIT OR Apache-2.0
//! Configuration loading, validation, and env overrides for the modscan
//! orchestrator.
//!
//! This crate provides [`OrchestratorConfig`] — the top-level runtime
//! settings — together with helpers for loading from a TOML file,
//! applying `MODSCAN_*` environment overrides, and producing advisory
//! [`ConfigWarning`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation but deserve
/// attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// `default_step_timeout` is unusually large.
    LargeStepTimeout {
        /// Configured timeout in seconds.
        secs: u64,
    },
    /// `modules_dir` does not exist on disk.
    MissingModulesDir {
        /// Configured path.
        path: String,
    },
    /// `lost_task_grace` is shorter than the default step timeout, which
    /// would let the executor reclaim tasks that are still legitimately
    /// running.
    GraceShorterThanStepTimeout {
        /// Configured grace period in seconds.
        grace_secs: u64,
        /// Configured default step timeout in seconds.
        step_timeout_secs: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::LargeStepTimeout { secs } => {
                write!(f, "default_step_timeout is unusually large ({secs}s)")
            }
            ConfigWarning::MissingModulesDir { path } => {
                write!(f, "modules_dir '{path}' does not exist")
            }
            ConfigWarning::GraceShorterThanStepTimeout {
                grace_secs,
                step_timeout_secs,
            } => write!(
                f,
                "lost_task_grace ({grace_secs}s) is shorter than default_step_timeout ({step_timeout_secs}s)"
            ),
        }
    }
}

/// Top-level runtime configuration for the orchestrator daemon.
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Address the HTTP API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Redis connection URL backing the queue plane.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    /// Root directory for content-addressed artifact storage.
    #[serde(default = "default_store_root")]
    pub store_root: String,
    /// Directory the registry scans for internal module manifests.
    #[serde(default = "default_modules_dir")]
    pub modules_dir: String,
    /// `tracing` log level filter string.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Default per-step deadline, in seconds, when a step does not specify
    /// its own `timeout_secs`.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,
    /// Number of times the registry retries a failed container build
    /// before marking it `failed`.
    #[serde(default = "default_build_retries")]
    pub n_build_retries: u32,
    /// Interval, in seconds, between external module health probes.
    #[serde(default = "default_health_probe_interval")]
    pub health_probe_interval_secs: u64,
    /// Grace period, in seconds, an in-flight task is allowed to sit with
    /// no result before the executor treats it as lost and times it out.
    #[serde(default = "default_lost_task_grace")]
    pub lost_task_grace_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".into()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}

fn default_store_root() -> String {
    "./data/store".into()
}

fn default_modules_dir() -> String {
    "./modules".into()
}

fn default_log_level() -> String {
    "info".into()
}

fn default_step_timeout() -> u64 {
    300
}

fn default_build_retries() -> u32 {
    3
}

fn default_health_probe_interval() -> u64 {
    30
}

fn default_lost_task_grace() -> u64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            redis_url: default_redis_url(),
            store_root: default_store_root(),
            modules_dir: default_modules_dir(),
            log_level: default_log_level(),
            default_step_timeout_secs: default_step_timeout(),
            n_build_retries: default_build_retries(),
            health_probe_interval_secs: default_health_probe_interval(),
            lost_task_grace_secs: default_lost_task_grace(),
        }
    }
}

const VALID_LOG_LEVELS: &[&str] = &["error", "warn", "info", "debug", "trace"];
const LARGE_TIMEOUT_THRESHOLD_SECS: u64 = 3_600;

/// Load an [`OrchestratorConfig`] from an optional TOML file path.
///
/// * If `path` is `Some`, reads and parses the file, merged over defaults
///   for any field the file omits.
/// * If `path` is `None`, returns [`OrchestratorConfig::default()`].
///
/// `MODSCAN_*` environment variable overrides are applied on top in both
/// cases.
pub fn load_config(path: Option<&Path>) -> Result<OrchestratorConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => OrchestratorConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse a TOML string into an [`OrchestratorConfig`].
pub fn parse_toml(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    toml::from_str::<OrchestratorConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Apply `MODSCAN_*` environment variable overrides.
///
/// Recognised variables: `MODSCAN_BIND_ADDR`, `MODSCAN_REDIS_URL`,
/// `MODSCAN_STORE_ROOT`, `MODSCAN_MODULES_DIR`, `MODSCAN_LOG_LEVEL`.
/// Numeric fields are not env-overridable; they are TOML-only.
pub fn apply_env_overrides(config: &mut OrchestratorConfig) {
    if let Ok(val) = std::env::var("MODSCAN_BIND_ADDR") {
        config.bind_addr = val;
    }
    if let Ok(val) = std::env::var("MODSCAN_REDIS_URL") {
        config.redis_url = val;
    }
    if let Ok(val) = std::env::var("MODSCAN_STORE_ROOT") {
        config.store_root = val;
    }
    if let Ok(val) = std::env::var("MODSCAN_MODULES_DIR") {
        config.modules_dir = val;
    }
    if let Ok(val) = std::env::var("MODSCAN_LOG_LEVEL") {
        config.log_level = val;
    }
}

/// Validate a parsed configuration, returning advisory warnings.
///
/// Hard errors (invalid log level, zero timeouts) are returned as a
/// [`ConfigError::ValidationError`]; soft issues (large timeouts, missing
/// `modules_dir`) come back as warnings.
pub fn validate_config(config: &OrchestratorConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors: Vec<String> = Vec::new();
    let mut warnings: Vec<ConfigWarning> = Vec::new();

    if !VALID_LOG_LEVELS.contains(&config.log_level.as_str()) {
        errors.push(format!("invalid log_level '{}'", config.log_level));
    }

    if config.default_step_timeout_secs == 0 {
        errors.push("default_step_timeout_secs must be greater than zero".into());
    } else if config.default_step_timeout_secs > LARGE_TIMEOUT_THRESHOLD_SECS {
        warnings.push(ConfigWarning::LargeStepTimeout {
            secs: config.default_step_timeout_secs,
        });
    }

    if config.health_probe_interval_secs == 0 {
        errors.push("health_probe_interval_secs must be greater than zero".into());
    }

    if !Path::new(&config.modules_dir).exists() {
        warnings.push(ConfigWarning::MissingModulesDir {
            path: config.modules_dir.clone(),
        });
    }

    if config.lost_task_grace_secs < config.default_step_timeout_secs {
        warnings.push(ConfigWarning::GraceShorterThanStepTimeout {
            grace_secs: config.lost_task_grace_secs,
            step_timeout_secs: config.default_step_timeout_secs,
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.n_build_retries, 3);
        assert_eq!(cfg.lost_task_grace_secs, 60);
    }

    #[test]
    fn default_config_is_valid_but_warns_on_missing_modules_dir() {
        let cfg = OrchestratorConfig::default();
        let warnings = validate_config(&cfg).expect("default config should be valid");
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MissingModulesDir { .. })));
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            bind_addr = "127.0.0.1:9000"
            log_level = "debug"
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.redis_url, default_redis_url());
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn validation_catches_invalid_log_level() {
        let cfg = OrchestratorConfig {
            log_level: "verbose".into(),
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_step_timeout() {
        let cfg = OrchestratorConfig {
            default_step_timeout_secs: 0,
            ..Default::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn large_step_timeout_produces_warning() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig {
            modules_dir: dir.path().display().to_string(),
            default_step_timeout_secs: 7200,
            lost_task_grace_secs: 7200,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::LargeStepTimeout { .. })));
    }

    #[test]
    fn short_grace_produces_warning() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig {
            modules_dir: dir.path().display().to_string(),
            default_step_timeout_secs: 300,
            lost_task_grace_secs: 10,
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::GraceShorterThanStepTimeout { .. })));
    }

    #[test]
    fn existing_modules_dir_silences_warning() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = OrchestratorConfig {
            modules_dir: dir.path().display().to_string(),
            ..Default::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(!warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MissingModulesDir { .. })));
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modscan.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "bind_addr = \"0.0.0.0:9999\"\nlog_level = \"warn\"").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.bind_addr, "0.0.0.0:9999");
        assert_eq!(cfg.log_level, "warn");
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/modscan.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn env_overrides_applied_after_file_load() {
        std::env::set_var("MODSCAN_LOG_LEVEL", "trace");
        let mut cfg = OrchestratorConfig::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.log_level, "trace");
        std::env::remove_var("MODSCAN_LOG_LEVEL");
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = OrchestratorConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: OrchestratorConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }
}
