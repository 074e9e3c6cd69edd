//! Configuration loading and environment variable handling

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::domains::cluster::{ClusterConfig, CrashPolicy};
use crate::domains::engine::EngineConfig;
use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::CadreConfig;
use crate::error::{ConfigError, ConfigResult};

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "CADRE".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<CadreConfig> {
        let content = std::fs::read_to_string(path)?;
        self.from_yaml(&content)
    }

    /// Load configuration from YAML text with environment overrides
    pub fn from_yaml(&self, content: &str) -> ConfigResult<CadreConfig> {
        let mut config: CadreConfig = serde_yaml::from_str(content)?;
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<CadreConfig> {
        let mut config = CadreConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<CadreConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut CadreConfig) -> ConfigResult<()> {
        self.apply_cluster_overrides(&mut config.cluster)?;
        self.apply_engine_overrides(&mut config.engine)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply worker pool overrides
    fn apply_cluster_overrides(&self, config: &mut ClusterConfig) -> ConfigResult<()> {
        if let Ok(count) = self.get_env_var("CORE_COUNT") {
            config.core_count = count
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid CORE_COUNT: {}", e)))?;
        }

        if let Ok(strict) = self.get_env_var("STRICT_ORDERING") {
            config.strict_ordering = strict
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid STRICT_ORDERING: {}", e)))?;
        }

        if let Ok(policy) = self.get_env_var("CRASH_POLICY") {
            config.crash_policy = CrashPolicy::from_str(&policy)
                .map_err(|_| ConfigError::EnvError(format!("Invalid CRASH_POLICY: {}", policy)))?;
        }

        if let Ok(grace) = self.get_env_var("SHUTDOWN_GRACE_MS") {
            let millis: u64 = grace
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid SHUTDOWN_GRACE_MS: {}", e)))?;
            config.shutdown_grace_period = Duration::from_millis(millis);
        }

        Ok(())
    }

    /// Apply engine overrides
    fn apply_engine_overrides(&self, config: &mut EngineConfig) -> ConfigResult<()> {
        if let Ok(program) = self.get_env_var("ENGINE_PROGRAM") {
            config.program = program;
        }

        if let Ok(slow) = self.get_env_var("SLOW_THRESHOLD_MS") {
            config.slow_threshold_ms = slow
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid SLOW_THRESHOLD_MS: {}", e)))?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
