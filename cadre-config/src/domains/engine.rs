//! Built-in command engine configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigResult;
use crate::validation::{validate_positive, validate_required_string, Validatable};

/// Configuration of the engine that runs one file per command invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Program invoked for every file
    #[serde(default = "default_program")]
    pub program: String,

    /// Arguments placed before the file path
    #[serde(default)]
    pub args: Vec<String>,

    /// Durations above this many milliseconds are classified slow
    #[serde(default = "default_slow_threshold_ms")]
    pub slow_threshold_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            slow_threshold_ms: default_slow_threshold_ms(),
        }
    }
}

impl Validatable for EngineConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_required_string(&self.program, "program", self.domain_name())?;
        validate_positive(self.slow_threshold_ms, "slow_threshold_ms", self.domain_name())?;
        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "engine"
    }
}

fn default_program() -> String {
    "node".to_string()
}

fn default_slow_threshold_ms() -> u64 {
    75
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.program, "node");
        assert!(config.args.is_empty());
        assert_eq!(config.slow_threshold_ms, 75);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_validation() {
        let mut config = EngineConfig::default();
        config.program = String::new();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.slow_threshold_ms = 0;
        assert!(config.validate().is_err());
    }
}
