//! Worker pool configuration

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_positive, Validatable};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Upper bound on concurrent worker processes; values below 1 mean 1
    #[serde(default = "default_core_count")]
    pub core_count: i64,

    /// Files to distribute, in order
    #[serde(default)]
    pub files: Vec<String>,

    /// Serialize event output behind one leader worker at a time
    #[serde(default = "crate::domains::utils::default_false")]
    pub strict_ordering: bool,

    /// What happens to a work item whose worker exits before completing it
    #[serde(default)]
    pub crash_policy: CrashPolicy,

    /// Time a retiring worker gets to exit before it is killed
    #[serde(
        rename = "shutdown_grace_period_ms",
        with = "crate::domains::utils::serde_duration_ms",
        default = "default_shutdown_grace_period"
    )]
    pub shutdown_grace_period: Duration,
}

/// Handling of a work item lost to a worker crash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrashPolicy {
    /// Report the item as failed and move on
    #[default]
    Drop,
    /// Put the item back on the queue once, then drop it
    Requeue,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            core_count: default_core_count(),
            files: Vec::new(),
            strict_ordering: false,
            crash_policy: CrashPolicy::Drop,
            shutdown_grace_period: default_shutdown_grace_period(),
        }
    }
}

impl ClusterConfig {
    /// Effective pool ceiling, clamped to at least one worker
    pub fn worker_limit(&self) -> usize {
        self.core_count.max(1) as usize
    }
}

impl FromStr for CrashPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "drop" => Ok(CrashPolicy::Drop),
            "requeue" => Ok(CrashPolicy::Requeue),
            _ => Err(format!("Invalid crash policy: {}", s)),
        }
    }
}

impl fmt::Display for CrashPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrashPolicy::Drop => f.write_str("drop"),
            CrashPolicy::Requeue => f.write_str("requeue"),
        }
    }
}

impl Validatable for ClusterConfig {
    fn validate(&self) -> ConfigResult<()> {
        validate_positive(
            self.shutdown_grace_period.as_millis(),
            "shutdown_grace_period_ms",
            self.domain_name(),
        )?;

        if self.files.iter().any(|f| f.trim().is_empty()) {
            return Err(self.validation_error("files cannot contain empty paths"));
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "cluster"
    }
}

// Default value functions
fn default_core_count() -> i64 {
    num_cpus::get() as i64
}

fn default_shutdown_grace_period() -> Duration {
    Duration::from_millis(500)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_config_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.core_count, num_cpus::get() as i64);
        assert_eq!(config.worker_limit(), num_cpus::get());
        assert!(!config.strict_ordering);
        assert_eq!(config.crash_policy, CrashPolicy::Drop);
        assert_eq!(config.shutdown_grace_period, Duration::from_millis(500));
    }

    #[test]
    fn test_worker_limit_clamps_to_one() {
        let mut config = ClusterConfig::default();
        config.core_count = 0;
        assert_eq!(config.worker_limit(), 1);
        config.core_count = -4;
        assert_eq!(config.worker_limit(), 1);
        config.core_count = 3;
        assert_eq!(config.worker_limit(), 3);
    }

    #[test]
    fn test_cluster_config_validation() {
        let mut config = ClusterConfig::default();
        assert!(config.validate().is_ok());

        config.shutdown_grace_period = Duration::ZERO;
        assert!(config.validate().is_err());

        config.shutdown_grace_period = Duration::from_millis(100);
        config.files = vec!["a.test".to_string(), " ".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_crash_policy_parse() {
        assert_eq!("drop".parse::<CrashPolicy>().unwrap(), CrashPolicy::Drop);
        assert_eq!("REQUEUE".parse::<CrashPolicy>().unwrap(), CrashPolicy::Requeue);
        assert!("retry".parse::<CrashPolicy>().is_err());
        assert_eq!(CrashPolicy::Requeue.to_string(), "requeue");
    }
}
