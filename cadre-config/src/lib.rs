//! Domain-driven configuration management for cadre
//!
//! Configuration is split by functional domain, loaded from YAML with
//! `CADRE_*` environment variable overrides, and validated per domain.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;

// Re-export domain configurations
pub use domains::{
    cluster::{ClusterConfig, CrashPolicy},
    engine::EngineConfig,
    logging::{LogFormat, LogLevel, LoggingConfig},
    CadreConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration_ms;
