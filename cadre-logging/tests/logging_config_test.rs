use cadre_config::{LogFormat, LogLevel, LoggingConfig};
use cadre_logging::{build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
include_location: true
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();
    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert!(config.include_location);

    assert!(init_logging_from_config(&config, None).is_ok());
    tracing::info!(worker_id = 1, "logging initialized");
}

#[test]
fn test_repeated_initialization_is_harmless() {
    let config = LoggingConfig::default();
    assert!(init_logging_from_config(&config, Some("warn")).is_ok());
    assert!(init_logging_from_config(&config, Some("trace")).is_ok());
    assert!(init_simple_tracing("info").is_ok());
    assert!(init_worker_tracing(Some("not a level [")).is_ok());
    assert!(init_worker_tracing(None).is_ok());
}

#[test]
fn test_env_filter_accepts_directives() {
    let filter = build_env_filter("cadre_cluster=debug,info");
    assert!(filter.to_string().contains("cadre_cluster=debug"));
}
