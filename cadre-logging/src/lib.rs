//! Structured logging setup for cadre
//!
//! The controller and its workers both log through `tracing`. Output always
//! goes to stderr: the controller's stdout carries reporter output and a
//! worker's stdout is its IPC channel.

pub mod init;

pub use init::{build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing};
