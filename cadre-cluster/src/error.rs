//! Error types for the worker pool

use cadre_ipc::IpcError;
use thiserror::Error;

use crate::worker::WorkerId;

/// Controller-side errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Failed to spawn worker: {0}")]
    SpawnError(String),

    #[error("Protocol violation from {worker}: {source}")]
    ProtocolViolation {
        worker: WorkerId,
        #[source]
        source: IpcError,
    },

    #[error("Invalid state transition for {worker}: {from} -> {to}")]
    InvalidTransition {
        worker: WorkerId,
        from: &'static str,
        to: &'static str,
    },

    #[error("Batch stalled: {pending} item(s) queued and no workers left")]
    Stalled { pending: usize },

    #[error("Run already started")]
    AlreadyStarted,

    #[error("Worker update channel closed")]
    ChannelClosed,

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),
}

impl ClusterError {
    /// Whether this error ends the run
    ///
    /// Transition errors are reported by the orchestrator and ignored; every
    /// other variant aborts the batch.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ClusterError::InvalidTransition { .. })
    }
}

/// Errors raised by an execution engine inside a worker
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Execution failed: {0}")]
    Failed(String),
}
