//! cadre worker pool
//!
//! This crate holds both sides of the pool: the controller-side
//! [`Orchestrator`] that spawns worker processes, hands out files and
//! aggregates their lifecycle events, and the worker-side [`runner`] that
//! executes files through an [`ExecutionEngine`] and reports back.

pub mod aggregator;
pub mod args;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod runner;
pub mod worker;

// Re-export main types
pub use aggregator::{ClusterEvent, EventAggregator, ReporterEvent, TestRecord};
pub use args::worker_args;
pub use engine::CommandEngine;
pub use error::{ClusterError, EngineError};
pub use orchestrator::{Orchestrator, OrchestratorConfig, RunSummary};
pub use queue::WorkQueue;
pub use runner::{
    run_worker, serve, ChannelReporter, EngineEvent, EventSink, ExecutionEngine, RunnableView,
    SuiteView, WorkerRunner,
};
pub use worker::{
    ProcessSpawner, WorkerEvent, WorkerHandle, WorkerId, WorkerLink, WorkerSpawner, WorkerState,
    WorkerUpdate,
};

// Re-export IPC types used in this crate's public API
pub use cadre_ipc::{ErrorRecord, EventName, LifecycleEvent, SerializedSuite, SerializedTest, WorkItem};
