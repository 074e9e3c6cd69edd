//! Inter-process communication for cadre
//!
//! This crate provides the envelope protocol, the line-framed transport and the
//! message channel used between the controller and its worker processes.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod records;
pub mod transport;

// Re-export commonly used types
pub use channel::{dispatch, ChannelSender, Flow, MessageReceiver};
pub use error::IpcError;
pub use protocol::{
    ControllerCommand, MessageEnvelope, Protocol, WorkItem, WorkerSignal, IPC_PROTOCOL_VERSION,
};
pub use records::{
    ErrorRecord, EventName, LifecycleEvent, RunnableKind, SerializedSuite, SerializedTest, Speed,
    TestState, DEFAULT_SLOW_MS,
};
pub use transport::{ChildProcessTransport, FramedReader, FramedWriter, StdioTransport};
