//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::IpcError;
use crate::records::LifecycleEvent;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// One schedulable unit of work, a test file path
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(path: impl Into<String>) -> Self {
        Self(path.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItem {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for WorkItem {
    fn from(path: String) -> Self {
        Self(path)
    }
}

/// A closed set of message kinds that one side of the channel understands
///
/// Inbound envelopes are checked against [`Protocol::KINDS`] before their
/// payload is decoded, so an unknown kind surfaces as
/// [`IpcError::UnexpectedKind`] rather than a generic decode failure.
pub trait Protocol: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Every kind tag this protocol accepts
    const KINDS: &'static [&'static str];

    /// The kind tag of this message
    fn kind(&self) -> &'static str;

    /// Decode a message from its kind tag and raw payload
    fn decode(kind: &str, payload: JsonValue) -> Result<Self, IpcError> {
        if !Self::KINDS.contains(&kind) {
            return Err(IpcError::UnexpectedKind {
                kind: kind.to_string(),
            });
        }

        let mut object = serde_json::Map::new();
        object.insert("kind".to_string(), JsonValue::String(kind.to_string()));
        if !payload.is_null() {
            object.insert("payload".to_string(), payload);
        }

        serde_json::from_value(JsonValue::Object(object))
            .map_err(|e| IpcError::DeserializationError(format!("{} payload: {}", kind, e)))
    }
}

/// Commands sent from the controller to worker processes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum ControllerCommand {
    /// Run one work item
    Execute(WorkItem),

    /// Stop accepting work and exit
    Shutdown,
}

impl Protocol for ControllerCommand {
    const KINDS: &'static [&'static str] = &["execute", "shutdown"];

    fn kind(&self) -> &'static str {
        match self {
            ControllerCommand::Execute(_) => "execute",
            ControllerCommand::Shutdown => "shutdown",
        }
    }
}

/// Signals sent from worker processes to the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum WorkerSignal {
    /// Startup handshake finished, the worker accepts work
    WorkerReady,

    /// The assigned work item has finished
    WorkerComplete,

    /// One event from the execution engine
    LifecycleEvent(LifecycleEvent),
}

impl Protocol for WorkerSignal {
    const KINDS: &'static [&'static str] = &["worker-ready", "worker-complete", "lifecycle-event"];

    fn kind(&self) -> &'static str {
        match self {
            WorkerSignal::WorkerReady => "worker-ready",
            WorkerSignal::WorkerComplete => "worker-complete",
            WorkerSignal::LifecycleEvent(_) => "lifecycle-event",
        }
    }
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

/// Envelope as it appears on the wire, before the kind is checked
#[derive(Debug, Deserialize)]
struct RawEnvelope {
    protocol_version: u32,
    timestamp: DateTime<Utc>,
    message: RawMessage,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    kind: Option<String>,
    #[serde(default)]
    payload: JsonValue,
}

impl<T: Protocol> MessageEnvelope<T> {
    /// Parse one framed envelope, checking version and kind before the payload
    pub fn parse(line: &str) -> Result<Self, IpcError> {
        let raw: RawEnvelope = serde_json::from_str(line)
            .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

        if raw.protocol_version != IPC_PROTOCOL_VERSION {
            return Err(IpcError::ProtocolVersionMismatch {
                expected: IPC_PROTOCOL_VERSION,
                actual: raw.protocol_version,
            });
        }

        let kind = raw
            .message
            .kind
            .ok_or_else(|| IpcError::InvalidMessage("envelope has no kind".to_string()))?;

        Ok(Self {
            protocol_version: raw.protocol_version,
            timestamp: raw.timestamp,
            message: T::decode(&kind, raw.message.payload)?,
        })
    }
}
