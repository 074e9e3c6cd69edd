//! IPC transport implementations
//!
//! Pipes carry no message boundaries, so every envelope is written as one
//! line of JSON. Readers and writers are separate halves so a process can
//! keep reading commands while events are flushed from another task.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, Protocol};

/// Reading half of a line-framed transport
pub struct FramedReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Receive the next envelope, or `None` once the other end has closed
    pub async fn next<T: Protocol>(&mut self) -> Result<Option<MessageEnvelope<T>>, IpcError> {
        loop {
            self.line.clear();
            let read = self
                .reader
                .read_line(&mut self.line)
                .await
                .map_err(|e| IpcError::IoError(e.to_string()))?;

            if read == 0 {
                return Ok(None);
            }

            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }

            return MessageEnvelope::parse(trimmed).map(Some);
        }
    }
}

/// Writing half of a line-framed transport
pub struct FramedWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Send a message to the other end
    pub async fn send<T: Serialize>(&mut self, message: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        json.push('\n');

        self.writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))?;

        self.writer
            .flush()
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Flush and shut down the underlying writer
    pub async fn close(&mut self) -> Result<(), IpcError> {
        self.writer
            .shutdown()
            .await
            .map_err(|e| IpcError::IoError(e.to_string()))
    }
}

/// Stdin/Stdout IPC transport used inside worker processes
pub struct StdioTransport;

impl StdioTransport {
    /// Split the process's own stdin/stdout into framed halves
    pub fn split() -> (FramedReader<tokio::io::Stdin>, FramedWriter<tokio::io::Stdout>) {
        (
            FramedReader::new(tokio::io::stdin()),
            FramedWriter::new(tokio::io::stdout()),
        )
    }
}

/// Child process transport for parent-child communication
pub struct ChildProcessTransport {
    stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
}

impl ChildProcessTransport {
    /// Create a new child process transport
    pub fn new(stdin: tokio::process::ChildStdin, stdout: tokio::process::ChildStdout) -> Self {
        Self { stdin, stdout }
    }

    /// Split into the reader of the child's stdout and the writer of its stdin
    pub fn split(
        self,
    ) -> (
        FramedReader<tokio::process::ChildStdout>,
        FramedWriter<tokio::process::ChildStdin>,
    ) {
        (FramedReader::new(self.stdout), FramedWriter::new(self.stdin))
    }
}
