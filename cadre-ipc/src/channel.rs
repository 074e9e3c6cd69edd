//! Message channel: typed dispatch of inbound envelopes and a fire-and-forget
//! sender for outbound ones.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, Protocol};
use crate::transport::{FramedReader, FramedWriter};

/// What the dispatch loop does after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Receiver of decoded inbound messages
///
/// Each implementation matches over its protocol enum; there is no lookup by
/// name. Unknown kinds never reach the receiver because they are rejected
/// while the envelope is parsed.
#[async_trait]
pub trait MessageReceiver<M: Protocol>: Send {
    async fn receive(&mut self, message: M) -> Result<Flow, IpcError>;
}

/// Pump envelopes from `reader` into `receiver` until EOF or [`Flow::Stop`]
///
/// Protocol violations end the loop with the error. They are fatal to the
/// receiving side and are not retried here.
pub async fn dispatch<R, M, H>(reader: &mut FramedReader<R>, receiver: &mut H) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    M: Protocol,
    H: MessageReceiver<M> + ?Sized,
{
    loop {
        let envelope = match reader.next::<M>().await? {
            Some(envelope) => envelope,
            None => {
                debug!("Channel closed by remote end");
                return Ok(());
            }
        };

        debug!(kind = envelope.message.kind(), "Dispatching inbound message");
        if receiver.receive(envelope.message).await? == Flow::Stop {
            return Ok(());
        }
    }
}

/// Cloneable sending side of a channel
///
/// Sends are queued to a writer task. Once the transport has failed or the
/// channel was closed, `send` logs and drops the message instead of erroring,
/// since the remote end exiting is reported separately.
pub struct ChannelSender<M> {
    label: Arc<str>,
    tx: mpsc::UnboundedSender<M>,
    connected: Arc<AtomicBool>,
}

impl<M> Clone for ChannelSender<M> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            tx: self.tx.clone(),
            connected: self.connected.clone(),
        }
    }
}

impl<M: Protocol> ChannelSender<M> {
    /// Spawn a writer task over `writer` and return the sender feeding it
    ///
    /// The writer task ends, closing the transport, when every sender has been
    /// dropped.
    pub fn spawn<W>(label: impl Into<String>, mut writer: FramedWriter<W>) -> (Self, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let label: Arc<str> = Arc::from(label.into());
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, mut rx) = mpsc::unbounded_channel::<M>();

        let task_label = label.clone();
        let task_connected = connected.clone();
        let task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let kind = message.kind();
                if let Err(e) = writer.send(&MessageEnvelope::new(message)).await {
                    task_connected.store(false, Ordering::SeqCst);
                    match e {
                        // The remote end going away mid-send is expected during shutdown
                        IpcError::IoError(ref msg) if msg.contains("Broken pipe") => {
                            debug!(channel = %task_label, kind, "Channel closed while sending");
                        }
                        other => {
                            error!(channel = %task_label, kind, "Failed to send message: {}", other);
                        }
                    }
                    break;
                }
            }
            task_connected.store(false, Ordering::SeqCst);
            let _ = writer.close().await;
            debug!(channel = %task_label, "Channel writer finished");
        });

        (
            Self {
                label,
                tx,
                connected,
            },
            task,
        )
    }

    /// Queue a message for the remote end
    pub fn send(&self, message: M) {
        if !self.is_connected() {
            warn!(
                channel = %self.label,
                kind = message.kind(),
                "Dropping message for disconnected channel"
            );
            return;
        }

        if let Err(mpsc::error::SendError(message)) = self.tx.send(message) {
            self.connected.store(false, Ordering::SeqCst);
            warn!(
                channel = %self.label,
                kind = message.kind(),
                "Dropping message, channel writer has stopped"
            );
        }
    }

    /// Whether the transport is still believed to be open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    /// Mark the channel closed; later sends become no-ops
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}
