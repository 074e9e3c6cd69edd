//! Worker handles and worker process spawning
//!
//! The orchestrator owns one [`WorkerHandle`] per live worker. A handle holds
//! the worker's scheduling state and a [`WorkerLink`] for sending commands.
//! Everything a worker says comes back on a single update channel as
//! [`WorkerUpdate`]s, so the orchestrator can run as one event loop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use cadre_ipc::{
    dispatch, ChannelSender, ChildProcessTransport, ControllerCommand, Flow, IpcError,
    MessageReceiver, Protocol, WorkItem, WorkerSignal,
};

use crate::error::ClusterError;

/// How long an exited worker's stdout may stay open before its reader is aborted
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Controller-assigned identifier of a worker, stable for its lifetime
///
/// Distinct from the OS pid, which is only known for real processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Scheduling state of a worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerState {
    /// Started, handshake not yet received
    Spawned,
    /// Ready and without an assignment
    Idle,
    /// Executing exactly one item
    Busy(WorkItem),
    /// Told to exit
    Retiring,
    /// Process has exited
    Gone,
}

impl WorkerState {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerState::Spawned => "spawned",
            WorkerState::Idle => "idle",
            WorkerState::Busy(_) => "busy",
            WorkerState::Retiring => "retiring",
            WorkerState::Gone => "gone",
        }
    }
}

/// What happened to a worker
#[derive(Debug)]
pub enum WorkerEvent {
    /// A decoded signal from the worker
    Signal(WorkerSignal),
    /// The channel to the worker broke
    Failed(String),
    /// The worker sent something outside the protocol
    ProtocolViolation(IpcError),
    /// The process exited, with its exit code if it had one
    Exited(Option<i32>),
}

/// One inbound update, tagged with the worker it came from
#[derive(Debug)]
pub struct WorkerUpdate {
    pub worker_id: WorkerId,
    pub event: WorkerEvent,
}

impl WorkerUpdate {
    pub fn new(worker_id: WorkerId, event: WorkerEvent) -> Self {
        Self { worker_id, event }
    }

    pub fn signal(worker_id: WorkerId, signal: WorkerSignal) -> Self {
        Self::new(worker_id, WorkerEvent::Signal(signal))
    }
}

/// Controller's outbound link to one worker
pub trait WorkerLink: Send {
    /// OS process id, if the worker is a real process
    fn pid(&self) -> Option<u32>;

    /// Queue a command for the worker
    fn send(&mut self, command: ControllerCommand);

    /// Ask the worker to exit, forcing it after `grace`
    ///
    /// The worker reports [`WorkerEvent::Exited`] once it is gone.
    fn terminate(&mut self, grace: Duration);
}

/// Starts workers
pub trait WorkerSpawner: Send {
    /// Start a worker that reports on `updates`
    fn spawn(
        &mut self,
        worker_id: WorkerId,
        updates: mpsc::UnboundedSender<WorkerUpdate>,
    ) -> Result<Box<dyn WorkerLink>, ClusterError>;
}

/// Orchestrator-side record of one worker
pub struct WorkerHandle {
    id: WorkerId,
    link: Box<dyn WorkerLink>,
    state: WorkerState,
    started_at: DateTime<Utc>,
    items_completed: u64,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("pid", &self.link.pid())
            .field("state", &self.state)
            .field("items_completed", &self.items_completed)
            .finish()
    }
}

impl WorkerHandle {
    pub fn new(id: WorkerId, link: Box<dyn WorkerLink>) -> Self {
        Self {
            id,
            link,
            state: WorkerState::Spawned,
            started_at: Utc::now(),
            items_completed: 0,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.link.pid()
    }

    pub fn state(&self) -> &WorkerState {
        &self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn items_completed(&self) -> u64 {
        self.items_completed
    }

    /// Whether the startup handshake has been received
    pub fn is_ready(&self) -> bool {
        !matches!(self.state, WorkerState::Spawned | WorkerState::Gone)
    }

    /// Whether an item is assigned and not yet completed
    pub fn is_active(&self) -> bool {
        matches!(self.state, WorkerState::Busy(_))
    }

    /// Ready and inactive
    pub fn is_idle(&self) -> bool {
        self.state == WorkerState::Idle
    }

    pub fn current_item(&self) -> Option<&WorkItem> {
        match &self.state {
            WorkerState::Busy(item) => Some(item),
            _ => None,
        }
    }

    fn invalid(&self, to: &'static str) -> ClusterError {
        ClusterError::InvalidTransition {
            worker: self.id,
            from: self.state.name(),
            to,
        }
    }

    /// Record the startup handshake
    pub fn mark_ready(&mut self) -> Result<(), ClusterError> {
        match self.state {
            WorkerState::Spawned => {
                self.state = WorkerState::Idle;
                Ok(())
            }
            _ => Err(self.invalid("idle")),
        }
    }

    /// Assign an item and send it to the worker
    pub fn assign(&mut self, item: WorkItem) -> Result<(), ClusterError> {
        if self.state != WorkerState::Idle {
            return Err(self.invalid("busy"));
        }
        self.link.send(ControllerCommand::Execute(item.clone()));
        self.state = WorkerState::Busy(item);
        Ok(())
    }

    /// Record completion of the current item, returning it
    pub fn complete(&mut self) -> Result<WorkItem, ClusterError> {
        match std::mem::replace(&mut self.state, WorkerState::Idle) {
            WorkerState::Busy(item) => {
                self.items_completed += 1;
                Ok(item)
            }
            previous => {
                self.state = previous;
                Err(self.invalid("idle"))
            }
        }
    }

    /// Send the single terminate instruction
    ///
    /// Only ready, inactive workers are retired.
    pub fn retire(&mut self, grace: Duration) -> Result<(), ClusterError> {
        if self.state != WorkerState::Idle {
            return Err(self.invalid("retiring"));
        }
        self.link.terminate(grace);
        self.state = WorkerState::Retiring;
        Ok(())
    }

    /// Record process exit, returning the item that was in flight
    pub fn exited(&mut self) -> Option<WorkItem> {
        match std::mem::replace(&mut self.state, WorkerState::Gone) {
            WorkerState::Busy(item) => Some(item),
            _ => None,
        }
    }
}

/// Spawns workers as child processes speaking the IPC protocol on stdio
///
/// The child's stderr is inherited so worker logs reach the terminal.
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Spawn workers by re-executing the current binary
    pub fn current_exe(args: Vec<String>) -> Result<Self, ClusterError> {
        let program = std::env::current_exe()
            .map_err(|e| ClusterError::SpawnError(format!("Failed to get current exe: {}", e)))?;
        Ok(Self::new(program, args))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(
        &mut self,
        worker_id: WorkerId,
        updates: mpsc::UnboundedSender<WorkerUpdate>,
    ) -> Result<Box<dyn WorkerLink>, ClusterError> {
        debug!("Spawning worker process: {}", worker_id);

        // Flags must precede a `--` separator or they would parse as files
        let (flags, trailing) = match self.args.iter().position(|arg| arg == "--") {
            Some(index) => self.args.split_at(index),
            None => (self.args.as_slice(), &[][..]),
        };

        let mut cmd = Command::new(&self.program);
        cmd.args(flags)
            .arg("--worker-id")
            .arg(worker_id.get().to_string())
            .args(trailing)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| ClusterError::SpawnError(format!("Failed to spawn worker: {}", e)))?;

        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClusterError::SpawnError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClusterError::SpawnError("Failed to get stdout".to_string()))?;

        let (mut reader, writer) = ChildProcessTransport::new(stdin, stdout).split();
        let (sender, _writer_task) = ChannelSender::spawn(worker_id.to_string(), writer);

        // Stdout reader task
        let reader_updates = updates.clone();
        let reader_task = tokio::spawn(async move {
            let mut forwarder = SignalForwarder {
                worker_id,
                updates: reader_updates,
            };
            if let Err(e) = dispatch(&mut reader, &mut forwarder).await {
                let event = match e {
                    IpcError::IoError(_) | IpcError::ConnectionClosed | IpcError::NotConnected => {
                        WorkerEvent::Failed(e.to_string())
                    }
                    other => WorkerEvent::ProtocolViolation(other),
                };
                let _ = forwarder.updates.send(WorkerUpdate::new(worker_id, event));
            }
        });

        // Supervisor task: owns the child and reports its exit after the
        // reader has drained everything the worker wrote
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    debug!("Force killing {}", worker_id);
                    if let Err(e) = child.kill().await {
                        debug!("Failed to kill {}: {}", worker_id, e);
                    }
                    child.wait().await
                }
            };

            let reader_abort = reader_task.abort_handle();
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader_task).await.is_err() {
                warn!("{} stdout still open after exit", worker_id);
                reader_abort.abort();
            }

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("Failed to wait for {}: {}", worker_id, e);
                    None
                }
            };
            let _ = updates.send(WorkerUpdate::new(worker_id, WorkerEvent::Exited(code)));
        });

        info!(worker_id = %worker_id, pid = ?pid, "Spawned worker process");

        Ok(Box::new(ProcessLink {
            worker_id,
            pid,
            sender: Some(sender),
            kill_tx: Some(kill_tx),
        }))
    }
}

/// Link to a worker child process
///
/// Dropping the link kills the process if it is still running.
struct ProcessLink {
    worker_id: WorkerId,
    pid: Option<u32>,
    sender: Option<ChannelSender<ControllerCommand>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl WorkerLink for ProcessLink {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn send(&mut self, command: ControllerCommand) {
        match &self.sender {
            Some(sender) => sender.send(command),
            None => warn!(
                worker_id = %self.worker_id,
                kind = command.kind(),
                "Dropping command for terminated worker"
            ),
        }
    }

    fn terminate(&mut self, grace: Duration) {
        debug!("Stopping {}", self.worker_id);

        // Shutdown, then close stdin once the writer drains
        if let Some(sender) = self.sender.take() {
            sender.send(ControllerCommand::Shutdown);
        }

        if let Some(kill_tx) = self.kill_tx.take() {
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                // Fails if the process already exited
                let _ = kill_tx.send(());
            });
        }
    }
}

/// Forwards decoded worker signals onto the orchestrator's update channel
struct SignalForwarder {
    worker_id: WorkerId,
    updates: mpsc::UnboundedSender<WorkerUpdate>,
}

#[async_trait]
impl MessageReceiver<WorkerSignal> for SignalForwarder {
    async fn receive(&mut self, message: WorkerSignal) -> Result<Flow, IpcError> {
        if self
            .updates
            .send(WorkerUpdate::signal(self.worker_id, message))
            .is_err()
        {
            // Orchestrator is gone
            return Ok(Flow::Stop);
        }
        Ok(Flow::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Log {
        sent: Vec<ControllerCommand>,
        terminated: usize,
    }

    struct RecordingLink(Arc<Mutex<Log>>);

    impl WorkerLink for RecordingLink {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn send(&mut self, command: ControllerCommand) {
            self.0.lock().unwrap().sent.push(command);
        }

        fn terminate(&mut self, _grace: Duration) {
            self.0.lock().unwrap().terminated += 1;
        }
    }

    fn handle() -> (WorkerHandle, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let handle = WorkerHandle::new(WorkerId::new(1), Box::new(RecordingLink(log.clone())));
        (handle, log)
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId::new(7).to_string(), "worker-7");
        assert_eq!(serde_json::to_value(WorkerId::new(7)).unwrap(), 7);
    }

    #[test]
    fn test_lifecycle_transitions() {
        let (mut worker, log) = handle();
        assert!(!worker.is_ready());
        assert!(!worker.is_active());

        worker.mark_ready().unwrap();
        assert!(worker.is_ready());
        assert!(worker.is_idle());

        worker.assign("a.test".into()).unwrap();
        assert!(worker.is_active());
        assert_eq!(worker.current_item().map(WorkItem::as_str), Some("a.test"));
        assert_eq!(
            log.lock().unwrap().sent,
            vec![ControllerCommand::Execute("a.test".into())]
        );

        assert_eq!(worker.complete().unwrap(), WorkItem::from("a.test"));
        assert!(worker.is_idle());
        assert_eq!(worker.items_completed(), 1);

        worker.retire(Duration::from_millis(10)).unwrap();
        assert_eq!(worker.state(), &WorkerState::Retiring);
        assert_eq!(log.lock().unwrap().terminated, 1);
        assert!(worker.exited().is_none());
        assert_eq!(worker.state(), &WorkerState::Gone);
    }

    #[test]
    fn test_assign_requires_idle() {
        let (mut worker, log) = handle();
        // Not ready yet
        let err = worker.assign("a.test".into()).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidTransition { from: "spawned", .. }));

        worker.mark_ready().unwrap();
        worker.assign("a.test".into()).unwrap();
        // Never two items at once
        assert!(worker.assign("b.test".into()).is_err());
        assert_eq!(log.lock().unwrap().sent.len(), 1);
    }

    #[test]
    fn test_complete_without_assignment_is_rejected() {
        let (mut worker, _log) = handle();
        worker.mark_ready().unwrap();
        assert!(worker.complete().is_err());
        assert!(worker.is_idle());
        assert!(worker.mark_ready().is_err());
    }

    #[test]
    fn test_retire_is_single_shot() {
        let (mut worker, log) = handle();
        worker.mark_ready().unwrap();
        worker.retire(Duration::from_millis(10)).unwrap();
        assert!(worker.retire(Duration::from_millis(10)).is_err());
        assert_eq!(log.lock().unwrap().terminated, 1);
    }

    #[test]
    fn test_exit_while_busy_returns_item() {
        let (mut worker, _log) = handle();
        worker.mark_ready().unwrap();
        worker.assign("lost.test".into()).unwrap();
        assert_eq!(worker.exited(), Some(WorkItem::from("lost.test")));
        assert!(!worker.is_ready());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let mut spawner = ProcessSpawner::new("/nonexistent/cadre-worker", Vec::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = spawner.spawn(WorkerId::new(1), tx).err().unwrap();
        assert!(matches!(err, ClusterError::SpawnError(_)));
    }

    #[cfg(unix)]
    async fn exit_code(updates: &mut mpsc::UnboundedReceiver<WorkerUpdate>) -> Option<i32> {
        loop {
            let update = tokio::time::timeout(Duration::from_secs(15), updates.recv())
                .await
                .expect("worker exit reported")
                .expect("update channel open");
            if let WorkerEvent::Exited(code) = update.event {
                return code;
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_worker_id_precedes_separator() {
        let script = r#"[ "$0" = --worker-id ] && [ "$1" = 4 ] && [ "$2" = -- ] || exit 9"#;
        let mut spawner = ProcessSpawner::new(
            "sh",
            vec!["-c".to_string(), script.to_string(), "--".to_string(), "a.test".to_string()],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = spawner.spawn(WorkerId::new(4), tx).unwrap();
        assert_eq!(exit_code(&mut rx).await, Some(0));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reader_is_aborted_when_stdout_outlives_worker() {
        // The background sleep inherits stdout and keeps it open after sh exits
        let mut spawner = ProcessSpawner::new(
            "sh",
            vec!["-c".to_string(), "(sleep 30 &); exit 0".to_string()],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _link = spawner.spawn(WorkerId::new(1), tx).unwrap();
        assert_eq!(exit_code(&mut rx).await, Some(0));

        // Every update sender is released once the reader task is gone
        let closed = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(closed, Ok(None)), "reader task still running");
    }
}
