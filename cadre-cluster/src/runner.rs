//! Worker-side execution
//!
//! A worker announces itself with `worker-ready`, then runs each `execute`
//! command through its [`ExecutionEngine`] and answers with
//! `worker-complete`. Engine events are projected into serialized records and
//! forwarded as `lifecycle-event` signals while the item runs.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

use cadre_ipc::{
    dispatch, ChannelSender, ControllerCommand, ErrorRecord, EventName, Flow, FramedReader,
    FramedWriter, IpcError, LifecycleEvent, MessageReceiver, RunnableKind, SerializedSuite,
    SerializedTest, Speed, StdioTransport, TestState, WorkItem, WorkerSignal, DEFAULT_SLOW_MS,
};

use crate::error::EngineError;

/// Read access to an engine's native test or hook
pub trait RunnableView {
    fn title(&self) -> &str;

    /// Title prefixed by the titles of every enclosing suite
    fn full_title(&self) -> String;

    fn file(&self) -> Option<&str> {
        None
    }

    fn is_async(&self) -> bool {
        false
    }

    fn is_pending(&self) -> bool {
        false
    }

    fn timed_out(&self) -> bool {
        false
    }

    fn state(&self) -> Option<TestState> {
        None
    }

    fn duration_ms(&self) -> Option<u64> {
        None
    }

    fn slow_ms(&self) -> u64 {
        DEFAULT_SLOW_MS
    }

    fn timer_id(&self) -> Option<u64> {
        None
    }

    fn kind(&self) -> RunnableKind {
        RunnableKind::Test
    }

    /// Flatten into the record sent across the process boundary
    fn to_record(&self) -> SerializedTest {
        let mut test = SerializedTest::new(self.title(), self.full_title());
        test.file = self.file().map(str::to_string);
        test.is_async = self.is_async();
        test.sync = !test.is_async;
        test.pending = self.is_pending();
        test.timed_out = self.timed_out();
        test.state = self.state();
        test.duration = self.duration_ms();
        test.slow = self.slow_ms();
        test.speed = test.duration.map(|d| Speed::classify(d, test.slow));
        test.timer = self.timer_id();
        test.kind = self.kind();
        test
    }
}

/// Read access to an engine's native suite
pub trait SuiteView {
    fn title(&self) -> &str;

    fn full_title(&self) -> String;

    fn file(&self) -> Option<&str> {
        None
    }

    fn is_delayed(&self) -> bool {
        false
    }

    fn is_root(&self) -> bool {
        false
    }

    /// Titles of the direct child tests
    fn test_titles(&self) -> Vec<String> {
        Vec::new()
    }

    fn to_record(&self) -> SerializedSuite {
        SerializedSuite {
            title: self.title().to_string(),
            full_title: self.full_title(),
            file: self.file().map(str::to_string),
            delayed: self.is_delayed(),
            root: self.is_root(),
            tests: self.test_titles(),
        }
    }
}

/// An event raised by the engine, borrowing its native objects
pub enum EngineEvent<'a> {
    Start,
    End,
    Suite(&'a dyn SuiteView),
    SuiteEnd(&'a dyn SuiteView),
    Test(&'a dyn RunnableView),
    TestEnd(&'a dyn RunnableView),
    Hook(&'a dyn RunnableView),
    HookEnd(&'a dyn RunnableView),
    Pass(&'a dyn RunnableView),
    Fail(&'a dyn RunnableView, ErrorRecord),
    Pending(&'a dyn RunnableView),
}

impl EngineEvent<'_> {
    pub fn name(&self) -> EventName {
        match self {
            EngineEvent::Start => EventName::Start,
            EngineEvent::End => EventName::End,
            EngineEvent::Suite(_) => EventName::Suite,
            EngineEvent::SuiteEnd(_) => EventName::SuiteEnd,
            EngineEvent::Test(_) => EventName::Test,
            EngineEvent::TestEnd(_) => EventName::TestEnd,
            EngineEvent::Hook(_) => EventName::Hook,
            EngineEvent::HookEnd(_) => EventName::HookEnd,
            EngineEvent::Pass(_) => EventName::Pass,
            EngineEvent::Fail(..) => EventName::Fail,
            EngineEvent::Pending(_) => EventName::Pending,
        }
    }

    /// Project into the serialized event
    pub fn to_lifecycle(&self) -> LifecycleEvent {
        let event = LifecycleEvent::new(self.name());
        match self {
            EngineEvent::Start | EngineEvent::End => event,
            EngineEvent::Suite(suite) | EngineEvent::SuiteEnd(suite) => {
                event.with_suite(suite.to_record())
            }
            EngineEvent::Test(test)
            | EngineEvent::TestEnd(test)
            | EngineEvent::Hook(test)
            | EngineEvent::HookEnd(test)
            | EngineEvent::Pass(test)
            | EngineEvent::Pending(test) => event.with_test(test.to_record()),
            EngineEvent::Fail(test, error) => {
                event.with_test(test.to_record()).with_error(error.clone())
            }
        }
    }
}

/// Receives engine events as they happen
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent<'_>);
}

/// Runs work items
#[async_trait]
pub trait ExecutionEngine: Send {
    /// Execute `files`, reporting through `sink`
    ///
    /// An `Err` is logged by the worker; completion is signalled either way.
    async fn execute(&mut self, files: &[WorkItem], sink: &dyn EventSink) -> Result<(), EngineError>;
}

/// Sink that forwards every engine event to the controller
#[derive(Clone)]
pub struct ChannelReporter {
    channel: ChannelSender<WorkerSignal>,
}

impl ChannelReporter {
    pub fn new(channel: ChannelSender<WorkerSignal>) -> Self {
        Self { channel }
    }
}

impl EventSink for ChannelReporter {
    fn emit(&self, event: EngineEvent<'_>) {
        self.channel
            .send(WorkerSignal::LifecycleEvent(event.to_lifecycle()));
    }
}

/// Handles controller commands inside a worker
pub struct WorkerRunner<E> {
    engine: E,
    channel: ChannelSender<WorkerSignal>,
    reporter: ChannelReporter,
    executed: u64,
}

impl<E: ExecutionEngine> WorkerRunner<E> {
    pub fn new(engine: E, channel: ChannelSender<WorkerSignal>) -> Self {
        Self {
            engine,
            reporter: ChannelReporter::new(channel.clone()),
            channel,
            executed: 0,
        }
    }

    /// Send the startup handshake
    pub fn announce_ready(&self) {
        self.channel.send(WorkerSignal::WorkerReady);
    }

    /// Number of items executed so far
    pub fn executed(&self) -> u64 {
        self.executed
    }
}

#[async_trait]
impl<E: ExecutionEngine> MessageReceiver<ControllerCommand> for WorkerRunner<E> {
    async fn receive(&mut self, message: ControllerCommand) -> Result<Flow, IpcError> {
        match message {
            ControllerCommand::Execute(item) => {
                info!(item = %item, "Executing item");
                if let Err(e) = self
                    .engine
                    .execute(std::slice::from_ref(&item), &self.reporter)
                    .await
                {
                    error!(item = %item, "Execution failed: {}", e);
                }
                self.executed += 1;
                self.channel.send(WorkerSignal::WorkerComplete);
                Ok(Flow::Continue)
            }
            ControllerCommand::Shutdown => {
                info!(executed = self.executed, "Shutdown requested");
                Ok(Flow::Stop)
            }
        }
    }
}

/// Serve one controller over an arbitrary transport
///
/// Returns once the controller sends `shutdown` or closes the channel, after
/// every queued signal has been written.
pub async fn serve<R, W, E>(
    mut reader: FramedReader<R>,
    writer: FramedWriter<W>,
    engine: E,
) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    E: ExecutionEngine,
{
    let (channel, writer_task) = ChannelSender::spawn("controller", writer);
    let mut runner = WorkerRunner::new(engine, channel);
    runner.announce_ready();

    let result = dispatch(&mut reader, &mut runner).await;

    // Dropping the last sender lets the writer drain and close
    drop(runner);
    if let Err(e) = writer_task.await {
        debug!("Writer task ended abnormally: {}", e);
    }
    result
}

/// Serve the controller over this process's stdin and stdout
pub async fn run_worker<E: ExecutionEngine>(engine: E) -> Result<(), IpcError> {
    let (reader, writer) = StdioTransport::split();
    serve(reader, writer, engine).await
}
