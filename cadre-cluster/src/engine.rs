//! Engine that runs each file through an external command
//!
//! Every file becomes one suite holding one test. The test passes when
//! `program args... <file>` exits successfully. The command's output is
//! captured, never inherited, because stdout carries the IPC channel.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

use cadre_config::EngineConfig;
use cadre_ipc::{ErrorRecord, TestState, WorkItem, DEFAULT_SLOW_MS};

use crate::error::EngineError;
use crate::runner::{EngineEvent, EventSink, ExecutionEngine, RunnableView, SuiteView};

/// Lines of stderr kept as the failure stack
const STDERR_TAIL_LINES: usize = 20;

/// Runs `program args... <file>` per file
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
    slow_ms: u64,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            slow_ms: DEFAULT_SLOW_MS,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.program.clone(), config.args.clone())
            .with_slow_threshold(config.slow_threshold_ms)
    }

    pub fn with_slow_threshold(mut self, slow_ms: u64) -> Self {
        self.slow_ms = slow_ms;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run_file(&self, file: &WorkItem, sink: &dyn EventSink) -> Result<(), EngineError> {
        let suite = FileSuite::new(file);
        let mut test = FileTest {
            suite: &suite,
            slow_ms: self.slow_ms,
            state: None,
            duration_ms: None,
        };

        sink.emit(EngineEvent::Suite(&suite));
        sink.emit(EngineEvent::Test(&test));

        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(file.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;
        test.duration_ms = Some(started.elapsed().as_millis() as u64);

        let result = match output {
            Ok(output) if output.status.success() => {
                debug!(file = %file, "Command passed");
                test.state = Some(TestState::Passed);
                sink.emit(EngineEvent::Pass(&test));
                Ok(())
            }
            Ok(output) => {
                test.state = Some(TestState::Failed);
                let message = match output.status.code() {
                    Some(code) => format!("{} exited with code {}", self.program, code),
                    None => format!("{} was terminated by a signal", self.program),
                };
                let mut error = ErrorRecord::new(message);
                if let Some(tail) = stderr_tail(&output.stderr) {
                    error = error.with_stack(tail);
                }
                sink.emit(EngineEvent::Fail(&test, error));
                Ok(())
            }
            Err(source) => {
                warn!(file = %file, "Failed to launch {}: {}", self.program, source);
                test.state = Some(TestState::Failed);
                let error = EngineError::Launch {
                    program: self.program.clone(),
                    source,
                };
                sink.emit(EngineEvent::Fail(&test, ErrorRecord::from(&error)));
                Err(error)
            }
        };

        sink.emit(EngineEvent::TestEnd(&test));
        sink.emit(EngineEvent::SuiteEnd(&suite));
        result
    }
}

#[async_trait]
impl ExecutionEngine for CommandEngine {
    async fn execute(&mut self, files: &[WorkItem], sink: &dyn EventSink) -> Result<(), EngineError> {
        sink.emit(EngineEvent::Start);

        let mut first_error = None;
        for file in files {
            if let Err(e) = self.run_file(file, sink).await {
                first_error.get_or_insert(e);
            }
        }

        sink.emit(EngineEvent::End);
        first_error.map_or(Ok(()), Err)
    }
}

fn stderr_tail(stderr: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }
    let start = lines.len().saturating_sub(STDERR_TAIL_LINES);
    Some(lines[start..].join("\n"))
}

struct FileSuite {
    path: String,
    name: String,
}

impl FileSuite {
    fn new(file: &WorkItem) -> Self {
        let name = Path::new(file.as_str())
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| file.to_string());
        Self {
            path: file.to_string(),
            name,
        }
    }
}

impl SuiteView for FileSuite {
    fn title(&self) -> &str {
        &self.path
    }

    fn full_title(&self) -> String {
        self.path.clone()
    }

    fn file(&self) -> Option<&str> {
        Some(&self.path)
    }

    fn test_titles(&self) -> Vec<String> {
        vec![self.name.clone()]
    }
}

struct FileTest<'a> {
    suite: &'a FileSuite,
    slow_ms: u64,
    state: Option<TestState>,
    duration_ms: Option<u64>,
}

impl RunnableView for FileTest<'_> {
    fn title(&self) -> &str {
        &self.suite.name
    }

    fn full_title(&self) -> String {
        format!("{} {}", self.suite.path, self.suite.name)
    }

    fn file(&self) -> Option<&str> {
        Some(&self.suite.path)
    }

    fn is_async(&self) -> bool {
        true
    }

    fn state(&self) -> Option<TestState> {
        self.state
    }

    fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    fn slow_ms(&self) -> u64 {
        self.slow_ms
    }
}
