//! Serialized lifecycle records exchanged between workers and the controller
//!
//! The execution engine's native suites and tests hold references to their
//! parents and run context. These records are the flattened, cycle-free
//! projections that cross the process boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default slow threshold in milliseconds
pub const DEFAULT_SLOW_MS: u64 = 75;

/// Name of a lifecycle event emitted by the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
    Start,
    End,
    Suite,
    SuiteEnd,
    Test,
    TestEnd,
    Hook,
    HookEnd,
    Pass,
    Fail,
    Pending,
}

impl EventName {
    pub const ALL: [EventName; 11] = [
        EventName::Start,
        EventName::End,
        EventName::Suite,
        EventName::SuiteEnd,
        EventName::Test,
        EventName::TestEnd,
        EventName::Hook,
        EventName::HookEnd,
        EventName::Pass,
        EventName::Fail,
        EventName::Pending,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Start => "start",
            EventName::End => "end",
            EventName::Suite => "suite",
            EventName::SuiteEnd => "suite-end",
            EventName::Test => "test",
            EventName::TestEnd => "test-end",
            EventName::Hook => "hook",
            EventName::HookEnd => "hook-end",
            EventName::Pass => "pass",
            EventName::Fail => "fail",
            EventName::Pending => "pending",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome state of a finished test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestState {
    Passed,
    Failed,
    Pending,
}

/// Speed classification relative to the slow threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speed {
    Fast,
    Medium,
    Slow,
}

impl Speed {
    /// Classify a duration: above the threshold is slow, above half of it medium
    pub fn classify(duration_ms: u64, slow_ms: u64) -> Self {
        if duration_ms > slow_ms {
            Speed::Slow
        } else if duration_ms > slow_ms / 2 {
            Speed::Medium
        } else {
            Speed::Fast
        }
    }
}

/// Whether a runnable is a test or a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnableKind {
    #[default]
    Test,
    Hook,
}

/// Flattened projection of a test or hook
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedTest {
    pub title: String,
    pub full_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "async", default)]
    pub is_async: bool,
    #[serde(default)]
    pub sync: bool,
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TestState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Speed>,
    /// Identifier of the engine's timeout timer, if one was armed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<u64>,
    /// Duration in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(rename = "type", default)]
    pub kind: RunnableKind,
    /// Slow threshold in milliseconds
    #[serde(default = "default_slow")]
    pub slow: u64,
}

fn default_slow() -> u64 {
    DEFAULT_SLOW_MS
}

impl SerializedTest {
    /// Create a test record with the given titles and defaults elsewhere
    pub fn new(title: impl Into<String>, full_title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            full_title: full_title.into(),
            file: None,
            is_async: false,
            sync: true,
            pending: false,
            timed_out: false,
            state: None,
            speed: None,
            timer: None,
            duration: None,
            kind: RunnableKind::Test,
            slow: DEFAULT_SLOW_MS,
        }
    }
}

/// Flattened projection of a suite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedSuite {
    pub title: String,
    #[serde(default)]
    pub full_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default)]
    pub delayed: bool,
    #[serde(default)]
    pub root: bool,
    /// Titles of the suite's direct child tests
    #[serde(default)]
    pub tests: Vec<String>,
}

impl SerializedSuite {
    pub fn new(title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            full_title: title.clone(),
            title,
            file: None,
            delayed: false,
            root: false,
            tests: Vec::new(),
        }
    }
}

/// Failure details attached to a `fail` event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl<E: std::error::Error> From<&E> for ErrorRecord {
    fn from(err: &E) -> Self {
        let mut stack = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push(format!("caused by: {}", cause));
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack: if stack.is_empty() {
                None
            } else {
                Some(stack.join("\n"))
            },
        }
    }
}

/// One lifecycle event as forwarded by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    pub event_name: EventName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<SerializedTest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite: Option<SerializedSuite>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorRecord>,
}

impl LifecycleEvent {
    pub fn new(event_name: EventName) -> Self {
        Self {
            event_name,
            test: None,
            suite: None,
            error: None,
        }
    }

    pub fn with_test(mut self, test: SerializedTest) -> Self {
        self.test = Some(test);
        self
    }

    pub fn with_suite(mut self, suite: SerializedSuite) -> Self {
        self.suite = Some(suite);
        self
    }

    pub fn with_error(mut self, error: ErrorRecord) -> Self {
        self.error = Some(error);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_name_wire_format() {
        for name in EventName::ALL {
            let value = serde_json::to_value(name).unwrap();
            assert_eq!(value, json!(name.as_str()));
        }
        let parsed: EventName = serde_json::from_value(json!("suite-end")).unwrap();
        assert_eq!(parsed, EventName::SuiteEnd);
    }

    #[test]
    fn test_speed_classification() {
        assert_eq!(Speed::classify(10, 75), Speed::Fast);
        assert_eq!(Speed::classify(37, 75), Speed::Fast);
        assert_eq!(Speed::classify(38, 75), Speed::Medium);
        assert_eq!(Speed::classify(75, 75), Speed::Medium);
        assert_eq!(Speed::classify(76, 75), Speed::Slow);
    }

    #[test]
    fn test_serialized_test_field_names() {
        let mut test = SerializedTest::new("adds", "math adds");
        test.is_async = true;
        test.timed_out = true;
        test.state = Some(TestState::Failed);
        test.kind = RunnableKind::Hook;

        let value = serde_json::to_value(&test).unwrap();
        assert_eq!(value["fullTitle"], "math adds");
        assert_eq!(value["async"], true);
        assert_eq!(value["timedOut"], true);
        assert_eq!(value["state"], "failed");
        assert_eq!(value["type"], "hook");
        assert!(value.get("file").is_none());
    }

    #[test]
    fn test_sparse_test_record_uses_defaults() {
        let test: SerializedTest =
            serde_json::from_value(json!({"title": "t", "fullTitle": "s t"})).unwrap();
        assert_eq!(test.slow, DEFAULT_SLOW_MS);
        assert_eq!(test.kind, RunnableKind::Test);
        assert!(!test.pending);
    }

    #[test]
    fn test_error_record_from_error_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let record = ErrorRecord::from(&io);
        assert_eq!(record.message, "disk on fire");
        assert!(record.stack.is_none());
    }
}
