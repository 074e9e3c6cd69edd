//! Aggregation of worker lifecycle events into one reporter stream
//!
//! Workers report engine events per file. The aggregator rebuilds typed
//! [`ReporterEvent`]s from the serialized records, absorbs the per-worker
//! `start`/`end` pair (the orchestrator emits exactly one of each for the
//! whole batch) and, in strict mode, keeps one worker's events contiguous.
//!
//! Strict mode elects a leader: the first worker to report while no leader
//! is set. Events from other workers are buffered in arrival order. When the
//! leader finishes its item or exits, the worker at the head of the buffer
//! is promoted and its events up to its own completion are flushed.

use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, warn};

use cadre_ipc::{
    ErrorRecord, EventName, LifecycleEvent, RunnableKind, SerializedSuite, SerializedTest, Speed,
    TestState,
};

use crate::worker::WorkerId;

/// A test or hook record with derived accessors
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TestRecord(SerializedTest);

impl TestRecord {
    pub fn title(&self) -> &str {
        &self.0.title
    }

    pub fn full_title(&self) -> &str {
        &self.0.full_title
    }

    pub fn file(&self) -> Option<&str> {
        self.0.file.as_deref()
    }

    pub fn state(&self) -> Option<TestState> {
        self.0.state
    }

    pub fn is_pending(&self) -> bool {
        self.0.pending || self.0.state == Some(TestState::Pending)
    }

    pub fn is_async(&self) -> bool {
        self.0.is_async
    }

    pub fn timed_out(&self) -> bool {
        self.0.timed_out
    }

    pub fn is_hook(&self) -> bool {
        self.0.kind == RunnableKind::Hook
    }

    /// Slow threshold in milliseconds
    pub fn slow(&self) -> u64 {
        self.0.slow
    }

    pub fn duration_ms(&self) -> Option<u64> {
        self.0.duration
    }

    /// Reported speed, or derived from the duration when absent
    pub fn speed(&self) -> Option<Speed> {
        self.0
            .speed
            .or_else(|| self.0.duration.map(|d| Speed::classify(d, self.0.slow)))
    }

    pub fn serialized(&self) -> &SerializedTest {
        &self.0
    }

    pub fn into_serialized(self) -> SerializedTest {
        self.0
    }
}

impl From<SerializedTest> for TestRecord {
    fn from(test: SerializedTest) -> Self {
        Self(test)
    }
}

/// A reconstructed lifecycle event as the reporter sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ReporterEvent {
    Start,
    End,
    Suite { suite: SerializedSuite },
    SuiteEnd { suite: SerializedSuite },
    Test { test: TestRecord },
    TestEnd { test: TestRecord },
    Hook { test: TestRecord },
    HookEnd { test: TestRecord },
    Pass { test: TestRecord },
    Fail { test: TestRecord, error: ErrorRecord },
    Pending { test: TestRecord },
}

impl ReporterEvent {
    pub fn name(&self) -> EventName {
        match self {
            ReporterEvent::Start => EventName::Start,
            ReporterEvent::End => EventName::End,
            ReporterEvent::Suite { .. } => EventName::Suite,
            ReporterEvent::SuiteEnd { .. } => EventName::SuiteEnd,
            ReporterEvent::Test { .. } => EventName::Test,
            ReporterEvent::TestEnd { .. } => EventName::TestEnd,
            ReporterEvent::Hook { .. } => EventName::Hook,
            ReporterEvent::HookEnd { .. } => EventName::HookEnd,
            ReporterEvent::Pass { .. } => EventName::Pass,
            ReporterEvent::Fail { .. } => EventName::Fail,
            ReporterEvent::Pending { .. } => EventName::Pending,
        }
    }

    /// Rebuild an event from its serialized form
    ///
    /// Returns `Err` with the name of the missing record when the event does
    /// not carry what its name requires.
    pub fn reconstruct(event: LifecycleEvent) -> Result<Self, &'static str> {
        let LifecycleEvent {
            event_name,
            test,
            suite,
            error,
        } = event;

        let test = || test.map(TestRecord::from).ok_or("test");
        let suite = || suite.ok_or("suite");

        Ok(match event_name {
            EventName::Start => ReporterEvent::Start,
            EventName::End => ReporterEvent::End,
            EventName::Suite => ReporterEvent::Suite { suite: suite()? },
            EventName::SuiteEnd => ReporterEvent::SuiteEnd { suite: suite()? },
            EventName::Test => ReporterEvent::Test { test: test()? },
            EventName::TestEnd => ReporterEvent::TestEnd { test: test()? },
            EventName::Hook => ReporterEvent::Hook { test: test()? },
            EventName::HookEnd => ReporterEvent::HookEnd { test: test()? },
            EventName::Pass => ReporterEvent::Pass { test: test()? },
            EventName::Pending => ReporterEvent::Pending { test: test()? },
            EventName::Fail => ReporterEvent::Fail {
                test: test()?,
                error: error.unwrap_or_else(|| ErrorRecord::new("unknown failure")),
            },
        })
    }
}

/// An event on the aggregated stream
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClusterEvent {
    /// Worker the event came from; `None` for the batch `start`/`end`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerId>,
    #[serde(flatten)]
    pub event: ReporterEvent,
}

impl ClusterEvent {
    pub fn start() -> Self {
        Self {
            worker: None,
            event: ReporterEvent::Start,
        }
    }

    pub fn end() -> Self {
        Self {
            worker: None,
            event: ReporterEvent::End,
        }
    }

    pub fn from_worker(worker: WorkerId, event: ReporterEvent) -> Self {
        Self {
            worker: Some(worker),
            event,
        }
    }

    pub fn name(&self) -> EventName {
        self.event.name()
    }
}

#[derive(Debug)]
enum Entry {
    Event(ReporterEvent),
    /// The worker finished an item while buffered
    Finished,
}

/// Merges per-worker events into the reporter stream
#[derive(Debug, Default)]
pub struct EventAggregator {
    strict: bool,
    leader: Option<WorkerId>,
    buffer: VecDeque<(WorkerId, Entry)>,
}

impl EventAggregator {
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            ..Default::default()
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Current leader in strict mode
    pub fn leader(&self) -> Option<WorkerId> {
        self.leader
    }

    /// Number of buffered events
    pub fn buffered(&self) -> usize {
        self.buffer
            .iter()
            .filter(|(_, entry)| matches!(entry, Entry::Event(_)))
            .count()
    }

    /// Accept a worker's serialized event, returning what may be emitted now
    pub fn accept(&mut self, worker: WorkerId, event: LifecycleEvent) -> Vec<ClusterEvent> {
        let name = event.event_name;
        match ReporterEvent::reconstruct(event) {
            Ok(ReporterEvent::Start) | Ok(ReporterEvent::End) => {
                debug!(worker_id = %worker, event = %name, "Absorbed per-worker event");
                Vec::new()
            }
            Ok(event) => self.push(worker, event),
            Err(missing) => {
                warn!(
                    worker_id = %worker,
                    event = %name,
                    "Dropping {} event without its {} record",
                    name,
                    missing
                );
                Vec::new()
            }
        }
    }

    /// Route an already reconstructed event
    pub fn push(&mut self, worker: WorkerId, event: ReporterEvent) -> Vec<ClusterEvent> {
        if !self.strict {
            return vec![ClusterEvent::from_worker(worker, event)];
        }

        let leader = *self.leader.get_or_insert(worker);
        if leader == worker {
            vec![ClusterEvent::from_worker(worker, event)]
        } else {
            self.buffer.push_back((worker, Entry::Event(event)));
            Vec::new()
        }
    }

    /// The worker completed its item
    pub fn worker_finished(&mut self, worker: WorkerId) -> Vec<ClusterEvent> {
        self.relinquish(worker)
    }

    /// The worker exited
    pub fn worker_gone(&mut self, worker: WorkerId) -> Vec<ClusterEvent> {
        self.relinquish(worker)
    }

    fn relinquish(&mut self, worker: WorkerId) -> Vec<ClusterEvent> {
        if !self.strict {
            return Vec::new();
        }

        if self.leader == Some(worker) {
            return self.promote();
        }

        if self.buffer.iter().any(|(w, _)| *w == worker) {
            self.buffer.push_back((worker, Entry::Finished));
        }
        Vec::new()
    }

    /// Hand leadership to the worker at the head of the buffer
    fn promote(&mut self) -> Vec<ClusterEvent> {
        self.leader = None;
        let mut out = Vec::new();

        while let Some(next) = self.buffer.front().map(|(w, _)| *w) {
            let mut finished = false;
            let mut remaining = VecDeque::with_capacity(self.buffer.len());

            for (worker, entry) in self.buffer.drain(..) {
                if worker != next || finished {
                    remaining.push_back((worker, entry));
                    continue;
                }
                match entry {
                    Entry::Event(event) => out.push(ClusterEvent::from_worker(worker, event)),
                    Entry::Finished => finished = true,
                }
            }
            self.buffer = remaining;

            if !finished {
                debug!(worker_id = %next, "Promoted to leader");
                self.leader = Some(next);
                break;
            }
        }

        out
    }

    /// Release everything still buffered, grouped by worker
    pub fn drain(&mut self) -> Vec<ClusterEvent> {
        self.leader = None;
        let mut out = Vec::new();

        while let Some(next) = self.buffer.front().map(|(w, _)| *w) {
            let (taken, remaining): (VecDeque<_>, VecDeque<_>) =
                self.buffer.drain(..).partition(|(w, _)| *w == next);
            self.buffer = remaining;
            out.extend(taken.into_iter().filter_map(|(worker, entry)| match entry {
                Entry::Event(event) => Some(ClusterEvent::from_worker(worker, event)),
                Entry::Finished => None,
            }));
        }

        out
    }
}
