//! Worker pool orchestrator
//!
//! A single task owns all scheduling state. Worker signals, channel failures
//! and process exits arrive on one update channel and are handled one at a
//! time, so scheduling passes never interleave.
//!
//! A scheduling pass:
//! 1. grows the pool to `min(queued items, core count)`,
//! 2. hands the head item to each ready, inactive worker,
//! 3. once the queue is empty and every worker is ready and inactive, emits
//!    the batch `end` event and retires the pool.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use cadre_config::{ClusterConfig, CrashPolicy};
use cadre_ipc::{ErrorRecord, SerializedTest, TestState, WorkItem, WorkerSignal};

use crate::aggregator::{ClusterEvent, EventAggregator, ReporterEvent};
use crate::error::ClusterError;
use crate::queue::WorkQueue;
use crate::worker::{
    WorkerEvent, WorkerHandle, WorkerId, WorkerSpawner, WorkerState, WorkerUpdate,
};

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently live workers, at least 1
    pub core_count: usize,
    pub strict_ordering: bool,
    pub crash_policy: CrashPolicy,
    /// How long a retired worker may take to exit before it is killed
    pub shutdown_grace_period: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from(&ClusterConfig::default())
    }
}

impl From<&ClusterConfig> for OrchestratorConfig {
    fn from(config: &ClusterConfig) -> Self {
        Self {
            core_count: config.worker_limit(),
            strict_ordering: config.strict_ordering,
            crash_policy: config.crash_policy,
            shutdown_grace_period: config.shutdown_grace_period,
        }
    }
}

/// Outcome of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub items: usize,
    pub completed: usize,
    pub workers_spawned: usize,
    pub requeued: usize,
    /// Items whose worker exited before completing them
    pub lost: Vec<WorkItem>,
}

/// Owns the queue, the pool and the aggregated event stream
pub struct Orchestrator<S: WorkerSpawner> {
    config: OrchestratorConfig,
    spawner: S,
    queue: WorkQueue,
    workers: BTreeMap<WorkerId, WorkerHandle>,
    aggregator: EventAggregator,
    listeners: Vec<mpsc::UnboundedSender<ClusterEvent>>,
    updates_tx: mpsc::UnboundedSender<WorkerUpdate>,
    updates_rx: mpsc::UnboundedReceiver<WorkerUpdate>,
    next_worker_id: u32,
    started: bool,
    ended: bool,
    requeued: HashSet<WorkItem>,
    summary: RunSummary,
}

impl<S: WorkerSpawner> Orchestrator<S> {
    pub fn new(mut config: OrchestratorConfig, spawner: S) -> Self {
        config.core_count = config.core_count.max(1);
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            aggregator: EventAggregator::new(config.strict_ordering),
            config,
            spawner,
            queue: WorkQueue::new(),
            workers: BTreeMap::new(),
            listeners: Vec::new(),
            updates_tx,
            updates_rx,
            next_worker_id: 1,
            started: false,
            ended: false,
            requeued: HashSet::new(),
            summary: RunSummary::default(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Register a listener for the aggregated event stream
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ClusterEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(tx);
        rx
    }

    /// Sender for worker updates, as handed to the spawner
    pub fn updates(&self) -> mpsc::UnboundedSender<WorkerUpdate> {
        self.updates_tx.clone()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn pool_size(&self) -> usize {
        self.workers.len()
    }

    pub fn worker(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.workers.values()
    }

    pub fn has_ended(&self) -> bool {
        self.ended
    }

    /// `end` has been emitted and every worker has exited
    pub fn is_finished(&self) -> bool {
        self.ended && self.workers.is_empty()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Run a batch to completion
    ///
    /// Emits `start`, schedules every item and returns once `end` has been
    /// emitted and the pool has exited.
    pub async fn run<I>(&mut self, items: I) -> Result<RunSummary, ClusterError>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        let span = info_span!("run", run_id = %Uuid::new_v4());
        async move {
            self.start(items)?;

            loop {
                if self.is_finished() {
                    break;
                }
                if let Some(pending) = self.stalled() {
                    error!(pending, "No workers left to run queued items");
                    self.abort();
                    return Err(ClusterError::Stalled { pending });
                }

                let update = self
                    .updates_rx
                    .recv()
                    .await
                    .ok_or(ClusterError::ChannelClosed)?;

                if let Err(e) = self.handle_update(update) {
                    error!("Aborting run: {}", e);
                    self.abort();
                    return Err(e);
                }
            }

            info!(
                items = self.summary.items,
                completed = self.summary.completed,
                lost = self.summary.lost.len(),
                "Run finished"
            );
            Ok(self.summary.clone())
        }
        .instrument(span)
        .await
    }

    /// Emit `start`, enqueue the items and run the first scheduling pass
    pub fn start<I>(&mut self, items: I) -> Result<(), ClusterError>
    where
        I: IntoIterator<Item = WorkItem>,
    {
        if self.started {
            return Err(ClusterError::AlreadyStarted);
        }
        self.started = true;

        self.emit(ClusterEvent::start());
        let before = self.queue.len();
        self.queue.extend(items);
        self.summary.items = self.queue.len() - before;

        info!(
            items = self.summary.items,
            cores = self.config.core_count,
            strict = self.config.strict_ordering,
            "Starting run"
        );
        self.schedule()
    }

    /// Queued items remain but no worker is left to take them
    pub fn stalled(&self) -> Option<usize> {
        if !self.ended && self.workers.is_empty() && !self.queue.is_empty() {
            Some(self.queue.len())
        } else {
            None
        }
    }

    /// Apply one update from a worker
    ///
    /// Returns an error only for conditions that end the run.
    pub fn handle_update(&mut self, update: WorkerUpdate) -> Result<(), ClusterError> {
        let WorkerUpdate { worker_id, event } = update;

        if !self.workers.contains_key(&worker_id) {
            debug!(worker_id = %worker_id, "Ignoring update from removed worker: {:?}", event);
            return Ok(());
        }

        match event {
            WorkerEvent::Signal(WorkerSignal::WorkerReady) => self.on_ready(worker_id),
            WorkerEvent::Signal(WorkerSignal::WorkerComplete) => self.on_complete(worker_id),
            WorkerEvent::Signal(WorkerSignal::LifecycleEvent(event)) => {
                let events = self.aggregator.accept(worker_id, event);
                self.emit_all(events);
                Ok(())
            }
            WorkerEvent::Failed(message) => {
                // The exit that follows decides what happens to its item
                error!(worker_id = %worker_id, "Worker channel failed: {}", message);
                Ok(())
            }
            WorkerEvent::ProtocolViolation(source) => Err(ClusterError::ProtocolViolation {
                worker: worker_id,
                source,
            }),
            WorkerEvent::Exited(code) => self.on_exit(worker_id, code),
        }
    }

    fn on_ready(&mut self, worker_id: WorkerId) -> Result<(), ClusterError> {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            if let Err(e) = worker.mark_ready() {
                warn!("Ignoring duplicate ready signal: {}", e);
                return Ok(());
            }
            debug!(worker_id = %worker_id, pid = ?worker.pid(), "Worker ready");
        }
        self.schedule()
    }

    fn on_complete(&mut self, worker_id: WorkerId) -> Result<(), ClusterError> {
        if let Some(worker) = self.workers.get_mut(&worker_id) {
            match worker.complete() {
                Ok(item) => {
                    debug!(worker_id = %worker_id, item = %item, "Item complete");
                    self.summary.completed += 1;
                }
                Err(e) => {
                    warn!("Ignoring completion: {}", e);
                    return Ok(());
                }
            }
        }

        let events = self.aggregator.worker_finished(worker_id);
        self.emit_all(events);
        self.schedule()
    }

    fn on_exit(&mut self, worker_id: WorkerId, code: Option<i32>) -> Result<(), ClusterError> {
        let Some(mut worker) = self.workers.remove(&worker_id) else {
            return Ok(());
        };
        let retiring = *worker.state() == WorkerState::Retiring;
        let lost = worker.exited();

        if let Some(item) = lost {
            warn!(
                worker_id = %worker_id,
                exit_code = ?code,
                item = %item,
                "Worker exited before completing its item"
            );
            self.recover(worker_id, item, code);
        } else if retiring {
            debug!(worker_id = %worker_id, exit_code = ?code, "Worker retired");
        } else {
            info!(worker_id = %worker_id, exit_code = ?code, "Worker exited");
        }

        let events = self.aggregator.worker_gone(worker_id);
        self.emit_all(events);

        match self.config.crash_policy {
            CrashPolicy::Requeue => self.schedule(),
            CrashPolicy::Drop => {
                self.check_termination();
                Ok(())
            }
        }
    }

    /// Apply the crash policy to an item lost with its worker
    fn recover(&mut self, worker_id: WorkerId, item: WorkItem, code: Option<i32>) {
        if self.config.crash_policy == CrashPolicy::Requeue && self.requeued.insert(item.clone()) {
            info!(item = %item, "Requeueing item");
            self.summary.requeued += 1;
            self.queue.enqueue(item);
            return;
        }

        let message = match code {
            Some(code) => format!("worker exited with code {} before completing {}", code, item),
            None => format!("worker exited before completing {}", item),
        };
        let mut test = SerializedTest::new(item.as_str(), item.as_str());
        test.file = Some(item.to_string());
        test.state = Some(TestState::Failed);

        let events = self.aggregator.push(
            worker_id,
            ReporterEvent::Fail {
                test: test.into(),
                error: ErrorRecord::new(message),
            },
        );
        self.emit_all(events);
        self.summary.lost.push(item);
    }

    /// One scheduling pass
    ///
    /// Running it again with nothing changed spawns and sends nothing.
    fn schedule(&mut self) -> Result<(), ClusterError> {
        if self.ended {
            return Ok(());
        }

        let desired = self.queue.len().min(self.config.core_count);
        while self.workers.len() < desired {
            self.spawn_worker()?;
        }

        let idle: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|w| w.is_idle())
            .map(WorkerHandle::id)
            .collect();

        for worker_id in idle {
            let Some(item) = self.queue.pop() else {
                break;
            };
            if let Some(worker) = self.workers.get_mut(&worker_id) {
                debug!(worker_id = %worker_id, item = %item, "Assigning item");
                worker.assign(item)?;
            }
        }

        self.check_termination();
        Ok(())
    }

    fn spawn_worker(&mut self) -> Result<(), ClusterError> {
        let worker_id = WorkerId::new(self.next_worker_id);
        self.next_worker_id += 1;

        let link = self.spawner.spawn(worker_id, self.updates_tx.clone())?;
        debug!(worker_id = %worker_id, pid = ?link.pid(), "Worker spawned");
        self.workers.insert(worker_id, WorkerHandle::new(worker_id, link));
        self.summary.workers_spawned += 1;
        Ok(())
    }

    fn check_termination(&mut self) {
        if self.ended || !self.queue.is_empty() {
            return;
        }
        if !self.workers.values().all(WorkerHandle::is_idle) {
            return;
        }

        self.ended = true;
        let flushed = self.aggregator.drain();
        self.emit_all(flushed);
        self.emit(ClusterEvent::end());

        let grace = self.config.shutdown_grace_period;
        for worker in self.workers.values_mut() {
            if let Err(e) = worker.retire(grace) {
                warn!("Could not retire worker: {}", e);
            }
        }
        debug!(workers = self.workers.len(), "Batch ended, retiring pool");
    }

    /// Drop every worker; their processes are killed with their links
    fn abort(&mut self) {
        if !self.workers.is_empty() {
            warn!(workers = self.workers.len(), "Killing worker pool");
        }
        self.workers.clear();
    }

    fn emit(&mut self, event: ClusterEvent) {
        self.listeners.retain(|listener| listener.send(event.clone()).is_ok());
    }

    fn emit_all(&mut self, events: Vec<ClusterEvent>) {
        for event in events {
            self.emit(event);
        }
    }
}
