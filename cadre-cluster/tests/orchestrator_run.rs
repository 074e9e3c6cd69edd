use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cadre_cluster::{
    ClusterError, ClusterEvent, Orchestrator, OrchestratorConfig, ReporterEvent, WorkerEvent,
    WorkerId, WorkerLink, WorkerSpawner, WorkerUpdate,
};
use cadre_config::CrashPolicy;
use cadre_ipc::{ControllerCommand, EventName, LifecycleEvent, SerializedTest, WorkItem, WorkerSignal};
use tokio::sync::mpsc;

/// Spawner whose workers live in tasks and answer like real ones
///
/// Items named `crash*` make the worker exit mid-item. Items named `slow*`
/// take longer, so events of concurrent workers interleave.
#[derive(Default, Clone)]
struct SimulatedSpawner {
    spawned: Arc<Mutex<Vec<WorkerId>>>,
    terminations: Arc<Mutex<HashMap<WorkerId, usize>>>,
}

struct SimulatedLink {
    id: WorkerId,
    updates: mpsc::UnboundedSender<WorkerUpdate>,
    terminations: Arc<Mutex<HashMap<WorkerId, usize>>>,
}

impl WorkerSpawner for SimulatedSpawner {
    fn spawn(
        &mut self,
        worker_id: WorkerId,
        updates: mpsc::UnboundedSender<WorkerUpdate>,
    ) -> Result<Box<dyn WorkerLink>, ClusterError> {
        self.spawned.lock().unwrap().push(worker_id);
        let ready = updates.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            let _ = ready.send(WorkerUpdate::signal(worker_id, WorkerSignal::WorkerReady));
        });
        Ok(Box::new(SimulatedLink {
            id: worker_id,
            updates,
            terminations: self.terminations.clone(),
        }))
    }
}

fn lifecycle(name: EventName, item: &WorkItem) -> WorkerSignal {
    let test = SerializedTest::new(item.as_str(), format!("{} case", item));
    WorkerSignal::LifecycleEvent(LifecycleEvent::new(name).with_test(test))
}

impl WorkerLink for SimulatedLink {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn send(&mut self, command: ControllerCommand) {
        let ControllerCommand::Execute(item) = command else {
            return;
        };
        let id = self.id;
        let updates = self.updates.clone();
        tokio::spawn(async move {
            let send = |signal| updates.send(WorkerUpdate::signal(id, signal));
            let _ = send(WorkerSignal::LifecycleEvent(LifecycleEvent::new(EventName::Start)));
            let _ = send(lifecycle(EventName::Test, &item));

            let delay = if item.as_str().starts_with("slow") { 30 } else { 5 };
            tokio::time::sleep(Duration::from_millis(delay)).await;

            if item.as_str().starts_with("crash") {
                let _ = updates.send(WorkerUpdate::new(id, WorkerEvent::Exited(Some(1))));
                return;
            }
            let _ = send(lifecycle(EventName::Pass, &item));
            let _ = send(WorkerSignal::LifecycleEvent(LifecycleEvent::new(EventName::End)));
            let _ = send(WorkerSignal::WorkerComplete);
        });
    }

    fn terminate(&mut self, _grace: Duration) {
        *self.terminations.lock().unwrap().entry(self.id).or_default() += 1;
        let _ = self
            .updates
            .send(WorkerUpdate::new(self.id, WorkerEvent::Exited(Some(0))));
    }
}

fn config(cores: usize, strict: bool, policy: CrashPolicy) -> OrchestratorConfig {
    OrchestratorConfig {
        core_count: cores,
        strict_ordering: strict,
        crash_policy: policy,
        shutdown_grace_period: Duration::from_millis(50),
    }
}

fn items(names: &[&str]) -> Vec<WorkItem> {
    names.iter().map(|n| WorkItem::from(*n)).collect()
}

fn collect(rx: &mut mpsc::UnboundedReceiver<ClusterEvent>) -> Vec<ClusterEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn item_of(event: &ClusterEvent) -> Option<&str> {
    match &event.event {
        ReporterEvent::Test { test } | ReporterEvent::Pass { test } => Some(test.title()),
        ReporterEvent::Fail { test, .. } => Some(test.title()),
        _ => None,
    }
}

#[tokio::test]
async fn test_run_emits_single_start_and_end() {
    let spawner = SimulatedSpawner::default();
    let mut orchestrator = Orchestrator::new(config(2, false, CrashPolicy::Drop), spawner.clone());
    let mut rx = orchestrator.subscribe();

    let summary = orchestrator.run(items(&["a", "b", "c"])).await.unwrap();
    assert_eq!(summary.items, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.workers_spawned, 2);
    assert!(summary.lost.is_empty());

    let events = collect(&mut rx);
    let names: Vec<EventName> = events.iter().map(ClusterEvent::name).collect();
    assert_eq!(names.first(), Some(&EventName::Start));
    assert_eq!(names.last(), Some(&EventName::End));
    assert_eq!(names.iter().filter(|n| **n == EventName::Start).count(), 1);
    assert_eq!(names.iter().filter(|n| **n == EventName::End).count(), 1);
    assert_eq!(names.iter().filter(|n| **n == EventName::Pass).count(), 3);

    let terminations = spawner.terminations.lock().unwrap();
    assert_eq!(terminations.len(), 2);
    assert!(terminations.values().all(|count| *count == 1));
}

#[tokio::test]
async fn test_run_with_no_items() {
    let spawner = SimulatedSpawner::default();
    let mut orchestrator = Orchestrator::new(config(4, false, CrashPolicy::Drop), spawner.clone());
    let mut rx = orchestrator.subscribe();

    let summary = orchestrator.run(Vec::new()).await.unwrap();
    assert_eq!(summary.workers_spawned, 0);
    assert!(spawner.spawned.lock().unwrap().is_empty());

    let names: Vec<EventName> = collect(&mut rx).iter().map(ClusterEvent::name).collect();
    assert_eq!(names, vec![EventName::Start, EventName::End]);
}

#[tokio::test]
async fn test_strict_ordering_keeps_items_contiguous() {
    let spawner = SimulatedSpawner::default();
    let mut orchestrator = Orchestrator::new(config(3, true, CrashPolicy::Drop), spawner);
    let mut rx = orchestrator.subscribe();

    orchestrator
        .run(items(&["slow-1", "fast-1", "fast-2", "slow-2", "fast-3"]))
        .await
        .unwrap();

    let events = collect(&mut rx);
    let titles: Vec<&str> = events.iter().filter_map(item_of).collect();
    assert_eq!(titles.len(), 10);
    // Each item's test and pass events are adjacent in the output
    for pair in titles.chunks(2) {
        assert_eq!(pair[0], pair[1], "interleaved output: {:?}", titles);
    }
    assert_eq!(events.last().map(ClusterEvent::name), Some(EventName::End));
}

#[tokio::test]
async fn test_crash_of_only_worker_stalls_run() {
    let spawner = SimulatedSpawner::default();
    let mut orchestrator = Orchestrator::new(config(1, false, CrashPolicy::Drop), spawner.clone());
    let mut rx = orchestrator.subscribe();

    let err = orchestrator
        .run(items(&["crash", "b", "c"]))
        .await
        .unwrap_err();
    assert!(matches!(err, ClusterError::Stalled { pending: 2 }));
    assert_eq!(spawner.spawned.lock().unwrap().len(), 1);

    let events = collect(&mut rx);
    let names: Vec<EventName> = events.iter().map(ClusterEvent::name).collect();
    assert!(!names.contains(&EventName::End));
    let fail = events
        .iter()
        .find(|e| e.name() == EventName::Fail)
        .expect("lost item reported");
    assert_eq!(item_of(fail), Some("crash"));
}

#[tokio::test]
async fn test_crash_with_requeue_recovers() {
    let spawner = SimulatedSpawner::default();
    let mut orchestrator =
        Orchestrator::new(config(1, false, CrashPolicy::Requeue), spawner.clone());

    // The crashing item is retried on a replacement worker, then dropped
    let summary = orchestrator.run(items(&["crash", "b"])).await.unwrap();
    assert_eq!(summary.requeued, 1);
    assert_eq!(summary.lost, items(&["crash"]));
    assert_eq!(summary.completed, 1);
    assert_eq!(spawner.spawned.lock().unwrap().len(), 2);
}
