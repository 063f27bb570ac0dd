#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use operon_core::{
    BackoffPolicy, ChangeKind, EventSeverity, EventSink, Notification, ObjectKey, ObservedObject,
    Payload, ReconcileError, Reconciler,
};
use operon_engine::{Engine, EngineConfig, EngineState};
use operon_store::new_store;
use operon_watch::NotifierParts;

fn fake_parts(
    collections: usize,
) -> (
    NotifierParts,
    mpsc::Sender<Notification>,
    Vec<watch::Sender<bool>>,
    mpsc::UnboundedSender<String>,
) {
    let (note_tx, note_rx) = mpsc::channel(64);
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let (stop_tx, _) = watch::channel(false);
    let mut sync_txs = Vec::new();
    let mut sync_rxs = Vec::new();
    for _ in 0..collections {
        let (tx, rx) = watch::channel(false);
        sync_txs.push(tx);
        sync_rxs.push(rx);
    }
    let parts = NotifierParts {
        notifications: note_rx,
        synced: sync_rxs,
        fatal: fatal_rx,
        tasks: Vec::new(),
        stop: stop_tx,
    };
    (parts, note_tx, sync_txs, fatal_tx)
}

fn sync_all(txs: &[watch::Sender<bool>]) {
    for tx in txs {
        let _ = tx.send(true);
    }
}

fn obs(ns: &str, name: &str) -> ObservedObject {
    ObservedObject {
        key: ObjectKey::namespaced(ns, name),
        resource_version: "1".into(),
        creation_ts: 0,
        raw: serde_json::json!({}),
    }
}

fn primary_added(ns: &str, name: &str) -> Notification {
    Notification::Primary {
        kind: ChangeKind::Added,
        payload: Payload::Full(Arc::new(obs(ns, name))),
    }
}

enum Step {
    Succeed,
    Retry,
    Fail,
    Panic,
}

struct ScriptedReconciler {
    script: Mutex<VecDeque<Step>>,
    seen: mpsc::UnboundedSender<ObjectKey>,
}

impl ScriptedReconciler {
    fn new(script: Vec<Step>) -> (Arc<Self>, mpsc::UnboundedReceiver<ObjectKey>) {
        let (seen, seen_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen,
            }),
            seen_rx,
        )
    }
}

#[async_trait::async_trait]
impl Reconciler for ScriptedReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);
        let _ = self.seen.send(key.clone());
        match step {
            Step::Succeed => Ok(()),
            Step::Retry => Err(ReconcileError::retryable("transient api error")),
            Step::Fail => Err(ReconcileError::terminal("bad image reference")),
            Step::Panic => panic!("scripted panic"),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<(ObjectKey, EventSeverity, String, String)>>,
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn publish(
        &self,
        subject: &ObjectKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        self.events.lock().unwrap().push((
            subject.clone(),
            severity,
            reason.to_string(),
            message.to_string(),
        ));
        Ok(())
    }
}

async fn wait_state(rx: &mut watch::Receiver<EngineState>, want: EngineState) {
    timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("engine state channel closed");
        }
    })
    .await
    .expect("state never reached");
}

fn fast_retry_config() -> EngineConfig {
    EngineConfig {
        retry: BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(50)),
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failures_requeue_until_success() {
    let (parts, notes, syncs, _fatal) = fake_parts(1);
    let (_writer, store) = new_store();
    let (reconciler, mut seen) = ScriptedReconciler::new(vec![Step::Retry, Step::Retry]);
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new(fast_retry_config(), reconciler, sink.clone());
    let mut state = engine.state_watch();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(engine.run_with(store, parts, shutdown_rx));
    sync_all(&syncs);
    wait_state(&mut state, EngineState::Running).await;

    notes.send(primary_added("prod", "flaky")).await.unwrap();
    for _ in 0..3 {
        let key = timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("retry never arrived")
            .unwrap();
        assert_eq!(key, ObjectKey::namespaced("prod", "flaky"));
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();
    assert!(handle.await.unwrap().is_ok());
    // success forgot the key; nothing left to retry
    assert!(seen.try_recv().is_err());
    assert!(sink.events.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminal_failures_report_once_and_stop_retrying() {
    let (parts, notes, syncs, _fatal) = fake_parts(1);
    let (_writer, store) = new_store();
    let (reconciler, mut seen) = ScriptedReconciler::new(vec![Step::Fail]);
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new(fast_retry_config(), reconciler, sink.clone());
    let mut state = engine.state_watch();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(engine.run_with(store, parts, shutdown_rx));
    sync_all(&syncs);
    wait_state(&mut state, EngineState::Running).await;

    notes.send(primary_added("prod", "doomed")).await.unwrap();
    timeout(Duration::from_secs(5), seen.recv())
        .await
        .expect("reconcile never ran")
        .unwrap();

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();
    assert!(handle.await.unwrap().is_ok());

    assert!(seen.try_recv().is_err(), "terminal failures must not retry");
    let events = sink.events.lock().unwrap();
    assert_eq!(events.len(), 1);
    let (subject, severity, reason, message) = &events[0];
    assert_eq!(*subject, ObjectKey::namespaced("prod", "doomed"));
    assert_eq!(*severity, EventSeverity::Warning);
    assert_eq!(reason, "ReconcileFailed");
    assert!(message.contains("bad image reference"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_reconciler_is_retried_not_fatal() {
    let (parts, notes, syncs, _fatal) = fake_parts(1);
    let (_writer, store) = new_store();
    let (reconciler, mut seen) = ScriptedReconciler::new(vec![Step::Panic]);
    let sink = Arc::new(RecordingSink::default());
    let engine = Engine::new(fast_retry_config(), reconciler, sink.clone());
    let mut state = engine.state_watch();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(engine.run_with(store, parts, shutdown_rx));
    sync_all(&syncs);
    wait_state(&mut state, EngineState::Running).await;

    notes.send(primary_added("prod", "bomb")).await.unwrap();
    // first attempt panics, retry succeeds
    for _ in 0..2 {
        timeout(Duration::from_secs(5), seen.recv())
            .await
            .expect("retry after panic never arrived")
            .unwrap();
    }

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown_tx.send(true).unwrap();
    assert!(handle.await.unwrap().is_ok());
    assert!(seen.try_recv().is_err());
}
