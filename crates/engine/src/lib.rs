//! Engine lifecycle: wires the notifier, cache, queue, and workers together.

#![forbid(unsafe_code)]

mod dispatch;
mod worker;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use operon_core::{BackoffPolicy, EventSeverity, EventSink, ObjectKey, Reconciler};
use operon_queue::WorkQueue;
use operon_store::{StoreHandle, StoreWriter};
use operon_watch::{spawn_notifier, NotifierParts, WatchConfig};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The watch pipeline never became ready.
    #[error("startup failed: {0}")]
    Startup(String),
    /// A running engine lost its watch pipeline and drained.
    #[error("fatal runtime error: {0}")]
    Fatal(String),
}

/// Lifecycle phases, observable through [`Engine::state_watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Syncing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent reconcile workers.
    pub workers: usize,
    /// How long to wait for the initial cache sync before giving up.
    pub sync_timeout: Duration,
    /// Retry backoff applied to failed reconciles.
    pub retry: BackoffPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            sync_timeout: Duration::from_secs(60),
            retry: BackoffPolicy::default(),
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    reconciler: Arc<dyn Reconciler>,
    sink: Arc<dyn EventSink>,
    state_tx: watch::Sender<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig, reconciler: Arc<dyn Reconciler>, sink: Arc<dyn EventSink>) -> Self {
        let (state_tx, _) = watch::channel(EngineState::Created);
        Self {
            config,
            reconciler,
            sink,
            state_tx,
        }
    }

    /// Receiver that tracks the engine through its lifecycle phases.
    pub fn state_watch(&self) -> watch::Receiver<EngineState> {
        self.state_tx.subscribe()
    }

    /// Spawns the notifier against a live cluster, then drives the engine
    /// until `shutdown` flips or the watch pipeline dies.
    pub async fn run(
        self,
        client: Client,
        watch_cfg: WatchConfig,
        writer: StoreWriter,
        store: StoreHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let parts = spawn_notifier(client, watch_cfg, writer)
            .await
            .map_err(|e| EngineError::Startup(format!("{e:#}")))?;
        self.run_with(store, parts, shutdown).await
    }

    /// Drives the engine over an already-running notifier.
    ///
    /// Blocks through Syncing and Running, drains on shutdown or on a fatal
    /// watch failure, and returns once every task has stopped.
    pub async fn run_with(
        self,
        store: StoreHandle,
        parts: NotifierParts,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), EngineError> {
        let NotifierParts {
            notifications,
            synced,
            mut fatal,
            tasks,
            stop,
        } = parts;

        self.transition(EngineState::Syncing);
        info!(
            collections = synced.len(),
            timeout_s = self.config.sync_timeout.as_secs(),
            "waiting for initial sync"
        );

        let sync = tokio::select! {
            res = wait_for_sync(synced) => res,
            _ = wait_for_stop(&mut shutdown) => {
                Err("shutdown requested before cache sync completed".to_string())
            }
            _ = tokio::time::sleep(self.config.sync_timeout) => {
                Err(format!("cache sync timed out after {:?}", self.config.sync_timeout))
            }
            msg = fatal.recv() => {
                Err(msg.unwrap_or_else(|| "notifier stopped before cache sync".to_string()))
            }
        };
        if let Err(reason) = sync {
            error!(error = %reason, "startup aborted");
            let _ = stop.send(true);
            // a watch task parked in a full-channel send only unblocks once
            // the receiver is gone
            drop(notifications);
            join_all(tasks).await;
            self.transition(EngineState::Stopped);
            return Err(EngineError::Startup(reason));
        }

        let queue = Arc::new(WorkQueue::with_policy(self.config.retry));
        let dispatcher = tokio::spawn(dispatch::run_dispatcher(
            notifications,
            store.clone(),
            queue.clone(),
            stop.subscribe(),
        ));
        let workers: Vec<_> = (0..self.config.workers.max(1))
            .map(|id| {
                tokio::spawn(worker::run_worker(
                    id,
                    queue.clone(),
                    self.reconciler.clone(),
                    self.sink.clone(),
                ))
            })
            .collect();

        self.transition(EngineState::Running);
        info!(workers = workers.len(), "engine running");

        let failure = tokio::select! {
            _ = wait_for_stop(&mut shutdown) => {
                info!("shutdown requested; draining");
                None
            }
            msg = fatal.recv() => {
                let reason = msg.unwrap_or_else(|| "notifier stopped unexpectedly".to_string());
                error!(error = %reason, "watch pipeline failed; draining");
                Some(reason)
            }
        };

        self.transition(EngineState::Draining);
        let _ = stop.send(true);
        queue.shut_down();

        for (id, handle) in workers.into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!(worker = id, error = %e, "worker task failed to join");
            }
        }
        if let Err(e) = dispatcher.await {
            warn!(error = %e, "dispatcher task failed to join");
        }
        join_all(tasks).await;

        self.transition(EngineState::Stopped);
        info!("engine stopped");

        match failure {
            None => Ok(()),
            Some(reason) => Err(EngineError::Fatal(reason)),
        }
    }

    fn transition(&self, next: EngineState) {
        debug!(state = ?next, "engine state");
        let _ = self.state_tx.send(next);
    }
}

/// Resolves once every collection has reported its initial sync.
async fn wait_for_sync(synced: Vec<watch::Receiver<bool>>) -> Result<(), String> {
    for mut rx in synced {
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return Err("notifier closed before initial sync".to_string());
            }
        }
    }
    Ok(())
}

/// Resolves when `rx` flips to true; a dropped sender counts as stop.
async fn wait_for_stop(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Event sink that writes to the process log instead of the API server.
pub struct LogSink;

#[async_trait::async_trait]
impl EventSink for LogSink {
    async fn publish(
        &self,
        subject: &ObjectKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        info!(subject = %subject, severity = ?severity, reason, message, "event");
        Ok(())
    }
}
