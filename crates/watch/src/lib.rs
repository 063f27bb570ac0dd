//! Change notifier: kube discovery and watch plumbing.
//!
//! One task per watched collection keeps a subscription alive with
//! reconnect backoff and periodic resync, writes observed state into the
//! cache, and emits typed notifications on a bounded channel consumed by
//! the engine dispatcher. The cache write always happens before the
//! notification is sent, so a dequeued key never reads a stale cache.

#![forbid(unsafe_code)]

mod events;
mod track;

pub use events::KubeEventSink;
pub use track::{controller_owner, extract_key, to_observed, OwnedTracker, PrimaryTracker, Tracker};

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::TryStreamExt;
use kube::{
    api::{Api, ListParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    Client,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use operon_core::{BackoffPolicy, Notification};
use operon_store::StoreWriter;

/// One collection to subscribe to, keyed as `v1/Kind` or `group/v1/Kind`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceSpec {
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(Self {
                group: String::new(),
                version: (*version).to_string(),
                kind: (*kind).to_string(),
            }),
            [group, version, kind] => Ok(Self {
                group: (*group).to_string(),
                version: (*version).to_string(),
                kind: (*kind).to_string(),
            }),
            _ => Err(anyhow!(
                "invalid gvk key: {} (expect v1/Kind or group/v1/Kind)",
                key
            )),
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    fn to_gvk(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// Reconnect discipline for a broken watch stream.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub backoff: BackoffPolicy,
    /// `None` retries forever; `Some(n)` surfaces a fatal error after `n`
    /// consecutive failures.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30)),
            max_attempts: None,
        }
    }
}

/// Which collections to watch and how. No process-wide registration: this
/// is the whole subscription surface.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub primary: ResourceSpec,
    /// Collections whose objects may carry a controlling owner reference
    /// to the primary kind.
    pub owned: Vec<ResourceSpec>,
    /// Namespace scope; `None` watches cluster-wide.
    pub namespace: Option<String>,
    /// Periodic full re-list; `None` disables.
    pub resync: Option<Duration>,
    pub reconnect: ReconnectPolicy,
    /// Notification channel capacity.
    pub buffer: usize,
}

impl WatchConfig {
    pub fn new(primary: ResourceSpec) -> Self {
        Self {
            primary,
            owned: Vec::new(),
            namespace: None,
            resync: Some(Duration::from_secs(300)),
            reconnect: ReconnectPolicy::default(),
            buffer: 2048,
        }
    }
}

/// Handles to a running notifier, consumed by the engine.
pub struct NotifierParts {
    pub notifications: mpsc::Receiver<Notification>,
    /// One sync flag per collection; all true once the initial replay is
    /// done everywhere.
    pub synced: Vec<watch::Receiver<bool>>,
    /// Unrecoverable watch failures (reconnect budget exhausted).
    pub fatal: mpsc::UnboundedReceiver<String>,
    pub tasks: Vec<JoinHandle<()>>,
    /// Flip to true to stop every watch task.
    pub stop: watch::Sender<bool>,
}

/// Resolve the configured collections through discovery and spawn one
/// watch task each. The store writer moves into the primary collection's
/// task: the primary watch is the cache's single writer.
pub async fn spawn_notifier(
    client: Client,
    cfg: WatchConfig,
    writer: StoreWriter,
) -> Result<NotifierParts> {
    let discovery = Discovery::new(client.clone())
        .run()
        .await
        .context("running api discovery")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let (tx, rx) = mpsc::channel(cfg.buffer.max(1));
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
    let mut synced = Vec::new();
    let mut tasks = Vec::new();

    let mut specs = Vec::with_capacity(1 + cfg.owned.len());
    specs.push(cfg.primary.clone());
    specs.extend(cfg.owned.iter().cloned());

    // The first spec is the primary; it takes the writer.
    let mut writer = Some(writer);
    for spec in specs {
        let (ar, namespaced) = find_api_resource(&discovery, &spec.to_gvk())?;
        let api = scoped_api(&client, &ar, namespaced, cfg.namespace.as_deref());
        let tracker = match writer.take() {
            Some(w) => Tracker::Primary(PrimaryTracker::new(w)),
            None => Tracker::Owned(OwnedTracker::new(cfg.primary.kind.clone())),
        };
        let (sync_tx, sync_rx) = watch::channel(false);
        synced.push(sync_rx);
        let task = CollectionWatch {
            api,
            gvk: spec.gvk_key(),
            tracker,
            tx: tx.clone(),
            sync_tx,
            fatal: fatal_tx.clone(),
            stop: stop_rx.clone(),
            resync: cfg.resync,
            reconnect: cfg.reconnect.clone(),
        };
        tasks.push(tokio::spawn(task.run()));
    }

    Ok(NotifierParts {
        notifications: rx,
        synced,
        fatal: fatal_rx,
        tasks,
        stop: stop_tx,
    })
}

fn find_api_resource(
    discovery: &Discovery,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(anyhow!(
        "resource not served: {}/{}/{}",
        gvk.group,
        gvk.version,
        gvk.kind
    ))
}

fn scoped_api(
    client: &Client,
    ar: &kube::core::ApiResource,
    namespaced: bool,
    ns: Option<&str>,
) -> Api<DynamicObject> {
    if namespaced {
        match ns {
            Some(ns) => Api::namespaced_with(client.clone(), ns, ar),
            None => Api::all_with(client.clone(), ar),
        }
    } else {
        Api::all_with(client.clone(), ar)
    }
}

struct CollectionWatch {
    api: Api<DynamicObject>,
    gvk: String,
    tracker: Tracker,
    tx: mpsc::Sender<Notification>,
    sync_tx: watch::Sender<bool>,
    fatal: mpsc::UnboundedSender<String>,
    stop: watch::Receiver<bool>,
    resync: Option<Duration>,
    reconnect: ReconnectPolicy,
}

impl CollectionWatch {
    async fn run(mut self) {
        let mut attempts: u32 = 0;
        loop {
            if *self.stop.borrow() {
                break;
            }
            match self.watch_once(&mut attempts).await {
                // Stop was requested or the engine side went away.
                Ok(()) => break,
                Err(e) => {
                    attempts = attempts.saturating_add(1);
                    metrics::counter!("watch_reconnects_total", 1u64);
                    if let Some(max) = self.reconnect.max_attempts {
                        if attempts >= max {
                            warn!(gvk = %self.gvk, attempts, "watch reconnect budget exhausted");
                            let _ = self.fatal.send(format!("watch {}: {:#}", self.gvk, e));
                            break;
                        }
                    }
                    let delay = self.reconnect.backoff.delay(attempts);
                    warn!(
                        gvk = %self.gvk,
                        error = ?e,
                        attempt = attempts,
                        backoff_ms = delay.as_millis() as u64,
                        "watch stream failed; reconnecting"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.stop.changed() => {}
                    }
                }
            }
        }
        debug!(gvk = %self.gvk, "watch task stopped");
    }

    /// One subscription lifetime: list+watch until the stream breaks, stop
    /// is requested, or the notification channel closes.
    async fn watch_once(&mut self, attempts: &mut u32) -> Result<()> {
        let stream = watcher::watcher(self.api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);
        info!(gvk = %self.gvk, "watch started");
        let mut resync_tick = self
            .resync
            .map(|every| tokio::time::interval_at(tokio::time::Instant::now() + every, every));
        loop {
            tokio::select! {
                res = self.stop.changed() => {
                    if res.is_err() || *self.stop.borrow() {
                        return Ok(());
                    }
                }
                _ = next_tick(&mut resync_tick) => {
                    let list = self.api.list(&ListParams::default()).await.context("periodic relist")?;
                    metrics::counter!("watch_resyncs_total", 1u64);
                    debug!(gvk = %self.gvk, count = list.items.len(), "resync replay");
                    for note in self.tracker.handle_replay(&list.items) {
                        if self.tx.send(note).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                ev = stream.try_next() => match ev.context("watch stream")? {
                    Some(Event::Applied(o)) => {
                        metrics::counter!("watch_events_total", 1u64);
                        if let Some(note) = self.tracker.handle_applied(&o) {
                            if self.tx.send(note).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Event::Deleted(o)) => {
                        metrics::counter!("watch_events_total", 1u64);
                        if let Some(note) = self.tracker.handle_deleted(&o) {
                            if self.tx.send(note).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Event::Restarted(list)) => {
                        *attempts = 0;
                        let notes = self.tracker.handle_replay(&list);
                        if !*self.sync_tx.borrow() {
                            let _ = self.sync_tx.send(true);
                            info!(gvk = %self.gvk, count = list.len(), "initial sync complete");
                        } else {
                            debug!(gvk = %self.gvk, count = list.len(), "watch restarted; collection replayed");
                        }
                        for note in notes {
                            if self.tx.send(note).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    None => return Err(anyhow!("watch stream ended")),
                }
            }
        }
    }
}

async fn next_tick(tick: &mut Option<tokio::time::Interval>) {
    match tick {
        Some(t) => {
            t.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
