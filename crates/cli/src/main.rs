//! operond: a generic reconcile daemon over dynamic cluster objects.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tracing::{info, warn};

use operon_core::{BackoffPolicy, EventSink, ObjectKey, ReconcileError, Reconciler};
use operon_engine::{Engine, EngineConfig, LogSink};
use operon_store::{new_store, StoreHandle};
use operon_watch::{KubeEventSink, ResourceSpec, WatchConfig};

#[derive(Parser, Debug)]
#[command(
    name = "operond",
    about = "Watches a primary collection and drives a reconcile loop over it",
    version
)]
struct Args {
    /// Primary collection, as group/version/Kind (core group: v1/Kind).
    #[arg(long, env = "OPERON_GVK")]
    gvk: String,

    /// Owned collections whose changes requeue the controlling parent.
    #[arg(long, value_delimiter = ',')]
    owned: Vec<String>,

    /// Watch a single namespace instead of the whole cluster.
    #[arg(long)]
    namespace: Option<String>,

    /// Concurrent reconcile workers.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Abort startup if the cache is not synced within this window.
    #[arg(long, default_value_t = 60)]
    sync_timeout_secs: u64,

    /// Periodic full re-list interval; 0 disables.
    #[arg(long, default_value_t = 300)]
    resync_secs: u64,

    /// Base retry delay for failed reconciles.
    #[arg(long, default_value_t = 5)]
    retry_base_ms: u64,

    /// Retry delay ceiling.
    #[arg(long, default_value_t = 1000)]
    retry_cap_secs: u64,

    /// Give up after this many consecutive failed reconnects per watch;
    /// unset retries forever.
    #[arg(long)]
    watch_max_attempts: Option<u32>,

    /// Notification channel capacity.
    #[arg(long, default_value_t = 2048)]
    buffer: usize,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9090.
    #[arg(long, env = "OPERON_METRICS_ADDR")]
    metrics_addr: Option<String>,

    /// Log reconcile events instead of publishing them to the cluster.
    #[arg(long)]
    no_events: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("OPERON_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn init_metrics(addr: &str) -> Result<()> {
    let sock: SocketAddr = addr
        .parse()
        .with_context(|| format!("invalid metrics address {addr}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(sock)
        .install()
        .context("starting metrics exporter")?;
    info!(addr = %sock, "metrics exporter listening");
    Ok(())
}

/// Stand-in reconciler that logs the observed state of each key. Replace
/// with a real [`Reconciler`] to act on the cluster.
struct LoggingReconciler {
    store: StoreHandle,
}

#[async_trait::async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError> {
        match self.store.get(key) {
            Some(obj) => info!(key = %key, rv = %obj.resource_version, "observed"),
            None => info!(key = %key, "gone"),
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    if let Some(addr) = &args.metrics_addr {
        init_metrics(addr)?;
    }

    let primary = ResourceSpec::parse(&args.gvk)?;
    let mut watch_cfg = WatchConfig::new(primary.clone());
    for spec in &args.owned {
        watch_cfg.owned.push(ResourceSpec::parse(spec)?);
    }
    watch_cfg.namespace = args.namespace.clone();
    watch_cfg.resync = (args.resync_secs > 0).then(|| Duration::from_secs(args.resync_secs));
    watch_cfg.reconnect.max_attempts = args.watch_max_attempts;
    watch_cfg.buffer = args.buffer;

    let config = EngineConfig {
        workers: args.workers,
        sync_timeout: Duration::from_secs(args.sync_timeout_secs),
        retry: BackoffPolicy::new(
            Duration::from_millis(args.retry_base_ms),
            Duration::from_secs(args.retry_cap_secs),
        ),
    };

    let client = Client::try_default().await.context("building kube client")?;
    let (writer, store) = new_store();

    let sink: Arc<dyn EventSink> = if args.no_events {
        Arc::new(LogSink)
    } else {
        Arc::new(KubeEventSink::new(client.clone(), "operond", &primary))
    };
    let reconciler = Arc::new(LoggingReconciler {
        store: store.clone(),
    });

    info!(
        gvk = %primary.gvk_key(),
        owned = args.owned.len(),
        workers = args.workers,
        "starting engine"
    );

    let engine = Engine::new(config, reconciler, sink);
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("signal received; shutting down");
        let _ = stop_tx.send(true);
    });

    engine.run(client, watch_cfg, writer, store, stop_rx).await?;
    info!("clean shutdown");
    Ok(())
}
