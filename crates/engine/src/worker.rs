//! Reconcile worker loop.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use metrics::{counter, histogram};
use tracing::{debug, error, warn};

use operon_core::{EventSeverity, EventSink, ObjectKey, ReconcileError, Reconciler};
use operon_queue::WorkQueue;

/// Pulls keys off the queue until shutdown, running one reconcile at a time.
///
/// A panicking reconciler is treated as a retryable failure so one bad key
/// cannot take the worker down.
pub(crate) async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<dyn Reconciler>,
    sink: Arc<dyn EventSink>,
) {
    while let Some(key) = queue.get().await {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(reconciler.reconcile(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| Err(ReconcileError::Retryable(panic_reason(payload))));
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(()) => {
                counter!("reconcile_success_total", 1u64);
                debug!(worker = id, key = %key, "reconciled");
                queue.forget(&key);
            }
            Err(ReconcileError::Retryable(reason)) => {
                counter!("reconcile_retry_total", 1u64);
                let attempt = queue.retries(&key) + 1;
                warn!(worker = id, key = %key, attempt, error = %reason, "reconcile failed; will retry");
                queue.add_rate_limited(key.clone());
            }
            Err(ReconcileError::Terminal(reason)) => {
                counter!("reconcile_terminal_total", 1u64);
                error!(worker = id, key = %key, error = %reason, "reconcile failed terminally; giving up");
                queue.forget(&key);
                if let Err(e) = sink
                    .publish(&key, EventSeverity::Warning, "ReconcileFailed", &reason)
                    .await
                {
                    debug!(key = %key, error = %e, "event sink publish failed");
                }
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, "worker stopped");
}

fn panic_reason(payload: Box<dyn std::any::Any + Send>) -> String {
    let msg = if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    format!("reconciler panicked: {msg}")
}
