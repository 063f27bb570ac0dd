//! Turns change notifications into queue work.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use operon_core::{Notification, ObjectKey};
use operon_queue::WorkQueue;
use operon_store::StoreHandle;

/// Drains the notification channel until the notifier closes it or the
/// engine starts draining.
///
/// Primary changes enqueue their own key. Owned changes resolve to the
/// controlling parent and enqueue that instead; a child whose parent is not
/// in the cache is dropped.
pub(crate) async fn run_dispatcher(
    mut notifications: mpsc::Receiver<Notification>,
    store: StoreHandle,
    queue: Arc<WorkQueue<ObjectKey>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let note = tokio::select! {
            res = stop.changed() => {
                if res.is_err() || *stop.borrow() {
                    break;
                }
                continue;
            }
            note = notifications.recv() => match note {
                Some(note) => note,
                None => break,
            },
        };
        match note {
            Notification::Primary { kind, payload } => {
                let key = payload.key().clone();
                debug!(key = %key, kind = ?kind, "enqueue");
                queue.add(key);
            }
            Notification::Owned { kind, key, owner } => match owner {
                None => {
                    debug!(key = %key, kind = ?kind, "no controlling owner; ignoring");
                }
                Some(owner) => {
                    // parents live in the same scope as their children
                    let parent = ObjectKey {
                        namespace: key.namespace.clone(),
                        name: owner.name,
                    };
                    if store.get(&parent).is_some() {
                        debug!(key = %key, parent = %parent, kind = ?kind, "enqueue parent");
                        queue.add(parent);
                    } else {
                        counter!("dispatch_orphans_total", 1u64);
                        debug!(key = %key, parent = %parent, "parent not in cache; ignoring orphan");
                    }
                }
            },
        }
    }
    debug!("dispatcher stopped");
}
