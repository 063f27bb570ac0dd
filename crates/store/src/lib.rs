//! In-memory observed-state cache.
//!
//! Single-writer, many-reader: the notifier owns the only [`StoreWriter`],
//! and every mutation publishes a fresh immutable [`Snapshot`] through an
//! atomic swap, so reads never block and never see a half-applied change.
//! An epoch counter on a watch channel lets callers await "something
//! changed" without polling.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::debug;

use operon_core::{ObjectKey, ObservedObject};

/// Immutable view of the cache at one epoch.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub epoch: u64,
    objects: FxHashMap<ObjectKey, Arc<ObservedObject>>,
}

impl Snapshot {
    pub fn get(&self, key: &ObjectKey) -> Option<&Arc<ObservedObject>> {
        self.objects.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ObservedObject>> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Build an empty cache, split into its writer and reader halves.
pub fn new_store() -> (StoreWriter, StoreHandle) {
    let snap = Arc::new(ArcSwap::from_pointee(Snapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let writer = StoreWriter {
        objects: FxHashMap::default(),
        epoch: 0,
        snap: snap.clone(),
        epoch_tx,
    };
    let handle = StoreHandle { snap, epoch_rx };
    (writer, handle)
}

/// Write half of the cache. Deliberately not `Clone`: the notifier is the
/// only writer, which is what makes publish-before-enqueue ordering hold.
pub struct StoreWriter {
    objects: FxHashMap<ObjectKey, Arc<ObservedObject>>,
    epoch: u64,
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_tx: watch::Sender<u64>,
}

impl StoreWriter {
    /// Insert or replace one object. Returns the stored copy and whether the
    /// key was already present.
    pub fn upsert(&mut self, obj: ObservedObject) -> (Arc<ObservedObject>, bool) {
        let stored = Arc::new(obj);
        let existed = self
            .objects
            .insert(stored.key.clone(), stored.clone())
            .is_some();
        self.publish();
        (stored, existed)
    }

    /// Remove one object, returning its last observed state if present.
    pub fn remove(&mut self, key: &ObjectKey) -> Option<Arc<ObservedObject>> {
        let prev = self.objects.remove(key);
        if prev.is_some() {
            self.publish();
        }
        prev
    }

    /// Replace the whole collection with a freshly listed state. Returns the
    /// stored copies plus the keys that vanished since the previous snapshot,
    /// so the caller can turn the latter into delete tombstones.
    pub fn replace_all(
        &mut self,
        objs: Vec<ObservedObject>,
    ) -> (Vec<Arc<ObservedObject>>, Vec<ObjectKey>) {
        let mut stored = Vec::with_capacity(objs.len());
        let mut next = FxHashMap::default();
        next.reserve(objs.len());
        for obj in objs {
            let obj = Arc::new(obj);
            next.insert(obj.key.clone(), obj.clone());
            stored.push(obj);
        }
        let vanished: Vec<ObjectKey> = self
            .objects
            .keys()
            .filter(|k| !next.contains_key(*k))
            .cloned()
            .collect();
        self.objects = next;
        self.publish();
        debug!(
            objects = self.objects.len(),
            vanished = vanished.len(),
            "collection replaced"
        );
        (stored, vanished)
    }

    fn publish(&mut self) {
        self.epoch += 1;
        self.snap.store(Arc::new(Snapshot {
            epoch: self.epoch,
            objects: self.objects.clone(),
        }));
        let _ = self.epoch_tx.send(self.epoch);
        metrics::gauge!("store_objects", self.objects.len() as f64);
    }
}

/// Read half of the cache. Cheap to clone; every read is a lock-free load of
/// the current snapshot.
#[derive(Clone)]
pub struct StoreHandle {
    snap: Arc<ArcSwap<Snapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StoreHandle {
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<ObservedObject>> {
        self.snap.load().get(key).cloned()
    }

    /// All objects, optionally narrowed to one namespace, ordered by key.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<ObservedObject>> {
        let snap = self.snap.load();
        let mut out: Vec<Arc<ObservedObject>> = snap
            .iter()
            .filter(|o| match namespace {
                Some(ns) => o.key.namespace.as_deref() == Some(ns),
                None => true,
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn len(&self) -> usize {
        self.snap.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snap.load().is_empty()
    }

    /// Current snapshot, pinned, for multi-read consistency.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snap.load_full()
    }

    pub fn epoch(&self) -> u64 {
        self.snap.load().epoch
    }

    /// Epoch signal; bumps on every published snapshot.
    pub fn epoch_watch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}
