//! Object-to-notification translation at the notifier boundary.
//!
//! Raw dynamic objects are resolved here, once: identity key, controlling
//! owner, full payload or tombstone. Downstream consumers never touch a
//! `DynamicObject` again.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use kube::core::DynamicObject;
use rustc_hash::FxHashMap;
use tracing::warn;

use operon_core::{ChangeKind, Notification, ObjectKey, ObservedObject, OwnerRef, Payload};
use operon_store::StoreWriter;

/// Identity fields only; deterministic for any two notifications about the
/// same logical object.
pub fn extract_key(obj: &DynamicObject) -> Result<ObjectKey> {
    let name = obj
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow!("object missing metadata.name"))?;
    Ok(ObjectKey {
        namespace: obj.metadata.namespace.clone(),
        name,
    })
}

/// The controlling owner reference, if it points at the primary kind.
pub fn controller_owner(obj: &DynamicObject, primary_kind: &str) -> Option<OwnerRef> {
    obj.metadata
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
        .filter(|r| r.kind == primary_kind)
        .map(|r| OwnerRef {
            kind: r.kind.clone(),
            name: r.name.clone(),
        })
}

/// Snapshot a dynamic object into its cache representation.
pub fn to_observed(obj: &DynamicObject) -> Result<ObservedObject> {
    let key = extract_key(obj)?;
    let resource_version = obj.metadata.resource_version.clone().unwrap_or_default();
    let creation_ts = obj
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0.timestamp())
        .unwrap_or(0);
    let mut raw = serde_json::to_value(obj).context("serializing object")?;
    strip_managed_fields(&mut raw);
    Ok(ObservedObject {
        key,
        resource_version,
        creation_ts,
        raw,
    })
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Primary-collection tracker: owns the cache writer. Every event mutates
/// the cache first and yields the notification second.
pub struct PrimaryTracker {
    writer: StoreWriter,
}

impl PrimaryTracker {
    pub fn new(writer: StoreWriter) -> Self {
        Self { writer }
    }

    pub fn apply(&mut self, obj: ObservedObject) -> Notification {
        let (stored, existed) = self.writer.upsert(obj);
        let kind = if existed {
            ChangeKind::Updated
        } else {
            ChangeKind::Added
        };
        Notification::Primary {
            kind,
            payload: Payload::Full(stored),
        }
    }

    pub fn delete(&mut self, obj: ObservedObject) -> Notification {
        self.writer.remove(&obj.key);
        Notification::Primary {
            kind: ChangeKind::Deleted,
            payload: Payload::Full(Arc::new(obj)),
        }
    }

    /// Replay a freshly listed collection: every live object surfaces as an
    /// add, every cached object that vanished surfaces as a tombstone.
    pub fn replay(&mut self, objs: Vec<ObservedObject>) -> Vec<Notification> {
        let (stored, vanished) = self.writer.replace_all(objs);
        let mut out = Vec::with_capacity(stored.len() + vanished.len());
        for key in vanished {
            out.push(Notification::Primary {
                kind: ChangeKind::Deleted,
                payload: Payload::Tombstone(key),
            });
        }
        for obj in stored {
            out.push(Notification::Primary {
                kind: ChangeKind::Added,
                payload: Payload::Full(obj),
            });
        }
        out
    }
}

/// Owned-collection tracker. Keeps the last known controlling owner per
/// key so a tombstone delete still re-triggers the right parent.
pub struct OwnedTracker {
    primary_kind: String,
    owners: FxHashMap<ObjectKey, Option<OwnerRef>>,
}

impl OwnedTracker {
    pub fn new(primary_kind: impl Into<String>) -> Self {
        Self {
            primary_kind: primary_kind.into(),
            owners: FxHashMap::default(),
        }
    }

    pub fn apply(&mut self, key: ObjectKey, owner: Option<OwnerRef>) -> Notification {
        let kind = if self.owners.insert(key.clone(), owner.clone()).is_some() {
            ChangeKind::Updated
        } else {
            ChangeKind::Added
        };
        Notification::Owned { kind, key, owner }
    }

    pub fn delete(&mut self, key: ObjectKey, owner: Option<OwnerRef>) -> Notification {
        let last = self.owners.remove(&key).flatten();
        let owner = owner.or(last);
        Notification::Owned {
            kind: ChangeKind::Deleted,
            key,
            owner,
        }
    }

    pub fn replay(&mut self, current: Vec<(ObjectKey, Option<OwnerRef>)>) -> Vec<Notification> {
        let mut next = FxHashMap::default();
        for (key, owner) in &current {
            next.insert(key.clone(), owner.clone());
        }
        let mut out = Vec::with_capacity(current.len() + self.owners.len());
        for (key, last) in self.owners.iter() {
            if !next.contains_key(key) {
                out.push(Notification::Owned {
                    kind: ChangeKind::Deleted,
                    key: key.clone(),
                    owner: last.clone(),
                });
            }
        }
        for (key, owner) in current {
            out.push(Notification::Owned {
                kind: ChangeKind::Added,
                key,
                owner,
            });
        }
        self.owners = next;
        out
    }
}

/// Per-collection event handler driven by the watch loop. Malformed
/// payloads are counted, warned about, and dropped without an enqueue.
pub enum Tracker {
    Primary(PrimaryTracker),
    Owned(OwnedTracker),
}

impl Tracker {
    pub fn handle_applied(&mut self, obj: &DynamicObject) -> Option<Notification> {
        match self {
            Tracker::Primary(t) => match to_observed(obj) {
                Ok(o) => Some(t.apply(o)),
                Err(e) => {
                    drop_malformed(e);
                    None
                }
            },
            Tracker::Owned(t) => match extract_key(obj) {
                Ok(key) => {
                    let owner = controller_owner(obj, &t.primary_kind);
                    Some(t.apply(key, owner))
                }
                Err(e) => {
                    drop_malformed(e);
                    None
                }
            },
        }
    }

    pub fn handle_deleted(&mut self, obj: &DynamicObject) -> Option<Notification> {
        match self {
            Tracker::Primary(t) => match to_observed(obj) {
                Ok(o) => Some(t.delete(o)),
                Err(e) => {
                    drop_malformed(e);
                    None
                }
            },
            Tracker::Owned(t) => match extract_key(obj) {
                Ok(key) => {
                    let owner = controller_owner(obj, &t.primary_kind);
                    Some(t.delete(key, owner))
                }
                Err(e) => {
                    drop_malformed(e);
                    None
                }
            },
        }
    }

    pub fn handle_replay(&mut self, objs: &[DynamicObject]) -> Vec<Notification> {
        match self {
            Tracker::Primary(t) => {
                let mut converted = Vec::with_capacity(objs.len());
                for obj in objs {
                    match to_observed(obj) {
                        Ok(o) => converted.push(o),
                        Err(e) => drop_malformed(e),
                    }
                }
                t.replay(converted)
            }
            Tracker::Owned(t) => {
                let mut converted = Vec::with_capacity(objs.len());
                for obj in objs {
                    match extract_key(obj) {
                        Ok(key) => {
                            let owner = controller_owner(obj, &t.primary_kind);
                            converted.push((key, owner));
                        }
                        Err(e) => drop_malformed(e),
                    }
                }
                t.replay(converted)
            }
        }
    }
}

fn drop_malformed(err: anyhow::Error) {
    metrics::counter!("notifier_malformed_total", 1u64);
    warn!(error = ?err, "dropping malformed notification");
}
