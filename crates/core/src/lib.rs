//! Core types and traits for the operon reconciliation engine.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod backoff;

pub use backoff::BackoffPolicy;

/// Stable identity of one desired-state object within a collection.
///
/// Two notifications referring to the same logical object always carry the
/// same key. Ordering is namespace-first so listings group by scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn namespaced(ns: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(ns.into()),
            name: name.into(),
        }
    }

    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Read-only copy of a remote object as last observed.
///
/// Entries are snapshots: replaced wholesale on update, never mutated in
/// place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedObject {
    pub key: ObjectKey,
    pub resource_version: String,
    /// Creation time, seconds since the Unix epoch; 0 when absent.
    pub creation_ts: i64,
    /// Full object body as delivered by the subscription.
    pub raw: serde_json::Value,
}

/// Controlling-owner back-reference carried by an owned object.
///
/// Lookup data only: the parent is resolved by `name` within the child's
/// namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

/// Delete payloads degrade to a tombstone when the final object body was
/// missed during a disconnect; the key survives either way.
#[derive(Debug, Clone)]
pub enum Payload {
    Full(Arc<ObservedObject>),
    Tombstone(ObjectKey),
}

impl Payload {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Payload::Full(obj) => &obj.key,
            Payload::Tombstone(key) => key,
        }
    }
}

/// One typed event emitted by the notifier onto the engine channel.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Change to an object of the primary collection.
    Primary { kind: ChangeKind, payload: Payload },
    /// Change to an object of an owned collection. The controlling owner of
    /// the primary kind, if any, is resolved once at the notifier boundary.
    Owned {
        kind: ChangeKind,
        key: ObjectKey,
        owner: Option<OwnerRef>,
    },
}

impl Notification {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Notification::Primary { payload, .. } => payload.key(),
            Notification::Owned { key, .. } => key,
        }
    }
}

/// Why a reconciliation attempt did not succeed.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Transient; the key is re-queued with backoff.
    #[error("retryable: {0}")]
    Retryable(String),
    /// Needs external intervention; never retried automatically.
    #[error("terminal: {0}")]
    Terminal(String),
}

impl ReconcileError {
    pub fn retryable(msg: impl fmt::Display) -> Self {
        Self::Retryable(msg.to_string())
    }

    pub fn terminal(msg: impl fmt::Display) -> Self {
        Self::Terminal(msg.to_string())
    }
}

/// Caller-supplied idempotent convergence step.
///
/// Invocations are serialized per key by the work queue; the implementation
/// needs no per-key locking but owns any synchronization for state it
/// mutates outside its key's scope.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<(), ReconcileError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// Best-effort audit sink for human-visible state transitions.
///
/// Failures here are logged and swallowed; they never abort reconciliation.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(
        &self,
        subject: &ObjectKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()>;
}

pub mod prelude {
    pub use crate::backoff::BackoffPolicy;
    pub use crate::{
        ChangeKind, EventSeverity, EventSink, Notification, ObjectKey, ObservedObject, OwnerRef,
        Payload, ReconcileError, Reconciler,
    };
}
