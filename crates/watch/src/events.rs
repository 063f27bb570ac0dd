//! Audit sink publishing Kubernetes Events for the primary collection.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;

use operon_core::{EventSeverity, EventSink, ObjectKey};

use crate::ResourceSpec;

/// Publishes `(subject, reason, message)` tuples as v1 Events attributed
/// to the engine. Best-effort by contract: callers log and move on when
/// `publish` fails.
pub struct KubeEventSink {
    client: Client,
    reporter: Reporter,
    api_version: String,
    kind: String,
}

impl KubeEventSink {
    pub fn new(client: Client, controller: &str, primary: &ResourceSpec) -> Self {
        let api_version = if primary.group.is_empty() {
            primary.version.clone()
        } else {
            format!("{}/{}", primary.group, primary.version)
        };
        Self {
            client,
            reporter: Reporter {
                controller: controller.to_string(),
                instance: None,
            },
            api_version,
            kind: primary.kind.clone(),
        }
    }

    fn reference(&self, subject: &ObjectKey) -> ObjectReference {
        ObjectReference {
            api_version: Some(self.api_version.clone()),
            kind: Some(self.kind.clone()),
            name: Some(subject.name.clone()),
            namespace: subject.namespace.clone(),
            ..ObjectReference::default()
        }
    }
}

#[async_trait::async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        subject: &ObjectKey,
        severity: EventSeverity,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            self.reference(subject),
        );
        let type_ = match severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(message.to_string()),
                action: "Reconcile".to_string(),
                secondary: None,
            })
            .await
            .context("publishing event")?;
        Ok(())
    }
}
