//! Kubernetes Event publishing for the source controllers.
//!
//! Events are fire-and-forget: failures are logged and never propagate into
//! reconciliation. New-artifact events carry `revision` and `checksum`
//! annotations so downstream consumers can react without a status read.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::{Event as CoreEvent, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, Time};
use kube::api::PostParams;
use kube::core::ObjectMeta;
use kube::{Api, Client};
use tracing::warn;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Well-known event reasons.
pub mod reasons {
    pub const NEW_ARTIFACT: &str = "NewArtifact";
    pub const ARTIFACT_UP_TO_DATE: &str = "ArtifactUpToDate";
    pub const CHART_PULL_SUCCEEDED: &str = "ChartPullSucceeded";
    pub const CHART_PACKAGE_SUCCEEDED: &str = "ChartPackageSucceeded";
    pub const GARBAGE_COLLECTION_SUCCEEDED: &str = "GarbageCollectionSucceeded";
    pub const GARBAGE_COLLECTION_FAILED: &str = "GarbageCollectionFailed";
    pub const RESOLVED_DEPENDENCIES: &str = "ResolvedDependencies";
}

/// Annotation keys attached to new-artifact events.
pub mod annotations {
    pub const REVISION: &str = "source.charthouse.dev/revision";
    pub const CHECKSUM: &str = "source.charthouse.dev/checksum";
}

/// Publishes events about reconciled objects.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an event. `annotations` end up in the event metadata.
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: &str,
        reason: &str,
        message: &str,
        annotations: Option<BTreeMap<String, String>>,
    );
}

/// Publishes core/v1 Events through the Kubernetes API.
pub struct KubeEventPublisher {
    client: Client,
    controller_name: String,
}

impl KubeEventPublisher {
    pub fn new(client: Client, controller_name: &str) -> Self {
        Self {
            client,
            controller_name: controller_name.to_string(),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        object: &ObjectReference,
        type_: &str,
        reason: &str,
        message: &str,
        annotations: Option<BTreeMap<String, String>>,
    ) {
        let namespace = object.namespace.clone().unwrap_or_else(|| "default".to_string());
        let name = object.name.clone().unwrap_or_default();
        let now = Utc::now();

        let event = CoreEvent {
            metadata: ObjectMeta {
                // Unique enough for events; the API server rejects exact
                // duplicates within the same microsecond.
                name: Some(format!("{}.{:x}", name, now.timestamp_nanos_opt().unwrap_or_default())),
                namespace: Some(namespace.clone()),
                annotations,
                ..Default::default()
            },
            involved_object: object.clone(),
            type_: Some(type_.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            reporting_component: Some(self.controller_name.clone()),
            source: Some(k8s_openapi::api::core::v1::EventSource {
                component: Some(self.controller_name.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            event_time: Some(MicroTime(now)),
            count: Some(1),
            ..Default::default()
        };

        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), &namespace);
        if let Err(err) = api.create(&PostParams::default(), &event).await {
            warn!(reason, error = %err, "failed to publish event");
        }
    }
}

/// Collects events in memory; used in tests.
#[derive(Default)]
pub struct RecordingEventPublisher {
    pub events: std::sync::Mutex<Vec<RecordedEvent>>,
}

#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub type_: String,
    pub reason: String,
    pub message: String,
    pub annotations: Option<BTreeMap<String, String>>,
}

#[async_trait]
impl EventPublisher for RecordingEventPublisher {
    async fn publish(
        &self,
        _object: &ObjectReference,
        type_: &str,
        reason: &str,
        message: &str,
        annotations: Option<BTreeMap<String, String>>,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            type_: type_.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
            annotations,
        });
    }
}

impl RecordingEventPublisher {
    pub fn reasons(&self) -> Vec<String> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.reason.clone())
            .collect()
    }
}

/// Builds the annotation map for a new-artifact event.
pub fn artifact_annotations(revision: &str, checksum: Option<&str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    map.insert(annotations::REVISION.to_string(), revision.to_string());
    if let Some(checksum) = checksum {
        map.insert(annotations::CHECKSUM.to_string(), checksum.to_string());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_publisher_collects_events() {
        let publisher = RecordingEventPublisher::default();
        publisher
            .publish(
                &ObjectReference::default(),
                EVENT_TYPE_NORMAL,
                reasons::NEW_ARTIFACT,
                "stored artifact with revision '6.2.0'",
                Some(artifact_annotations("6.2.0", Some("abc"))),
            )
            .await;

        assert_eq!(publisher.reasons(), vec!["NewArtifact"]);
        let events = publisher.events.lock().unwrap();
        let recorded = events[0].annotations.as_ref().unwrap();
        assert_eq!(
            recorded.get(annotations::REVISION).map(String::as_str),
            Some("6.2.0")
        );
        assert_eq!(
            recorded.get(annotations::CHECKSUM).map(String::as_str),
            Some("abc")
        );
    }
}
