//! CDEvents emission for release observability
//!
//! - `service.deployed` when a workload phase of a pipeline turns successful
//! - `service.published` when a pipeline finishes and its group goes online
//! - `service.rolledback` when a rollback completes
//!
//! Emission is best-effort: callers log failures and carry on.

use crate::model::{Group, PhaseName, Pipeline, Service};
use crate::naming;
use async_trait::async_trait;
use cdevents_sdk::{CDEvent, Subject};
use cloudevents::Event;
use serde_json::json;
use std::fmt::Display;
use thiserror::Error;

const EVENT_SOURCE: &str = "https://ferry.io";
const SUBJECT_SOURCE: &str = "https://ferry.io/controller";

#[derive(Debug, Error)]
pub enum CDEventsError {
    #[error("cdevents error: {0}")]
    Generic(String),
}

/// Trait for sending CDEvents
///
/// Production code uses `HttpEventSink` which sends events via HTTP POST.
/// Tests use `MockEventSink` which stores events in memory for assertions.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError>;
}

/// Production event sink that sends CloudEvents via HTTP POST
pub struct HttpEventSink {
    enabled: bool,
    sink_url: Option<String>,
    client: reqwest::Client,
}

impl HttpEventSink {
    /// Sends nothing unless `enabled` is set and a sink URL is configured
    pub fn new(enabled: bool, sink_url: Option<String>) -> Self {
        HttpEventSink {
            enabled,
            sink_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, None)
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError> {
        if !self.enabled {
            return Ok(());
        }

        let Some(url) = &self.sink_url else {
            return Ok(());
        };

        self.client
            .post(url)
            .header("Content-Type", "application/cloudevents+json")
            .json(event)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| CDEventsError::Generic(format!("HTTP POST failed: {}", e)))?;

        Ok(())
    }
}

/// Mock event sink for testing - stores events in memory
#[cfg(test)]
#[derive(Default)]
pub struct MockEventSink {
    events: std::sync::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl MockEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::unwrap_used)]
    pub fn get_emitted_events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

#[cfg(test)]
#[async_trait]
impl EventSink for MockEventSink {
    async fn send(&self, event: &Event) -> Result<(), CDEventsError> {
        #[allow(clippy::unwrap_used)]
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// The release an event is about
pub struct ReleaseRef<'a> {
    pub namespace: &'a str,
    pub service: &'a Service,
    pub pipeline: &'a Pipeline,
}

impl ReleaseRef<'_> {
    fn workload(&self, phase: PhaseName, group: Group) -> String {
        naming::encode(&self.service.name, self.service.id, phase, group)
    }

    fn environment_id(&self, phase: PhaseName, group: Group) -> String {
        format!("{}/{}", self.namespace, self.workload(phase, group))
    }

    fn environment_source(&self, phase: PhaseName, group: Group) -> String {
        format!(
            "/apis/apps/v1/namespaces/{}/deployments/{}",
            self.namespace,
            self.workload(phase, group)
        )
    }
}

fn invalid<E: Display>(field: &'static str) -> impl FnOnce(E) -> CDEventsError {
    move |e| CDEventsError::Generic(format!("Invalid {}: {}", field, e))
}

/// A workload phase became ready: `service.deployed`
pub async fn emit_phase_deployed(
    release: &ReleaseRef<'_>,
    phase: PhaseName,
    group: Group,
    sink: &dyn EventSink,
) -> Result<(), CDEventsError> {
    let event = build_service_deployed_event(release, phase, group)?;
    sink.send(&event).await
}

/// The deployed group went online: `service.published`
pub async fn emit_published(
    release: &ReleaseRef<'_>,
    group: Group,
    sink: &dyn EventSink,
) -> Result<(), CDEventsError> {
    let event = build_service_published_event(release, group)?;
    sink.send(&event).await
}

/// A rollback restored `group`: `service.rolledback`
pub async fn emit_rolledback(
    release: &ReleaseRef<'_>,
    group: Group,
    sink: &dyn EventSink,
) -> Result<(), CDEventsError> {
    let event = build_service_rolledback_event(release, group)?;
    sink.send(&event).await
}

fn build_service_deployed_event(
    release: &ReleaseRef<'_>,
    phase: PhaseName,
    group: Group,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_deployed;

    let subject = Subject::from(service_deployed::Content {
        artifact_id: artifact(release)?
            .try_into()
            .map_err(invalid("artifact_id"))?,
        environment: service_deployed::ContentEnvironment {
            id: release
                .environment_id(phase, group)
                .try_into()
                .map_err(invalid("environment id"))?,
            source: Some(
                release
                    .environment_source(phase, group)
                    .try_into()
                    .map_err(invalid("environment source"))?,
            ),
        },
    });

    finish_event(
        subject,
        format!("/pipelines/{}/{}", release.pipeline.id, phase),
        custom_data(release, Some(phase), group, "phase_ready"),
    )
}

fn build_service_published_event(
    release: &ReleaseRef<'_>,
    group: Group,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_published;

    let subject = Subject::from(service_published::Content {
        environment: Some(service_published::ContentEnvironment {
            id: release
                .environment_id(PhaseName::Online, group)
                .try_into()
                .map_err(invalid("environment id"))?,
            source: Some(
                release
                    .environment_source(PhaseName::Online, group)
                    .try_into()
                    .map_err(invalid("environment source"))?,
            ),
        }),
    });

    finish_event(
        subject,
        format!("/pipelines/{}/finish", release.pipeline.id),
        custom_data(release, None, group, "finished"),
    )
}

fn build_service_rolledback_event(
    release: &ReleaseRef<'_>,
    group: Group,
) -> Result<Event, CDEventsError> {
    use cdevents_sdk::latest::service_rolledback;

    let subject = Subject::from(service_rolledback::Content {
        artifact_id: artifact(release)?
            .try_into()
            .map_err(invalid("artifact_id"))?,
        environment: service_rolledback::ContentEnvironment {
            id: release
                .environment_id(PhaseName::Online, group)
                .try_into()
                .map_err(invalid("environment id"))?,
            source: Some(
                release
                    .environment_source(PhaseName::Online, group)
                    .try_into()
                    .map_err(invalid("environment source"))?,
            ),
        },
    });

    finish_event(
        subject,
        format!("/pipelines/{}/rollback", release.pipeline.id),
        custom_data(release, None, group, "rolled_back"),
    )
}

/// Attach ids and sources, then convert to a CloudEvent
fn finish_event(
    subject: Subject,
    subject_id: String,
    data: serde_json::Value,
) -> Result<Event, CDEventsError> {
    let cdevent = CDEvent::from(
        subject
            .with_id(subject_id.try_into().map_err(invalid("subject id"))?)
            .with_source(SUBJECT_SOURCE.try_into().map_err(invalid("subject source"))?),
    )
    .with_id(
        uuid::Uuid::new_v4()
            .to_string()
            .try_into()
            .map_err(invalid("event id"))?,
    )
    .with_source(EVENT_SOURCE.try_into().map_err(invalid("event source"))?)
    .with_custom_data(data);

    cdevent
        .try_into()
        .map_err(|e| CDEventsError::Generic(format!("Failed to convert to CloudEvent: {}", e)))
}

fn artifact(release: &ReleaseRef<'_>) -> Result<String, CDEventsError> {
    if release.pipeline.image.is_empty() {
        return Err(CDEventsError::Generic(format!(
            "pipeline {} has no image",
            release.pipeline.id
        )));
    }
    Ok(release.pipeline.image.clone())
}

fn custom_data(
    release: &ReleaseRef<'_>,
    phase: Option<PhaseName>,
    group: Group,
    reason: &str,
) -> serde_json::Value {
    json!({
        "ferry": {
            "version": "v1",
            "service": {
                "id": release.service.id,
                "name": release.service.name,
                "namespace": release.namespace
            },
            "pipeline": {
                "id": release.pipeline.id,
                "created_by": release.pipeline.created_by,
                "image": release.pipeline.image
            },
            "phase": phase.map(PhaseName::as_str),
            "group": group.as_str(),
            "decision": {
                "reason": reason
            }
        }
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "cdevents_test.rs"]
mod tests;
