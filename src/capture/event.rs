//! Event capturer: copies cluster events into the matching phase log
//!
//! An event lands in the log of the latest pipeline of the service its
//! subject names, under the phase kind the pipeline is currently in.

use super::{found, CaptureError, Capturer, Change, Outcome, WatchEvent};
use crate::controller::Context;
use crate::model::{PhaseKey, PhaseKind};
use crate::naming::{self, WorkloadIdentity};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;

/// Decoded subject plus the line to append
pub struct LogEntry {
    pub identity: WorkloadIdentity,
    pub type_: String,
    pub reason: String,
    pub message: String,
}

fn subject(event: &Event) -> Option<WorkloadIdentity> {
    naming::decode_subject(event.involved_object.name.as_deref()?)
}

pub struct EventCapturer {
    ctx: Context,
}

impl EventCapturer {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Capturer for EventCapturer {
    type Object = Event;
    type Fields = LogEntry;

    fn name(&self) -> &'static str {
        "event"
    }

    fn valid(&self, event: &WatchEvent<Event>) -> bool {
        subject(&event.object).is_some()
    }

    /// Only live events; the initial listing replays history
    fn ready(&self, event: &WatchEvent<Event>) -> bool {
        event.change == Change::Updated
    }

    fn parse(&self, event: &WatchEvent<Event>) -> Option<LogEntry> {
        let object = &event.object;
        Some(LogEntry {
            identity: subject(object)?,
            type_: object.type_.clone().unwrap_or_else(|| "Normal".to_string()),
            reason: object.reason.clone().unwrap_or_default(),
            message: object.message.clone().unwrap_or_default(),
        })
    }

    async fn operate(
        &self,
        _event: &WatchEvent<Event>,
        entry: LogEntry,
    ) -> Result<Outcome, CaptureError> {
        let store = &self.ctx.store;
        let Some(pipeline) = found(store.latest_pipeline(entry.identity.service_id).await)? else {
            return Ok(Outcome::Discarded("no_pipeline"));
        };
        if pipeline.status.is_terminal() {
            return Ok(Outcome::Discarded("pipeline_finished"));
        }

        let Some(service) = found(store.service(entry.identity.service_id).await)? else {
            return Ok(Outcome::Discarded("no_service"));
        };
        if service.name != entry.identity.service {
            return Ok(Outcome::Discarded("foreign_service"));
        }
        // While deploying, only the group being published writes its log
        let kind = PhaseKind::for_pipeline(pipeline.status);
        if kind == PhaseKind::Deploy && service.deploy_group != Some(entry.identity.group) {
            return Ok(Outcome::Discarded("other_group"));
        }

        let key = PhaseKey::new(pipeline.id, kind, entry.identity.phase);
        let line = format!(
            "{} [{}] {}: {}",
            self.ctx.clock.stamp(),
            entry.type_,
            entry.reason,
            entry.message
        );
        if store.append_phase_log(key, &line).await? {
            Ok(Outcome::Applied)
        } else {
            Ok(Outcome::Discarded("phase_closed"))
        }
    }
}
