//! Deployment capturer: completes phases and performs the blue/green cutover

use super::{found, CaptureError, Capturer, Change, Outcome, WatchEvent};
use crate::controller::cdevents::{self, ReleaseRef};
use crate::controller::group;
use crate::controller::Context;
use crate::model::{PhaseKey, PhaseKind, PhaseStatus};
use crate::naming::{self, WorkloadIdentity};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use tracing::{debug, info, warn};

/// Whether a Deployment has fully rolled out
///
/// All four must hold: a non-zero replica target (scaled-to-zero groups are
/// being drained), the controller has observed the current generation, and
/// every desired replica is both updated and available.
pub fn is_ready(deployment: &Deployment) -> bool {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let generation = deployment.metadata.generation;
    desired != 0
        && generation.is_some()
        && generation == status.observed_generation
        && status.updated_replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
}

pub struct DeploymentCapturer {
    ctx: Context,
}

impl DeploymentCapturer {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Scale the other group's workload of the same phase to zero
    async fn drain(&self, namespace: &str, identity: &WorkloadIdentity) -> Result<(), CaptureError> {
        let other = identity.with_group(group::complement(identity.group)).name();
        match self.ctx.gateway.scale(namespace, &other, 0).await {
            Ok(()) => {
                info!(drained = %other, ready = %identity.name(), "Cut over to new group");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(workload = %other, "No previous workload to drain");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Capturer for DeploymentCapturer {
    type Object = Deployment;
    type Fields = WorkloadIdentity;

    fn name(&self) -> &'static str {
        "deployment"
    }

    fn valid(&self, event: &WatchEvent<Deployment>) -> bool {
        naming::identity_from_labels(event.labels()).is_some() || naming::is_managed(&event.name())
    }

    fn ready(&self, event: &WatchEvent<Deployment>) -> bool {
        event.change != Change::Deleted && is_ready(&event.object)
    }

    fn parse(&self, event: &WatchEvent<Deployment>) -> Option<WorkloadIdentity> {
        naming::resolve(&event.name(), Some(event.labels()))
    }

    async fn operate(
        &self,
        event: &WatchEvent<Deployment>,
        identity: WorkloadIdentity,
    ) -> Result<Outcome, CaptureError> {
        let store = &self.ctx.store;

        let Some(pipeline) = found(store.latest_pipeline(identity.service_id).await)? else {
            return Ok(Outcome::Discarded("no_pipeline"));
        };
        if pipeline.status.is_terminal() {
            return Ok(Outcome::Discarded("pipeline_finished"));
        }

        let kind = PhaseKind::for_pipeline(pipeline.status);
        let key = PhaseKey::new(pipeline.id, kind, identity.phase);
        let Some(phase) = found(store.phase(key).await)? else {
            return Ok(Outcome::Discarded("no_phase"));
        };

        let Some(version) = event.resource_version() else {
            return Ok(Outcome::Discarded("no_version"));
        };
        if phase.resource_version == version {
            return Ok(Outcome::Discarded("duplicate"));
        }
        if phase.status.is_terminal() {
            return Ok(Outcome::Discarded("phase_finished"));
        }

        let Some(service) = found(store.service(identity.service_id).await)? else {
            return Ok(Outcome::Discarded("no_service"));
        };
        if service.name != identity.service {
            return Ok(Outcome::Discarded("foreign_service"));
        }
        // A rollout only completes through the group it publishes to
        let in_deploy_group = service.deploy_group == Some(identity.group);
        if kind == PhaseKind::Deploy && !in_deploy_group {
            return Ok(Outcome::Discarded("other_group"));
        }
        let namespace = event.namespace().unwrap_or_default();

        let cutover = event.change == Change::Updated
            && kind == PhaseKind::Deploy
            && in_deploy_group
            && service.online_group.is_some();
        if cutover {
            self.drain(&namespace, &identity).await?;
        }

        if !store
            .complete_phase(key, PhaseStatus::Success, &version)
            .await?
        {
            return Ok(Outcome::Discarded("raced"));
        }
        info!(
            pipeline = pipeline.id,
            kind = %kind,
            phase = %identity.phase,
            group = %identity.group,
            resource_version = %version,
            "Phase ready"
        );

        let release = ReleaseRef {
            namespace: &namespace,
            service: &service,
            pipeline: &pipeline,
        };
        if let Err(e) = cdevents::emit_phase_deployed(
            &release,
            identity.phase,
            identity.group,
            self.ctx.cdevents_sink.as_ref(),
        )
        .await
        {
            warn!(error = %e, pipeline = pipeline.id, "Failed to emit deployed event");
        }

        Ok(Outcome::Applied)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deployment_test.rs"]
mod tests;
