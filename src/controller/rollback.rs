//! Rollback engine
//!
//! Restores the previous group phase by phase and drains the bad one. The
//! service lock is taken before the first cluster call and is only released
//! once every phase has been rolled back, so a failure part way through leaves
//! the pipeline `rollbacking` with the lock held. Calling `rollback` again
//! resumes from the first phase that has not been rolled back yet.

use crate::controller::cdevents::{self, ReleaseRef};
use crate::controller::context::Context;
use crate::controller::error::WorkflowError;
use crate::controller::group::{self, RollbackPair};
use crate::controller::manifest;
use crate::gateway::WorkloadKind;
use crate::model::{
    Group, PhaseKey, PhaseKind, PhaseName, PhaseStatus, PhaseWrite, Pipeline, PipelinePhase,
    PipelineStatus, Service,
};
use crate::store::Release;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{debug, error, info, warn};

fn check_rollbackable(pipeline: &Pipeline) -> Result<(), WorkflowError> {
    match pipeline.status {
        PipelineStatus::RollbackSuccess | PipelineStatus::Terminate => {
            Err(WorkflowError::CannotRollback {
                id: pipeline.id,
                status: pipeline.status,
            })
        }
        _ => Ok(()),
    }
}

/// Status the group selection is based on
///
/// A resumed rollback no longer knows whether the rollout had cut over; the
/// recorded finish phase tells.
fn effective_status(pipeline: &Pipeline, phases: &[PipelinePhase]) -> PipelineStatus {
    if pipeline.status != PipelineStatus::Rollbacking {
        return pipeline.status;
    }
    let finished = phases.iter().any(|p| {
        p.kind == PhaseKind::Deploy && p.name == PhaseName::Finish && p.status == PhaseStatus::Success
    });
    if finished {
        PipelineStatus::Success
    } else {
        PipelineStatus::Process
    }
}

/// Deploy phases to roll back, in phase order
fn phases_to_roll_back(phases: &[PipelinePhase]) -> Vec<PhaseName> {
    let done: HashSet<PhaseName> = phases
        .iter()
        .filter(|p| p.kind == PhaseKind::Rollback && p.status == PhaseStatus::Success)
        .map(|p| p.name)
        .collect();

    let mut pending: Vec<PhaseName> = phases
        .iter()
        .filter(|p| p.kind == PhaseKind::Deploy && p.name.has_workload() && p.status.is_terminal())
        .map(|p| p.name)
        .filter(|name| !done.contains(name))
        .collect();
    pending.sort();
    pending
}

/// Roll a pipeline back to the previous group
pub async fn rollback(
    ctx: &Context,
    pipeline_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let started = Instant::now();
    let result = rollback_pipeline(ctx, pipeline_id, username).await;
    ctx.observe("rollback", started, result.is_ok());
    result
}

async fn rollback_pipeline(
    ctx: &Context,
    pipeline_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let pipeline = ctx.store.pipeline(pipeline_id).await?;
    check_rollbackable(&pipeline)?;
    // Groups of an older release now belong to the pipeline that followed it
    let latest = ctx.store.latest_pipeline(pipeline.service_id).await?;
    if latest.id != pipeline.id {
        return Err(WorkflowError::Superseded {
            id: pipeline.id,
            latest: latest.id,
        });
    }

    let phases = ctx.store.phases(pipeline.id).await?;
    if let Some(in_flight) = phases.iter().find(|p| p.status == PhaseStatus::Process) {
        return Err(WorkflowError::ProcessingNotRollbackable(in_flight.key()));
    }

    let service = ctx.store.service(pipeline.service_id).await?;
    let resuming = pipeline.status == PipelineStatus::Rollbacking;
    if service.is_locked() && service.lock != Service::pipeline_holder(pipeline.id) && !resuming {
        return Err(WorkflowError::ServiceLocked {
            holder: service.lock.clone(),
        });
    }
    let namespace = ctx.store.namespace(service.namespace_id).await?;

    let status = effective_status(&pipeline, &phases);
    let pair = group::rollback_pair(status, &service)
        .ok_or(WorkflowError::NoGroupToRollback(service.id))?;
    let previous_online = previous_online(ctx, &namespace.name, &service, status, pair).await?;

    ctx.store
        .lock_for_rollback(pipeline.id, service.id, username)
        .await?;
    info!(
        pipeline = pipeline.id,
        destroy = %pair.destroy,
        rollback = %pair.rollback,
        resuming,
        username = %username,
        "Rolling back pipeline"
    );

    for phase in phases_to_roll_back(&phases) {
        if let Err(e) =
            roll_back_phase(ctx, &namespace.name, &service, pipeline.id, phase, pair, previous_online)
                .await
        {
            error!(
                error = %e,
                pipeline = pipeline.id,
                phase = %phase,
                "Rollback aborted, service stays locked"
            );
            return Err(e);
        }
    }

    ctx.store
        .release(Release {
            pipeline_id: pipeline.id,
            service_id: service.id,
            from: PipelineStatus::Rollbacking,
            to: PipelineStatus::RollbackSuccess,
            holder: Some(username.to_string()),
            groups: Some(group::after_rollback(pair, previous_online)),
        })
        .await?;

    let rolled_back = ctx.store.pipeline(pipeline.id).await?;
    match previous_online {
        Some(_) => {
            info!(pipeline = pipeline.id, online = %pair.rollback, "Rollback complete");
            let release = ReleaseRef {
                namespace: &namespace.name,
                service: &service,
                pipeline: &rolled_back,
            };
            if let Err(e) =
                cdevents::emit_rolledback(&release, pair.rollback, ctx.cdevents_sink.as_ref())
                    .await
            {
                warn!(error = %e, pipeline = pipeline.id, "Failed to emit rolledback event");
            }
        }
        None => info!(
            pipeline = pipeline.id,
            "Rollback of first rollout complete, service has no online group"
        ),
    }

    Ok(rolled_back)
}

/// Group that served traffic before this rollout, if any
///
/// Before cutover that is the current online group. After cutover the online
/// group is the bad release, and the rollback group only served traffic if
/// its online workload exists.
async fn previous_online(
    ctx: &Context,
    namespace: &str,
    service: &Service,
    status: PipelineStatus,
    pair: RollbackPair,
) -> Result<Option<Group>, WorkflowError> {
    if status != PipelineStatus::Success {
        return Ok(service.online_group);
    }
    let name = group::workload_name(&service.name, service.id, PhaseName::Online, pair.rollback);
    let exists = ctx
        .gateway
        .exists(namespace, WorkloadKind::Deployment, &name)
        .await?;
    Ok(exists.then_some(pair.rollback))
}

async fn roll_back_phase(
    ctx: &Context,
    namespace: &str,
    service: &Service,
    pipeline_id: i64,
    phase: PhaseName,
    pair: RollbackPair,
    previous_online: Option<Group>,
) -> Result<(), WorkflowError> {
    if previous_online.is_some() {
        let restore = group::workload_name(&service.name, service.id, phase, pair.rollback);
        let replicas = manifest::phase_replicas(phase, service.replicas);
        match ctx.gateway.scale(namespace, &restore, replicas).await {
            Ok(()) => debug!(workload = %restore, replicas, "Restored workload"),
            Err(e) if e.is_not_found() => warn!(workload = %restore, "Nothing to restore"),
            Err(e) => return Err(e.into()),
        }
    }

    let destroy = group::workload_name(&service.name, service.id, phase, pair.destroy);
    match ctx.gateway.scale(namespace, &destroy, 0).await {
        Ok(()) => debug!(workload = %destroy, "Drained workload"),
        Err(e) if e.is_not_found() => debug!(workload = %destroy, "Workload already gone"),
        Err(e) => return Err(e.into()),
    }

    ctx.store
        .write_phase(PhaseWrite::new(
            PhaseKey::new(pipeline_id, PhaseKind::Rollback, phase),
            PhaseStatus::Success,
        ))
        .await?;
    info!(pipeline = pipeline_id, phase = %phase, "Phase rolled back");
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "rollback_test.rs"]
mod tests;
