//! Finish and terminate workflows
//!
//! `finish` is the bookkeeping half of the cutover: the capturers already
//! drained the old group phase by phase, so finishing only promotes the deploy
//! group to online, releases the lock and closes the pipeline.

use crate::controller::cdevents::{self, ReleaseRef};
use crate::controller::context::Context;
use crate::controller::error::WorkflowError;
use crate::controller::group;
use crate::model::{
    PhaseKey, PhaseKind, PhaseName, PhaseStatus, PhaseWrite, Pipeline, PipelinePhase,
    PipelineStatus, Service,
};
use crate::store::Release;
use std::time::Instant;
use tracing::{info, warn};

fn check_open(pipeline: &Pipeline) -> Result<(), WorkflowError> {
    if pipeline.status.is_terminal() {
        return Err(WorkflowError::PipelineFinished {
            id: pipeline.id,
            status: pipeline.status,
        });
    }
    if pipeline.status.is_rollback() {
        return Err(WorkflowError::RollbackInProgress(pipeline.id));
    }
    Ok(())
}

/// Reason the recorded deploy phases do not allow finishing, if any
fn not_ready_reason(phases: &[PipelinePhase]) -> Option<String> {
    let deploy_phases = phases
        .iter()
        .filter(|p| p.kind == PhaseKind::Deploy && p.name.has_workload());

    let mut online = false;
    for phase in deploy_phases {
        if phase.status != PhaseStatus::Success {
            return Some(format!("phase {} is {}", phase.name, phase.status));
        }
        online |= phase.name == PhaseName::Online;
    }
    if online {
        None
    } else {
        Some("online phase has not been deployed".to_string())
    }
}

/// Complete a pipeline whose phases all succeeded
pub async fn finish(
    ctx: &Context,
    pipeline_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let started = Instant::now();
    let result = finish_pipeline(ctx, pipeline_id, username).await;
    ctx.observe("finish", started, result.is_ok());
    result
}

async fn finish_pipeline(
    ctx: &Context,
    pipeline_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let pipeline = ctx.store.pipeline(pipeline_id).await?;
    check_open(&pipeline)?;
    if pipeline.status != PipelineStatus::Process {
        return Err(WorkflowError::PhaseNotReady {
            id: pipeline.id,
            reason: format!("pipeline is {}", pipeline.status),
        });
    }

    let phases = ctx.store.phases(pipeline.id).await?;
    if let Some(reason) = not_ready_reason(&phases) {
        return Err(WorkflowError::PhaseNotReady {
            id: pipeline.id,
            reason,
        });
    }

    let service = ctx.store.service(pipeline.service_id).await?;
    let holder = Service::pipeline_holder(pipeline.id);
    if service.is_locked() && service.lock != holder {
        return Err(WorkflowError::ServiceLocked {
            holder: service.lock.clone(),
        });
    }
    let Some(deploy_group) = service.deploy_group else {
        return Err(WorkflowError::PhaseNotReady {
            id: pipeline.id,
            reason: "service has no deploy group".to_string(),
        });
    };

    ctx.store
        .write_phase(PhaseWrite::new(
            PhaseKey::new(pipeline.id, PhaseKind::Deploy, PhaseName::Finish),
            PhaseStatus::Success,
        ))
        .await?;
    ctx.store
        .release(Release {
            pipeline_id: pipeline.id,
            service_id: service.id,
            from: PipelineStatus::Process,
            to: PipelineStatus::Success,
            holder: Some(holder),
            groups: Some(group::after_finish(deploy_group)),
        })
        .await?;

    info!(
        pipeline = pipeline.id,
        service = %service.name,
        online = %deploy_group,
        username = %username,
        "Pipeline finished"
    );

    let finished = ctx.store.pipeline(pipeline.id).await?;
    let namespace = ctx.store.namespace(service.namespace_id).await?;
    let release = ReleaseRef {
        namespace: &namespace.name,
        service: &service,
        pipeline: &finished,
    };
    if let Err(e) =
        cdevents::emit_published(&release, deploy_group, ctx.cdevents_sink.as_ref()).await
    {
        warn!(error = %e, pipeline = pipeline.id, "Failed to emit published event");
    }

    Ok(finished)
}

/// Cancel a pipeline that has not finished
///
/// Groups are left untouched; the lock is released only when this pipeline
/// holds it.
pub async fn terminate(
    ctx: &Context,
    pipeline_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let started = Instant::now();
    let result = terminate_pipeline(ctx, pipeline_id, username).await;
    ctx.observe("terminate", started, result.is_ok());
    result
}

async fn terminate_pipeline(
    ctx: &Context,
    pipeline_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let pipeline = ctx.store.pipeline(pipeline_id).await?;
    check_open(&pipeline)?;

    let service = ctx.store.service(pipeline.service_id).await?;
    let holder = Service::pipeline_holder(pipeline.id);
    let holds_lock = service.lock == holder;

    ctx.store
        .release(Release {
            pipeline_id: pipeline.id,
            service_id: service.id,
            from: pipeline.status,
            to: PipelineStatus::Terminate,
            holder: holds_lock.then_some(holder),
            groups: None,
        })
        .await?;

    info!(
        pipeline = pipeline.id,
        from = %pipeline.status,
        released_lock = holds_lock,
        username = %username,
        "Pipeline terminated"
    );
    Ok(ctx.store.pipeline(pipeline.id).await?)
}
