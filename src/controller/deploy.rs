//! Deploy workflow: publish one phase of a pipeline to its deploy group

use crate::controller::context::Context;
use crate::controller::error::WorkflowError;
use crate::controller::group;
use crate::controller::manifest::{self, CronTask};
use crate::gateway::{self, Applied, Workload};
use crate::model::{
    PhaseKey, PhaseKind, PhaseName, PhaseStatus, PhaseWrite, Pipeline, PipelinePhase, Service,
};
use crate::naming::{self, CronIdentity, WorkloadIdentity};
use std::time::Instant;
use tracing::{error, info, warn};

/// Parse a phase name accepted by [`deploy`]
///
/// `image` is produced by the build step and `finish` has its own workflow,
/// so only workload phases can be published here.
pub fn parse_deploy_phase(phase: &str) -> Result<PhaseName, WorkflowError> {
    match phase.parse::<PhaseName>() {
        Ok(name) if name.has_workload() => Ok(name),
        _ => Err(WorkflowError::InvalidPhase(phase.to_string())),
    }
}

fn check_deployable(pipeline: &Pipeline) -> Result<(), WorkflowError> {
    if pipeline.status.is_terminal() {
        return Err(WorkflowError::PipelineFinished {
            id: pipeline.id,
            status: pipeline.status,
        });
    }
    if pipeline.status.is_rollback() {
        return Err(WorkflowError::RollbackInProgress(pipeline.id));
    }
    if pipeline.image.is_empty() {
        return Err(WorkflowError::ImageMissing(pipeline.id));
    }
    Ok(())
}

fn check_service_name(service: &Service) -> Result<(), WorkflowError> {
    if naming::is_valid_service_name(&service.name) {
        Ok(())
    } else {
        Err(WorkflowError::InvalidServiceName(service.name.clone()))
    }
}

/// Publish `phase` of a pipeline
///
/// Takes the service lock, publishes ConfigMap, Service and Deployment into
/// the deploy group and leaves the phase in `process`; the deployment capturer
/// completes it once the Deployment is ready. Calling it again before the
/// phase completes re-publishes (update instead of create).
pub async fn deploy(
    ctx: &Context,
    pipeline_id: i64,
    phase: &str,
    username: &str,
) -> Result<PipelinePhase, WorkflowError> {
    let started = Instant::now();
    let result = deploy_phase(ctx, pipeline_id, phase, username).await;
    ctx.observe("deploy", started, result.is_ok());
    result
}

async fn deploy_phase(
    ctx: &Context,
    pipeline_id: i64,
    phase: &str,
    username: &str,
) -> Result<PipelinePhase, WorkflowError> {
    let name = parse_deploy_phase(phase)?;
    let pipeline = ctx.store.pipeline(pipeline_id).await?;
    check_deployable(&pipeline)?;

    let key = PhaseKey::new(pipeline.id, PhaseKind::Deploy, name);
    match ctx.store.phase(key).await {
        Ok(existing) if existing.status.is_terminal() => {
            return Err(WorkflowError::PhaseFinished(key));
        }
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let service = ctx.store.service(pipeline.service_id).await?;
    check_service_name(&service)?;
    let namespace = ctx.store.namespace(service.namespace_id).await?;

    let holder = Service::pipeline_holder(pipeline.id);
    if service.is_locked() && service.lock != holder {
        return Err(WorkflowError::ServiceLocked {
            holder: service.lock.clone(),
        });
    }

    let deploy_group = group::deploy_group_for(service.online_group);
    ctx.store
        .lock_for_deploy(pipeline.id, service.id, deploy_group)
        .await?;
    // No-op on a republish: a published phase stays `process`
    ctx.store
        .write_phase(PhaseWrite::new(key, PhaseStatus::Wait))
        .await?;

    let identity = WorkloadIdentity::new(service.name.clone(), service.id, name, deploy_group);
    info!(
        pipeline = pipeline.id,
        phase = %name,
        group = %deploy_group,
        workload = %identity.name(),
        username = %username,
        "Publishing phase"
    );

    let deployment = manifest::build_deployment(
        &identity,
        &service,
        &namespace.name,
        pipeline.id,
        &pipeline.image,
    );
    let snapshot = serde_json::to_string(&deployment)?;

    let mut workloads = Vec::with_capacity(3);
    if let Some(config_map) = manifest::build_config_map(&identity, &service, &namespace.name) {
        workloads.push(Workload::ConfigMap(config_map));
    }
    workloads.push(Workload::Service(manifest::build_service(
        &identity,
        &service,
        &namespace.name,
    )));
    workloads.push(Workload::Deployment(deployment));

    for workload in &workloads {
        if let Err(e) = gateway::apply(ctx.gateway.as_ref(), &namespace.name, workload).await {
            if e.is_rejection() {
                error!(
                    error = %e,
                    pipeline = pipeline.id,
                    phase = %name,
                    "Cluster rejected workload, failing phase"
                );
                ctx.store
                    .write_phase(PhaseWrite::new(key, PhaseStatus::Failed))
                    .await?;
            } else {
                warn!(
                    error = %e,
                    pipeline = pipeline.id,
                    phase = %name,
                    "Publishing failed, phase status unchanged"
                );
            }
            return Err(e.into());
        }
    }

    ctx.store
        .write_phase(PhaseWrite::new(key, PhaseStatus::Process).with_deployment(snapshot))
        .await?;
    info!(pipeline = pipeline.id, phase = %name, "Phase published");

    Ok(ctx.store.phase(key).await?)
}

/// Publish a CronJob for a service task using the pipeline image
pub async fn publish_cron_job(
    ctx: &Context,
    pipeline_id: i64,
    task: &CronTask,
) -> Result<Applied, WorkflowError> {
    let started = Instant::now();
    let result = publish_task(ctx, pipeline_id, task).await;
    ctx.observe("cron_job", started, result.is_ok());
    result
}

async fn publish_task(
    ctx: &Context,
    pipeline_id: i64,
    task: &CronTask,
) -> Result<Applied, WorkflowError> {
    if !naming::is_valid_service_name(&task.name) {
        return Err(WorkflowError::InvalidTaskName(task.name.clone()));
    }
    let pipeline = ctx.store.pipeline(pipeline_id).await?;
    check_deployable(&pipeline)?;

    let service = ctx.store.service(pipeline.service_id).await?;
    check_service_name(&service)?;
    let namespace = ctx.store.namespace(service.namespace_id).await?;

    let identity = CronIdentity {
        service: service.name.clone(),
        service_id: service.id,
        task: task.name.clone(),
    };
    let cron_job = manifest::build_cron_job(
        &identity,
        task,
        &namespace.name,
        pipeline.id,
        &pipeline.image,
    );

    let applied = gateway::apply(
        ctx.gateway.as_ref(),
        &namespace.name,
        &Workload::CronJob(cron_job),
    )
    .await?;
    info!(pipeline = pipeline.id, task = %task.name, applied = ?applied, "CronJob published");
    Ok(applied)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "deploy_test.rs"]
mod tests;
