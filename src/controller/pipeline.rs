//! Pipeline intake: open a release for a service and record its build
//!
//! A service runs one release at a time. A new pipeline is only opened once
//! the previous one reached a terminal status and nothing holds the service
//! lock; the build step then records the image that `deploy` publishes.

use crate::controller::context::Context;
use crate::controller::error::WorkflowError;
use crate::model::Pipeline;
use std::time::Instant;
use tracing::info;

fn check_image(image: &str) -> Result<(), WorkflowError> {
    if image.is_empty() || image.chars().any(char::is_whitespace) {
        return Err(WorkflowError::InvalidImage(image.to_string()));
    }
    Ok(())
}

/// Open a new pipeline for a service
pub async fn create_pipeline(
    ctx: &Context,
    service_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let started = Instant::now();
    let result = open_pipeline(ctx, service_id, username).await;
    ctx.observe("create_pipeline", started, result.is_ok());
    result
}

async fn open_pipeline(
    ctx: &Context,
    service_id: i64,
    username: &str,
) -> Result<Pipeline, WorkflowError> {
    let service = ctx.store.service(service_id).await?;
    if service.is_locked() {
        return Err(WorkflowError::ServiceLocked {
            holder: service.lock.clone(),
        });
    }
    match ctx.store.latest_pipeline(service.id).await {
        Ok(latest) if !latest.status.is_terminal() => {
            return Err(WorkflowError::PipelineActive {
                service_id: service.id,
                id: latest.id,
            });
        }
        Ok(_) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let pipeline = ctx.store.create_pipeline(service.id, username).await?;
    info!(
        pipeline = pipeline.id,
        service = %service.name,
        username = %username,
        "Pipeline created"
    );
    Ok(pipeline)
}

/// Record the image built for a pipeline
pub async fn record_image(
    ctx: &Context,
    pipeline_id: i64,
    image: &str,
) -> Result<Pipeline, WorkflowError> {
    let started = Instant::now();
    let result = store_image(ctx, pipeline_id, image.trim()).await;
    ctx.observe("record_image", started, result.is_ok());
    result
}

async fn store_image(
    ctx: &Context,
    pipeline_id: i64,
    image: &str,
) -> Result<Pipeline, WorkflowError> {
    check_image(image)?;
    let pipeline = ctx.store.pipeline(pipeline_id).await?;
    if pipeline.status.is_terminal() {
        return Err(WorkflowError::PipelineFinished {
            id: pipeline.id,
            status: pipeline.status,
        });
    }

    ctx.store.record_image(pipeline.id, image).await?;
    info!(pipeline = pipeline.id, image = %image, "Image recorded");
    Ok(ctx.store.pipeline(pipeline.id).await?)
}
