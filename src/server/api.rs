//! Operator API: the workflow entry points over HTTP
//!
//! - `POST /api/pipelines` - open a pipeline `{service_id, username}`
//! - `POST /api/pipelines/image` - record the build `{pipeline_id, image}`
//! - `POST /api/deploy` - publish a phase `{pipeline_id, phase, username}`
//! - `POST /api/rollback` - roll a pipeline back `{pipeline_id, username}`
//! - `POST /api/finish` - close a rollout and swap groups
//! - `POST /api/terminate` - cancel a pipeline
//! - `POST /api/cronjob` - publish a scheduled task `{pipeline_id, task}`
//! - `GET /api/endpoints` - live pod membership per workload
//!
//! Failures answer `{"error": message, "kind": category}`.

use crate::capture::{EndpointRegistry, Membership};
use crate::controller::manifest::CronTask;
use crate::controller::{self, Context, ErrorCategory, WorkflowError};
use crate::gateway::Applied;
use crate::model::{Pipeline, PipelinePhase};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

#[derive(Clone)]
pub struct ApiState {
    ctx: Context,
    registry: Arc<EndpointRegistry>,
}

impl ApiState {
    pub fn new(ctx: Context, registry: Arc<EndpointRegistry>) -> Self {
        Self { ctx, registry }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePipelineRequest {
    pub service_id: i64,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct ImageRequest {
    pub pipeline_id: i64,
    pub image: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    pub pipeline_id: i64,
    pub phase: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct PipelineRequest {
    pub pipeline_id: i64,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct CronJobRequest {
    pub pipeline_id: i64,
    pub task: CronTask,
}

pub fn status_for(category: ErrorCategory) -> StatusCode {
    match category {
        ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::Precondition => StatusCode::CONFLICT,
        ErrorCategory::NotFound => StatusCode::NOT_FOUND,
        ErrorCategory::Rejected => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCategory::Transient => StatusCode::BAD_GATEWAY,
    }
}

/// Workflow failure rendered as an HTTP response
pub struct ApiError(WorkflowError);

impl From<WorkflowError> for ApiError {
    fn from(err: WorkflowError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let category = self.0.category();
        let status = status_for(category);
        if status.is_server_error() {
            warn!(error = %self.0, kind = category.as_str(), "Request failed");
        }
        let body = json!({
            "error": self.0.to_string(),
            "kind": category.as_str(),
        });
        (status, Json(body)).into_response()
    }
}

async fn create_pipeline(
    State(state): State<ApiState>,
    Json(req): Json<CreatePipelineRequest>,
) -> Result<(StatusCode, Json<Pipeline>), ApiError> {
    let pipeline = controller::create_pipeline(&state.ctx, req.service_id, &req.username).await?;
    Ok((StatusCode::CREATED, Json(pipeline)))
}

async fn record_image(
    State(state): State<ApiState>,
    Json(req): Json<ImageRequest>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline = controller::record_image(&state.ctx, req.pipeline_id, &req.image).await?;
    Ok(Json(pipeline))
}

async fn deploy(
    State(state): State<ApiState>,
    Json(req): Json<DeployRequest>,
) -> Result<Json<PipelinePhase>, ApiError> {
    let phase = controller::deploy(&state.ctx, req.pipeline_id, &req.phase, &req.username).await?;
    Ok(Json(phase))
}

async fn rollback(
    State(state): State<ApiState>,
    Json(req): Json<PipelineRequest>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline = controller::rollback(&state.ctx, req.pipeline_id, &req.username).await?;
    Ok(Json(pipeline))
}

async fn finish(
    State(state): State<ApiState>,
    Json(req): Json<PipelineRequest>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline = controller::finish(&state.ctx, req.pipeline_id, &req.username).await?;
    Ok(Json(pipeline))
}

async fn terminate(
    State(state): State<ApiState>,
    Json(req): Json<PipelineRequest>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline = controller::terminate(&state.ctx, req.pipeline_id, &req.username).await?;
    Ok(Json(pipeline))
}

async fn cron_job(
    State(state): State<ApiState>,
    Json(req): Json<CronJobRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let applied = controller::publish_cron_job(&state.ctx, req.pipeline_id, &req.task).await?;
    let result = match applied {
        Applied::Created => "created",
        Applied::Updated => "updated",
    };
    Ok(Json(json!({ "task": req.task.name, "result": result })))
}

async fn endpoints(State(state): State<ApiState>) -> Json<Vec<Membership>> {
    Json(state.registry.snapshot())
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/pipelines", post(create_pipeline))
        .route("/api/pipelines/image", post(record_image))
        .route("/api/deploy", post(deploy))
        .route("/api/rollback", post(rollback))
        .route("/api/finish", post(finish))
        .route("/api/terminate", post(terminate))
        .route("/api/cronjob", post(cron_job))
        .route("/api/endpoints", get(endpoints))
        .with_state(state)
}
