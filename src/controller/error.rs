use crate::gateway::GatewayError;
use crate::model::{PhaseKey, PipelineStatus};
use crate::store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("invalid phase '{0}'")]
    InvalidPhase(String),

    #[error("invalid service name '{0}': numeric segments are reserved for the service id")]
    InvalidServiceName(String),

    #[error("invalid task name '{0}'")]
    InvalidTaskName(String),

    #[error("invalid image reference '{0}'")]
    InvalidImage(String),

    #[error("pipeline {id} is already {status}")]
    PipelineFinished { id: i64, status: PipelineStatus },

    #[error("phase {0} is already finished")]
    PhaseFinished(PhaseKey),

    #[error("pipeline {0} has no built image")]
    ImageMissing(i64),

    #[error("service is locked by '{holder}'")]
    ServiceLocked { holder: String },

    #[error("pipeline {id} cannot be rolled back from {status}")]
    CannotRollback { id: i64, status: PipelineStatus },

    #[error("phase {0} is still processing and cannot be rolled back")]
    ProcessingNotRollbackable(PhaseKey),

    #[error("pipeline {id} is not ready: {reason}")]
    PhaseNotReady { id: i64, reason: String },

    #[error("service {0} has no group to roll back")]
    NoGroupToRollback(i64),

    #[error("pipeline {0} is rolling back")]
    RollbackInProgress(i64),

    #[error("service {service_id} already has pipeline {id} in progress")]
    PipelineActive { service_id: i64, id: i64 },

    #[error("pipeline {id} was superseded by pipeline {latest}")]
    Superseded { id: i64, latest: i64 },

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("failed to serialize manifest: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for WorkflowError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Locked { holder } => WorkflowError::ServiceLocked { holder },
            other => WorkflowError::Store(other),
        }
    }
}

/// Coarse error class, used for logging and HTTP status mapping
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Precondition,
    NotFound,
    /// Cluster refused the published object
    Rejected,
    Transient,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Precondition => "precondition",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Rejected => "rejected",
            ErrorCategory::Transient => "transient",
        }
    }
}

impl WorkflowError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            WorkflowError::InvalidPhase(_)
            | WorkflowError::InvalidServiceName(_)
            | WorkflowError::InvalidTaskName(_)
            | WorkflowError::InvalidImage(_) => ErrorCategory::Validation,
            WorkflowError::PipelineFinished { .. }
            | WorkflowError::PhaseFinished(_)
            | WorkflowError::ImageMissing(_)
            | WorkflowError::ServiceLocked { .. }
            | WorkflowError::CannotRollback { .. }
            | WorkflowError::ProcessingNotRollbackable(_)
            | WorkflowError::PhaseNotReady { .. }
            | WorkflowError::NoGroupToRollback(_)
            | WorkflowError::RollbackInProgress(_)
            | WorkflowError::PipelineActive { .. }
            | WorkflowError::Superseded { .. } => ErrorCategory::Precondition,
            WorkflowError::Store(StoreError::NotFound(_)) => ErrorCategory::NotFound,
            WorkflowError::Store(StoreError::Locked { .. } | StoreError::Conflict(_)) => {
                ErrorCategory::Precondition
            }
            WorkflowError::Store(_) => ErrorCategory::Transient,
            WorkflowError::Gateway(err) if err.is_rejection() => ErrorCategory::Rejected,
            WorkflowError::Gateway(_) => ErrorCategory::Transient,
            WorkflowError::Serialization(_) => ErrorCategory::Rejected,
        }
    }
}
