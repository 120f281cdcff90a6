//! Records shared by the workflows, the reconciler and the store

pub mod pipeline;
pub mod service;

pub use pipeline::{
    PhaseKey, PhaseKind, PhaseName, PhaseStatus, PhaseWrite, Pipeline, PipelinePhase,
    PipelineStatus,
};
pub use service::{Group, GroupAssignment, Namespace, ResourceQuota, Service};
