//! Pipeline/phase persistence
//!
//! The store is the single source of truth every capturer and workflow reads.
//! All writes that guard a state transition are conditional (compare-and-set)
//! so concurrent deliveries of the same watch event cannot both win:
//!
//! - [`PipelineStore::complete_phase`] only moves a non-terminal phase whose
//!   stored resource version differs from the incoming one
//! - [`PipelineStore::lock_for_deploy`] / [`PipelineStore::lock_for_rollback`]
//!   change the service lock together with the pipeline status it guards
//! - [`PipelineStore::release`] checks the expected pipeline status and lock
//!   holder before swapping groups

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::model::{
    Group, GroupAssignment, Namespace, PhaseKey, PhaseStatus, PhaseWrite, Pipeline,
    PipelinePhase, PipelineStatus, Service,
};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("service is locked by '{holder}'")]
    Locked { holder: String },

    #[error("conflicting state: {0}")]
    Conflict(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Final transition of a pipeline
#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub pipeline_id: i64,
    pub service_id: i64,
    /// Status the pipeline must currently have
    pub from: PipelineStatus,
    pub to: PipelineStatus,
    /// Expected lock holder; the lock is cleared when it matches (or is empty).
    /// `None` leaves the lock untouched.
    pub holder: Option<String>,
    /// New group pair, if the transition swaps groups
    pub groups: Option<GroupAssignment>,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    async fn pipeline(&self, id: i64) -> Result<Pipeline, StoreError>;

    /// Most recently created pipeline of a service
    async fn latest_pipeline(&self, service_id: i64) -> Result<Pipeline, StoreError>;

    async fn create_pipeline(&self, service_id: i64, created_by: &str)
        -> Result<Pipeline, StoreError>;

    /// Record the image produced by the build step
    async fn record_image(&self, pipeline_id: i64, image: &str) -> Result<(), StoreError>;

    async fn service(&self, id: i64) -> Result<Service, StoreError>;

    async fn namespace(&self, id: i64) -> Result<Namespace, StoreError>;

    async fn phase(&self, key: PhaseKey) -> Result<PipelinePhase, StoreError>;

    /// All phases of a pipeline, ordered by kind then phase order
    async fn phases(&self, pipeline_id: i64) -> Result<Vec<PipelinePhase>, StoreError>;

    /// Insert a phase, or move an existing one forward
    ///
    /// A terminal phase is never touched and a `process` phase is never set
    /// back to `wait`. Returns whether a row was written.
    async fn write_phase(&self, write: PhaseWrite) -> Result<bool, StoreError>;

    /// Move a phase to a terminal status as a reaction to a cluster event
    ///
    /// Single conditional update: applies only while the phase is not terminal
    /// and its stored resource version differs from `resource_version`.
    /// Returns whether the transition happened.
    async fn complete_phase(
        &self,
        key: PhaseKey,
        status: PhaseStatus,
        resource_version: &str,
    ) -> Result<bool, StoreError>;

    /// Append a line to a non-terminal phase's log
    async fn append_phase_log(&self, key: PhaseKey, line: &str) -> Result<bool, StoreError>;

    /// Take the service lock for a rollout step
    ///
    /// Atomically: requires a non-terminal, non-rollback pipeline and a lock
    /// that is free or already held by this pipeline; stores the lock and the
    /// deploy group, and moves the pipeline from `Wait` to `Process`.
    async fn lock_for_deploy(
        &self,
        pipeline_id: i64,
        service_id: i64,
        deploy_group: Group,
    ) -> Result<(), StoreError>;

    /// Take the service lock for a rollback
    ///
    /// Atomically: requires a pipeline not in `RollbackSuccess`/`Terminate` and
    /// a lock that is free, held by this pipeline, or left by an earlier
    /// attempt at this rollback; sets the pipeline to `Rollbacking` and the
    /// lock to `username`.
    async fn lock_for_rollback(
        &self,
        pipeline_id: i64,
        service_id: i64,
        username: &str,
    ) -> Result<(), StoreError>;

    async fn release(&self, release: Release) -> Result<(), StoreError>;
}
