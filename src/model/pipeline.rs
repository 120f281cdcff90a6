use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Overall status of one rollout attempt
///
/// `Process` and `Rollbacking` are the only states in which phases may advance
/// or a rollback may execute. The remaining non-`Wait` states are terminal.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Wait,
    Process,
    Success,
    Failed,
    Rollbacking,
    RollbackSuccess,
    RollbackFailed,
    Terminate,
}

impl PipelineStatus {
    pub const TERMINAL: [PipelineStatus; 5] = [
        PipelineStatus::Success,
        PipelineStatus::Failed,
        PipelineStatus::RollbackSuccess,
        PipelineStatus::RollbackFailed,
        PipelineStatus::Terminate,
    ];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Statuses whose phase events belong to the rollback kind
    pub fn is_rollback(self) -> bool {
        matches!(
            self,
            PipelineStatus::Rollbacking
                | PipelineStatus::RollbackSuccess
                | PipelineStatus::RollbackFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PipelineStatus::Wait => "wait",
            PipelineStatus::Process => "process",
            PipelineStatus::Success => "success",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Rollbacking => "rollbacking",
            PipelineStatus::RollbackSuccess => "rollback_success",
            PipelineStatus::RollbackFailed => "rollback_failed",
            PipelineStatus::Terminate => "terminate",
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(PipelineStatus::Wait),
            "process" => Ok(PipelineStatus::Process),
            "success" => Ok(PipelineStatus::Success),
            "failed" => Ok(PipelineStatus::Failed),
            "rollbacking" => Ok(PipelineStatus::Rollbacking),
            "rollback_success" => Ok(PipelineStatus::RollbackSuccess),
            "rollback_failed" => Ok(PipelineStatus::RollbackFailed),
            "terminate" => Ok(PipelineStatus::Terminate),
            other => Err(format!("unknown pipeline status '{}'", other)),
        }
    }
}

/// Named step of a rollout, in execution order
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    Image,
    Sandbox,
    Online,
    Finish,
}

impl PhaseName {
    /// Phases that own a workload in the cluster
    pub const WORKLOAD: [PhaseName; 2] = [PhaseName::Sandbox, PhaseName::Online];

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseName::Image => "image",
            PhaseName::Sandbox => "sandbox",
            PhaseName::Online => "online",
            PhaseName::Finish => "finish",
        }
    }

    pub fn has_workload(self) -> bool {
        Self::WORKLOAD.contains(&self)
    }
}

impl fmt::Display for PhaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(PhaseName::Image),
            "sandbox" => Ok(PhaseName::Sandbox),
            "online" => Ok(PhaseName::Online),
            "finish" => Ok(PhaseName::Finish),
            other => Err(format!("unknown phase '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Deploy,
    Rollback,
}

impl PhaseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseKind::Deploy => "deploy",
            PhaseKind::Rollback => "rollback",
        }
    }

    /// Kind of phase a pipeline in `status` is currently producing
    pub fn for_pipeline(status: PipelineStatus) -> Self {
        if status.is_rollback() {
            PhaseKind::Rollback
        } else {
            PhaseKind::Deploy
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deploy" => Ok(PhaseKind::Deploy),
            "rollback" => Ok(PhaseKind::Rollback),
            other => Err(format!("unknown phase kind '{}'", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    Wait,
    Process,
    Success,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PhaseStatus::Success | PhaseStatus::Failed)
    }

    /// Position in the `wait -> process -> terminal` order
    fn rank(self) -> u8 {
        match self {
            PhaseStatus::Wait => 0,
            PhaseStatus::Process => 1,
            PhaseStatus::Success | PhaseStatus::Failed => 2,
        }
    }

    /// Whether a phase in this status may be written with `next`
    ///
    /// Terminal phases are frozen and nothing moves backwards; rewriting the
    /// same status is allowed so a republish can refresh its snapshot.
    pub fn may_become(self, next: PhaseStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Wait => "wait",
            PhaseStatus::Process => "process",
            PhaseStatus::Success => "success",
            PhaseStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(PhaseStatus::Wait),
            "process" => Ok(PhaseStatus::Process),
            "success" => Ok(PhaseStatus::Success),
            "failed" => Ok(PhaseStatus::Failed),
            other => Err(format!("unknown phase status '{}'", other)),
        }
    }
}

/// One rollout attempt for a service
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Pipeline {
    pub id: i64,
    pub service_id: i64,
    pub status: PipelineStatus,
    /// Image reference produced by the build step; empty until built
    pub image: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Unique key of a phase row
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PhaseKey {
    pub pipeline_id: i64,
    pub kind: PhaseKind,
    pub name: PhaseName,
}

impl PhaseKey {
    pub fn new(pipeline_id: i64, kind: PhaseKind, name: PhaseName) -> Self {
        Self {
            pipeline_id,
            kind,
            name,
        }
    }
}

impl fmt::Display for PhaseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pipeline_id, self.kind, self.name)
    }
}

/// One step of a rollout or rollback
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PipelinePhase {
    pub id: i64,
    pub pipeline_id: i64,
    pub kind: PhaseKind,
    pub name: PhaseName,
    pub status: PhaseStatus,
    /// Last cluster resource version this phase reacted to
    pub resource_version: String,
    /// JSON snapshot of the published Deployment
    pub deployment: Option<String>,
    pub log: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelinePhase {
    pub fn key(&self) -> PhaseKey {
        PhaseKey::new(self.pipeline_id, self.kind, self.name)
    }
}

/// Requested write of a phase row
///
/// Inserted when absent; applied to an existing row only while that row is
/// not terminal.
#[derive(Clone, Debug, PartialEq)]
pub struct PhaseWrite {
    pub key: PhaseKey,
    pub status: PhaseStatus,
    pub deployment: Option<String>,
}

impl PhaseWrite {
    pub fn new(key: PhaseKey, status: PhaseStatus) -> Self {
        Self {
            key,
            status,
            deployment: None,
        }
    }

    pub fn with_deployment(mut self, deployment: String) -> Self {
        self.deployment = Some(deployment);
        self
    }
}
