//! Cluster access for published workloads
//!
//! The workflows never talk to the Kubernetes API directly; they go through
//! [`WorkloadGateway`], which `KubeGateway` implements against a live cluster
//! and `MockGateway` implements in memory for tests. Every call is bounded by
//! a fixed timeout and never retried.

pub mod cluster;
#[cfg(test)]
pub mod mock;

pub use cluster::KubeGateway;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Service as KubeService};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: WorkloadKind, name: String },

    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),

    /// The cluster refused the object itself (4xx other than 404/409)
    #[error("cluster rejected {kind} '{name}' ({code}): {message}")]
    Rejected {
        kind: WorkloadKind,
        name: String,
        code: u16,
        message: String,
    },

    #[error("cluster API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("scale of '{name}' returned {actual:?} replicas, expected {expected}")]
    ScaleMismatch {
        name: String,
        expected: i32,
        actual: Option<i32>,
    },

    #[error("{0} has no metadata.name")]
    MissingName(WorkloadKind),
}

impl GatewayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, GatewayError::NotFound { .. })
    }

    /// Whether retrying the same request can never succeed
    pub fn is_rejection(&self) -> bool {
        matches!(self, GatewayError::Rejected { .. } | GatewayError::MissingName(_))
    }

    /// Classify a client error for a call on `kind`/`name`
    pub fn classify(err: kube::Error, kind: WorkloadKind, name: &str) -> Self {
        match err {
            kube::Error::Api(status) if status.code == 404 => GatewayError::NotFound {
                kind,
                name: name.to_string(),
            },
            kube::Error::Api(status)
                if (400..500).contains(&status.code) && status.code != 409 =>
            {
                GatewayError::Rejected {
                    kind,
                    name: name.to_string(),
                    code: status.code,
                    message: status.message.clone(),
                }
            }
            kube::Error::Api(status) => GatewayError::Api {
                code: status.code,
                message: status.message.clone(),
            },
            other => GatewayError::Kube(other),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    Service,
    ConfigMap,
    CronJob,
}

impl WorkloadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::Service => "Service",
            WorkloadKind::ConfigMap => "ConfigMap",
            WorkloadKind::CronJob => "CronJob",
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An object the workflows publish
#[derive(Clone, Debug)]
pub enum Workload {
    Deployment(Deployment),
    Service(KubeService),
    ConfigMap(ConfigMap),
    CronJob(CronJob),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::Service(_) => WorkloadKind::Service,
            Workload::ConfigMap(_) => WorkloadKind::ConfigMap,
            Workload::CronJob(_) => WorkloadKind::CronJob,
        }
    }

    pub fn name(&self) -> Result<&str, GatewayError> {
        let name = match self {
            Workload::Deployment(d) => d.metadata.name.as_deref(),
            Workload::Service(s) => s.metadata.name.as_deref(),
            Workload::ConfigMap(c) => c.metadata.name.as_deref(),
            Workload::CronJob(c) => c.metadata.name.as_deref(),
        };
        name.ok_or(GatewayError::MissingName(self.kind()))
    }
}

/// Result of [`apply`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
}

#[async_trait]
pub trait WorkloadGateway: Send + Sync {
    /// Whether the object exists; not-found is `Ok(false)`, other errors propagate
    async fn exists(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<bool, GatewayError>;

    async fn create(&self, namespace: &str, workload: &Workload) -> Result<(), GatewayError>;

    async fn update(&self, namespace: &str, workload: &Workload) -> Result<(), GatewayError>;

    /// Set a Deployment's replica count through its scale subresource
    ///
    /// Fails with `NotFound` when the Deployment does not exist.
    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), GatewayError>;
}

/// Create the object, or update it when it already exists
pub async fn apply(
    gateway: &dyn WorkloadGateway,
    namespace: &str,
    workload: &Workload,
) -> Result<Applied, GatewayError> {
    let name = workload.name()?;
    if gateway.exists(namespace, workload.kind(), name).await? {
        gateway.update(namespace, workload).await?;
        Ok(Applied::Updated)
    } else {
        gateway.create(namespace, workload).await?;
        Ok(Applied::Created)
    }
}
