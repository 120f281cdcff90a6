use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// One of the two blue/green deployment slots of a service
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Group {
    Blue,
    Green,
}

impl Group {
    pub fn as_str(self) -> &'static str {
        match self {
            Group::Blue => "blue",
            Group::Green => "green",
        }
    }

    /// Parse a stored group column where "" means no group
    pub fn from_column(value: &str) -> Result<Option<Group>, String> {
        if value.is_empty() {
            Ok(None)
        } else {
            value.parse().map(Some)
        }
    }

    pub fn to_column(group: Option<Group>) -> &'static str {
        group.map(Group::as_str).unwrap_or("")
    }
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Group {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue" => Ok(Group::Blue),
            "green" => Ok(Group::Green),
            other => Err(format!("unknown group '{}'", other)),
        }
    }
}

/// Container resource requests and limits, in Kubernetes quantity notation
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct ResourceQuota {
    pub cpu_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_request: Option<String>,
    pub memory_limit: Option<String>,
}

/// A deployable unit
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Service {
    pub id: i64,
    pub namespace_id: i64,
    pub name: String,
    /// Configured replica count for the online phase
    pub replicas: i32,
    pub port: i32,
    #[serde(default)]
    pub quota: ResourceQuota,
    /// Environment rendered into the service ConfigMap
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    /// Group currently receiving production traffic
    pub online_group: Option<Group>,
    /// Target group of the current or next rollout
    pub deploy_group: Option<Group>,
    /// Pipeline id or username holding the service; empty when unlocked
    pub lock: String,
}

impl Service {
    pub fn is_locked(&self) -> bool {
        !self.lock.is_empty()
    }

    /// Lock holder string for a pipeline
    pub fn pipeline_holder(pipeline_id: i64) -> String {
        pipeline_id.to_string()
    }
}

/// Cluster namespace a service's workloads live in
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Namespace {
    pub id: i64,
    pub name: String,
}

/// Persisted group pair of a service
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupAssignment {
    pub online: Option<Group>,
    pub deploy: Option<Group>,
}
