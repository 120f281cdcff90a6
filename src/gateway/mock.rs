//! In-memory `WorkloadGateway` for tests
//!
//! Records every call in order, tracks which objects exist and the replica
//! count of scaled Deployments, and can be told to fail specific calls.

use super::{GatewayError, Workload, WorkloadGateway, WorkloadKind};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Exists(WorkloadKind, String),
    Create(WorkloadKind, String),
    Update(WorkloadKind, String),
    Scale(String, i32),
}

impl Call {
    fn is_mutation(&self) -> bool {
        !matches!(self, Call::Exists(..))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Exists,
    Create,
    Update,
    Scale,
}

/// Failure injected into a call
#[derive(Clone, Copy, Debug)]
pub enum Failure {
    Timeout,
    /// Cluster answered with this HTTP status
    Status(u16),
}

impl Failure {
    fn into_error(self, kind: WorkloadKind, name: &str) -> GatewayError {
        match self {
            Failure::Timeout => GatewayError::Timeout(Duration::from_secs(5)),
            Failure::Status(code) => GatewayError::classify(
                kube::Error::Api(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("injected {}", code),
                    reason: "Injected".to_string(),
                    code,
                }),
                kind,
                name,
            ),
        }
    }
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    objects: HashSet<(WorkloadKind, String)>,
    replicas: HashMap<String, i32>,
    published: HashMap<(WorkloadKind, String), Workload>,
    failures: HashMap<(Op, String), Failure>,
}

#[derive(Default)]
pub struct MockGateway {
    state: Mutex<State>,
}

#[allow(clippy::unwrap_used)]
impl MockGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend a Deployment already runs with `replicas` pods
    pub fn with_deployment(self, name: &str, replicas: i32) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state
                .objects
                .insert((WorkloadKind::Deployment, name.to_string()));
            state.replicas.insert(name.to_string(), replicas);
        }
        self
    }

    /// Make every `op` call on `name` fail
    pub fn fail(&self, op: Op, name: &str, failure: Failure) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((op, name.to_string()), failure);
    }

    /// Drop every injected failure
    pub fn recover(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that would change the cluster
    pub fn mutations(&self) -> Vec<Call> {
        self.calls().into_iter().filter(Call::is_mutation).collect()
    }

    pub fn scale_calls(&self) -> Vec<(String, i32)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Scale(name, replicas) => Some((name, replicas)),
                _ => None,
            })
            .collect()
    }

    pub fn replicas(&self, name: &str) -> Option<i32> {
        self.state.lock().unwrap().replicas.get(name).copied()
    }

    /// Last object published under `kind`/`name`
    pub fn published(&self, kind: WorkloadKind, name: &str) -> Option<Workload> {
        self.state
            .lock()
            .unwrap()
            .published
            .get(&(kind, name.to_string()))
            .cloned()
    }

    fn record(
        &self,
        call: Call,
        op: Op,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<(), GatewayError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        match state.failures.get(&(op, name.to_string())) {
            Some(failure) => Err(failure.into_error(kind, name)),
            None => Ok(()),
        }
    }

    fn store(&self, workload: &Workload) -> Result<(), GatewayError> {
        let name = workload.name()?.to_string();
        let mut state = self.state.lock().unwrap();
        if let Workload::Deployment(d) = workload {
            let replicas = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            state.replicas.insert(name.clone(), replicas);
        }
        state.objects.insert((workload.kind(), name.clone()));
        state
            .published
            .insert((workload.kind(), name), workload.clone());
        Ok(())
    }
}

#[async_trait]
#[allow(clippy::unwrap_used)]
impl WorkloadGateway for MockGateway {
    async fn exists(
        &self,
        _namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<bool, GatewayError> {
        self.record(Call::Exists(kind, name.to_string()), Op::Exists, kind, name)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .objects
            .contains(&(kind, name.to_string())))
    }

    async fn create(&self, _namespace: &str, workload: &Workload) -> Result<(), GatewayError> {
        let name = workload.name()?;
        let kind = workload.kind();
        self.record(Call::Create(kind, name.to_string()), Op::Create, kind, name)?;
        self.store(workload)
    }

    async fn update(&self, _namespace: &str, workload: &Workload) -> Result<(), GatewayError> {
        let name = workload.name()?;
        let kind = workload.kind();
        self.record(Call::Update(kind, name.to_string()), Op::Update, kind, name)?;
        self.store(workload)
    }

    async fn scale(&self, _namespace: &str, name: &str, replicas: i32) -> Result<(), GatewayError> {
        let kind = WorkloadKind::Deployment;
        self.record(Call::Scale(name.to_string(), replicas), Op::Scale, kind, name)?;

        let mut state = self.state.lock().unwrap();
        if !state.objects.contains(&(kind, name.to_string())) {
            return Err(GatewayError::NotFound {
                kind,
                name: name.to_string(),
            });
        }
        state.replicas.insert(name.to_string(), replicas);
        Ok(())
    }
}
