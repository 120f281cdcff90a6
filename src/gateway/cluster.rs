//! `WorkloadGateway` backed by the Kubernetes API

use super::{GatewayError, Workload, WorkloadGateway, WorkloadKind};
use crate::server::SharedMetrics;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Service as KubeService};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct KubeGateway {
    client: Client,
    timeout: Duration,
    metrics: Option<SharedMetrics>,
}

impl KubeGateway {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Run one API call under the gateway timeout and classify its error
    async fn call<T, F>(
        &self,
        operation: &'static str,
        kind: WorkloadKind,
        name: &str,
        fut: F,
    ) -> Result<T, GatewayError>
    where
        F: Future<Output = Result<T, kube::Error>>,
    {
        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(GatewayError::classify(err, kind, name)),
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
        };

        if let Some(ref metrics) = self.metrics {
            metrics.record_gateway_call(
                operation,
                result.is_ok(),
                started.elapsed().as_secs_f64(),
            );
        }
        result
    }

    async fn exists_in<K>(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<bool, GatewayError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        let found = self.call("get", kind, name, api.get_opt(name)).await?;
        Ok(found.is_some())
    }

    async fn create_in<K>(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        object: &K,
    ) -> Result<(), GatewayError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        self.call("create", kind, name, api.create(&PostParams::default(), object))
            .await?;
        info!(namespace = %namespace, kind = %kind, name = %name, "Created workload");
        Ok(())
    }

    async fn update_in<K>(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
        object: &K,
    ) -> Result<(), GatewayError>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
            + Clone
            + DeserializeOwned
            + Serialize
            + Debug,
        <K as kube::Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api(namespace);
        self.call(
            "update",
            kind,
            name,
            api.replace(name, &PostParams::default(), object),
        )
        .await?;
        info!(namespace = %namespace, kind = %kind, name = %name, "Updated workload");
        Ok(())
    }
}

#[async_trait]
impl WorkloadGateway for KubeGateway {
    async fn exists(
        &self,
        namespace: &str,
        kind: WorkloadKind,
        name: &str,
    ) -> Result<bool, GatewayError> {
        match kind {
            WorkloadKind::Deployment => self.exists_in::<Deployment>(namespace, kind, name).await,
            WorkloadKind::Service => self.exists_in::<KubeService>(namespace, kind, name).await,
            WorkloadKind::ConfigMap => self.exists_in::<ConfigMap>(namespace, kind, name).await,
            WorkloadKind::CronJob => self.exists_in::<CronJob>(namespace, kind, name).await,
        }
    }

    async fn create(&self, namespace: &str, workload: &Workload) -> Result<(), GatewayError> {
        let name = workload.name()?;
        let kind = workload.kind();
        match workload {
            Workload::Deployment(o) => self.create_in(namespace, kind, name, o).await,
            Workload::Service(o) => self.create_in(namespace, kind, name, o).await,
            Workload::ConfigMap(o) => self.create_in(namespace, kind, name, o).await,
            Workload::CronJob(o) => self.create_in(namespace, kind, name, o).await,
        }
    }

    async fn update(&self, namespace: &str, workload: &Workload) -> Result<(), GatewayError> {
        let name = workload.name()?;
        let kind = workload.kind();
        match workload {
            Workload::Deployment(o) => self.update_in(namespace, kind, name, o).await,
            Workload::Service(o) => self.update_in(namespace, kind, name, o).await,
            Workload::ConfigMap(o) => self.update_in(namespace, kind, name, o).await,
            Workload::CronJob(o) => self.update_in(namespace, kind, name, o).await,
        }
    }

    async fn scale(&self, namespace: &str, name: &str, replicas: i32) -> Result<(), GatewayError> {
        let api: Api<Deployment> = self.api(namespace);
        let patch = serde_json::json!({
            "spec": {
                "replicas": replicas
            }
        });

        let scale = self
            .call(
                "scale",
                WorkloadKind::Deployment,
                name,
                api.patch_scale(name, &PatchParams::default(), &Patch::Strategic(&patch)),
            )
            .await?;

        let actual = scale.spec.and_then(|s| s.replicas);
        if actual != Some(replicas) {
            return Err(GatewayError::ScaleMismatch {
                name: name.to_string(),
                expected: replicas,
                actual,
            });
        }

        debug!(namespace = %namespace, deployment = %name, replicas = replicas, "Scaled deployment");
        Ok(())
    }
}
