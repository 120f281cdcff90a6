//! Typed Kubernetes objects for a service release
//!
//! Every object carries the identity labels from [`crate::naming`], so the
//! capturers can join cluster events back to a pipeline phase without parsing
//! names.

use crate::model::{PhaseName, ResourceQuota, Service};
use crate::naming::{self, CronIdentity, WorkloadIdentity};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, Service as KubeService, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

pub const ANNOTATION_PIPELINE: &str = "ferry.io/pipeline-id";

/// A scheduled batch task of a service
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CronTask {
    pub name: String,
    /// Cron expression, e.g. `*/15 * * * *`
    pub schedule: String,
    #[serde(default)]
    pub command: Vec<String>,
}

/// Replica count a phase is published with
///
/// The sandbox only ever runs a single pod, whatever the service asks for.
pub fn phase_replicas(phase: PhaseName, configured: i32) -> i32 {
    match phase {
        PhaseName::Sandbox => 1,
        _ => configured,
    }
}

/// Name of the ConfigMap feeding a workload's environment
pub fn config_map_name(identity: &WorkloadIdentity) -> String {
    format!("{}-env", identity.name())
}

fn quantities(entries: [(&str, &Option<String>); 2]) -> Option<BTreeMap<String, Quantity>> {
    let map: BTreeMap<String, Quantity> = entries
        .into_iter()
        .filter_map(|(key, value)| {
            value
                .as_ref()
                .map(|v| (key.to_string(), Quantity(v.clone())))
        })
        .collect();
    (!map.is_empty()).then_some(map)
}

fn resources(quota: &ResourceQuota) -> Option<ResourceRequirements> {
    let requests = quantities([
        ("cpu", &quota.cpu_request),
        ("memory", &quota.memory_request),
    ]);
    let limits = quantities([("cpu", &quota.cpu_limit), ("memory", &quota.memory_limit)]);
    if requests.is_none() && limits.is_none() {
        return None;
    }
    Some(ResourceRequirements {
        requests,
        limits,
        ..Default::default()
    })
}

fn env_from(config_map: Option<String>) -> Option<Vec<EnvFromSource>> {
    config_map.map(|name| {
        vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name,
                optional: Some(false),
            }),
            ..Default::default()
        }]
    })
}

fn annotations(pipeline_id: i64) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from([(
        ANNOTATION_PIPELINE.to_string(),
        pipeline_id.to_string(),
    )]))
}

/// ConfigMap rendered from the service's environment config
///
/// `None` when the service has no config.
pub fn build_config_map(
    identity: &WorkloadIdentity,
    service: &Service,
    namespace: &str,
) -> Option<ConfigMap> {
    if service.config.is_empty() {
        return None;
    }
    Some(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(identity)),
            namespace: Some(namespace.to_string()),
            labels: Some(naming::identity_labels(identity)),
            ..Default::default()
        },
        data: Some(service.config.clone()),
        ..Default::default()
    })
}

/// Service fronting a phase workload; shares its name, so its Endpoints do too
pub fn build_service(
    identity: &WorkloadIdentity,
    service: &Service,
    namespace: &str,
) -> KubeService {
    let labels = naming::identity_labels(identity);
    KubeService {
        metadata: ObjectMeta {
            name: Some(identity.name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: service.port,
                target_port: Some(IntOrString::Int(service.port)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deployment of one phase in one group
pub fn build_deployment(
    identity: &WorkloadIdentity,
    service: &Service,
    namespace: &str,
    pipeline_id: i64,
    image: &str,
) -> Deployment {
    let labels = naming::identity_labels(identity);
    let config_map = (!service.config.is_empty()).then(|| config_map_name(identity));

    Deployment {
        metadata: ObjectMeta {
            name: Some(identity.name()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: annotations(pipeline_id),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(phase_replicas(identity.phase, service.replicas)),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: annotations(pipeline_id),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: service.name.clone(),
                        image: Some(image.to_string()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            container_port: service.port,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        resources: resources(&service.quota),
                        env_from: env_from(config_map),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// CronJob running a service task on the pipeline image
pub fn build_cron_job(
    identity: &CronIdentity,
    task: &CronTask,
    namespace: &str,
    pipeline_id: i64,
    image: &str,
) -> CronJob {
    let labels = BTreeMap::from([
        (naming::LABEL_SERVICE.to_string(), identity.service.clone()),
        (
            naming::LABEL_SERVICE_ID.to_string(),
            identity.service_id.to_string(),
        ),
        (naming::LABEL_TASK.to_string(), identity.task.clone()),
        (
            naming::LABEL_MANAGED_BY.to_string(),
            naming::MANAGED_BY.to_string(),
        ),
    ]);
    let command = (!task.command.is_empty()).then(|| task.command.clone());

    CronJob {
        metadata: ObjectMeta {
            name: Some(naming::encode_cron_job(
                &identity.service,
                identity.service_id,
                &identity.task,
            )),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: annotations(pipeline_id),
            ..Default::default()
        },
        spec: Some(CronJobSpec {
            schedule: task.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    ..Default::default()
                }),
                spec: Some(JobSpec {
                    backoff_limit: Some(0),
                    template: PodTemplateSpec {
                        metadata: Some(ObjectMeta {
                            labels: Some(labels),
                            ..Default::default()
                        }),
                        spec: Some(PodSpec {
                            containers: vec![Container {
                                name: identity.task.clone(),
                                image: Some(image.to_string()),
                                command,
                                ..Default::default()
                            }],
                            restart_policy: Some("Never".to_string()),
                            ..Default::default()
                        }),
                    },
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
