//! Fixtures shared by the workflow and capture tests
//!
//! The canonical scenario is service `checkout` (id 42, 5 replicas) in
//! namespace `shop`, released by pipeline 7.

use crate::controller::context::Mocks;
use crate::controller::group;
use crate::model::{
    Group, Namespace, PhaseKey, PhaseKind, PhaseName, PhaseStatus, PhaseWrite, Pipeline,
    PipelineStatus, Service,
};
use crate::store::PipelineStore;
use chrono::Utc;
use std::collections::BTreeMap;

pub const NAMESPACE: &str = "shop";
pub const SERVICE_ID: i64 = 42;
pub const PIPELINE_ID: i64 = 7;
pub const IMAGE: &str = "registry.local/shop/checkout:v7";

pub fn service(online: Option<Group>) -> Service {
    Service {
        id: SERVICE_ID,
        namespace_id: 1,
        name: "checkout".to_string(),
        replicas: 5,
        port: 8080,
        quota: Default::default(),
        config: BTreeMap::from([("LOG_LEVEL".to_string(), "info".to_string())]),
        online_group: online,
        deploy_group: online.map(group::complement),
        lock: String::new(),
    }
}

pub fn pipeline(status: PipelineStatus) -> Pipeline {
    let now = Utc::now();
    Pipeline {
        id: PIPELINE_ID,
        service_id: SERVICE_ID,
        status,
        image: IMAGE.to_string(),
        created_by: "alice".to_string(),
        created_at: now,
        updated_at: now,
    }
}

/// Seed namespace, service and pipeline 7
pub async fn seed(mocks: &Mocks, service: Service, pipeline: Pipeline) {
    mocks
        .store
        .insert_namespace(Namespace {
            id: 1,
            name: NAMESPACE.to_string(),
        })
        .await;
    mocks.store.insert_service(service).await;
    mocks.store.insert_pipeline(pipeline).await;
}

/// Record a phase of pipeline 7 with the given status
pub async fn seed_phase(mocks: &Mocks, kind: PhaseKind, name: PhaseName, status: PhaseStatus) {
    let key = PhaseKey::new(PIPELINE_ID, kind, name);
    let written = mocks
        .store
        .write_phase(PhaseWrite::new(key, status))
        .await
        .expect("phase write");
    assert!(written, "fixture phase {} was already terminal", key);
}

pub async fn phase_status(mocks: &Mocks, kind: PhaseKind, name: PhaseName) -> Option<PhaseStatus> {
    mocks
        .store
        .phase(PhaseKey::new(PIPELINE_ID, kind, name))
        .await
        .ok()
        .map(|p| p.status)
}
