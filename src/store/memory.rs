//! In-memory store
//!
//! Every operation runs under one mutex, so each trait method is atomic and
//! the conditional writes behave exactly like their SQL counterparts. Used by
//! the tests and for local runs without a database.

use super::{PipelineStore, Release, StoreError};
use crate::controller::clock::{Clock, SystemClock};
use crate::model::{
    Group, Namespace, PhaseKey, PhaseStatus, PhaseWrite, Pipeline, PipelinePhase,
    PipelineStatus, Service,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    namespaces: HashMap<i64, Namespace>,
    services: HashMap<i64, Service>,
    pipelines: BTreeMap<i64, Pipeline>,
    phases: HashMap<PhaseKey, PipelinePhase>,
    next_pipeline_id: i64,
    next_phase_id: i64,
}

impl Inner {
    fn pipeline_mut(&mut self, id: i64) -> Result<&mut Pipeline, StoreError> {
        self.pipelines
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("pipeline {}", id)))
    }

    fn service_mut(&mut self, id: i64) -> Result<&mut Service, StoreError> {
        self.services
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("service {}", id)))
    }
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_pipeline_id: 1,
                next_phase_id: 1,
                ..Default::default()
            }),
            clock,
        }
    }

    pub async fn insert_namespace(&self, namespace: Namespace) {
        self.inner
            .lock()
            .await
            .namespaces
            .insert(namespace.id, namespace);
    }

    pub async fn insert_service(&self, service: Service) {
        self.inner.lock().await.services.insert(service.id, service);
    }

    /// Insert a pipeline with a fixed id, e.g. to seed a scenario
    pub async fn insert_pipeline(&self, pipeline: Pipeline) {
        let mut inner = self.inner.lock().await;
        inner.next_pipeline_id = inner.next_pipeline_id.max(pipeline.id + 1);
        inner.pipelines.insert(pipeline.id, pipeline);
    }

    /// Force a pipeline status, bypassing the transition rules
    pub async fn set_pipeline_status(&self, id: i64, status: PipelineStatus) {
        if let Some(pipeline) = self.inner.lock().await.pipelines.get_mut(&id) {
            pipeline.status = status;
        }
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn pipeline(&self, id: i64) -> Result<Pipeline, StoreError> {
        self.inner
            .lock()
            .await
            .pipelines
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pipeline {}", id)))
    }

    async fn latest_pipeline(&self, service_id: i64) -> Result<Pipeline, StoreError> {
        self.inner
            .lock()
            .await
            .pipelines
            .values()
            .rev()
            .find(|p| p.service_id == service_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("pipeline for service {}", service_id)))
    }

    async fn create_pipeline(
        &self,
        service_id: i64,
        created_by: &str,
    ) -> Result<Pipeline, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if !inner.services.contains_key(&service_id) {
            return Err(StoreError::NotFound(format!("service {}", service_id)));
        }

        let id = inner.next_pipeline_id;
        inner.next_pipeline_id += 1;
        let pipeline = Pipeline {
            id,
            service_id,
            status: PipelineStatus::Wait,
            image: String::new(),
            created_by: created_by.to_string(),
            created_at: now,
            updated_at: now,
        };
        inner.pipelines.insert(id, pipeline.clone());
        Ok(pipeline)
    }

    async fn record_image(&self, pipeline_id: i64, image: &str) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let pipeline = inner.pipeline_mut(pipeline_id)?;
        if pipeline.status.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}",
                pipeline_id, pipeline.status
            )));
        }
        pipeline.image = image.to_string();
        pipeline.updated_at = now;
        Ok(())
    }

    async fn service(&self, id: i64) -> Result<Service, StoreError> {
        self.inner
            .lock()
            .await
            .services
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("service {}", id)))
    }

    async fn namespace(&self, id: i64) -> Result<Namespace, StoreError> {
        self.inner
            .lock()
            .await
            .namespaces
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("namespace {}", id)))
    }

    async fn phase(&self, key: PhaseKey) -> Result<PipelinePhase, StoreError> {
        self.inner
            .lock()
            .await
            .phases
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("phase {}", key)))
    }

    async fn phases(&self, pipeline_id: i64) -> Result<Vec<PipelinePhase>, StoreError> {
        let inner = self.inner.lock().await;
        let mut phases: Vec<PipelinePhase> = inner
            .phases
            .values()
            .filter(|p| p.pipeline_id == pipeline_id)
            .cloned()
            .collect();
        phases.sort_by_key(|p| (p.kind.as_str(), p.name));
        Ok(phases)
    }

    async fn write_phase(&self, write: PhaseWrite) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        if let Some(existing) = inner.phases.get_mut(&write.key) {
            if !existing.status.may_become(write.status) {
                return Ok(false);
            }
            existing.status = write.status;
            if write.deployment.is_some() {
                existing.deployment = write.deployment;
            }
            existing.updated_at = now;
            return Ok(true);
        }

        let id = inner.next_phase_id;
        inner.next_phase_id += 1;
        inner.phases.insert(
            write.key,
            PipelinePhase {
                id,
                pipeline_id: write.key.pipeline_id,
                kind: write.key.kind,
                name: write.key.name,
                status: write.status,
                resource_version: String::new(),
                deployment: write.deployment,
                log: String::new(),
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn complete_phase(
        &self,
        key: PhaseKey,
        status: PhaseStatus,
        resource_version: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(phase) = inner.phases.get_mut(&key) else {
            return Ok(false);
        };
        if phase.status.is_terminal() || phase.resource_version == resource_version {
            return Ok(false);
        }
        phase.status = status;
        phase.resource_version = resource_version.to_string();
        phase.updated_at = now;
        Ok(true)
    }

    async fn append_phase_log(&self, key: PhaseKey, line: &str) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(phase) = inner.phases.get_mut(&key) else {
            return Ok(false);
        };
        if phase.status.is_terminal() {
            return Ok(false);
        }
        phase.log.push_str(line);
        phase.log.push('\n');
        phase.updated_at = now;
        Ok(true)
    }

    async fn lock_for_deploy(
        &self,
        pipeline_id: i64,
        service_id: i64,
        deploy_group: Group,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let holder = Service::pipeline_holder(pipeline_id);
        let mut inner = self.inner.lock().await;

        let status = inner.pipeline_mut(pipeline_id)?.status;
        if status.is_terminal() || status.is_rollback() {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}",
                pipeline_id, status
            )));
        }

        let service = inner.service_mut(service_id)?;
        if service.is_locked() && service.lock != holder {
            return Err(StoreError::Locked {
                holder: service.lock.clone(),
            });
        }
        service.lock = holder;
        service.deploy_group = Some(deploy_group);

        let pipeline = inner.pipeline_mut(pipeline_id)?;
        if pipeline.status == PipelineStatus::Wait {
            pipeline.status = PipelineStatus::Process;
        }
        pipeline.updated_at = now;
        Ok(())
    }

    async fn lock_for_rollback(
        &self,
        pipeline_id: i64,
        service_id: i64,
        username: &str,
    ) -> Result<(), StoreError> {
        let now = self.clock.now();
        let holder = Service::pipeline_holder(pipeline_id);
        let mut inner = self.inner.lock().await;

        let status = inner.pipeline_mut(pipeline_id)?.status;
        if matches!(
            status,
            PipelineStatus::RollbackSuccess | PipelineStatus::Terminate
        ) {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}",
                pipeline_id, status
            )));
        }

        let service = inner.service_mut(service_id)?;
        let resumable = status == PipelineStatus::Rollbacking;
        if service.is_locked() && service.lock != holder && !resumable {
            return Err(StoreError::Locked {
                holder: service.lock.clone(),
            });
        }
        service.lock = username.to_string();

        let pipeline = inner.pipeline_mut(pipeline_id)?;
        pipeline.status = PipelineStatus::Rollbacking;
        pipeline.updated_at = now;
        Ok(())
    }

    async fn release(&self, release: Release) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let status = inner.pipeline_mut(release.pipeline_id)?.status;
        if status != release.from {
            return Err(StoreError::Conflict(format!(
                "pipeline {} is {}, expected {}",
                release.pipeline_id, status, release.from
            )));
        }

        let service = inner.service_mut(release.service_id)?;
        if let Some(holder) = &release.holder {
            if service.is_locked() && &service.lock != holder {
                return Err(StoreError::Locked {
                    holder: service.lock.clone(),
                });
            }
            service.lock.clear();
        }
        if let Some(groups) = release.groups {
            service.online_group = groups.online;
            service.deploy_group = groups.deploy;
        }

        let pipeline = inner.pipeline_mut(release.pipeline_id)?;
        pipeline.status = release.to;
        pipeline.updated_at = now;
        Ok(())
    }
}
