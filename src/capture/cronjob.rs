//! CronJob capturer: reports each finished batch run once
//!
//! Watches the Jobs a ferry CronJob spawns (`{service}-cronjob-{id}-{task}-{n}`).
//! Batch runs are outside the blue/green state machine; results are logged
//! and counted.

use super::{CaptureError, Capturer, Change, Outcome, WatchEvent};
use crate::naming::{self, CronIdentity};
use crate::server::SharedMetrics;
use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn of(job: &Job) -> Self {
        let status = job.status.as_ref();
        if status.and_then(|s| s.succeeded).unwrap_or(0) >= 1 {
            JobState::Succeeded
        } else if status.and_then(|s| s.failed).unwrap_or(0) >= 1 {
            JobState::Failed
        } else {
            JobState::Running
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Running => "running",
            JobState::Succeeded => "success",
            JobState::Failed => "failed",
        }
    }
}

pub struct JobCapturer {
    /// Finished jobs already reported, keyed by namespace and job name
    reported: Mutex<HashMap<(String, String), JobState>>,
    metrics: Option<SharedMetrics>,
}

impl JobCapturer {
    pub fn new(metrics: Option<SharedMetrics>) -> Self {
        Self {
            reported: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn result(&self, namespace: &str, job: &str) -> Option<JobState> {
        self.reported
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), job.to_string()))
            .copied()
    }
}

#[async_trait]
impl Capturer for JobCapturer {
    type Object = Job;
    type Fields = CronIdentity;

    fn name(&self) -> &'static str {
        "cronjob"
    }

    fn valid(&self, event: &WatchEvent<Job>) -> bool {
        naming::decode_cron_job(&event.name()).is_some()
    }

    fn ready(&self, event: &WatchEvent<Job>) -> bool {
        event.change == Change::Deleted || JobState::of(&event.object) != JobState::Running
    }

    fn parse(&self, event: &WatchEvent<Job>) -> Option<CronIdentity> {
        naming::decode_cron_job(&event.name())
    }

    async fn operate(
        &self,
        event: &WatchEvent<Job>,
        identity: CronIdentity,
    ) -> Result<Outcome, CaptureError> {
        let key = (event.namespace().unwrap_or_default(), event.name());
        let mut reported = self.reported.lock().unwrap_or_else(PoisonError::into_inner);

        if event.change == Change::Deleted {
            return Ok(match reported.remove(&key) {
                Some(_) => Outcome::Applied,
                None => Outcome::Discarded("unknown"),
            });
        }
        if reported.contains_key(&key) {
            return Ok(Outcome::Discarded("reported"));
        }

        let state = JobState::of(&event.object);
        reported.insert(key, state);
        drop(reported);

        match state {
            JobState::Failed => warn!(
                service = %identity.service,
                service_id = identity.service_id,
                task = %identity.task,
                job = %event.name(),
                "CronJob run failed"
            ),
            _ => info!(
                service = %identity.service,
                service_id = identity.service_id,
                task = %identity.task,
                job = %event.name(),
                "CronJob run succeeded"
            ),
        }
        if let Some(ref metrics) = self.metrics {
            metrics.record_job(state.as_str());
        }
        Ok(Outcome::Applied)
    }
}
