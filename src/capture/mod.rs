//! Event capturers: the reconciler half of the control plane
//!
//! Every watched resource kind has one [`Capturer`]. Each notification runs
//! through the same four steps:
//!
//! 1. `valid` - is this a workload ferry manages
//! 2. `ready` - has it reached a state worth acting on
//! 3. `parse` - decode its identity
//! 4. `operate` - look up the pipeline and act
//!
//! A notification failing any step is discarded without side effects. Nothing
//! is retried here: the watch stream re-delivers state until the resource is
//! stable, so the next notification is the retry. Repeated delivery is made
//! harmless by the store's conditional writes.

pub mod cronjob;
pub mod deployment;
pub mod endpoint;
pub mod event;
pub mod watch;

pub use cronjob::{JobCapturer, JobState};
pub use deployment::{is_ready, DeploymentCapturer};
pub use endpoint::{EndpointCapturer, EndpointRegistry, Membership};
pub use event::EventCapturer;
pub use watch::{spawn_watchers, WatchConfig};

use crate::gateway::GatewayError;
use crate::server::SharedMetrics;
use crate::store::StoreError;
use async_trait::async_trait;
use kube::ResourceExt;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Watch change tag
///
/// The live watch stream does not tell creation from modification, so every
/// live apply is an `Updated`; `Added` only comes from the initial listing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Change {
    Added,
    Updated,
    Deleted,
}

/// One watch notification
#[derive(Clone, Debug)]
pub struct WatchEvent<K> {
    pub change: Change,
    pub object: K,
}

impl<K: kube::Resource> WatchEvent<K> {
    pub fn new(change: Change, object: K) -> Self {
        Self { change, object }
    }

    pub fn name(&self) -> String {
        self.object.name_any()
    }

    pub fn namespace(&self) -> Option<String> {
        self.object.namespace()
    }

    pub fn resource_version(&self) -> Option<String> {
        self.object.resource_version()
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.object.labels()
    }
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

/// What handling one notification amounted to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// State was changed (phase completed, log appended, registry updated)
    Applied,
    /// Nothing to do; carries the reason
    Discarded(&'static str),
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Discarded(_) => "discarded",
        }
    }
}

#[async_trait]
pub trait Capturer: Send + Sync {
    type Object: kube::Resource + Clone + Send + Sync;
    type Fields: Send;

    /// Name used in logs and metric labels
    fn name(&self) -> &'static str;

    fn valid(&self, event: &WatchEvent<Self::Object>) -> bool;

    fn ready(&self, event: &WatchEvent<Self::Object>) -> bool;

    fn parse(&self, event: &WatchEvent<Self::Object>) -> Option<Self::Fields>;

    async fn operate(
        &self,
        event: &WatchEvent<Self::Object>,
        fields: Self::Fields,
    ) -> Result<Outcome, CaptureError>;
}

/// Treat a missing record as "nothing to do"
fn found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Run one notification through a capturer
///
/// Errors are logged and counted; the caller only sees them for testing.
pub async fn capture<C: Capturer + ?Sized>(
    capturer: &C,
    event: &WatchEvent<C::Object>,
    metrics: Option<&SharedMetrics>,
) -> Result<Outcome, CaptureError> {
    let result = run_steps(capturer, event).await;
    let label = match &result {
        Ok(outcome) => {
            debug!(
                capturer = capturer.name(),
                object = %event.name(),
                outcome = ?outcome,
                "Handled notification"
            );
            outcome.as_str()
        }
        Err(e) => {
            warn!(
                capturer = capturer.name(),
                object = %event.name(),
                error = %e,
                "Dropped notification"
            );
            "error"
        }
    };
    if let Some(metrics) = metrics {
        metrics.record_capture(capturer.name(), label);
    }
    result
}

async fn run_steps<C: Capturer + ?Sized>(
    capturer: &C,
    event: &WatchEvent<C::Object>,
) -> Result<Outcome, CaptureError> {
    if !capturer.valid(event) {
        return Ok(Outcome::Discarded("unmanaged"));
    }
    if !capturer.ready(event) {
        return Ok(Outcome::Discarded("not_ready"));
    }
    let Some(fields) = capturer.parse(event) else {
        return Ok(Outcome::Discarded("unparsed"));
    };
    capturer.operate(event, fields).await
}
