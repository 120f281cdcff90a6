//! Endpoint capturer: live pod membership per workload
//!
//! Observational only. The registry holds one entry per live Endpoints
//! object and drops it when the object is deleted, so it never outgrows the
//! cluster.

use super::{CaptureError, Capturer, Change, Outcome, WatchEvent};
use crate::model::{Group, PhaseName};
use crate::naming::{self, WorkloadIdentity};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Endpoints;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Ready pod addresses behind one workload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Membership {
    pub namespace: String,
    pub workload: String,
    pub service: String,
    pub service_id: i64,
    pub phase: PhaseName,
    pub group: Group,
    /// Sorted, so snapshots compare deterministically
    pub ips: Vec<String>,
    pub resource_version: String,
}

#[derive(Default)]
pub struct EndpointRegistry {
    entries: RwLock<BTreeMap<(String, String), Membership>>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All memberships, ordered by namespace and workload name
    pub fn snapshot(&self) -> Vec<Membership> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, namespace: &str, workload: &str) -> Option<Membership> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(namespace.to_string(), workload.to_string()))
            .cloned()
    }

    /// Store a membership; returns false when this version was already recorded
    fn record(&self, membership: Membership) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let key = (membership.namespace.clone(), membership.workload.clone());
        if entries
            .get(&key)
            .is_some_and(|m| m.resource_version == membership.resource_version)
        {
            return false;
        }
        entries.insert(key, membership);
        true
    }

    fn remove(&self, namespace: &str, workload: &str) -> bool {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(namespace.to_string(), workload.to_string()))
            .is_some()
    }
}

/// Sorted IPs of ready addresses
pub fn ready_ips(endpoints: &Endpoints) -> Vec<String> {
    let mut ips: Vec<String> = endpoints
        .subsets
        .iter()
        .flatten()
        .flat_map(|subset| subset.addresses.iter().flatten())
        .map(|address| address.ip.clone())
        .collect();
    ips.sort();
    ips.dedup();
    ips
}

fn has_not_ready(endpoints: &Endpoints) -> bool {
    endpoints
        .subsets
        .iter()
        .flatten()
        .any(|subset| subset.not_ready_addresses.as_ref().is_some_and(|a| !a.is_empty()))
}

pub struct EndpointCapturer {
    registry: Arc<EndpointRegistry>,
}

impl EndpointCapturer {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl Capturer for EndpointCapturer {
    type Object = Endpoints;
    type Fields = WorkloadIdentity;

    fn name(&self) -> &'static str {
        "endpoint"
    }

    fn valid(&self, event: &WatchEvent<Endpoints>) -> bool {
        naming::identity_from_labels(event.labels()).is_some() || naming::is_managed(&event.name())
    }

    fn ready(&self, event: &WatchEvent<Endpoints>) -> bool {
        event.change == Change::Deleted || !has_not_ready(&event.object)
    }

    fn parse(&self, event: &WatchEvent<Endpoints>) -> Option<WorkloadIdentity> {
        naming::resolve(&event.name(), Some(event.labels()))
    }

    async fn operate(
        &self,
        event: &WatchEvent<Endpoints>,
        identity: WorkloadIdentity,
    ) -> Result<Outcome, CaptureError> {
        let namespace = event.namespace().unwrap_or_default();
        let workload = event.name();

        if event.change == Change::Deleted {
            return Ok(if self.registry.remove(&namespace, &workload) {
                Outcome::Applied
            } else {
                Outcome::Discarded("unknown")
            });
        }

        let ips = ready_ips(&event.object);
        debug!(workload = %workload, ips = ?ips, "Endpoint membership");
        let recorded = self.registry.record(Membership {
            namespace,
            workload,
            service: identity.service,
            service_id: identity.service_id,
            phase: identity.phase,
            group: identity.group,
            ips,
            resource_version: event.resource_version().unwrap_or_default(),
        });
        Ok(if recorded {
            Outcome::Applied
        } else {
            Outcome::Discarded("duplicate")
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::capture::capture;
    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointSubset};
    use kube::api::ObjectMeta;

    fn address(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn endpoints(name: &str, version: &str, ready: &[&str], not_ready: &[&str]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("shop".to_string()),
                resource_version: Some(version.to_string()),
                ..Default::default()
            },
            subsets: Some(vec![EndpointSubset {
                addresses: Some(ready.iter().map(|ip| address(ip)).collect()),
                not_ready_addresses: Some(not_ready.iter().map(|ip| address(ip)).collect()),
                ..Default::default()
            }]),
        }
    }

    fn updated(endpoints: Endpoints) -> WatchEvent<Endpoints> {
        WatchEvent::new(Change::Updated, endpoints)
    }

    #[tokio::test]
    async fn test_membership_is_sorted() {
        let registry = Arc::new(EndpointRegistry::new());
        let capturer = EndpointCapturer::new(registry.clone());

        let event = updated(endpoints(
            "checkout-42-online-green",
            "10",
            &["10.0.0.9", "10.0.0.10", "10.0.0.2"],
            &[],
        ));
        assert_eq!(
            capture(&capturer, &event, None).await.unwrap(),
            Outcome::Applied
        );

        let membership = registry.get("shop", "checkout-42-online-green").unwrap();
        assert_eq!(membership.ips, vec!["10.0.0.10", "10.0.0.2", "10.0.0.9"]);
        assert_eq!(membership.service_id, 42);
        assert_eq!(membership.group, Group::Green);
        assert_eq!(membership.phase, PhaseName::Online);
    }

    #[tokio::test]
    async fn test_not_ready_addresses_hold_back_update() {
        let registry = Arc::new(EndpointRegistry::new());
        let capturer = EndpointCapturer::new(registry.clone());

        let event = updated(endpoints(
            "checkout-42-online-green",
            "10",
            &["10.0.0.1"],
            &["10.0.0.2"],
        ));
        assert_eq!(
            capture(&capturer, &event, None).await.unwrap(),
            Outcome::Discarded("not_ready")
        );
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_same_version_is_duplicate_and_delete_evicts() {
        let registry = Arc::new(EndpointRegistry::new());
        let capturer = EndpointCapturer::new(registry.clone());
        let object = endpoints("checkout-42-online-green", "10", &["10.0.0.1"], &[]);

        capture(&capturer, &updated(object.clone()), None)
            .await
            .unwrap();
        assert_eq!(
            capture(&capturer, &updated(object.clone()), None)
                .await
                .unwrap(),
            Outcome::Discarded("duplicate")
        );

        let deleted = WatchEvent::new(Change::Deleted, object);
        assert_eq!(
            capture(&capturer, &deleted, None).await.unwrap(),
            Outcome::Applied
        );
        assert!(registry.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_unmanaged_endpoints_ignored() {
        let registry = Arc::new(EndpointRegistry::new());
        let capturer = EndpointCapturer::new(registry.clone());

        let event = updated(endpoints("kubernetes", "1", &["10.96.0.1"], &[]));
        assert_eq!(
            capture(&capturer, &event, None).await.unwrap(),
            Outcome::Discarded("unmanaged")
        );
    }
}
