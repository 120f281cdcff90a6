//! Workload naming scheme
//!
//! Every workload ferry publishes is named `{service}-{serviceID}-{phase}-{group}`
//! and CronJobs are named `{service}-cronjob-{serviceID}-{task}`. The numeric id
//! segment is the anchor: decoding splits on the **first** hyphen-delimited run
//! of digits, so service names must never contain such a segment themselves
//! (see [`is_valid_service_name`]).
//!
//! Published objects also carry the identity as labels (see [`identity_labels`]);
//! name decoding is the fallback for objects without them.

use crate::model::{Group, PhaseName};
use std::collections::BTreeMap;
use std::sync::LazyLock;

pub const LABEL_SERVICE: &str = "ferry.io/service";
pub const LABEL_SERVICE_ID: &str = "ferry.io/service-id";
pub const LABEL_PHASE: &str = "ferry.io/phase";
pub const LABEL_GROUP: &str = "ferry.io/group";
pub const LABEL_TASK: &str = "ferry.io/task";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "ferry";

/// Overall shape every managed name must have before it is split
static MANAGED_SHAPE: LazyLock<regex::Regex> = LazyLock::new(|| compile(r"^[\w-]+-\d+-[\w-]+$"));

static WORKLOAD: LazyLock<regex::Regex> =
    LazyLock::new(|| compile(r"^(?P<service>[\w-]+?)-(?P<id>\d+)-(?P<rest>[\w-]+)$"));

/// Event subjects: deployments, their ReplicaSets and pods (extra suffixes allowed)
static SUBJECT: LazyLock<regex::Regex> = LazyLock::new(|| {
    compile(
        r"^(?P<service>[\w-]+?)-(?P<id>\d+)-(?P<phase>sandbox|online)-(?P<group>blue|green)(?:-[\w-]+)?$",
    )
});

static CRON_JOB: LazyLock<regex::Regex> = LazyLock::new(|| {
    compile(r"^(?P<service>[\w-]+?)-cronjob-(?P<id>\d+)-(?P<task>[\w-]+?)(?:-\d+)?$")
});

#[allow(clippy::expect_used)] // Patterns are constants; failure is a programming error
fn compile(pattern: &str) -> regex::Regex {
    regex::Regex::new(pattern).expect("naming pattern must compile")
}

/// Identity of a phase workload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkloadIdentity {
    pub service: String,
    pub service_id: i64,
    pub phase: PhaseName,
    pub group: Group,
}

impl WorkloadIdentity {
    pub fn new(service: impl Into<String>, service_id: i64, phase: PhaseName, group: Group) -> Self {
        Self {
            service: service.into(),
            service_id,
            phase,
            group,
        }
    }

    pub fn name(&self) -> String {
        encode(&self.service, self.service_id, self.phase, self.group)
    }

    /// Same workload in the other blue/green slot
    pub fn with_group(&self, group: Group) -> Self {
        Self {
            group,
            ..self.clone()
        }
    }
}

/// Identity of a scheduled batch workload
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CronIdentity {
    pub service: String,
    pub service_id: i64,
    pub task: String,
}

pub fn encode(service: &str, service_id: i64, phase: PhaseName, group: Group) -> String {
    format!("{}-{}-{}-{}", service, service_id, phase, group)
}

pub fn encode_cron_job(service: &str, service_id: i64, task: &str) -> String {
    format!("{}-cronjob-{}-{}", service, service_id, task)
}

/// Whether a resource name has the managed workload shape
pub fn is_managed(name: &str) -> bool {
    MANAGED_SHAPE.is_match(name)
}

/// Decode a workload name back into its identity
///
/// Returns `None` for names outside the managed shape, ids that overflow, and
/// unknown phase or group segments.
pub fn decode(name: &str) -> Option<WorkloadIdentity> {
    if !is_managed(name) {
        return None;
    }
    let caps = WORKLOAD.captures(name)?;
    let service_id = caps["id"].parse::<i64>().ok()?;
    let (phase, group) = caps["rest"].rsplit_once('-')?;

    Some(WorkloadIdentity {
        service: caps["service"].to_string(),
        service_id,
        phase: phase.parse().ok()?,
        group: group.parse().ok()?,
    })
}

/// Decode the subject of a cluster event (deployment, ReplicaSet or pod name)
///
/// Only the `sandbox` and `online` phases produce log-worthy subjects.
pub fn decode_subject(name: &str) -> Option<WorkloadIdentity> {
    let caps = SUBJECT.captures(name)?;
    Some(WorkloadIdentity {
        service: caps["service"].to_string(),
        service_id: caps["id"].parse().ok()?,
        phase: caps["phase"].parse().ok()?,
        group: caps["group"].parse().ok()?,
    })
}

/// Decode a CronJob name, or the name of a Job it spawned
pub fn decode_cron_job(name: &str) -> Option<CronIdentity> {
    let caps = CRON_JOB.captures(name)?;
    Some(CronIdentity {
        service: caps["service"].to_string(),
        service_id: caps["id"].parse().ok()?,
        task: caps["task"].to_string(),
    })
}

/// Service names must be non-empty and free of purely numeric segments
pub fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.split('-').all(|segment| {
            !segment.is_empty() && !segment.chars().all(|c| c.is_ascii_digit())
        })
}

/// Labels carrying the identity on published objects
pub fn identity_labels(identity: &WorkloadIdentity) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_SERVICE.to_string(), identity.service.clone()),
        (LABEL_SERVICE_ID.to_string(), identity.service_id.to_string()),
        (LABEL_PHASE.to_string(), identity.phase.to_string()),
        (LABEL_GROUP.to_string(), identity.group.to_string()),
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
    ])
}

/// Read the identity from labels; all four identity labels must be present and valid
pub fn identity_from_labels(labels: &BTreeMap<String, String>) -> Option<WorkloadIdentity> {
    Some(WorkloadIdentity {
        service: labels.get(LABEL_SERVICE)?.clone(),
        service_id: labels.get(LABEL_SERVICE_ID)?.parse().ok()?,
        phase: labels.get(LABEL_PHASE)?.parse().ok()?,
        group: labels.get(LABEL_GROUP)?.parse().ok()?,
    })
}

/// Resolve the identity of an object from its labels, falling back to its name
pub fn resolve(name: &str, labels: Option<&BTreeMap<String, String>>) -> Option<WorkloadIdentity> {
    labels
        .and_then(identity_from_labels)
        .or_else(|| decode(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_workload_name() {
        assert_eq!(
            encode("checkout", 42, PhaseName::Sandbox, Group::Green),
            "checkout-42-sandbox-green"
        );
    }

    #[test]
    fn test_decode_roundtrip() {
        let cases = [
            ("checkout", 42, PhaseName::Sandbox, Group::Green),
            ("order-api", 0, PhaseName::Online, Group::Blue),
            ("a1-b2", 9_000_000_001, PhaseName::Online, Group::Green),
            ("user_profile", 7, PhaseName::Sandbox, Group::Blue),
        ];

        for (service, id, phase, group) in cases {
            let name = encode(service, id, phase, group);
            let identity = decode(&name).unwrap_or_else(|| panic!("{} should decode", name));
            assert_eq!(identity, WorkloadIdentity::new(service, id, phase, group));
        }
    }

    #[test]
    fn test_decode_rejects_unrelated_resources() {
        for name in [
            "coredns",
            "kube-proxy",
            "metrics-server-v1",
            "checkout-42",
            "checkout-42-canary-green",
            "checkout-42-sandbox-purple",
            "checkout-99999999999999999999-online-blue",
            "",
        ] {
            assert_eq!(decode(name), None, "{} should not decode", name);
        }
    }

    #[test]
    fn test_decode_splits_on_first_numeric_segment() {
        // The documented limitation: a numeric segment in the service name wins
        let identity = decode("web-2-api-7-online-blue");
        assert_eq!(identity, None, "rest 'api-7-online' is not a phase");

        let identity = decode("web-2-online-blue");
        assert_eq!(
            identity.map(|i| (i.service, i.service_id)),
            Some(("web".to_string(), 2))
        );
    }

    #[test]
    fn test_is_managed_shape() {
        assert!(is_managed("checkout-42-sandbox-green"));
        assert!(!is_managed("checkout"));
        assert!(!is_managed("42-sandbox"));
    }

    #[test]
    fn test_decode_subject_accepts_pod_names() {
        let identity = decode_subject("checkout-42-online-blue-5d9c7b8f4-x2kqz");
        assert_eq!(
            identity,
            Some(WorkloadIdentity::new(
                "checkout",
                42,
                PhaseName::Online,
                Group::Blue
            ))
        );
    }

    #[test]
    fn test_decode_subject_restricted_to_workload_phases() {
        assert_eq!(decode_subject("checkout-42-image-blue"), None);
        assert_eq!(decode_subject("checkout-42-finish-green-abc"), None);
        assert!(decode_subject("checkout-42-sandbox-green").is_some());
    }

    #[test]
    fn test_decode_cron_job_and_spawned_job() {
        let expected = CronIdentity {
            service: "billing".to_string(),
            service_id: 12,
            task: "invoice-sweep".to_string(),
        };
        let cron_name = encode_cron_job("billing", 12, "invoice-sweep");
        assert_eq!(cron_name, "billing-cronjob-12-invoice-sweep");
        assert_eq!(decode_cron_job(&cron_name), Some(expected.clone()));
        assert_eq!(
            decode_cron_job("billing-cronjob-12-invoice-sweep-28391234"),
            Some(expected)
        );
        assert_eq!(decode_cron_job("billing-12-online-blue"), None);
    }

    #[test]
    fn test_service_name_validation() {
        assert!(is_valid_service_name("checkout"));
        assert!(is_valid_service_name("order-api-v2"));
        assert!(!is_valid_service_name("web-2-api"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("trailing-"));
    }

    #[test]
    fn test_labels_take_precedence_over_name() {
        let identity = WorkloadIdentity::new("checkout", 42, PhaseName::Online, Group::Blue);
        let labels = identity_labels(&identity);

        assert_eq!(identity_from_labels(&labels), Some(identity.clone()));
        // Name disagrees with labels; labels win
        assert_eq!(
            resolve("renamed-object", Some(&labels)),
            Some(identity.clone())
        );
        // No labels: fall back to the name
        assert_eq!(resolve(&identity.name(), None), Some(identity));
    }

    #[test]
    fn test_partial_labels_fall_back_to_name() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_SERVICE.to_string(), "checkout".to_string());

        let resolved = resolve("checkout-42-sandbox-green", Some(&labels));
        assert_eq!(resolved.map(|i| i.group), Some(Group::Green));
    }
}
