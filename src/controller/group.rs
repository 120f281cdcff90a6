//! Blue/green group selection
//!
//! Pure functions only. Callers persist the chosen groups on the service.

use crate::model::{Group, GroupAssignment, PhaseName, PipelineStatus, Service};
use crate::naming;

/// The other blue/green slot
pub fn complement(group: Group) -> Group {
    match group {
        Group::Blue => Group::Green,
        Group::Green => Group::Blue,
    }
}

/// Group the next rollout targets
///
/// A service that was never deployed has no online group; its first rollout
/// goes to `blue`.
pub fn deploy_group_for(online: Option<Group>) -> Group {
    online.map(complement).unwrap_or(Group::Blue)
}

pub fn workload_name(service: &str, service_id: i64, phase: PhaseName, group: Group) -> String {
    naming::encode(service, service_id, phase, group)
}

/// Groups a rollback operates on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollbackPair {
    /// Group holding the bad release; scaled to zero
    pub destroy: Group,
    /// Group restored to its replica count
    pub rollback: Group,
}

/// Select the destroy/rollback groups for a pipeline
///
/// A pipeline that already reached `Success` has cut over, so the bad release
/// is the online group. Otherwise the bad release is the group being stood up.
/// Returns `None` when the relevant group was never assigned.
pub fn rollback_pair(status: PipelineStatus, service: &Service) -> Option<RollbackPair> {
    let destroy = if status == PipelineStatus::Success {
        service.online_group?
    } else {
        service.deploy_group?
    };
    Some(RollbackPair {
        destroy,
        rollback: complement(destroy),
    })
}

/// Assignment after a rollout finishes: the deployed group goes online
pub fn after_finish(deploy_group: Group) -> GroupAssignment {
    GroupAssignment {
        online: Some(deploy_group),
        deploy: Some(complement(deploy_group)),
    }
}

/// Assignment after a rollback completes
///
/// With no previous online group there is nothing serving to fall back to, so
/// the service stays offline with the destroyed group as the next target.
pub fn after_rollback(pair: RollbackPair, previous_online: Option<Group>) -> GroupAssignment {
    match previous_online {
        Some(_) => GroupAssignment {
            online: Some(pair.rollback),
            deploy: Some(pair.destroy),
        },
        None => GroupAssignment {
            online: None,
            deploy: Some(pair.destroy),
        },
    }
}
