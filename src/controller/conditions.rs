//! Condition management helpers following Kubernetes API conventions

use chrono::{DateTime, Utc};

use crate::crd::Condition;

/// Condition types written by the simulator controllers
pub const CONDITION_TYPE_ERROR: &str = "Error";
pub const CONDITION_TYPE_PROVISIONED: &str = "Provisioned";
pub const CONDITION_TYPE_KUBECONFIG_READY: &str = "KubeconfigReady";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

pub const REASON_CREATION_ERROR: &str = "CreationError";
pub const REASON_CONFIGURATION_ERROR: &str = "ConfigurationError";
pub const REASON_SHOOT_ERROR: &str = "ShootError";
pub const REASON_NO_RUNTIME_ID_LABEL: &str = "NoRuntimeIdLabel";
pub const REASON_CLUSTER_CLIENT_CREATION_ERROR: &str = "ClusterClientCreationError";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips, and is taken from
/// `now` so callers can stamp it with their injected clock.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
    now: DateTime<Utc>,
) {
    let now = now.to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = observed_generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation,
        });
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Compare two condition lists ignoring transition times
pub fn same_conditions(a: &[Condition], b: &[Condition]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| {
            x.type_ == y.type_
                && x.status == y.status
                && x.reason == y.reason
                && x.message == y.message
        })
}

/// Create an Error=True condition that transitioned at `now`
pub fn error_condition(reason: &str, message: &str, now: DateTime<Utc>) -> Condition {
    Condition {
        type_: CONDITION_TYPE_ERROR.to_string(),
        status: CONDITION_STATUS_TRUE.to_string(),
        last_transition_time: now.to_rfc3339(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation: None,
    }
}
