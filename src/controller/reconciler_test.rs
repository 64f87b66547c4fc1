//! Tests for the kube-runtime wiring
//!
//! The controller loops need a cluster, so these cover the pieces that do
//! not: backoff selection, outcome mapping and dependent-to-Runtime mapping.

#[cfg(test)]
mod tests {
    use super::super::reconciler::*;
    use super::super::ReconcileOutcome;
    use crate::error::Error;
    use kube::runtime::controller::Action;
    use std::time::Duration;

    #[test]
    fn test_retriable_errors_retry_quickly() {
        let err = Error::CredentialError("garden unreachable".into());
        assert!(err.is_retriable());
        assert_eq!(retry_after(&err), Duration::from_secs(15));
    }

    #[test]
    fn test_non_retriable_errors_back_off() {
        let err = Error::ConfigError("bad namespace".into());
        assert!(!err.is_retriable());
        assert_eq!(retry_after(&err), Duration::from_secs(60));
    }

    #[test]
    fn test_outcome_maps_to_action() {
        assert_eq!(Action::from(ReconcileOutcome::Done), Action::await_change());
        assert_eq!(
            Action::from(ReconcileOutcome::RequeueAfter(Duration::from_secs(5))),
            Action::requeue(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_dependents_map_to_runtime_of_same_name() {
        let obj_ref = runtime_ref("kcp-system", "rt-1");
        assert_eq!(obj_ref.name, "rt-1");
        assert_eq!(obj_ref.namespace.as_deref(), Some("kcp-system"));
    }
}
