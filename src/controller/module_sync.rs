//! Module list synchronization between the tenant and control-plane Kyma
//!
//! The tenant `spec.modules` is the source of truth. Tenant status,
//! control-plane spec and control-plane status are each diffed against it
//! by name and brought in line. The tenant spec itself is never written.

use std::collections::HashSet;

use crate::crd::{Kyma, KymaSpec, KymaState, KymaStatus, Module, ModuleStatus};

/// Which parts of one Kyma were modified by a sync pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectChange {
    pub spec_changed: bool,
    pub status_changed: bool,
}

impl ObjectChange {
    pub fn any(&self) -> bool {
        self.spec_changed || self.status_changed
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub tenant: ObjectChange,
    pub control_plane: ObjectChange,
    desired: Vec<String>,
    removed: Vec<String>,
}

impl SyncOutcome {
    /// Names removed from any list during this pass
    pub fn removed(&self) -> &[String] {
        &self.removed
    }

    pub fn is_removed(&self, name: &str) -> bool {
        self.removed.iter().any(|n| n == name)
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.desired.iter().any(|n| n == name) && !self.is_removed(name)
    }

    pub fn any_changed(&self) -> bool {
        self.tenant.any() || self.control_plane.any()
    }
}

fn dedup<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .into_iter()
        .filter(|n| seen.insert(*n))
        .map(str::to_string)
        .collect()
}

/// Names to add to and remove from `current` so it equals `desired` as a set
fn set_diff(current: &[String], desired: &[String]) -> (Vec<String>, Vec<String>) {
    let to_add = desired
        .iter()
        .filter(|n| !current.contains(n))
        .cloned()
        .collect();
    let to_remove = current
        .iter()
        .filter(|n| !desired.contains(n))
        .cloned()
        .collect();
    (to_add, to_remove)
}

/// Channel to record for a newly added module
fn channel_for(spec: &KymaSpec, name: &str) -> Option<String> {
    spec.modules
        .iter()
        .find(|m| m.name == name)
        .and_then(|m| m.channel.clone())
        .or_else(|| (!spec.channel.is_empty()).then(|| spec.channel.clone()))
}

fn sync_status(
    status: &mut Option<KymaStatus>,
    desired: &[String],
    spec: &KymaSpec,
    removed: &mut Vec<String>,
) -> bool {
    let current = dedup(
        status
            .iter()
            .flat_map(|s| s.modules.iter().map(|m| m.name.as_str())),
    );
    let (to_add, to_remove) = set_diff(&current, desired);
    if to_add.is_empty() && to_remove.is_empty() {
        return false;
    }
    let status = status.get_or_insert_with(KymaStatus::default);
    status.modules.retain(|m| !to_remove.contains(&m.name));
    status
        .modules
        .extend(to_add.iter().map(|name| ModuleStatus {
            name: name.clone(),
            channel: channel_for(spec, name),
            state: KymaState::Ready,
        }));
    removed.extend(to_remove);
    true
}

/// Bring the tenant status and both control-plane lists in line with the
/// tenant spec
pub fn sync(tenant: &mut Kyma, control_plane: &mut Kyma) -> SyncOutcome {
    let desired = dedup(tenant.spec.modules.iter().map(|m| m.name.as_str()));
    let mut removed = Vec::new();
    let mut outcome = SyncOutcome::default();

    outcome.tenant.status_changed =
        sync_status(&mut tenant.status, &desired, &tenant.spec, &mut removed);

    let current = dedup(control_plane.spec.modules.iter().map(|m| m.name.as_str()));
    let (to_add, to_remove) = set_diff(&current, &desired);
    if !to_add.is_empty() || !to_remove.is_empty() {
        let modules = &mut control_plane.spec.modules;
        modules.retain(|m| !to_remove.contains(&m.name));
        modules.extend(to_add.iter().map(|name| Module {
            name: name.clone(),
            channel: channel_for(&tenant.spec, name),
        }));
        removed.extend(to_remove);
        outcome.control_plane.spec_changed = true;
    }

    outcome.control_plane.status_changed =
        sync_status(&mut control_plane.status, &desired, &tenant.spec, &mut removed);

    outcome.removed = dedup(removed.iter().map(String::as_str));
    outcome.desired = desired;
    outcome
}
