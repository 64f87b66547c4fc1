//! Finalizer handling for the simulator resources
//!
//! Finalizers are edited on the in-memory object and persisted with a plain
//! update, so the same helpers serve every kind and both store backends.

use kube::{Resource, ResourceExt};
use tracing::info;

use crate::error::Result;
use crate::store::{Object, Store};

/// Add `finalizer` to the object if not present
///
/// Returns `true` when the object had to be updated.
pub async fn add_finalizer<K: Object>(store: &Store, obj: &mut K, finalizer: &str) -> Result<bool> {
    if has_finalizer(obj, finalizer) {
        return Ok(false);
    }
    obj.finalizers_mut().push(finalizer.to_string());
    *obj = store.update(obj).await?;
    info!("Added finalizer {} to {} {}", finalizer, K::kind(&()), obj.name_any());
    Ok(true)
}

/// Remove `finalizer` once cleanup is complete
///
/// With no finalizers left the API server completes the deletion.
pub async fn remove_finalizer<K: Object>(store: &Store, obj: &mut K, finalizer: &str) -> Result<bool> {
    if !has_finalizer(obj, finalizer) {
        return Ok(false);
    }
    obj.finalizers_mut().retain(|f| f != finalizer);
    let name = obj.name_any();
    *obj = store.update(obj).await?;
    info!("Removed finalizer {} from {} {}", finalizer, K::kind(&()), name);
    Ok(true)
}

/// A deletion timestamp means deletion was requested and finalizers hold it
pub fn is_being_deleted<K: Resource>(obj: &K) -> bool {
    obj.meta().deletion_timestamp.is_some()
}

pub fn has_finalizer<K: Resource>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::crd::{Kyma, KymaSpec, DELETION_HOOK_FINALIZER};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_add_then_remove_finalizer() {
        let memory = Arc::new(MemoryStore::kcp(Arc::new(ManualClock::default())));
        let store = Store::new(memory.clone());
        let mut kyma = Kyma::new("rt-1", KymaSpec::default());
        kyma.metadata.namespace = Some("kcp-system".to_string());
        let mut kyma = store.create(&kyma).await.unwrap();

        assert!(add_finalizer(&store, &mut kyma, DELETION_HOOK_FINALIZER)
            .await
            .unwrap());
        assert!(!add_finalizer(&store, &mut kyma, DELETION_HOOK_FINALIZER)
            .await
            .unwrap());
        assert!(has_finalizer(&kyma, DELETION_HOOK_FINALIZER));

        store.delete::<Kyma>(Some("kcp-system"), "rt-1").await.unwrap();
        let mut kyma: Kyma = store.get(Some("kcp-system"), "rt-1").await.unwrap().unwrap();
        assert!(is_being_deleted(&kyma));

        assert!(remove_finalizer(&store, &mut kyma, DELETION_HOOK_FINALIZER)
            .await
            .unwrap());
        assert_eq!(memory.count::<Kyma>(), 0);
    }
}
