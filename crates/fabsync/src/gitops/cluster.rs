//! Running cluster holding the actual state.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use super::resource::{ResourceIdentity, ResourceKind, SpecDocument};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    #[error("Cluster request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Cluster object not found: {0}")]
    NotFound(String),

    #[error("Cluster rejected {object}: {reason}")]
    Rejected { object: String, reason: String },
}

impl ClusterError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClusterError::Unreachable(_) | ClusterError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

/// An object as the cluster reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterObject {
    pub kind: ResourceKind,
    pub namespace: String,
    pub name: String,
    pub spec: SpecDocument,
    #[serde(default)]
    pub status: Option<Value>,
}

impl ClusterObject {
    pub fn new(identity: &ResourceIdentity, spec: SpecDocument) -> Self {
        Self {
            kind: identity.kind,
            namespace: identity.namespace.clone(),
            name: identity.name.clone(),
            spec,
            status: None,
        }
    }

    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(self.kind, self.namespace.clone(), self.name.clone())
    }
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Name used in logs and connectivity alerts.
    fn name(&self) -> &str {
        "cluster"
    }

    async fn list(&self, kind: ResourceKind, namespace: &str) -> Result<Vec<ClusterObject>>;

    /// Creates or replaces `object`, returning the status the cluster reports.
    async fn apply(&self, object: &ClusterObject) -> Result<Option<Value>>;

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;
}

/// In-process cluster used for dry runs and tests.
///
/// Supports injecting connectivity failures, per-object apply failures and
/// a fixed apply latency.
#[derive(Default)]
pub struct InMemoryCluster {
    objects: Mutex<BTreeMap<ResourceIdentity, ClusterObject>>,
    failing_applies: Mutex<HashSet<String>>,
    apply_delay: Mutex<Option<Duration>>,
    unreachable_calls: AtomicU32,
    list_calls: AtomicUsize,
    apply_calls: AtomicUsize,
    generation: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> std::sync::MutexGuard<'_, BTreeMap<ResourceIdentity, ClusterObject>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Places an object directly, bypassing `apply`.
    pub fn insert(&self, object: ClusterObject) {
        self.objects().insert(object.identity(), object);
    }

    pub fn remove(&self, identity: &ResourceIdentity) -> Option<ClusterObject> {
        self.objects().remove(identity)
    }

    pub fn get(&self, identity: &ResourceIdentity) -> Option<ClusterObject> {
        self.objects().get(identity).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    /// The next `count` calls fail with [`ClusterError::Unreachable`].
    pub fn fail_next_calls(&self, count: u32) {
        self.unreachable_calls.store(count, Ordering::SeqCst);
    }

    /// Applies to an object with this name are rejected.
    pub fn fail_applies_for(&self, name: &str) {
        self.failing_applies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.to_string());
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        *self
            .apply_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(delay);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<()> {
        let injected = self
            .unreachable_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(ClusterError::Unreachable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn list(&self, kind: ResourceKind, namespace: &str) -> Result<Vec<ClusterObject>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self
            .objects()
            .values()
            .filter(|o| o.kind == kind && o.namespace == namespace)
            .cloned()
            .collect())
    }

    async fn apply(&self, object: &ClusterObject) -> Result<Option<Value>> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self
            .apply_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_reachable()?;

        let rejected = self
            .failing_applies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&object.name);
        if rejected {
            return Err(ClusterError::Rejected {
                object: object.identity().to_string(),
                reason: "admission denied".to_string(),
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let status = json!({ "ready": true, "observedGeneration": generation });
        let mut stored = object.clone();
        stored.status = Some(status.clone());
        self.objects().insert(stored.identity(), stored);
        Ok(Some(status))
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        self.check_reachable()?;
        let identity = ResourceIdentity::new(kind, namespace, name);
        self.objects()
            .remove(&identity)
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(identity.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(name: &str) -> ClusterObject {
        ClusterObject::new(
            &ResourceIdentity::new(ResourceKind::Vpc, "default", name),
            SpecDocument::new().with("vlan", 10),
        )
    }

    #[tokio::test]
    async fn test_apply_then_list() {
        let cluster = InMemoryCluster::new();
        let status = cluster.apply(&object("vpc-1")).await.unwrap();
        assert_eq!(status.unwrap()["ready"], true);

        let listed = cluster.list(ResourceKind::Vpc, "default").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(cluster
            .list(ResourceKind::Switch, "default")
            .await
            .unwrap()
            .is_empty());
        assert!(cluster.list(ResourceKind::Vpc, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_injected_unreachable_is_retryable() {
        let cluster = InMemoryCluster::new();
        cluster.fail_next_calls(2);
        assert!(cluster.list(ResourceKind::Vpc, "default").await.unwrap_err().is_retryable());
        assert!(cluster.list(ResourceKind::Vpc, "default").await.is_err());
        assert!(cluster.list(ResourceKind::Vpc, "default").await.is_ok());
        assert_eq!(cluster.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_rejected_apply() {
        let cluster = InMemoryCluster::new();
        cluster.fail_applies_for("bad");
        let err = cluster.apply(&object("bad")).await.unwrap_err();
        assert!(matches!(err, ClusterError::Rejected { .. }));
        assert!(!err.is_retryable());
        assert!(cluster.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let cluster = InMemoryCluster::new();
        cluster.insert(object("vpc-1"));
        cluster.delete(ResourceKind::Vpc, "default", "vpc-1").await.unwrap();
        let err = cluster
            .delete(ResourceKind::Vpc, "default", "vpc-1")
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }
}
