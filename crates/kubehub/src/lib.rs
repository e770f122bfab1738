//! Fleetcheck kubehub: uniform dispatch surface over cluster resource kinds.
//!
//! Every higher component goes through [`DispatchTable`] instead of branching
//! per kind. Bindings are either kube-rs backed ([`KubeBinding`]) or in-memory
//! ([`MemoryCluster`]) for tests.

#![forbid(unsafe_code)]

use std::sync::Arc;

use kube::Client;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use fleetcheck_core::{Document, FleetError, FleetResult, ResourceKind, ResourceRef};

pub mod kube_binding;
pub mod memory;
pub mod subscription;

pub use kube_binding::{map_kube_err, KubeBinding, KubeExec};
pub use memory::MemoryCluster;
pub use subscription::{CancelHandle, WatchSubscription};

/// Optional selectors applied to list and watch calls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchFilter {
    pub fields: Option<String>,
    pub labels: Option<String>,
}

impl WatchFilter {
    pub fn fields(f: impl Into<String>) -> Self { Self { fields: Some(f.into()), labels: None } }
    pub fn labels(l: impl Into<String>) -> Self { Self { fields: None, labels: Some(l.into()) } }
}

/// Capability set of one resource kind against the control plane.
#[async_trait::async_trait]
pub trait ClusterResource: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Whether `patch` applies in place. Kinds without it go through delete/recreate.
    fn supports_patch(&self) -> bool;

    async fn list(&self, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<Vec<Document>>;

    /// Fetch one object; absent objects are `FleetError::NotFound`.
    async fn get(&self, name: &str, namespace: Option<&str>) -> FleetResult<Document>;

    async fn create(&self, namespace: Option<&str>, body: &Document) -> FleetResult<Document>;

    async fn delete(&self, name: &str, namespace: Option<&str>) -> FleetResult<()>;

    /// Merge-patch in place. Only valid when `supports_patch()`.
    async fn patch(&self, name: &str, namespace: Option<&str>, body: &Document) -> FleetResult<Document>;

    /// Open a watch scoped like `list`.
    async fn watch(&self, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<WatchSubscription>;
}

/// Captured result of a command run inside a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool { self.exit_code == 0 }
}

#[async_trait::async_trait]
pub trait PodExec: Send + Sync {
    async fn exec(&self, name: &str, namespace: &str, command: &[String]) -> FleetResult<ExecOutput>;
}

/// Kind-keyed registry of bindings. Built once per cluster session; read-only afterwards.
#[derive(Clone, Default)]
pub struct DispatchTable {
    bindings: FxHashMap<ResourceKind, Arc<dyn ClusterResource>>,
}

impl DispatchTable {
    pub fn new() -> Self { Self::default() }

    /// Table with a kube-rs binding for every known kind.
    pub fn kube(client: Client) -> Self {
        let mut table = Self::new();
        for kind in ResourceKind::ALL {
            table.register(Arc::new(KubeBinding::new(client.clone(), kind)));
        }
        info!(kinds = table.bindings.len(), "dispatch table ready");
        table
    }

    pub fn register(&mut self, binding: Arc<dyn ClusterResource>) {
        self.bindings.insert(binding.kind(), binding);
    }

    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut out: Vec<_> = self.bindings.keys().copied().collect();
        out.sort();
        out
    }

    /// Lookup is lazy: a missing binding only fails here, at the call site.
    pub fn resource(&self, kind: ResourceKind) -> FleetResult<&Arc<dyn ClusterResource>> {
        self.bindings.get(&kind).ok_or_else(|| FleetError::UnsupportedKind(kind.to_string()))
    }

    pub fn supports_patch(&self, kind: ResourceKind) -> FleetResult<bool> {
        Ok(self.resource(kind)?.supports_patch())
    }

    pub async fn list(&self, kind: ResourceKind, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<Vec<Document>> {
        self.resource(kind)?.list(namespace, filter).await
    }

    pub async fn get(&self, target: &ResourceRef) -> FleetResult<Document> {
        let ns = target.scope()?;
        self.resource(target.kind)?.get(&target.name, ns).await
    }

    pub async fn create(&self, target: &ResourceRef, body: &Document) -> FleetResult<Document> {
        let ns = target.scope()?;
        self.resource(target.kind)?.create(ns, body).await
    }

    pub async fn delete(&self, target: &ResourceRef) -> FleetResult<()> {
        let ns = target.scope()?;
        self.resource(target.kind)?.delete(&target.name, ns).await
    }

    pub async fn patch(&self, target: &ResourceRef, body: &Document) -> FleetResult<Document> {
        let ns = target.scope()?;
        self.resource(target.kind)?.patch(&target.name, ns, body).await
    }

    pub async fn watch(&self, kind: ResourceKind, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<WatchSubscription> {
        self.resource(kind)?.watch(namespace, filter).await
    }
}

/// Client from the ambient kubeconfig / in-cluster environment.
pub async fn get_kube_client() -> FleetResult<Client> {
    Client::try_default().await.map_err(|e| FleetError::Api(format!("kube client: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binding_fails_at_call_site() {
        let cluster = MemoryCluster::new();
        let table = cluster.dispatch_table_for(&[ResourceKind::ConfigMap]);
        assert_eq!(table.kinds(), vec![ResourceKind::ConfigMap]);
        let err = table.get(&ResourceRef::namespaced(ResourceKind::Pod, "p", "ns")).await.unwrap_err();
        assert!(matches!(err, FleetError::UnsupportedKind(k) if k == "Pod"));
        assert!(table.supports_patch(ResourceKind::ConfigMap).unwrap());
    }

    #[tokio::test]
    async fn namespaced_kind_without_namespace_is_rejected() {
        let table = MemoryCluster::new().dispatch_table();
        let err = table.get(&ResourceRef::cluster(ResourceKind::ConfigMap, "cm")).await.unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
    }

    #[test]
    fn exec_output_success_tracks_exit_code() {
        assert!(ExecOutput { exit_code: 0, ..Default::default() }.success());
        assert!(!ExecOutput { exit_code: 2, ..Default::default() }.success());
    }
}
