//! kube-rs backed bindings: one `KubeBinding` per resource kind, all going
//! through `DynamicObject` so the dispatch surface stays uniform.

use futures::StreamExt;
use k8s_openapi::api::{
    apps::v1::DaemonSet,
    coordination::v1::Lease,
    core::v1::{ConfigMap, Pod, ServiceAccount},
    rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
};
use kube::{
    api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject, WatchEvent as KubeWatchEvent},
    Client,
};
use metrics::counter;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use fleetcheck_core::{Document, EventType, FleetError, FleetResult, ResourceKind, WatchEvent};

use crate::{ClusterResource, ExecOutput, PodExec, WatchFilter, WatchSubscription};

pub fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
        ResourceKind::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
        ResourceKind::ServiceAccount => ApiResource::erase::<ServiceAccount>(&()),
        ResourceKind::DaemonSet => ApiResource::erase::<DaemonSet>(&()),
        ResourceKind::Role => ApiResource::erase::<Role>(&()),
        ResourceKind::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
        ResourceKind::ClusterRole => ApiResource::erase::<ClusterRole>(&()),
        ResourceKind::ClusterRoleBinding => ApiResource::erase::<ClusterRoleBinding>(&()),
        ResourceKind::Lease => ApiResource::erase::<Lease>(&()),
    }
}

/// 404 becomes `NotFound`, everything else is an opaque API failure.
pub fn map_kube_err(e: kube::Error, what: &str) -> FleetError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => FleetError::NotFound(what.to_string()),
        other => FleetError::Api(format!("{}: {}", what, other)),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn to_document(obj: &DynamicObject) -> FleetResult<Document> {
    let mut raw = serde_json::to_value(obj)?;
    strip_managed_fields(&mut raw);
    Ok(Document::from(raw))
}

fn list_params(filter: &WatchFilter) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(f) = filter.fields.as_deref() { lp = lp.fields(f); }
    if let Some(l) = filter.labels.as_deref() { lp = lp.labels(l); }
    lp
}

fn watch_params(filter: &WatchFilter) -> WatchParams {
    let mut wp = WatchParams::default();
    if let Some(f) = filter.fields.as_deref() { wp = wp.fields(f); }
    if let Some(l) = filter.labels.as_deref() { wp = wp.labels(l); }
    wp
}

pub struct KubeBinding {
    client: Client,
    kind: ResourceKind,
    ar: ApiResource,
}

impl KubeBinding {
    pub fn new(client: Client, kind: ResourceKind) -> Self {
        Self { client, kind, ar: api_resource(kind) }
    }

    fn api(&self, namespace: Option<&str>) -> FleetResult<Api<DynamicObject>> {
        if !self.kind.namespaced() {
            return Ok(Api::all_with(self.client.clone(), &self.ar));
        }
        match namespace {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &self.ar)),
            None => Err(FleetError::Validation(format!("namespace required for namespaced kind {}", self.kind))),
        }
    }

    /// Listing across all namespaces is allowed when no namespace is given.
    fn list_api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.kind.namespaced() => Api::namespaced_with(self.client.clone(), ns, &self.ar),
            _ => Api::all_with(self.client.clone(), &self.ar),
        }
    }

    fn what(&self, name: &str, namespace: Option<&str>) -> String {
        match namespace {
            Some(ns) => format!("{}/{}/{}", self.kind, ns, name),
            None => format!("{}/{}", self.kind, name),
        }
    }
}

#[async_trait::async_trait]
impl ClusterResource for KubeBinding {
    fn kind(&self) -> ResourceKind { self.kind }

    fn supports_patch(&self) -> bool { self.kind.supports_patch() }

    async fn list(&self, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<Vec<Document>> {
        let api = self.list_api(namespace);
        let list = api.list(&list_params(filter)).await.map_err(|e| map_kube_err(e, self.kind.as_str()))?;
        list.items.iter().map(to_document).collect()
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> FleetResult<Document> {
        let what = self.what(name, namespace);
        let api = self.api(namespace)?;
        match api.get_opt(name).await.map_err(|e| map_kube_err(e, &what))? {
            Some(obj) => to_document(&obj),
            None => Err(FleetError::NotFound(what)),
        }
    }

    async fn create(&self, namespace: Option<&str>, body: &Document) -> FleetResult<Document> {
        let api = self.api(namespace)?;
        let obj: DynamicObject = serde_json::from_value(body.to_json())?;
        let what = self.what(obj.metadata.name.as_deref().unwrap_or("<unnamed>"), namespace);
        let created = api.create(&PostParams::default(), &obj).await.map_err(|e| map_kube_err(e, &what))?;
        counter!("cluster_create_total", 1u64);
        info!(target_ref = %what, "created");
        to_document(&created)
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> FleetResult<()> {
        let what = self.what(name, namespace);
        let api = self.api(namespace)?;
        api.delete(name, &DeleteParams::default()).await.map_err(|e| map_kube_err(e, &what))?;
        counter!("cluster_delete_total", 1u64);
        info!(target_ref = %what, "delete issued");
        Ok(())
    }

    async fn patch(&self, name: &str, namespace: Option<&str>, body: &Document) -> FleetResult<Document> {
        let what = self.what(name, namespace);
        if !self.supports_patch() {
            return Err(FleetError::Validation(format!("{} has no native patch", what)));
        }
        let api = self.api(namespace)?;
        let payload = body.to_json();
        let patched = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .map_err(|e| map_kube_err(e, &what))?;
        counter!("cluster_patch_total", 1u64);
        to_document(&patched)
    }

    async fn watch(&self, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<WatchSubscription> {
        let api = self.list_api(namespace);
        let ctx = format!("{}@{}", self.kind, namespace.unwrap_or("*"));
        let stream = api.watch(&watch_params(filter), "0").await.map_err(|e| map_kube_err(e, &ctx))?;
        let events = stream.filter_map(|item| async move {
            match item {
                Ok(KubeWatchEvent::Added(o)) => Some(to_document(&o).map(|d| WatchEvent::new(EventType::Added, d))),
                Ok(KubeWatchEvent::Modified(o)) => Some(to_document(&o).map(|d| WatchEvent::new(EventType::Modified, d))),
                Ok(KubeWatchEvent::Deleted(o)) => Some(to_document(&o).map(|d| WatchEvent::new(EventType::Deleted, d))),
                Ok(KubeWatchEvent::Bookmark(_)) => None,
                Ok(KubeWatchEvent::Error(e)) => Some(Err(FleetError::Api(format!("watch error {}: {}", e.code, e.message)))),
                Err(e) => Some(Err(FleetError::api(e))),
            }
        });
        debug!(ctx = %ctx, "watch stream requested");
        Ok(WatchSubscription::spawn(events.boxed(), ctx))
    }
}

/// Exec-in-pod through the kube websocket API.
pub struct KubeExec {
    client: Client,
}

impl KubeExec {
    pub fn new(client: Client) -> Self { Self { client } }
}

fn exit_code(status: Option<k8s_openapi::apimachinery::pkg::apis::meta::v1::Status>) -> i32 {
    let Some(st) = status else { return -1 };
    if st.status.as_deref() == Some("Success") {
        return 0;
    }
    st.details
        .and_then(|d| d.causes)
        .and_then(|causes| causes.into_iter().find(|c| c.reason.as_deref() == Some("ExitCode")))
        .and_then(|c| c.message)
        .and_then(|m| m.parse().ok())
        .unwrap_or(1)
}

#[async_trait::async_trait]
impl PodExec for KubeExec {
    async fn exec(&self, name: &str, namespace: &str, command: &[String]) -> FleetResult<ExecOutput> {
        let what = format!("Pod/{}/{}", namespace, name);
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let ap = AttachParams::default().stdin(false).stdout(true).stderr(true);
        let mut attached = api.exec(name, command.to_vec(), &ap).await.map_err(|e| map_kube_err(e, &what))?;

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let read_out = async move {
            let mut buf = Vec::new();
            if let Some(mut r) = stdout_reader { let _ = r.read_to_end(&mut buf).await; }
            buf
        };
        let read_err = async move {
            let mut buf = Vec::new();
            if let Some(mut r) = stderr_reader { let _ = r.read_to_end(&mut buf).await; }
            buf
        };
        let (out, err) = tokio::join!(read_out, read_err);
        let status = match attached.take_status() {
            Some(fut) => fut.await,
            None => None,
        };
        attached.join().await.map_err(FleetError::api)?;
        let code = exit_code(status);
        info!(pod = %what, exit_code = code, "exec finished");
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&out).to_string(),
            stderr: String::from_utf8_lossy(&err).to_string(),
            exit_code: code,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Status, StatusCause, StatusDetails};

    #[test]
    fn api_resources_carry_expected_plurals() {
        assert_eq!(api_resource(ResourceKind::Pod).plural, "pods");
        assert_eq!(api_resource(ResourceKind::Lease).group, "coordination.k8s.io");
        assert_eq!(api_resource(ResourceKind::ClusterRoleBinding).plural, "clusterrolebindings");
        assert_eq!(api_resource(ResourceKind::DaemonSet).api_version, "apps/v1");
    }

    #[test]
    fn exit_code_reads_status_causes() {
        assert_eq!(exit_code(None), -1);
        assert_eq!(exit_code(Some(Status { status: Some("Success".into()), ..Default::default() })), 0);
        let failed = Status {
            status: Some("Failure".into()),
            details: Some(StatusDetails {
                causes: Some(vec![StatusCause { reason: Some("ExitCode".into()), message: Some("3".into()), field: None }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(exit_code(Some(failed)), 3);
    }

    #[test]
    fn filters_become_selectors() {
        let f = WatchFilter { fields: Some("spec.nodeName=n1".into()), labels: Some("app=agent".into()) };
        let lp = list_params(&f);
        assert_eq!(lp.field_selector.as_deref(), Some("spec.nodeName=n1"));
        assert_eq!(lp.label_selector.as_deref(), Some("app=agent"));
    }
}
