//! In-memory cluster for tests.
//!
//! Objects live in a map keyed by kind/namespace/name. Every mutation is
//! broadcast as a watch event so subscriptions see the same ordering a real
//! API server would give. Pods walk through a configurable phase sequence on
//! create (`Pending` then `Running` by default), emitted as ADDED then MODIFIED.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::broadcast;
use tracing::debug;

use fleetcheck_core::{Document, EventType, FleetError, FleetResult, ResourceKind, WatchEvent};

use crate::{ClusterResource, DispatchTable, WatchFilter, WatchSubscription};

type Key = (ResourceKind, Option<String>, String);
type Broadcast = (ResourceKind, Option<String>, WatchEvent);

struct Inner {
    objects: Mutex<FxHashMap<Key, Document>>,
    events: broadcast::Sender<Broadcast>,
    rv: AtomicU64,
    pod_phases: Mutex<Vec<String>>,
    hold_deletes: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<Inner>,
}

impl Default for MemoryCluster {
    fn default() -> Self { Self::new() }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn scoped(kind: ResourceKind, namespace: Option<&str>) -> Option<String> {
    if kind.namespaced() { namespace.map(str::to_string) } else { None }
}

/// RFC 7386 merge patch: null removes, objects recurse, everything else replaces.
fn json_merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(p) => {
            if !target.is_object() { *target = Json::Object(serde_json::Map::new()); }
            if let Json::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        json_merge_patch(t.entry(k.clone()).or_insert(Json::Null), v);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// `a=b,c=d` equality selectors against a dotted path prefix (`metadata.labels` or the object root).
fn selector_matches(doc: &Document, selector: &str, labels: bool) -> bool {
    selector.split(',').filter(|s| !s.trim().is_empty()).all(|term| {
        let Some((k, v)) = term.split_once('=') else { return false };
        let (k, v) = (k.trim(), v.trim());
        let found = if labels {
            doc.at(&["metadata", "labels", k]).and_then(Document::scalar_token)
        } else {
            doc.dotted(k).and_then(Document::scalar_token)
        };
        found.as_deref() == Some(v)
    })
}

impl MemoryCluster {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                objects: Mutex::new(FxHashMap::default()),
                events,
                rv: AtomicU64::new(1),
                pod_phases: Mutex::new(vec!["Pending".into(), "Running".into()]),
                hold_deletes: AtomicBool::new(false),
            }),
        }
    }

    pub fn dispatch_table(&self) -> DispatchTable { self.dispatch_table_for(&ResourceKind::ALL) }

    pub fn dispatch_table_for(&self, kinds: &[ResourceKind]) -> DispatchTable {
        let mut table = DispatchTable::new();
        for kind in kinds {
            table.register(Arc::new(MemoryBinding { kind: *kind, cluster: self.clone() }));
        }
        table
    }

    /// Phases a created pod reports, in order. The first rides on ADDED, the rest on MODIFIED.
    pub fn set_pod_phases(&self, phases: &[&str]) {
        *lock(&self.inner.pod_phases) = phases.iter().map(|s| s.to_string()).collect();
    }

    /// When set, deletes only stamp `metadata.deletionTimestamp` (a stuck finalizer).
    pub fn hold_deletes(&self, on: bool) { self.inner.hold_deletes.store(on, Ordering::SeqCst); }

    /// Insert an object without emitting events.
    pub fn seed(&self, kind: ResourceKind, doc: serde_json::Value) {
        let mut doc = Document::from(doc);
        let name = doc.name().unwrap_or_default().to_string();
        let ns = scoped(kind, doc.namespace());
        self.stamp(&mut doc);
        lock(&self.inner.objects).insert((kind, ns, name), doc);
    }

    /// Push a scripted event to current watchers without touching stored state.
    pub fn emit(&self, kind: ResourceKind, namespace: Option<&str>, event: WatchEvent) {
        let _ = self.inner.events.send((kind, scoped(kind, namespace), event));
    }

    pub fn object(&self, kind: ResourceKind, name: &str, namespace: Option<&str>) -> Option<Document> {
        lock(&self.inner.objects).get(&(kind, scoped(kind, namespace), name.to_string())).cloned()
    }

    pub fn len(&self) -> usize { lock(&self.inner.objects).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn stamp(&self, doc: &mut Document) {
        let rv = self.inner.rv.fetch_add(1, Ordering::SeqCst);
        if doc.str_at(&["metadata", "uid"]).is_none() {
            doc.set_at(&["metadata", "uid"], Document::string(uuid::Uuid::new_v4().to_string()));
        }
        doc.set_at(&["metadata", "resourceVersion"], Document::string(rv.to_string()));
    }

    fn publish(&self, kind: ResourceKind, ns: &Option<String>, event_type: EventType, object: Document) {
        let _ = self.inner.events.send((kind, ns.clone(), WatchEvent::new(event_type, object)));
    }

    fn create(&self, kind: ResourceKind, namespace: Option<&str>, body: &Document) -> FleetResult<Document> {
        let mut doc = body.clone();
        let name = doc.name().map(str::to_string).ok_or_else(|| FleetError::Validation("create body missing metadata.name".into()))?;
        let ns = scoped(kind, namespace.or(doc.namespace()));
        if let Some(n) = &ns { doc.set_at(&["metadata", "namespace"], Document::string(n.clone())); }
        let key = (kind, ns.clone(), name.clone());
        if lock(&self.inner.objects).contains_key(&key) {
            return Err(FleetError::Api(format!("{}/{} already exists", kind, name)));
        }
        self.stamp(&mut doc);
        if kind != ResourceKind::Pod {
            lock(&self.inner.objects).insert(key, doc.clone());
            self.publish(kind, &ns, EventType::Added, doc.clone());
            return Ok(doc);
        }
        let phases = lock(&self.inner.pod_phases).clone();
        let mut first = None;
        for (i, phase) in phases.iter().enumerate() {
            doc.set_at(&["status", "phase"], Document::string(phase.clone()));
            if i > 0 { self.stamp(&mut doc); }
            lock(&self.inner.objects).insert(key.clone(), doc.clone());
            let ev = if i == 0 { EventType::Added } else { EventType::Modified };
            self.publish(kind, &ns, ev, doc.clone());
            if first.is_none() { first = Some(doc.clone()); }
        }
        if first.is_none() {
            lock(&self.inner.objects).insert(key, doc.clone());
            self.publish(kind, &ns, EventType::Added, doc.clone());
        }
        Ok(first.unwrap_or(doc))
    }

    fn delete(&self, kind: ResourceKind, name: &str, namespace: Option<&str>) -> FleetResult<()> {
        let ns = scoped(kind, namespace);
        let key = (kind, ns.clone(), name.to_string());
        if self.inner.hold_deletes.load(Ordering::SeqCst) {
            let mut objects = lock(&self.inner.objects);
            let obj = objects.get_mut(&key).ok_or_else(|| FleetError::NotFound(format!("{}/{}", kind, name)))?;
            obj.set_at(&["metadata", "deletionTimestamp"], Document::string("1970-01-01T00:00:00Z"));
            let snapshot = obj.clone();
            drop(objects);
            self.publish(kind, &ns, EventType::Modified, snapshot);
            return Ok(());
        }
        let removed = lock(&self.inner.objects).remove(&key).ok_or_else(|| FleetError::NotFound(format!("{}/{}", kind, name)))?;
        debug!(kind = %kind, name, "memory delete");
        self.publish(kind, &ns, EventType::Deleted, removed);
        Ok(())
    }

    fn patch(&self, kind: ResourceKind, name: &str, namespace: Option<&str>, body: &Document) -> FleetResult<Document> {
        let ns = scoped(kind, namespace);
        let key = (kind, ns.clone(), name.to_string());
        let mut objects = lock(&self.inner.objects);
        let obj = objects.get_mut(&key).ok_or_else(|| FleetError::NotFound(format!("{}/{}", kind, name)))?;
        let mut json = obj.to_json();
        json_merge_patch(&mut json, &body.to_json());
        let mut next = Document::from(json);
        self.stamp(&mut next);
        *obj = next.clone();
        drop(objects);
        self.publish(kind, &ns, EventType::Modified, next.clone());
        Ok(next)
    }

    fn list(&self, kind: ResourceKind, namespace: Option<&str>, filter: &WatchFilter) -> Vec<Document> {
        let ns = scoped(kind, namespace);
        let objects = lock(&self.inner.objects);
        let mut out: Vec<(String, Document)> = objects
            .iter()
            .filter(|((k, n, _), _)| *k == kind && (ns.is_none() || *n == ns))
            .filter(|(_, d)| filter.fields.as_deref().map_or(true, |f| selector_matches(d, f, false)))
            .filter(|(_, d)| filter.labels.as_deref().map_or(true, |l| selector_matches(d, l, true)))
            .map(|((_, _, name), d)| (name.clone(), d.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out.into_iter().map(|(_, d)| d).collect()
    }

    fn watch(&self, kind: ResourceKind, namespace: Option<&str>, filter: &WatchFilter) -> WatchSubscription {
        let ns = scoped(kind, namespace);
        let filter = filter.clone();
        let rx = self.inner.events.subscribe();
        let ctx = format!("memory:{}@{}", kind, ns.as_deref().unwrap_or("*"));
        let stream = futures::stream::unfold(rx, move |mut rx| {
            let ns = ns.clone();
            let filter = filter.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((k, n, ev)) => {
                            let in_scope = k == kind && (ns.is_none() || n == ns);
                            let selected = filter.fields.as_deref().map_or(true, |f| selector_matches(&ev.object, f, false))
                                && filter.labels.as_deref().map_or(true, |l| selector_matches(&ev.object, l, true));
                            if in_scope && selected { return Some((Ok(ev), rx)); }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "memory watch lagged"),
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        WatchSubscription::spawn(stream, ctx)
    }
}

struct MemoryBinding {
    kind: ResourceKind,
    cluster: MemoryCluster,
}

#[async_trait::async_trait]
impl ClusterResource for MemoryBinding {
    fn kind(&self) -> ResourceKind { self.kind }

    fn supports_patch(&self) -> bool { self.kind.supports_patch() }

    async fn list(&self, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<Vec<Document>> {
        Ok(self.cluster.list(self.kind, namespace, filter))
    }

    async fn get(&self, name: &str, namespace: Option<&str>) -> FleetResult<Document> {
        self.cluster
            .object(self.kind, name, namespace)
            .ok_or_else(|| FleetError::NotFound(format!("{}/{}", self.kind, name)))
    }

    async fn create(&self, namespace: Option<&str>, body: &Document) -> FleetResult<Document> {
        self.cluster.create(self.kind, namespace, body)
    }

    async fn delete(&self, name: &str, namespace: Option<&str>) -> FleetResult<()> {
        self.cluster.delete(self.kind, name, namespace)
    }

    async fn patch(&self, name: &str, namespace: Option<&str>, body: &Document) -> FleetResult<Document> {
        if !self.supports_patch() {
            return Err(FleetError::Validation(format!("{}/{} has no native patch", self.kind, name)));
        }
        self.cluster.patch(self.kind, name, namespace, body)
    }

    async fn watch(&self, namespace: Option<&str>, filter: &WatchFilter) -> FleetResult<WatchSubscription> {
        Ok(self.cluster.watch(self.kind, namespace, filter))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetcheck_core::ResourceRef;
    use serde_json::json;

    fn pod(name: &str, ns: &str) -> Document {
        Document::from(json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": ns}, "spec": {"nodeName": "n1"}}))
    }

    #[tokio::test]
    async fn pod_create_walks_phases_on_the_watch() {
        let cluster = MemoryCluster::new();
        let table = cluster.dispatch_table();
        let mut sub = table.watch(ResourceKind::Pod, Some("ns"), &WatchFilter::default()).await.unwrap();
        let target = ResourceRef::namespaced(ResourceKind::Pod, "p", "ns");
        let created = table.create(&target, &pod("p", "ns")).await.unwrap();
        assert_eq!(created.phase(), Some("Pending"));
        let first = sub.next().await.unwrap();
        assert_eq!((first.event_type, first.phase()), (EventType::Added, Some("Pending")));
        let second = sub.next().await.unwrap();
        assert_eq!((second.event_type, second.phase()), (EventType::Modified, Some("Running")));
        assert_eq!(table.get(&target).await.unwrap().phase(), Some("Running"));

        table.delete(&target).await.unwrap();
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Deleted);
        assert!(table.get(&target).await.unwrap_err().is_not_found());
        sub.close().await;
    }

    #[tokio::test]
    async fn patch_is_a_json_merge_patch() {
        let cluster = MemoryCluster::new();
        cluster.seed(ResourceKind::ConfigMap, json!({"kind": "ConfigMap", "metadata": {"name": "cm", "namespace": "ns", "labels": {"a": "1", "b": "2"}}, "data": {"k": "v"}}));
        let table = cluster.dispatch_table();
        let target = ResourceRef::namespaced(ResourceKind::ConfigMap, "cm", "ns");
        let out = table.patch(&target, &Document::from(json!({"metadata": {"labels": {"a": null, "c": "3"}}}))).await.unwrap();
        assert_eq!(out.to_json()["metadata"]["labels"], json!({"b": "2", "c": "3"}));
        assert_eq!(out.to_json()["data"], json!({"k": "v"}));
        let pod_ref = ResourceRef::namespaced(ResourceKind::Pod, "p", "ns");
        assert!(matches!(table.patch(&pod_ref, &Document::default()).await, Err(FleetError::Validation(_))));
    }

    #[tokio::test]
    async fn list_honours_namespace_and_selectors() {
        let cluster = MemoryCluster::new();
        cluster.seed(ResourceKind::Pod, json!({"metadata": {"name": "a", "namespace": "x", "labels": {"app": "agent"}}, "spec": {"nodeName": "n1"}}));
        cluster.seed(ResourceKind::Pod, json!({"metadata": {"name": "b", "namespace": "x"}, "spec": {"nodeName": "n2"}}));
        cluster.seed(ResourceKind::Pod, json!({"metadata": {"name": "c", "namespace": "y", "labels": {"app": "agent"}}}));
        let table = cluster.dispatch_table();
        let names = |docs: Vec<Document>| docs.iter().map(|d| d.name().unwrap().to_string()).collect::<Vec<_>>();
        assert_eq!(names(table.list(ResourceKind::Pod, Some("x"), &WatchFilter::default()).await.unwrap()), vec!["a", "b"]);
        assert_eq!(names(table.list(ResourceKind::Pod, None, &WatchFilter::labels("app=agent")).await.unwrap()), vec!["a", "c"]);
        assert_eq!(names(table.list(ResourceKind::Pod, Some("x"), &WatchFilter::fields("spec.nodeName=n2")).await.unwrap()), vec!["b"]);
    }

    #[tokio::test]
    async fn held_deletes_never_emit_deleted() {
        let cluster = MemoryCluster::new();
        cluster.seed(ResourceKind::Pod, json!({"metadata": {"name": "p", "namespace": "ns"}}));
        cluster.hold_deletes(true);
        let table = cluster.dispatch_table();
        let mut sub = table.watch(ResourceKind::Pod, Some("ns"), &WatchFilter::default()).await.unwrap();
        table.delete(&ResourceRef::namespaced(ResourceKind::Pod, "p", "ns")).await.unwrap();
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Modified);
        assert!(cluster.object(ResourceKind::Pod, "p", Some("ns")).is_some());
        sub.close().await;
    }
}
