//! Block until a named resource reaches one of a set of accepted states.
//!
//! Matching is by substring: fleet members carry random name suffixes, so an
//! event qualifies when the requested name appears in the object name.
//!
//! Pod-only rules:
//! - ADDED with phase `Pending` never qualifies.
//! - Requesting ADDED without MODIFIED also accepts MODIFIED (pods usually reach
//!   `Running` through a MODIFIED event); those implicit MODIFIED events skip
//!   `Pending` as well.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fleetcheck_core::{AcceptedStates, EventType, FleetResult, ResourceKind, WatchEvent};
use fleetcheck_kubehub::{DispatchTable, WatchFilter, WatchSubscription};

const REOPEN_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rules {
    accepted: AcceptedStates,
    implicit_modified: bool,
}

impl Rules {
    fn for_kind(kind: ResourceKind, mut accepted: AcceptedStates) -> Self {
        let implicit_modified = kind == ResourceKind::Pod
            && accepted.contains(EventType::Added)
            && !accepted.contains(EventType::Modified);
        if implicit_modified { accepted.insert(EventType::Modified); }
        Self { accepted, implicit_modified }
    }

    fn qualifies(&self, kind: ResourceKind, name: &str, ev: &WatchEvent) -> bool {
        if !ev.name().map_or(false, |n| n.contains(name)) { return false; }
        if !self.accepted.contains(ev.event_type) { return false; }
        if ev.event_type == EventType::Deleted { return true; }
        let phase = ev.phase();
        if kind == ResourceKind::Pod && phase == Some("Pending") {
            let suppressed = ev.event_type == EventType::Added
                || (ev.event_type == EventType::Modified && self.implicit_modified);
            if suppressed { return false; }
        }
        self.accepted.phase_allows(phase)
    }
}

#[derive(Clone)]
pub struct WatchWaiter {
    table: Arc<DispatchTable>,
    filter: WatchFilter,
}

impl WatchWaiter {
    pub fn new(table: Arc<DispatchTable>) -> Self { Self { table, filter: WatchFilter::default() } }

    /// Extra selectors applied to every watch this waiter opens.
    pub fn with_filter(mut self, filter: WatchFilter) -> Self { self.filter = filter; self }

    /// Open the watch now; consume it later with [`ArmedWait::wait`].
    /// Arm before the mutation you expect to observe so fast transitions are not missed.
    pub async fn arm(&self, kind: ResourceKind, name: &str, namespace: Option<&str>, accepted: AcceptedStates) -> FleetResult<ArmedWait> {
        let sub = self.table.watch(kind, namespace, &self.filter).await?;
        Ok(ArmedWait {
            table: Arc::clone(&self.table),
            filter: self.filter.clone(),
            sub: Some(sub),
            kind,
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            rules: Rules::for_kind(kind, accepted),
            expect: None,
        })
    }

    /// Wait for `name` to reach one of `accepted_states` (event types and/or pod phases).
    /// `Ok(false)` on timeout; errors only when the watch cannot be opened.
    pub async fn wait_for(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: Option<&str>,
        accepted_states: &[&str],
        timeout: Duration,
    ) -> FleetResult<bool> {
        let accepted = AcceptedStates::parse(accepted_states.iter().copied())?;
        let armed = self.arm(kind, name, namespace, accepted).await?;
        Ok(armed.wait(timeout).await)
    }
}

/// A watch opened for one specific wait.
pub struct ArmedWait {
    table: Arc<DispatchTable>,
    filter: WatchFilter,
    sub: Option<WatchSubscription>,
    kind: ResourceKind,
    name: String,
    namespace: Option<String>,
    rules: Rules,
    expect: Option<Box<dyn Fn(&WatchEvent) -> bool + Send + Sync>>,
}

impl ArmedWait {
    /// Additionally require `check` to hold on the qualifying event. Watches replay
    /// existing objects first, so this is how a wait insists on the post-mutation body.
    pub fn expecting(mut self, check: impl Fn(&WatchEvent) -> bool + Send + Sync + 'static) -> Self {
        self.expect = Some(Box::new(check));
        self
    }

    pub async fn wait(self, timeout: Duration) -> bool { self.wait_event(timeout).await.is_some() }

    /// First qualifying event, or `None` on timeout. The watch is closed on every path.
    pub async fn wait_event(mut self, timeout: Duration) -> Option<WatchEvent> {
        let deadline = Instant::now() + timeout;
        let outcome = self.pump(deadline).await;
        if let Some(sub) = self.sub.take() { sub.close().await; }
        match &outcome {
            Some(ev) => {
                counter!("watch_wait_ok", 1u64);
                info!(kind = %self.kind, name = %self.name, event = %ev.event_type, phase = ?ev.phase(), "watch wait satisfied");
            }
            None => {
                counter!("watch_wait_timeout", 1u64);
                info!(kind = %self.kind, name = %self.name, timeout_secs = timeout.as_secs(), "watch wait timed out");
            }
        }
        outcome
    }

    async fn pump(&mut self, deadline: Instant) -> Option<WatchEvent> {
        loop {
            let sub = match self.sub.as_mut() {
                Some(s) => s,
                None => return None,
            };
            match tokio::time::timeout_at(deadline, sub.next()).await {
                Ok(Some(ev)) => {
                    let expected = self.expect.as_ref().map_or(true, |check| check(&ev));
                    if expected && self.rules.qualifies(self.kind, &self.name, &ev) { return Some(ev); }
                    debug!(kind = %self.kind, name = ?ev.name(), event = %ev.event_type, phase = ?ev.phase(), "event skipped");
                }
                Ok(None) => {
                    if let Some(old) = self.sub.take() { old.close().await; }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() { return None; }
                    warn!(kind = %self.kind, name = %self.name, "watch stream ended early; reopening");
                    tokio::time::sleep(REOPEN_BACKOFF.min(remaining)).await;
                    let reopen = self.table.watch(self.kind, self.namespace.as_deref(), &self.filter);
                    match tokio::time::timeout_at(deadline, reopen).await {
                        Ok(Ok(s)) => self.sub = Some(s),
                        Ok(Err(e)) => { warn!(error = %e, "watch reopen failed"); return None; }
                        Err(_) => { warn!(kind = %self.kind, name = %self.name, "watch reopen outlived the deadline"); return None; }
                    }
                }
                Err(_) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fleetcheck_core::{Document, FleetError};
    use fleetcheck_kubehub::{ClusterResource, MemoryCluster};
    use serde_json::json;

    fn pod_event(t: EventType, name: &str, phase: &str) -> WatchEvent {
        WatchEvent::new(t, Document::from(json!({"kind": "Pod", "metadata": {"name": name, "namespace": "ns"}, "status": {"phase": phase}})))
    }

    fn waiter(cluster: &MemoryCluster) -> WatchWaiter { WatchWaiter::new(Arc::new(cluster.dispatch_table())) }

    #[test]
    fn pod_added_implies_modified() {
        let r = Rules::for_kind(ResourceKind::Pod, AcceptedStates::of(&[EventType::Added]));
        assert!(r.implicit_modified);
        assert!(r.qualifies(ResourceKind::Pod, "agent", &pod_event(EventType::Modified, "agent-x1", "Running")));
        assert!(!r.qualifies(ResourceKind::Pod, "agent", &pod_event(EventType::Added, "agent-x1", "Pending")));
        assert!(!r.qualifies(ResourceKind::Pod, "agent", &pod_event(EventType::Modified, "agent-x1", "Pending")));
        assert!(!r.qualifies(ResourceKind::Pod, "other", &pod_event(EventType::Modified, "agent-x1", "Running")));
        // Only pods are widened.
        let cm = Rules::for_kind(ResourceKind::ConfigMap, AcceptedStates::of(&[EventType::Added]));
        assert!(!cm.implicit_modified);
        assert!(!cm.accepted.contains(EventType::Modified));
    }

    #[test]
    fn explicit_modified_keeps_pending() {
        let r = Rules::for_kind(ResourceKind::Pod, AcceptedStates::of(&[EventType::Added, EventType::Modified]));
        assert!(!r.implicit_modified);
        assert!(r.qualifies(ResourceKind::Pod, "p", &pod_event(EventType::Modified, "p", "Pending")));
        assert!(!r.qualifies(ResourceKind::Pod, "p", &pod_event(EventType::Added, "p", "Pending")));
    }

    #[test]
    fn phase_tokens_narrow_events() {
        let r = Rules::for_kind(ResourceKind::Pod, AcceptedStates::parse(["RUNNING", "ADDED"]).unwrap());
        assert!(r.qualifies(ResourceKind::Pod, "p", &pod_event(EventType::Added, "p", "Running")));
        assert!(!r.qualifies(ResourceKind::Pod, "p", &pod_event(EventType::Modified, "p", "Succeeded")));
        let del = Rules::for_kind(ResourceKind::Pod, AcceptedStates::of(&[EventType::Deleted]));
        assert!(del.qualifies(ResourceKind::Pod, "p", &pod_event(EventType::Deleted, "p", "Running")));
    }

    #[tokio::test(start_paused = true)]
    async fn modified_running_satisfies_added_request() {
        let cluster = MemoryCluster::new();
        let w = waiter(&cluster);
        let armed = w.arm(ResourceKind::Pod, "agent", Some("ns"), AcceptedStates::parse(["ADDED"]).unwrap()).await.unwrap();
        cluster.emit(ResourceKind::Pod, Some("ns"), pod_event(EventType::Modified, "agent-abc", "Pending"));
        cluster.emit(ResourceKind::Pod, Some("ns"), pod_event(EventType::Modified, "agent-abc", "Running"));
        let ev = armed.wait_event(Duration::from_secs(5)).await.expect("qualifying event");
        assert_eq!(ev.phase(), Some("Running"));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_on_silent_stream() {
        let cluster = MemoryCluster::new();
        let started = Instant::now();
        let ok = waiter(&cluster).wait_for(ResourceKind::Pod, "ghost", Some("ns"), &["DELETED"], Duration::from_secs(30)).await.unwrap();
        assert!(!ok);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn other_namespaces_and_kinds_are_ignored() {
        let cluster = MemoryCluster::new();
        let w = waiter(&cluster);
        let armed = w.arm(ResourceKind::Pod, "p", Some("ns"), AcceptedStates::of(&[EventType::Deleted])).await.unwrap();
        cluster.emit(ResourceKind::Pod, Some("other"), pod_event(EventType::Deleted, "p", "Running"));
        cluster.emit(ResourceKind::ConfigMap, Some("ns"), pod_event(EventType::Deleted, "p", "Running"));
        assert!(!armed.wait(Duration::from_secs(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_stale_object_does_not_satisfy_expectation() {
        let cluster = MemoryCluster::new();
        let w = waiter(&cluster);
        let armed = w
            .arm(ResourceKind::Pod, "p", Some("ns"), AcceptedStates::of(&[EventType::Added]))
            .await
            .unwrap()
            .expecting(|ev| ev.object.str_at(&["metadata", "labels", "tag"]) == Some("new"));
        cluster.emit(ResourceKind::Pod, Some("ns"), pod_event(EventType::Added, "p", "Running"));
        let mut tagged = pod_event(EventType::Modified, "p", "Running");
        tagged.object.set_at(&["metadata", "labels", "tag"], Document::string("new"));
        cluster.emit(ResourceKind::Pod, Some("ns"), tagged);
        let ev = armed.wait_event(Duration::from_secs(5)).await.expect("tagged event");
        assert_eq!(ev.event_type, EventType::Modified);

        let stale = w
            .arm(ResourceKind::Pod, "p", Some("ns"), AcceptedStates::of(&[EventType::Added]))
            .await
            .unwrap()
            .expecting(|ev| ev.object.str_at(&["metadata", "labels", "tag"]) == Some("new"));
        cluster.emit(ResourceKind::Pod, Some("ns"), pod_event(EventType::Added, "p", "Running"));
        assert!(!stale.wait(Duration::from_secs(2)).await);
    }

    /// Pod binding whose first watch ends at once and whose reopen never completes.
    struct StallingReopen {
        opened: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ClusterResource for StallingReopen {
        fn kind(&self) -> ResourceKind { ResourceKind::Pod }
        fn supports_patch(&self) -> bool { false }
        async fn list(&self, _: Option<&str>, _: &WatchFilter) -> FleetResult<Vec<Document>> { Ok(Vec::new()) }
        async fn get(&self, name: &str, _: Option<&str>) -> FleetResult<Document> { Err(FleetError::NotFound(name.into())) }
        async fn create(&self, _: Option<&str>, body: &Document) -> FleetResult<Document> { Ok(body.clone()) }
        async fn delete(&self, _: &str, _: Option<&str>) -> FleetResult<()> { Ok(()) }
        async fn patch(&self, _: &str, _: Option<&str>, body: &Document) -> FleetResult<Document> { Ok(body.clone()) }
        async fn watch(&self, _: Option<&str>, _: &WatchFilter) -> FleetResult<WatchSubscription> {
            if self.opened.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(WatchSubscription::spawn(futures::stream::empty(), "stalling"));
            }
            futures::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_reopen_still_honours_the_deadline() {
        let binding = Arc::new(StallingReopen { opened: AtomicUsize::new(0) });
        let mut table = DispatchTable::new();
        table.register(binding.clone());
        let started = Instant::now();
        let ok = WatchWaiter::new(Arc::new(table)).wait_for(ResourceKind::Pod, "p", Some("ns"), &["DELETED"], Duration::from_secs(10)).await.unwrap();
        assert!(!ok);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(10) && waited < Duration::from_secs(11), "waited {:?}", waited);
        assert_eq!(binding.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unsupported_kind_fails_loudly() {
        let cluster = MemoryCluster::new();
        let w = WatchWaiter::new(Arc::new(cluster.dispatch_table_for(&[ResourceKind::ConfigMap])));
        let err = w.wait_for(ResourceKind::Pod, "p", Some("ns"), &["ADDED"], Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::UnsupportedKind(_)));
    }
}
