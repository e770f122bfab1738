//! Fleetcheck harness: one session object per scenario suite.
//!
//! `Harness` wires the dispatch table, watch waiter, reconciler, leader
//! locator, cycle detector and state store together. Open it at suite start,
//! `close` it at suite end; nothing here is global.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::json;
use tracing::{info, warn};

use fleetcheck_apply::{FileTemplates, TemplateSource};
use fleetcheck_core::{poll_until, AcceptedStates, Document, EventType, FleetError, FleetResult, ResourceKind, ResourceRef, RetryPolicy, TokioClock};
use fleetcheck_index::{latest_first, term_query, CycleCompletionDetector, EventIndex, FleetCompletion};
use fleetcheck_kubehub::{get_kube_client, DispatchTable, ExecOutput, KubeExec, PodExec};
use fleetcheck_ops::{LeaderLocator, Reconciliation, ResourceReconciler, WatchWaiter};
use fleetcheck_persist::{ReconcileRecord, StateStore, Store};

pub mod config;
pub mod telemetry;

pub use config::HarnessConfig;
pub use telemetry::{init_metrics, init_tracing};

pub struct Harness {
    config: HarnessConfig,
    table: Arc<DispatchTable>,
    waiter: WatchWaiter,
    reconciler: ResourceReconciler,
    leader: LeaderLocator,
    index: Arc<dyn EventIndex>,
    detector: CycleCompletionDetector,
    exec: Option<Arc<dyn PodExec>>,
    store: Option<StateStore>,
}

impl Harness {
    pub fn new(config: HarnessConfig, table: DispatchTable, index: Arc<dyn EventIndex>, templates: Arc<dyn TemplateSource>) -> Self {
        let table = Arc::new(table);
        let waiter = WatchWaiter::new(Arc::clone(&table));
        let reconciler = ResourceReconciler::new(Arc::clone(&table), templates, config.reconciler());
        let leader = LeaderLocator::new(Arc::clone(&table)).with_lease_name(config.lease_name.clone());
        let detector = CycleCompletionDetector::new(Arc::clone(&index), config.detector());
        Self { config, table, waiter, reconciler, leader, index, detector, exec: None, store: None }
    }

    /// Session against the ambient cluster: kube bindings for every kind, exec over
    /// websockets, templates from disk and the state store at `state_db` (or the default path).
    pub async fn connect(config: HarnessConfig, index: Arc<dyn EventIndex>) -> FleetResult<Self> {
        let client = get_kube_client().await?;
        let table = DispatchTable::kube(client.clone());
        let store = match config.state_db.as_deref() {
            Some(path) => StateStore::open(path),
            None => StateStore::open_default(),
        }
        .map_err(store_err)?;
        let harness = Self::new(config, table, index, Arc::new(FileTemplates::new()))
            .with_exec(Arc::new(KubeExec::new(client)))
            .with_store(store);
        info!(namespace = %harness.config.namespace, "harness connected");
        Ok(harness)
    }

    pub fn with_exec(mut self, exec: Arc<dyn PodExec>) -> Self { self.exec = Some(exec); self }

    pub fn with_store(mut self, store: StateStore) -> Self { self.store = Some(store); self }

    pub fn config(&self) -> &HarnessConfig { &self.config }

    pub fn table(&self) -> &Arc<DispatchTable> { &self.table }

    pub fn store(&self) -> Option<&StateStore> { self.store.as_ref() }

    /// Flush and release the state store.
    pub fn close(self) -> FleetResult<()> {
        if let Some(store) = &self.store {
            store.close().map_err(store_err)?;
        }
        info!("harness closed");
        Ok(())
    }

    pub async fn wait_for(&self, kind: ResourceKind, name: &str, namespace: Option<&str>, accepted_states: &[&str], timeout: Duration) -> FleetResult<bool> {
        self.waiter.wait_for(kind, name, namespace, accepted_states, timeout).await
    }

    /// Reconcile and, on success, record the before/after bodies in the state store.
    pub async fn patch(&self, target: &ResourceRef, body: &Document) -> FleetResult<Reconciliation> {
        let out = self.reconciler.patch(target, body).await?;
        if let (Some(store), Some(after)) = (&self.store, out.object.as_ref()) {
            let rec = ReconcileRecord::now(target.clone(), out.previous.clone(), after.clone());
            store.put(&rec).map_err(store_err)?;
        }
        Ok(out)
    }

    /// Node of the current lease holder among pods named like `name_contains`; "" when undeterminable.
    pub async fn leader(&self, name_contains: &str) -> FleetResult<String> {
        self.leader.leader_node(&self.config.namespace, name_contains).await
    }

    pub async fn fleet_completion(&self, nodes: &[String]) -> FleetCompletion {
        self.detector.run(nodes, self.config.required_cycles, self.config.node_timeout, self.config.cycle_timeout).await
    }

    pub async fn fleet_cycle(&self, nodes: &[String]) -> bool { self.fleet_completion(nodes).await.converged }

    pub async fn require_fleet_cycle(&self, nodes: &[String]) -> FleetResult<()> {
        if self.fleet_cycle(nodes).await {
            return Ok(());
        }
        Err(FleetError::FleetCycleTimeout { secs: self.config.cycle_timeout.as_secs() })
    }

    pub async fn exec(&self, name: &str, namespace: &str, command: &[String]) -> FleetResult<ExecOutput> {
        let exec = self.exec.as_ref().ok_or_else(|| FleetError::Validation("exec is not configured for this session".into()))?;
        exec.exec(name, namespace, command).await
    }

    /// Tag `target` with `test_resource_id` and wait until an event carrying the label is seen.
    /// Pods are recreated, so an ADDED (Running) is expected; other kinds report MODIFIED.
    pub async fn label_and_await(&self, target: &ResourceRef, test_resource_id: &str) -> FleetResult<bool> {
        let accepted = if target.kind == ResourceKind::Pod {
            AcceptedStates::of(&[EventType::Added])
        } else {
            AcceptedStates::of(&[EventType::Added, EventType::Modified])
        };
        let tag = test_resource_id.to_string();
        let seen = self
            .waiter
            .arm(target.kind, &target.name, target.scope()?, accepted)
            .await?
            .expecting(move |ev| ev.object.str_at(&["metadata", "labels", "test_resource_id"]) == Some(tag.as_str()));
        let body = Document::from(json!({ "metadata": { "labels": { "test_resource_id": test_resource_id } } }));
        let out = self.patch(target, &body).await?;
        if !out.is_done() {
            warn!(target_ref = %target, "label patch had no effect");
            return Ok(false);
        }
        Ok(seen.wait(self.config.ready_timeout).await)
    }

    /// Poll the index until the newest record tagged with `test_resource_id` reports
    /// `result.evaluation == expected`.
    pub async fn await_evaluation(&self, test_resource_id: &str, expected: &str) -> FleetResult<bool> {
        let query = term_query(&self.config.resource_id_field, test_resource_id);
        let sort = latest_first();
        let policy = RetryPolicy::new(self.config.poll_interval, self.config.evaluation_timeout);
        let index = &self.index;
        let index_name = self.config.index_name.as_str();
        let (query, sort) = (&query, &sort);
        let ok = poll_until(&TokioClock, &policy, move || async move {
            let res = index.query(index_name, query, sort, 1).await?;
            let got = res.first().and_then(|h| h.field("result.evaluation")).and_then(Document::as_str);
            Ok(got == Some(expected))
        })
        .await;
        if ok {
            counter!("evaluation_wait_ok", 1u64);
        } else {
            counter!("evaluation_wait_timeout", 1u64);
        }
        info!(test_resource_id, expected, ok, "evaluation wait finished");
        Ok(ok)
    }
}

fn store_err(e: anyhow::Error) -> FleetError { FleetError::Internal(format!("state store: {:#}", e)) }
