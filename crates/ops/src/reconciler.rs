//! Bring a cluster object in line with a patch body.
//!
//! Kinds with a native patch take it directly. Pods go through
//! delete, wait for DELETED, create from template+patch, wait for Running.
//! The template is loaded and merged before the delete, so authoring errors
//! (missing template, shape mismatch, identity change) never leave the object deleted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetcheck_apply::{diff_summary, find_by_identity, strip_server_fields, TemplateSource};
use fleetcheck_core::{merge, AcceptedStates, Document, EventType, FleetError, FleetResult, ResourceRef};
use fleetcheck_kubehub::DispatchTable;

use crate::waiter::WatchWaiter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReconcileState {
    Idle,
    Resolving,
    Deleting,
    AwaitingDeletion,
    Recreating,
    AwaitingReady,
    Done,
    Failed,
}

impl ReconcileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileState::Idle => "Idle",
            ReconcileState::Resolving => "Resolving",
            ReconcileState::Deleting => "Deleting",
            ReconcileState::AwaitingDeletion => "AwaitingDeletion",
            ReconcileState::Recreating => "Recreating",
            ReconcileState::AwaitingReady => "AwaitingReady",
            ReconcileState::Done => "Done",
            ReconcileState::Failed => "Failed",
        }
    }
}

/// Outcome of one reconciliation.
///
/// `object` is `None` when the state is `Failed`: the recreated object never became
/// ready, and callers must treat the patch as having had no effect.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub state: ReconcileState,
    pub object: Option<Document>,
    /// Live object before the patch (recreate path only).
    pub previous: Option<Document>,
    pub transitions: Vec<ReconcileState>,
}

impl Reconciliation {
    pub fn is_done(&self) -> bool { self.state == ReconcileState::Done }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Manifest holding the reference bodies for recreate.
    pub template_path: String,
    pub delete_timeout: Duration,
    pub ready_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            template_path: "deploy/k8s/test-resources.yaml".into(),
            delete_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(120),
        }
    }
}

struct Track {
    target: String,
    states: Vec<ReconcileState>,
}

impl Track {
    fn new(target: &ResourceRef) -> Self { Self { target: target.to_string(), states: vec![ReconcileState::Idle] } }

    fn enter(&mut self, next: ReconcileState) {
        let from = self.states.last().copied().unwrap_or(ReconcileState::Idle);
        info!(target_ref = %self.target, from = from.as_str(), to = next.as_str(), "reconcile transition");
        self.states.push(next);
    }

    fn current(&self) -> ReconcileState { self.states.last().copied().unwrap_or(ReconcileState::Idle) }
}

pub struct ResourceReconciler {
    table: Arc<DispatchTable>,
    waiter: WatchWaiter,
    templates: Arc<dyn TemplateSource>,
    config: ReconcilerConfig,
}

impl ResourceReconciler {
    pub fn new(table: Arc<DispatchTable>, templates: Arc<dyn TemplateSource>, config: ReconcilerConfig) -> Self {
        let waiter = WatchWaiter::new(Arc::clone(&table));
        Self { table, waiter, templates, config }
    }

    pub fn config(&self) -> &ReconcilerConfig { &self.config }

    /// Apply `body` to `target`. `NotFound` is logged and returned as is; other API
    /// failures abort. A delete that is never observed fails with `ReconcileTimeout`.
    pub async fn patch(&self, target: &ResourceRef, body: &Document) -> FleetResult<Reconciliation> {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);
        let mut track = Track::new(target);
        let res = if self.table.supports_patch(target.kind)? {
            self.native(target, body, &mut track).await
        } else {
            self.recreate(target, body, &mut track).await
        };
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(r) if r.is_done() => counter!("reconcile_ok", 1u64),
            Ok(_) => counter!("reconcile_err", 1u64),
            Err(e) => {
                counter!("reconcile_err", 1u64);
                if e.is_not_found() {
                    warn!(target_ref = %target, stage = track.current().as_str(), "reconcile target not found");
                } else {
                    warn!(target_ref = %target, stage = track.current().as_str(), error = %e, "reconcile aborted");
                }
            }
        }
        res
    }

    async fn native(&self, target: &ResourceRef, body: &Document, track: &mut Track) -> FleetResult<Reconciliation> {
        let object = self.table.patch(target, body).await?;
        track.enter(ReconcileState::Done);
        Ok(Reconciliation { state: ReconcileState::Done, object: Some(object), previous: None, transitions: std::mem::take(&mut track.states) })
    }

    async fn recreate(&self, target: &ResourceRef, body: &Document, track: &mut Track) -> FleetResult<Reconciliation> {
        let namespace = target.scope()?;

        track.enter(ReconcileState::Resolving);
        let live = self.table.get(target).await?;
        let desired = self.desired_body(target, body, &live).await?;

        track.enter(ReconcileState::Deleting);
        let gone = self.waiter.arm(target.kind, &target.name, namespace, AcceptedStates::of(&[EventType::Deleted])).await?;
        self.table.delete(target).await?;

        track.enter(ReconcileState::AwaitingDeletion);
        if !gone.wait(self.config.delete_timeout).await {
            track.enter(ReconcileState::Failed);
            return Err(FleetError::ReconcileTimeout {
                stage: ReconcileState::AwaitingDeletion.as_str().into(),
                name: target.to_string(),
                secs: self.config.delete_timeout.as_secs(),
            });
        }

        track.enter(ReconcileState::Recreating);
        let ready_states = AcceptedStates::parse(["RUNNING", "ADDED"])?;
        let ready = self.waiter.arm(target.kind, &target.name, namespace, ready_states).await?;
        self.table.create(target, &desired).await?;

        track.enter(ReconcileState::AwaitingReady);
        match ready.wait_event(self.config.ready_timeout).await {
            Some(ev) => {
                track.enter(ReconcileState::Done);
                Ok(Reconciliation { state: ReconcileState::Done, object: Some(ev.object), previous: Some(live), transitions: std::mem::take(&mut track.states) })
            }
            None => {
                warn!(target_ref = %target, timeout_secs = self.config.ready_timeout.as_secs(), "recreated object never became ready");
                track.enter(ReconcileState::Failed);
                Ok(Reconciliation { state: ReconcileState::Failed, object: None, previous: Some(live), transitions: std::mem::take(&mut track.states) })
            }
        }
    }

    /// Template sub-document for `target` merged with `body`, ready to submit as a create.
    async fn desired_body(&self, target: &ResourceRef, body: &Document, live: &Document) -> FleetResult<Document> {
        let docs = self.templates.load(&self.config.template_path).await?;
        let base = find_by_identity(&docs, target)
            .ok_or_else(|| FleetError::Template(format!("{} has no document for {}", self.config.template_path, target)))?;
        let mut desired = merge(base, body)?;
        if let Some(ns) = target.namespace.as_deref().filter(|_| target.kind.namespaced()) {
            if desired.namespace().is_none() {
                desired.set_at(&["metadata", "namespace"], Document::string(ns));
            }
        }
        ensure_identity(target, &desired)?;
        strip_server_fields(&mut desired);
        let mut live_body = live.clone();
        strip_server_fields(&mut live_body);
        let d = diff_summary(&desired.to_json(), &live_body.to_json());
        debug!(target_ref = %target, adds = d.adds, updates = d.updates, removes = d.removes, "recreate body vs live");
        Ok(desired)
    }
}

/// The create body must address exactly `target`; anything else would only fail after the delete.
fn ensure_identity(target: &ResourceRef, desired: &Document) -> FleetResult<()> {
    let expected_ns = target.namespace.as_deref().filter(|_| target.kind.namespaced());
    let checks = [
        ("kind", Some(target.kind.as_str()), desired.kind()),
        ("metadata.name", Some(target.name.as_str()), desired.name()),
        ("metadata.namespace", expected_ns, desired.namespace()),
    ];
    for (field, want, got) in checks {
        if want != got {
            return Err(FleetError::IdentityChange {
                field: field.into(),
                from: want.unwrap_or("<none>").to_string(),
                to: got.unwrap_or("<none>").to_string(),
            });
        }
    }
    Ok(())
}
