//! Fleetcheck core types: documents, resource identities, watch events and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

pub mod document;
pub mod error;
pub mod merge;
pub mod retry;

pub use document::{Document, Scalar};
pub use error::{FleetError, FleetResult};
pub use merge::merge;
pub use retry::{poll_until, Clock, RetryPolicy, TokioClock};

pub mod prelude {
    pub use super::{
        merge, AcceptedStates, Document, EventType, FleetError, FleetResult, LeaseState, NodeSequence, PodRef,
        ResourceKind, ResourceRef, WatchEvent,
    };
}

/// Resource kinds the harness knows how to drive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    ConfigMap,
    ServiceAccount,
    DaemonSet,
    Role,
    RoleBinding,
    ClusterRole,
    ClusterRoleBinding,
    Lease,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Pod,
        ResourceKind::ConfigMap,
        ResourceKind::ServiceAccount,
        ResourceKind::DaemonSet,
        ResourceKind::Role,
        ResourceKind::RoleBinding,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::Lease,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::ServiceAccount => "ServiceAccount",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Role => "Role",
            ResourceKind::RoleBinding => "RoleBinding",
            ResourceKind::ClusterRole => "ClusterRole",
            ResourceKind::ClusterRoleBinding => "ClusterRoleBinding",
            ResourceKind::Lease => "Lease",
        }
    }

    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::ClusterRole | ResourceKind::ClusterRoleBinding)
    }

    /// Pods are immutable for most fields; everything else takes an in-place merge patch.
    pub fn supports_patch(&self) -> bool { !matches!(self, ResourceKind::Pod) }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ResourceKind {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| FleetError::UnsupportedKind(s.to_string()))
    }
}

/// Identity key for every cluster operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn namespaced(kind: ResourceKind, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self { kind, name: name.into(), namespace: Some(namespace.into()) }
    }

    pub fn cluster(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self { kind, name: name.into(), namespace: None }
    }

    /// Namespace is required for namespaced kinds and ignored for cluster-scoped ones.
    pub fn scope(&self) -> FleetResult<Option<&str>> {
        match (self.kind.namespaced(), self.namespace.as_deref()) {
            (true, Some(ns)) => Ok(Some(ns)),
            (true, None) => Err(FleetError::Validation(format!("namespace required for namespaced kind {}", self.kind))),
            (false, _) => Ok(None),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for EventType {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ADDED" => Ok(EventType::Added),
            "MODIFIED" => Ok(EventType::Modified),
            "DELETED" => Ok(EventType::Deleted),
            other => Err(FleetError::Validation(format!("unknown event type {}", other))),
        }
    }
}

/// One change notification from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub object: Document,
}

impl WatchEvent {
    pub fn new(event_type: EventType, object: Document) -> Self { Self { event_type, object } }
    pub fn name(&self) -> Option<&str> { self.object.name() }
    pub fn phase(&self) -> Option<&str> { self.object.phase() }
}

const PHASES: &[&str] = &["PENDING", "RUNNING", "SUCCEEDED", "FAILED", "UNKNOWN"];

/// States a waiter accepts: event types, optionally narrowed by object phase.
///
/// `["RUNNING", "ADDED"]` means an ADDED event whose object reports phase `Running`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptedStates {
    pub events: SmallVec<[EventType; 3]>,
    pub phases: SmallVec<[String; 2]>,
}

impl AcceptedStates {
    pub fn parse<I, S>(states: I) -> FleetResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = AcceptedStates::default();
        for s in states {
            let token = s.as_ref().trim().to_ascii_uppercase();
            if PHASES.contains(&token.as_str()) {
                if !out.phases.contains(&token) { out.phases.push(token); }
                continue;
            }
            let ev = EventType::from_str(&token)?;
            out.insert(ev);
        }
        if out.events.is_empty() {
            return Err(FleetError::Validation("accepted states name no event type".into()));
        }
        Ok(out)
    }

    pub fn of(events: &[EventType]) -> Self {
        let mut out = AcceptedStates::default();
        for ev in events { out.insert(*ev); }
        out
    }

    pub fn insert(&mut self, ev: EventType) {
        if !self.events.contains(&ev) { self.events.push(ev); }
    }

    pub fn contains(&self, ev: EventType) -> bool { self.events.contains(&ev) }

    /// No phase constraint, or the phase matches one of the accepted phases.
    pub fn phase_allows(&self, phase: Option<&str>) -> bool {
        if self.phases.is_empty() { return true; }
        match phase {
            Some(p) => self.phases.iter().any(|a| a.eq_ignore_ascii_case(p)),
            None => false,
        }
    }
}

/// Current holder of a leadership lease. Identity is `<prefix>_<suffix>`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaseState {
    pub holder_identity: String,
}

impl LeaseState {
    /// Suffix after the last `_`, matched against candidate pod names.
    pub fn discriminator(&self) -> &str {
        match self.holder_identity.rsplit_once('_') {
            Some((_, suffix)) => suffix,
            None => &self.holder_identity,
        }
    }
}

/// A fleet member as seen by the leader locator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodRef {
    pub name: String,
    pub node_name: String,
}

/// Latest progress marker a node reported to the event index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSequence {
    pub node_name: String,
    pub sequence_token: String,
    pub total_hits: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_is_lazy_and_case_insensitive() {
        assert_eq!("pod".parse::<ResourceKind>().unwrap(), ResourceKind::Pod);
        assert_eq!("ClusterRoleBinding".parse::<ResourceKind>().unwrap(), ResourceKind::ClusterRoleBinding);
        assert!(matches!("Deployment".parse::<ResourceKind>(), Err(FleetError::UnsupportedKind(_))));
    }

    #[test]
    fn scope_requires_namespace_for_namespaced_kinds() {
        assert!(ResourceRef::cluster(ResourceKind::Pod, "p").scope().is_err());
        assert_eq!(ResourceRef::namespaced(ResourceKind::Pod, "p", "ns").scope().unwrap(), Some("ns"));
        let cr = ResourceRef::namespaced(ResourceKind::ClusterRole, "r", "ignored");
        assert_eq!(cr.scope().unwrap(), None);
        assert_eq!(ResourceRef::cluster(ResourceKind::ClusterRole, "r").to_string(), "ClusterRole/r");
    }

    #[test]
    fn accepted_states_split_events_and_phases() {
        let s = AcceptedStates::parse(["RUNNING", "added"]).unwrap();
        assert!(s.contains(EventType::Added));
        assert!(!s.contains(EventType::Modified));
        assert!(s.phase_allows(Some("Running")));
        assert!(!s.phase_allows(Some("Pending")));
        assert!(!s.phase_allows(None));
        assert!(AcceptedStates::parse(["RUNNING"]).is_err());
        assert!(AcceptedStates::parse(["BOGUS"]).is_err());
        assert!(AcceptedStates::of(&[EventType::Deleted]).phase_allows(None));
    }

    #[test]
    fn lease_discriminator_takes_last_suffix() {
        let l = LeaseState { holder_identity: "elastic-agent-leader_cloudbeat_abc12".into() };
        assert_eq!(l.discriminator(), "abc12");
        let bare = LeaseState { holder_identity: "solo".into() };
        assert_eq!(bare.discriminator(), "solo");
    }
}
