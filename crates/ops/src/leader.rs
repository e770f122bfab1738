//! Resolve the current lease holder to the node running it.

use std::sync::Arc;

use tracing::{debug, info};

use fleetcheck_core::{Document, FleetResult, LeaseState, PodRef, ResourceKind, ResourceRef};
use fleetcheck_kubehub::{DispatchTable, WatchFilter};

pub const DEFAULT_LEASE_NAME: &str = "cloudbeat-cluster-leader";

fn holder_of(doc: &Document) -> Option<&str> { doc.str_at(&["spec", "holderIdentity"]) }

#[derive(Clone)]
pub struct LeaderLocator {
    table: Arc<DispatchTable>,
    lease_name: String,
}

impl LeaderLocator {
    pub fn new(table: Arc<DispatchTable>) -> Self { Self { table, lease_name: DEFAULT_LEASE_NAME.into() } }

    pub fn with_lease_name(mut self, name: impl Into<String>) -> Self { self.lease_name = name.into(); self }

    /// `None` when the lease does not exist.
    pub async fn lease_state(&self, namespace: &str) -> FleetResult<Option<LeaseState>> {
        let lease = ResourceRef::namespaced(ResourceKind::Lease, &self.lease_name, namespace);
        match self.table.get(&lease).await {
            Ok(doc) => Ok(Some(LeaseState {
                holder_identity: holder_of(&doc).unwrap_or_default().to_string(),
            })),
            Err(e) if e.is_not_found() => {
                debug!(lease = %lease, "no lease");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Node of the first candidate whose name contains the holder's discriminator.
    /// Empty string when there is no lease or no candidate matches.
    pub async fn locate_leader(&self, namespace: &str, candidates: &[PodRef]) -> FleetResult<String> {
        let Some(state) = self.lease_state(namespace).await? else { return Ok(String::new()) };
        let token = state.discriminator();
        if token.is_empty() {
            return Ok(String::new());
        }
        let node = candidates
            .iter()
            .find(|p| p.name.contains(token))
            .map(|p| p.node_name.clone())
            .unwrap_or_default();
        info!(holder = %state.holder_identity, token, node = %node, candidates = candidates.len(), "leader resolved");
        Ok(node)
    }

    /// Pods in `namespace` whose name contains `name_contains`.
    pub async fn candidate_pods(&self, namespace: &str, name_contains: &str) -> FleetResult<Vec<PodRef>> {
        let pods = self.table.list(ResourceKind::Pod, Some(namespace), &WatchFilter::default()).await?;
        Ok(pods
            .iter()
            .filter_map(|d| {
                let name = d.name()?;
                if !name.contains(name_contains) { return None; }
                let node_name = d.str_at(&["spec", "nodeName"]).unwrap_or_default().to_string();
                Some(PodRef { name: name.to_string(), node_name })
            })
            .collect())
    }

    /// Candidate discovery and lookup in one call.
    pub async fn leader_node(&self, namespace: &str, name_contains: &str) -> FleetResult<String> {
        let candidates = self.candidate_pods(namespace, name_contains).await?;
        self.locate_leader(namespace, &candidates).await
    }
}
