//! Fleet cycle completion detection.
//!
//! A node "advances" when its newest index record carries a sequence token
//! different from the last one this detection call saw for it. A cycle counts
//! once every node advanced within one pass. Success needs exactly
//! `nodes * required_cycles` advances; a node that stalls fails the call at
//! the overall deadline.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fleetcheck_core::{poll_until, Clock, Document, FleetResult, NodeSequence, RetryPolicy, TokioClock};

use crate::{latest_first, term_query, EventIndex};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Index name or pattern holding the fleet's records.
    pub index: String,
    /// Field that tags a record with its node.
    pub node_field: String,
    /// Field carrying the progress token.
    pub sequence_field: String,
    pub poll_interval: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            index: "logs-cloud_security_posture.findings-*".into(),
            node_field: "agent.name".into(),
            sequence_field: "cycle_id".into(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// State of one detection call. Discarded on return.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetCompletion {
    pub per_node_last_sequence: FxHashMap<String, String>,
    pub completed_cycles: u32,
    pub active_agents: usize,
    pub converged: bool,
}

pub struct CycleCompletionDetector {
    index: Arc<dyn EventIndex>,
    clock: Arc<dyn Clock>,
    config: DetectorConfig,
}

impl CycleCompletionDetector {
    pub fn new(index: Arc<dyn EventIndex>, config: DetectorConfig) -> Self {
        Self { index, clock: Arc::new(TokioClock), config }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self { self.clock = clock; self }

    /// Newest record for `node`; empty token and zero hits when the node has none.
    pub async fn latest(&self, node: &str) -> FleetResult<NodeSequence> {
        let res = self.index.query(&self.config.index, &term_query(&self.config.node_field, node), &latest_first(), 1).await?;
        let sequence_token = res
            .first()
            .and_then(|h| h.field(&self.config.sequence_field))
            .and_then(Document::scalar_token)
            .unwrap_or_default();
        Ok(NodeSequence { node_name: node.to_string(), sequence_token, total_hits: res.total_hits })
    }

    /// `true` once every node advanced on `required_cycles` passes before `overall_timeout`.
    pub async fn wait_for_fleet_cycle(
        &self,
        nodes: &[String],
        required_cycles: u32,
        per_node_timeout: Duration,
        overall_timeout: Duration,
    ) -> bool {
        self.run(nodes, required_cycles, per_node_timeout, overall_timeout).await.converged
    }

    pub async fn run(
        &self,
        nodes: &[String],
        required_cycles: u32,
        per_node_timeout: Duration,
        overall_timeout: Duration,
    ) -> FleetCompletion {
        let mut state = FleetCompletion::default();
        if required_cycles == 0 {
            state.converged = true;
            return state;
        }
        if nodes.is_empty() {
            warn!("fleet cycle requested for an empty fleet");
            return state;
        }
        let deadline = self.clock.now() + overall_timeout;
        let mut prev_sequence = String::new();

        while state.completed_cycles < required_cycles {
            if self.clock.now() >= deadline { break; }
            let mut cur_sequence = prev_sequence.clone();
            let mut all_advanced = true;
            for node in nodes {
                let remaining = deadline.saturating_duration_since(self.clock.now());
                if remaining.is_zero() {
                    all_advanced = false;
                    break;
                }
                let policy = RetryPolicy::new(self.config.poll_interval, per_node_timeout.min(remaining));
                let last = state.per_node_last_sequence.get(node).cloned();
                match self.await_advance(node, last.as_deref(), &policy).await {
                    Some(seq) => {
                        state.active_agents += 1;
                        debug!(node = %node, token = %seq.sequence_token, hits = seq.total_hits, "node advanced");
                        cur_sequence = seq.sequence_token.clone();
                        state.per_node_last_sequence.insert(node.clone(), seq.sequence_token);
                    }
                    None => {
                        debug!(node = %node, "node did not advance this pass");
                        all_advanced = false;
                    }
                }
            }
            if all_advanced && cur_sequence != prev_sequence {
                prev_sequence = cur_sequence;
                state.completed_cycles += 1;
                info!(cycle = state.completed_cycles, required = required_cycles, active_agents = state.active_agents, "fleet cycle completed");
            }
        }

        state.converged = state.completed_cycles >= required_cycles && state.active_agents == nodes.len() * required_cycles as usize;
        if state.converged {
            counter!("fleet_cycle_ok", 1u64);
        } else {
            counter!("fleet_cycle_timeout", 1u64);
            warn!(
                completed = state.completed_cycles,
                required = required_cycles,
                active_agents = state.active_agents,
                expected = nodes.len() * required_cycles as usize,
                timeout_secs = overall_timeout.as_secs(),
                "fleet cycle convergence not reached"
            );
        }
        state
    }

    async fn await_advance(&self, node: &str, last: Option<&str>, policy: &RetryPolicy) -> Option<NodeSequence> {
        let observed: Mutex<Option<NodeSequence>> = Mutex::new(None);
        let slot = &observed;
        let advanced = poll_until(self.clock.as_ref(), policy, move || async move {
            let seq = self.latest(node).await?;
            let moved = seq.total_hits != 0 && !seq.sequence_token.is_empty() && last != Some(seq.sequence_token.as_str());
            if moved {
                *slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(seq);
            }
            Ok(moved)
        })
        .await;
        if !advanced { return None; }
        observed.into_inner().unwrap_or_else(|p| p.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{IndexHit, QueryResult};
    use serde_json::{json, Value as Json};
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::time::Instant;

    /// Every query returns a fresh token, except for the stalled node.
    struct Ticking {
        ticks: AtomicU64,
        stalled: Option<&'static str>,
    }

    #[async_trait::async_trait]
    impl EventIndex for Ticking {
        async fn query(&self, _index: &str, query: &Json, _sort: &Json, _size: usize) -> FleetResult<QueryResult> {
            let node = query.pointer("/bool/must/0/term/agent.name").and_then(Json::as_str).unwrap_or_default().to_string();
            let token = if Some(node.as_str()) == self.stalled {
                "frozen".to_string()
            } else {
                format!("{}-{}", node, self.ticks.fetch_add(1, Ordering::SeqCst))
            };
            Ok(QueryResult { total_hits: 1, hits: vec![IndexHit { source: Document::from(json!({"cycle_id": token})) }] })
        }
    }

    fn nodes() -> Vec<String> { vec!["n1".into(), "n2".into(), "n3".into()] }

    fn detector(stalled: Option<&'static str>) -> CycleCompletionDetector {
        let index = Arc::new(Ticking { ticks: AtomicU64::new(0), stalled });
        CycleCompletionDetector::new(index, DetectorConfig { poll_interval: Duration::from_millis(500), ..DetectorConfig::default() })
    }

    #[tokio::test(start_paused = true)]
    async fn every_node_advancing_converges() {
        let out = detector(None).run(&nodes(), 2, Duration::from_secs(5), Duration::from_secs(60)).await;
        assert!(out.converged);
        assert_eq!(out.active_agents, 6);
        assert_eq!(out.completed_cycles, 2);
        assert_eq!(out.per_node_last_sequence.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_node_fails_at_overall_timeout() {
        let started = Instant::now();
        let ok = detector(Some("n2")).wait_for_fleet_cycle(&nodes(), 2, Duration::from_secs(5), Duration::from_secs(60)).await;
        assert!(!ok);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(62), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_index_never_advances() {
        let idx = Arc::new(crate::MemoryIndex::new());
        let d = CycleCompletionDetector::new(idx, DetectorConfig::default());
        let out = d.run(&nodes(), 1, Duration::from_secs(2), Duration::from_secs(10)).await;
        assert!(!out.converged);
        assert_eq!(out.active_agents, 0);
    }

    #[tokio::test]
    async fn degenerate_inputs() {
        let d = detector(None);
        assert!(d.wait_for_fleet_cycle(&nodes(), 0, Duration::from_secs(1), Duration::from_secs(1)).await);
        assert!(!d.wait_for_fleet_cycle(&[], 2, Duration::from_secs(1), Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn latest_reads_sequence_field() {
        let idx = crate::MemoryIndex::new();
        idx.push("logs-cloud_security_posture.findings-default", json!({"@timestamp": "2024-01-01T00:00:01Z", "agent": {"name": "n1"}, "cycle_id": "a"}));
        idx.push("logs-cloud_security_posture.findings-default", json!({"@timestamp": "2024-01-01T00:00:02Z", "agent": {"name": "n1"}, "cycle_id": "b"}));
        let d = CycleCompletionDetector::new(Arc::new(idx), DetectorConfig::default());
        let seq = d.latest("n1").await.unwrap();
        assert_eq!((seq.sequence_token.as_str(), seq.total_hits), ("b", 2));
        assert_eq!(d.latest("n9").await.unwrap().total_hits, 0);
    }
}
