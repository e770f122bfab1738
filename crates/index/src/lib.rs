//! Fleetcheck index: query surface over the downstream event index and fleet
//! cycle detection built on it.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};

use fleetcheck_core::{Document, FleetResult};

pub mod detector;
pub mod memory;

pub use detector::{CycleCompletionDetector, DetectorConfig, FleetCompletion};
pub use memory::MemoryIndex;

/// One matching record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexHit {
    pub source: Document,
}

impl IndexHit {
    /// Dotted lookup into the record source (`result.evaluation`).
    pub fn field(&self, path: &str) -> Option<&Document> { self.source.dotted(path) }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub total_hits: u64,
    pub hits: Vec<IndexHit>,
}

impl QueryResult {
    pub fn first(&self) -> Option<&IndexHit> { self.hits.first() }
}

/// Read side of the event index. Queries and sorts use the index's own JSON DSL.
#[async_trait::async_trait]
pub trait EventIndex: Send + Sync {
    async fn query(&self, index: &str, query: &Json, sort: &Json, size: usize) -> FleetResult<QueryResult>;
}

/// `bool.must` over a single exact term.
pub fn term_query(field: &str, value: &str) -> Json {
    terms_query(&[(field, value)])
}

/// `bool.must` over several exact terms.
pub fn terms_query(terms: &[(&str, &str)]) -> Json {
    let must: Vec<Json> = terms.iter().map(|(f, v)| json!({ "term": { *f: *v } })).collect();
    json!({ "bool": { "must": must } })
}

/// Newest record first.
pub fn latest_first() -> Json { json!([{ "@timestamp": { "order": "desc" } }]) }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_emit_index_dsl() {
        assert_eq!(term_query("agent.name", "n1"), json!({"bool": {"must": [{"term": {"agent.name": "n1"}}]}}));
        assert_eq!(latest_first(), json!([{"@timestamp": {"order": "desc"}}]));
        let q = terms_query(&[("a", "1"), ("b", "2")]);
        assert_eq!(q["bool"]["must"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn hit_field_follows_dotted_paths() {
        let hit = IndexHit { source: Document::from(json!({"result": {"evaluation": "passed"}, "cycle_id": 7})) };
        assert_eq!(hit.field("result.evaluation").and_then(Document::as_str), Some("passed"));
        assert_eq!(hit.field("cycle_id").and_then(Document::scalar_token).as_deref(), Some("7"));
        assert!(hit.field("result.missing").is_none());
    }
}
