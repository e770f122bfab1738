//! In-memory event index for tests.
//!
//! Understands the subset of the query DSL the harness emits: `bool.must` of
//! `term` clauses (or a bare `term`), `match_all`, and a list of
//! `{field: {order}}` sort keys. Index names ending in `*` match by prefix.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tracing::debug;

use fleetcheck_core::{Document, FleetError, FleetResult};

use crate::{EventIndex, IndexHit, QueryResult};

#[derive(Clone, Default)]
pub struct MemoryIndex {
    inner: Arc<Mutex<FxHashMap<String, Vec<Document>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

fn index_matches(pattern: &str, name: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => pattern == name,
    }
}

fn json_token(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn terms(query: &Json) -> FleetResult<Vec<(String, String)>> {
    let clauses: Vec<&Json> = if let Some(must) = query.pointer("/bool/must") {
        match must {
            Json::Array(a) => a.iter().collect(),
            other => vec![other],
        }
    } else if query.get("match_all").is_some() || query.as_object().map_or(false, |o| o.is_empty()) {
        Vec::new()
    } else {
        vec![query]
    };
    let mut out = Vec::new();
    for c in clauses {
        let term = c
            .get("term")
            .and_then(Json::as_object)
            .ok_or_else(|| FleetError::Validation(format!("unsupported query clause {}", c)))?;
        for (field, v) in term {
            // Accept both {"f": "v"} and {"f": {"value": "v"}}.
            let v = v.get("value").unwrap_or(v);
            let token = json_token(v).ok_or_else(|| FleetError::Validation(format!("non-scalar term for {}", field)))?;
            out.push((field.clone(), token));
        }
    }
    Ok(out)
}

fn sort_keys(sort: &Json) -> Vec<(String, bool)> {
    let entries: Vec<&Json> = match sort {
        Json::Array(a) => a.iter().collect(),
        Json::Null => Vec::new(),
        other => vec![other],
    };
    let mut out = Vec::new();
    for e in entries {
        match e {
            Json::String(field) => out.push((field.clone(), false)),
            Json::Object(o) => {
                for (field, spec) in o {
                    let order = spec.get("order").and_then(Json::as_str).or_else(|| spec.as_str()).unwrap_or("asc");
                    out.push((field.clone(), order.eq_ignore_ascii_case("desc")));
                }
            }
            _ => {}
        }
    }
    out
}

fn compare_field(a: &Document, b: &Document, field: &str) -> Ordering {
    let (av, bv) = (a.dotted(field).map(Document::to_json), b.dotted(field).map(Document::to_json));
    match (av, bv) {
        (Some(Json::Number(x)), Some(Json::Number(y))) => {
            x.as_f64().partial_cmp(&y.as_f64()).unwrap_or(Ordering::Equal)
        }
        (Some(x), Some(y)) => json_token(&x).cmp(&json_token(&y)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

impl MemoryIndex {
    pub fn new() -> Self { Self::default() }

    /// Append a record. A missing `@timestamp` is stamped with the current time.
    pub fn push(&self, index: &str, record: Json) {
        let mut doc = Document::from(record);
        if doc.get("@timestamp").is_none() {
            let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Nanos, true);
            doc.set_at(&["@timestamp"], Document::string(now));
        }
        lock(&self.inner).entry(index.to_string()).or_default().push(doc);
    }

    pub fn len(&self, index: &str) -> usize {
        lock(&self.inner).iter().filter(|(name, _)| index_matches(index, name)).map(|(_, v)| v.len()).sum()
    }

    pub fn is_empty(&self, index: &str) -> bool { self.len(index) == 0 }
}

#[async_trait::async_trait]
impl EventIndex for MemoryIndex {
    async fn query(&self, index: &str, query: &Json, sort: &Json, size: usize) -> FleetResult<QueryResult> {
        let terms = terms(query)?;
        let keys = sort_keys(sort);
        let mut names: Vec<String> = lock(&self.inner).keys().filter(|n| index_matches(index, n)).cloned().collect();
        names.sort();
        let mut matched: Vec<Document> = {
            let guard = lock(&self.inner);
            names
                .iter()
                .filter_map(|n| guard.get(n))
                .flat_map(|docs| docs.iter())
                .filter(|d| terms.iter().all(|(f, v)| d.dotted(f).and_then(Document::scalar_token).as_deref() == Some(v.as_str())))
                .cloned()
                .collect()
        };
        // Newest insert wins ties on a descending primary key.
        if keys.first().map_or(false, |(_, desc)| *desc) { matched.reverse(); }
        matched.sort_by(|a, b| {
            for (field, desc) in &keys {
                let ord = compare_field(a, b, field);
                let ord = if *desc { ord.reverse() } else { ord };
                if ord != Ordering::Equal { return ord; }
            }
            Ordering::Equal
        });
        let total_hits = matched.len() as u64;
        matched.truncate(size);
        debug!(index, total_hits, returned = matched.len(), "memory index query");
        Ok(QueryResult { total_hits, hits: matched.into_iter().map(|source| IndexHit { source }).collect() })
    }
}
