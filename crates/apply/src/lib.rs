//! Fleetcheck apply: template manifests for recreate-on-patch, payload guards and diff summaries.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use fleetcheck_core::{Document, FleetError, FleetResult, ResourceRef};

fn max_yaml_bytes() -> usize {
    std::env::var("FLEET_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("FLEET_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a multi-document YAML (or JSON) manifest. Empty documents are skipped.
pub fn parse_manifests(yaml: &str) -> Result<Vec<Document>> {
    if yaml.len() > max_yaml_bytes() {
        return Err(anyhow!("manifest too large (>{} bytes)", max_yaml_bytes()));
    }
    let mut out = Vec::new();
    for (i, de) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let val = serde_yaml::Value::deserialize(de).with_context(|| format!("parsing YAML document #{}", i))?;
        if val.is_null() { continue; }
        let json = serde_json::to_value(val).with_context(|| format!("converting YAML document #{} to JSON", i))?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document #{} too complex (>{} nodes)", i, max_yaml_nodes()));
        }
        if json.get("kind").and_then(|v| v.as_str()).is_none() {
            return Err(anyhow!("YAML document #{} missing kind", i));
        }
        if json.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).is_none() {
            return Err(anyhow!("YAML document #{} missing metadata.name", i));
        }
        out.push(Document::from(json));
    }
    Ok(out)
}

/// Source of reference manifests used as the base body when recreating objects.
#[async_trait::async_trait]
pub trait TemplateSource: Send + Sync {
    async fn load(&self, path: &str) -> FleetResult<Vec<Document>>;
}

/// Reads manifests from disk, relative paths resolved against `root`.
#[derive(Debug, Clone, Default)]
pub struct FileTemplates {
    root: Option<PathBuf>,
}

impl FileTemplates {
    pub fn new() -> Self { Self::default() }
    pub fn with_root(root: impl Into<PathBuf>) -> Self { Self { root: Some(root.into()) } }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) if !std::path::Path::new(path).is_absolute() => root.join(path),
            _ => PathBuf::from(path),
        }
    }
}

#[async_trait::async_trait]
impl TemplateSource for FileTemplates {
    async fn load(&self, path: &str) -> FleetResult<Vec<Document>> {
        let t0 = std::time::Instant::now();
        let full = self.resolve(path);
        let text = tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| FleetError::Template(format!("reading {}: {}", full.display(), e)))?;
        let docs = parse_manifests(&text).map_err(|e| FleetError::Template(format!("{}: {:#}", full.display(), e)))?;
        histogram!("template_load_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(path = %full.display(), documents = docs.len(), "template loaded");
        Ok(docs)
    }
}

/// Templates held in memory, keyed by path.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    files: HashMap<String, String>,
}

impl StaticTemplates {
    pub fn new() -> Self { Self::default() }

    pub fn with(mut self, path: impl Into<String>, yaml: impl Into<String>) -> Self {
        self.files.insert(path.into(), yaml.into());
        self
    }
}

#[async_trait::async_trait]
impl TemplateSource for StaticTemplates {
    async fn load(&self, path: &str) -> FleetResult<Vec<Document>> {
        let yaml = self.files.get(path).ok_or_else(|| FleetError::Template(format!("no template at {}", path)))?;
        parse_manifests(yaml).map_err(|e| FleetError::Template(format!("{}: {:#}", path, e)))
    }
}

/// Locate the sub-document for `target`: same kind and name, and same namespace when both carry one.
pub fn find_by_identity<'a>(docs: &'a [Document], target: &ResourceRef) -> Option<&'a Document> {
    let found = docs.iter().find(|d| {
        d.kind() == Some(target.kind.as_str())
            && d.name() == Some(target.name.as_str())
            && match (d.namespace(), target.namespace.as_deref()) {
                (Some(a), Some(b)) if target.kind.namespaced() => a == b,
                _ => true,
            }
    });
    if found.is_none() {
        counter!("template_miss_total", 1u64);
        debug!(target_ref = %target, candidates = docs.len(), "no template document matches");
    }
    found
}

/// Drop server-populated fields so a body can be submitted as a create.
pub fn strip_server_fields(doc: &mut Document) {
    for key in ["managedFields", "resourceVersion", "uid", "generation", "creationTimestamp", "deletionTimestamp", "selfLink"] {
        doc.remove_at(&["metadata", key]);
    }
    doc.remove_at(&["status"]);
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary { pub adds: usize, pub updates: usize, pub removes: usize }

pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, adds: &mut usize, ups: &mut usize, rems: &mut usize) {
        use serde_json::Value as V;
        match (a, b) {
            (V::Object(ao), V::Object(bo)) => {
                for (k, av) in ao.iter() {
                    if let Some(bv) = bo.get(k) {
                        if av == bv { continue; }
                        walk(av, bv, adds, ups, rems);
                    } else {
                        *adds += 1;
                    }
                }
                for (k, _bv) in bo.iter() {
                    if !ao.contains_key(k) { *rems += 1; }
                }
            }
            (V::Array(aa), V::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                for i in 0..min_len { if aa[i] != bb[i] { *ups += 1; } }
                if aa.len() > bb.len() { *adds += aa.len() - bb.len(); }
                if bb.len() > aa.len() { *rems += bb.len() - aa.len(); }
            }
            (av, bv) => { if av != bv { *ups += 1; } }
        }
    }
    let mut adds = 0usize; let mut ups = 0usize; let mut rems = 0usize;
    walk(target, base, &mut adds, &mut ups, &mut rems);
    DiffSummary { adds, updates: ups, removes: rems }
}
