//! Tree-shaped resource bodies.
//!
//! A `Document` is the closed sum of mapping, sequence and scalar. Mappings keep
//! insertion order so that rendered manifests stay readable after a merge.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Document {
    Map(IndexMap<String, Document>),
    Seq(Vec<Document>),
    Scalar(Scalar),
}

impl Default for Document {
    fn default() -> Self { Document::Map(IndexMap::new()) }
}

impl Document {
    pub fn null() -> Self { Document::Scalar(Scalar::Null) }

    pub fn string(s: impl Into<String>) -> Self { Document::Scalar(Scalar::String(s.into())) }

    /// Human label for the node shape, used in mismatch errors.
    pub fn shape(&self) -> &'static str {
        match self {
            Document::Map(_) => "mapping",
            Document::Seq(_) => "sequence",
            Document::Scalar(Scalar::Null) => "null",
            Document::Scalar(_) => "scalar",
        }
    }

    pub fn is_container(&self) -> bool { matches!(self, Document::Map(_) | Document::Seq(_)) }

    pub fn is_null(&self) -> bool { matches!(self, Document::Scalar(Scalar::Null)) }

    pub fn as_map(&self) -> Option<&IndexMap<String, Document>> {
        match self { Document::Map(m) => Some(m), _ => None }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut IndexMap<String, Document>> {
        match self { Document::Map(m) => Some(m), _ => None }
    }

    pub fn as_seq(&self) -> Option<&[Document]> {
        match self { Document::Seq(s) => Some(s), _ => None }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self { Document::Scalar(Scalar::String(s)) => Some(s), _ => None }
    }

    pub fn get(&self, key: &str) -> Option<&Document> { self.as_map().and_then(|m| m.get(key)) }

    /// Walk a path of mapping keys (sequence elements addressed by decimal index).
    pub fn at(&self, path: &[&str]) -> Option<&Document> {
        let mut cur = self;
        for seg in path {
            cur = match cur {
                Document::Map(m) => m.get(*seg)?,
                Document::Seq(s) => s.get(seg.parse::<usize>().ok()?)?,
                Document::Scalar(_) => return None,
            };
        }
        Some(cur)
    }

    pub fn str_at(&self, path: &[&str]) -> Option<&str> { self.at(path).and_then(Document::as_str) }

    /// Dotted-path lookup, e.g. `result.evaluation`.
    pub fn dotted(&self, path: &str) -> Option<&Document> {
        let segs: Vec<&str> = path.split('.').collect();
        self.at(&segs)
    }

    /// Set a value below nested mappings, creating (or replacing null/scalar) parents as needed.
    pub fn set_at(&mut self, path: &[&str], value: Document) {
        let Some((last, parents)) = path.split_last() else { *self = value; return; };
        let mut cur = self;
        for seg in parents {
            if !matches!(cur, Document::Map(_)) { *cur = Document::default(); }
            let Document::Map(m) = cur else { return };
            cur = m.entry((*seg).to_string()).or_insert_with(Document::default);
        }
        if !matches!(cur, Document::Map(_)) { *cur = Document::default(); }
        if let Document::Map(m) = cur { m.insert((*last).to_string(), value); }
    }

    /// Remove a key below nested mappings; returns the removed node.
    pub fn remove_at(&mut self, path: &[&str]) -> Option<Document> {
        let (last, parents) = path.split_last()?;
        let mut cur = self;
        for seg in parents {
            cur = cur.as_map_mut()?.get_mut(*seg)?;
        }
        cur.as_map_mut()?.shift_remove(*last)
    }

    pub fn kind(&self) -> Option<&str> { self.str_at(&["kind"]) }
    pub fn name(&self) -> Option<&str> { self.str_at(&["metadata", "name"]) }
    pub fn namespace(&self) -> Option<&str> { self.str_at(&["metadata", "namespace"]) }
    pub fn phase(&self) -> Option<&str> { self.str_at(&["status", "phase"]) }

    /// Render a scalar as an opaque token (strings verbatim, numbers/bools via JSON).
    pub fn scalar_token(&self) -> Option<String> {
        match self {
            Document::Scalar(Scalar::String(s)) => Some(s.clone()),
            Document::Scalar(Scalar::Number(n)) => Some(n.to_string()),
            Document::Scalar(Scalar::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Json {
        match self {
            Document::Map(m) => Json::Object(m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect()),
            Document::Seq(s) => Json::Array(s.iter().map(Document::to_json).collect()),
            Document::Scalar(Scalar::Null) => Json::Null,
            Document::Scalar(Scalar::Bool(b)) => Json::Bool(*b),
            Document::Scalar(Scalar::Number(n)) => Json::Number(n.clone()),
            Document::Scalar(Scalar::String(s)) => Json::String(s.clone()),
        }
    }
}

impl From<Json> for Document {
    fn from(v: Json) -> Self {
        match v {
            Json::Object(m) => Document::Map(m.into_iter().map(|(k, v)| (k, Document::from(v))).collect()),
            Json::Array(a) => Document::Seq(a.into_iter().map(Document::from).collect()),
            Json::Null => Document::Scalar(Scalar::Null),
            Json::Bool(b) => Document::Scalar(Scalar::Bool(b)),
            Json::Number(n) => Document::Scalar(Scalar::Number(n)),
            Json::String(s) => Document::Scalar(Scalar::String(s)),
        }
    }
}

impl From<&Document> for Json {
    fn from(d: &Document) -> Self { d.to_json() }
}

impl Serialize for Document {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { self.to_json().serialize(s) }
}

impl<'de> Deserialize<'de> for Document {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> { Json::deserialize(d).map(Document::from) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_keeps_key_order() {
        let v = json!({"z": 1, "a": {"y": [1, "two", null]}, "m": true});
        let d = Document::from(v.clone());
        let keys: Vec<_> = d.as_map().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
        assert_eq!(d.to_json(), v);
    }

    #[test]
    fn path_helpers_read_and_write() {
        let mut d = Document::from(json!({"kind": "Pod", "metadata": {"name": "p"}, "spec": {"containers": [{"image": "a"}]}}));
        assert_eq!(d.kind(), Some("Pod"));
        assert_eq!(d.name(), Some("p"));
        assert_eq!(d.namespace(), None);
        assert_eq!(d.str_at(&["spec", "containers", "0", "image"]), Some("a"));
        d.set_at(&["metadata", "labels", "app"], Document::string("x"));
        assert_eq!(d.dotted("metadata.labels.app").and_then(Document::as_str), Some("x"));
        assert!(d.remove_at(&["metadata", "labels"]).is_some());
        assert!(d.at(&["metadata", "labels"]).is_none());
    }

    #[test]
    fn scalar_tokens_render_numbers() {
        assert_eq!(Document::from(json!(42)).scalar_token().as_deref(), Some("42"));
        assert_eq!(Document::string("abc").scalar_token().as_deref(), Some("abc"));
        assert_eq!(Document::from(json!({})).scalar_token(), None);
    }
}
