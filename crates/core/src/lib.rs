//! hindsight core types: untyped API documents, type identity and the
//! reserved annotation keys shared by the import and serving paths.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Prefix of every annotation key owned by hindsight itself.
pub const ANNOTATION_PREFIX: &str = "hindsight";

/// Reserved annotation key for a dotted field path, e.g. `hindsight/metadata.uid`.
pub fn annotation_key(field: &str) -> String {
    format!("{}/{}", ANNOTATION_PREFIX, field)
}

/// Longest error or reason text carried into summaries and format errors.
pub const MAX_MESSAGE_LEN: usize = 200;

/// Cuts `s` to at most [`MAX_MESSAGE_LEN`] bytes, on a char boundary.
pub fn truncate_message(mut s: String) -> String {
    if s.len() > MAX_MESSAGE_LEN {
        let mut cut = MAX_MESSAGE_LEN;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
    }
    s
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PathError {
    #[error("field {path}: {segment} is not an object")]
    NotAnObject { path: String, segment: String },
    #[error("annotation {key} is not a string")]
    NotAString { key: String },
}

/// `(apiVersion, kind)` pair. Either part may be empty on legacy bundle files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeIdentity {
    pub api_version: String,
    pub kind: String,
}

impl TypeIdentity {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.api_version.is_empty() || self.kind.is_empty()
    }

    /// API group; empty for the core group.
    pub fn group(&self) -> &str {
        self.api_version.split_once('/').map(|(g, _)| g).unwrap_or("")
    }

    pub fn version(&self) -> &str {
        self.api_version.split_once('/').map(|(_, v)| v).unwrap_or(&self.api_version)
    }
}

impl fmt::Display for TypeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// Dotted path into a document, e.g. `spec.priorityClassName`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn parse(dotted: &str) -> Self {
        Self(dotted.split('.').filter(|s| !s.is_empty()).map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn dotted(&self) -> String {
        self.0.join(".")
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dotted())
    }
}

/// One API object as an untyped JSON mapping.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Json>);

impl From<Map<String, Json>> for Document {
    fn from(m: Map<String, Json>) -> Self {
        Self(m)
    }
}

impl From<Document> for Json {
    fn from(d: Document) -> Self {
        Json::Object(d.0)
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts only JSON objects.
    pub fn from_value(v: Json) -> Option<Self> {
        match v {
            Json::Object(m) => Some(Self(m)),
            _ => None,
        }
    }

    pub fn as_map(&self) -> &Map<String, Json> {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut Map<String, Json> {
        &mut self.0
    }

    pub fn into_value(self) -> Json {
        Json::Object(self.0)
    }

    fn str_at(&self, path: &[&str]) -> &str {
        let mut cur = match self.0.get(path[0]) { Some(v) => v, None => return "" };
        for seg in &path[1..] {
            cur = match cur.get(*seg) { Some(v) => v, None => return "" };
        }
        cur.as_str().unwrap_or("")
    }

    pub fn api_version(&self) -> &str { self.str_at(&["apiVersion"]) }
    pub fn kind(&self) -> &str { self.str_at(&["kind"]) }
    pub fn name(&self) -> &str { self.str_at(&["metadata", "name"]) }

    pub fn namespace(&self) -> Option<&str> {
        Some(self.str_at(&["metadata", "namespace"])).filter(|s| !s.is_empty())
    }

    pub fn type_identity(&self) -> TypeIdentity {
        TypeIdentity::new(self.api_version(), self.kind())
    }

    pub fn set_type_identity(&mut self, ti: &TypeIdentity) {
        self.0.insert("apiVersion".into(), Json::String(ti.api_version.clone()));
        self.0.insert("kind".into(), Json::String(ti.kind.clone()));
    }

    /// `namespace/name`, or just `name` for cluster-scoped objects.
    pub fn object_key(&self) -> String {
        match self.namespace() {
            Some(ns) => format!("{}/{}", ns, self.name()),
            None => self.name().to_string(),
        }
    }

    /// Status payload when present and not empty.
    pub fn status(&self) -> Option<&Json> {
        match self.0.get("status") {
            None | Some(Json::Null) => None,
            Some(Json::Object(m)) if m.is_empty() => None,
            Some(v) => Some(v),
        }
    }

    pub fn get(&self, path: &FieldPath) -> Option<&Json> {
        let (first, rest) = path.segments().split_first()?;
        let mut cur = self.0.get(first)?;
        for seg in rest {
            cur = cur.as_object()?.get(seg)?;
        }
        Some(cur)
    }

    /// Removes the value at `path`. Missing intermediates mean nothing to remove.
    pub fn remove(&mut self, path: &FieldPath) -> Result<Option<Json>, PathError> {
        let Some((last, parents)) = path.segments().split_last() else { return Ok(None) };
        let mut cur = &mut self.0;
        for seg in parents {
            match cur.get_mut(seg) {
                None | Some(Json::Null) => return Ok(None),
                Some(Json::Object(m)) => cur = m,
                Some(_) => {
                    return Err(PathError::NotAnObject { path: path.dotted(), segment: seg.clone() })
                }
            }
        }
        Ok(cur.remove(last))
    }

    /// Writes `value` at `path`, creating intermediate objects (a `null`
    /// intermediate is replaced by an object).
    pub fn set(&mut self, path: &FieldPath, value: Json) -> Result<(), PathError> {
        let Some((last, parents)) = path.segments().split_last() else { return Ok(()) };
        let mut cur = &mut self.0;
        for seg in parents {
            let slot = cur.entry(seg.clone()).or_insert_with(|| Json::Object(Map::new()));
            if slot.is_null() {
                *slot = Json::Object(Map::new());
            }
            cur = match slot {
                Json::Object(m) => m,
                _ => return Err(PathError::NotAnObject { path: path.dotted(), segment: seg.clone() }),
            };
        }
        cur.insert(last.clone(), value);
        Ok(())
    }

    pub fn annotation(&self, key: &str) -> Result<Option<&str>, PathError> {
        let annotations = self.0.get("metadata").and_then(|m| m.get("annotations"));
        match annotations.and_then(|a| a.get(key)) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(PathError::NotAString { key: key.to_string() }),
        }
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) -> Result<(), PathError> {
        let mut path = FieldPath::parse("metadata.annotations");
        path.0.push(key.to_string());
        self.set(&path, Json::String(value.into()))
    }

    /// Removes an annotation; an annotation map left empty is dropped too.
    pub fn remove_annotation(&mut self, key: &str) -> Option<Json> {
        let meta = self.0.get_mut("metadata")?.as_object_mut()?;
        let annotations = meta.get_mut("annotations")?.as_object_mut()?;
        let removed = annotations.remove(key);
        if removed.is_some() && annotations.is_empty() {
            meta.remove("annotations");
        }
        removed
    }
}

pub mod prelude {
    pub use super::{annotation_key, truncate_message, Document, FieldPath, PathError, TypeIdentity, ANNOTATION_PREFIX};
}
