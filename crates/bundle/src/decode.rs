//! Resource decoding for the shapes collectors have written over time.
//!
//! JSON files are tried, in this order, as
//! 1. a typed list envelope (`{"kind": "PodList", "items": [...]}`),
//! 2. a bare array of objects without type metadata,
//! 3. an untyped `{"items": [...]}` wrapper.
//!
//! YAML files hold an array of typed objects.

use std::collections::BTreeMap;
use std::path::Path;

use hindsight_core::{truncate_message, Document};
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Deserialize;
use serde_json::{Map, Value as Json};

use crate::Bundle;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("unsupported data format: {path}")]
    UnsupportedFormat { path: String },
    #[error("{path}: no known layout matched: {reasons}")]
    UnknownLayout { path: String, reasons: String },
    #[error("{path}: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Objects of an `items` array; any non-object entry disqualifies the array.
fn object_items(items: &[Json]) -> Result<Vec<Map<String, Json>>, String> {
    items
        .iter()
        .enumerate()
        .map(|(i, v)| v.as_object().cloned().ok_or_else(|| format!("item {} is not an object", i)))
        .collect()
}

fn typed_list(root: &Json) -> Result<Vec<Document>, String> {
    let obj = root.as_object().ok_or("typed list: not an object")?;
    let kind = obj.get("kind").and_then(Json::as_str).unwrap_or("");
    if kind.is_empty() {
        return Err("typed list: kind is missing".into());
    }
    let items = match obj.get("items") {
        Some(Json::Array(items)) => object_items(items).map_err(|e| format!("typed list: {}", e))?,
        Some(Json::Null) => Vec::new(),
        _ => return Err(format!("typed list: {} has no items array", kind)),
    };
    // Items without type metadata take it from the envelope (`PodList` → `Pod`).
    let api_version = obj.get("apiVersion").and_then(Json::as_str).unwrap_or("");
    let item_kind = kind.strip_suffix("List").unwrap_or("");
    Ok(items
        .into_iter()
        .map(|mut m| {
            let untyped = m.get("kind").and_then(Json::as_str).map_or(true, str::is_empty)
                && m.get("apiVersion").and_then(Json::as_str).map_or(true, str::is_empty);
            if untyped && !item_kind.is_empty() && !api_version.is_empty() {
                m.insert("apiVersion".into(), Json::String(api_version.to_string()));
                m.insert("kind".into(), Json::String(item_kind.to_string()));
            }
            Document::from(m)
        })
        .collect())
}

fn bare_array(root: &Json) -> Result<Vec<Document>, String> {
    let items = root.as_array().ok_or("array: not an array")?;
    Ok(object_items(items).map_err(|e| format!("array: {}", e))?.into_iter().map(Document::from).collect())
}

fn untyped_items(root: &Json) -> Result<Vec<Document>, String> {
    match root.get("items") {
        Some(Json::Array(items)) => {
            Ok(object_items(items).map_err(|e| format!("items: {}", e))?.into_iter().map(Document::from).collect())
        }
        _ => Err("items: no items array".into()),
    }
}

/// Decodes file contents according to the file extension of `path`.
pub fn decode_documents(path: &Path, data: &[u8]) -> Result<Vec<Document>, DecodeError> {
    let display = path.display().to_string();
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => {
            let root: Json = serde_json::from_slice(data)
                .map_err(|e| DecodeError::UnknownLayout { path: display.clone(), reasons: truncate_message(e.to_string()) })?;
            let mut reasons = Vec::with_capacity(3);
            for shape in [typed_list, bare_array, untyped_items] {
                match shape(&root) {
                    Ok(docs) => return Ok(docs),
                    Err(reason) => reasons.push(truncate_message(reason)),
                }
            }
            Err(DecodeError::UnknownLayout { path: display, reasons: reasons.join("; ") })
        }
        Some("yaml") | Some("yml") => {
            let items: Vec<Map<String, Json>> =
                serde_yaml::from_slice(data).map_err(|source| DecodeError::Yaml { path: display, source })?;
            Ok(items.into_iter().map(Document::from).collect())
        }
        _ => Err(DecodeError::UnsupportedFormat { path: display }),
    }
}

/// Reads and decodes the resources stored in one bundle file. Items may lack
/// type identity; callers fill it in before routing.
pub fn load_resources(bundle: &dyn Bundle, path: &Path) -> Result<Vec<Document>, DecodeError> {
    let data = bundle.read(path).map_err(|source| DecodeError::Read { path: path.display().to_string(), source })?;
    decode_documents(path, &data)
}

/// Encoding collectors use for config maps and secrets. Secret data is never collected.
#[derive(Debug, Deserialize)]
struct CollectedConfig {
    name: String,
    namespace: String,
    #[serde(default)]
    data: Option<BTreeMap<String, String>>,
}

fn read_collected(bundle: &dyn Bundle, path: &Path) -> Result<CollectedConfig, DecodeError> {
    let display = path.display().to_string();
    let data = bundle.read(path).map_err(|source| DecodeError::Read { path: display.clone(), source })?;
    serde_json::from_slice(&data).map_err(|source| DecodeError::Json { path: display, source })
}

fn to_document<T: serde::Serialize>(path: &Path, obj: &T) -> Result<Document, DecodeError> {
    let v = serde_json::to_value(obj).map_err(|source| DecodeError::Json { path: path.display().to_string(), source })?;
    Document::from_value(v).ok_or_else(|| DecodeError::UnsupportedFormat { path: path.display().to_string() })
}

pub fn load_config_map(bundle: &dyn Bundle, path: &Path) -> Result<Document, DecodeError> {
    let c = read_collected(bundle, path)?;
    let cm = ConfigMap {
        metadata: ObjectMeta { name: Some(c.name), namespace: Some(c.namespace), ..Default::default() },
        data: c.data,
        ..Default::default()
    };
    to_document(path, &cm)
}

/// Loads a secret record. The result carries no data.
pub fn load_secret(bundle: &dyn Bundle, path: &Path) -> Result<Document, DecodeError> {
    let c = read_collected(bundle, path)?;
    let secret = Secret {
        metadata: ObjectMeta { name: Some(c.name), namespace: Some(c.namespace), ..Default::default() },
        ..Default::default()
    };
    to_document(path, &secret)
}
