//! Custom resource definitions need preparation before the backend takes
//! them: conversion webhooks point at services that do not exist, and
//! bundles from older clusters carry `apiextensions.k8s.io/v1beta1`
//! definitions newer servers no longer serve.

use hindsight_core::{Document, FieldPath, TypeIdentity};
use serde_json::{json, Map, Value as Json};
use tracing::{info, warn};

pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const CRD_V1: &str = "apiextensions.k8s.io/v1";
pub const CRD_V1BETA1: &str = "apiextensions.k8s.io/v1beta1";

#[derive(Debug, thiserror::Error)]
pub enum CrdError {
    #[error("definition {name} has no spec")]
    MissingSpec { name: String },
    #[error("definition {name} declares no versions")]
    NoVersions { name: String },
    #[error(transparent)]
    Path(#[from] hindsight_core::PathError),
}

fn spec_mut<'a>(doc: &'a mut Document, name: &str) -> Result<&'a mut Map<String, Json>, CrdError> {
    doc.as_map_mut()
        .get_mut("spec")
        .and_then(Json::as_object_mut)
        .ok_or_else(|| CrdError::MissingSpec { name: name.to_string() })
}

/// Fills in missing type identity and disables conversion webhooks.
pub fn prepare(doc: &mut Document) -> Result<(), CrdError> {
    if doc.kind().is_empty() {
        let legacy = doc.get(&FieldPath::parse("spec.preserveUnknownFields")) == Some(&Json::Bool(true));
        let api_version = if legacy {
            info!(name = %doc.name(), "definition assumed v1beta1 since it preserves unknown fields");
            CRD_V1BETA1
        } else {
            CRD_V1
        };
        doc.set_type_identity(&TypeIdentity::new(api_version, CRD_KIND));
    }
    for field in ["spec.conversion.webhook", "spec.conversion.webhookClientConfig", "spec.conversion.conversionReviewVersions"] {
        doc.remove(&FieldPath::parse(field))?;
    }
    doc.set(&FieldPath::parse("spec.conversion.strategy"), Json::String("None".into()))?;
    Ok(())
}

pub fn is_legacy(doc: &Document) -> bool {
    doc.api_version() == CRD_V1BETA1 && doc.kind() == CRD_KIND
}

/// Whether the definition was flagged by the server it came from as having
/// a non-structural schema.
pub fn has_non_structural_schema(doc: &Document) -> bool {
    let Some(conditions) = doc.get(&FieldPath::parse("status.conditions")).and_then(Json::as_array) else {
        return false;
    };
    conditions
        .iter()
        .find(|c| c.get("type").and_then(Json::as_str) == Some("NonStructuralSchema"))
        .and_then(|c| c.get("status").and_then(Json::as_str))
        == Some("True")
}

/// Stops the backend from pruning unknown fields of every served version.
pub fn relax_pruning(doc: &mut Document) -> Result<(), CrdError> {
    let name = doc.name().to_string();
    let spec = spec_mut(doc, &name)?;
    if let Some(versions) = spec.get_mut("versions").and_then(Json::as_array_mut) {
        for v in versions.iter_mut().filter_map(Json::as_object_mut) {
            let schema = v
                .entry("schema")
                .or_insert_with(|| json!({}))
                .as_object_mut()
                .ok_or_else(|| CrdError::MissingSpec { name: name.clone() })?;
            let root = schema.entry("openAPIV3Schema").or_insert_with(|| json!({ "type": "object" }));
            if let Some(root) = root.as_object_mut() {
                root.insert("x-kubernetes-preserve-unknown-fields".into(), Json::Bool(true));
            }
        }
    }
    spec.insert("preserveUnknownFields".into(), Json::Bool(false));
    Ok(())
}

fn convert_columns(columns: &Json) -> Json {
    let Some(columns) = columns.as_array() else { return columns.clone() };
    Json::Array(
        columns
            .iter()
            .map(|c| {
                let mut c = c.clone();
                if let Some(obj) = c.as_object_mut() {
                    if let Some(path) = obj.remove("JSONPath") {
                        obj.insert("jsonPath".into(), path);
                    }
                }
                c
            })
            .collect(),
    )
}

/// Rewrites a `v1beta1` definition into the `v1` schema. Per-definition
/// settings (`validation`, `subresources`, `additionalPrinterColumns`)
/// become per-version settings.
pub fn convert_to_v1(mut doc: Document) -> Result<Document, CrdError> {
    let name = doc.name().to_string();
    let spec = spec_mut(&mut doc, &name)?;

    let legacy_version = spec.remove("version");
    let validation = spec.remove("validation");
    let subresources = spec.remove("subresources");
    let columns = spec.remove("additionalPrinterColumns");
    let preserve_unknown = spec.remove("preserveUnknownFields") == Some(Json::Bool(true));

    let mut versions = match spec.remove("versions") {
        Some(Json::Array(v)) if !v.is_empty() => v,
        _ => match legacy_version.as_ref().and_then(Json::as_str) {
            Some(v) => vec![json!({ "name": v, "served": true, "storage": true })],
            None => return Err(CrdError::NoVersions { name }),
        },
    };
    for v in versions.iter_mut().filter_map(Json::as_object_mut) {
        if !v.contains_key("schema") {
            if let Some(validation) = &validation {
                v.insert("schema".into(), validation.clone());
            }
        }
        if !v.contains_key("subresources") {
            if let Some(sub) = &subresources {
                v.insert("subresources".into(), sub.clone());
            }
        }
        let own_columns = v.remove("additionalPrinterColumns");
        if let Some(cols) = own_columns.as_ref().or(columns.as_ref()) {
            v.insert("additionalPrinterColumns".into(), convert_columns(cols));
        }
    }
    spec.insert("versions".into(), Json::Array(versions));
    spec.insert("conversion".into(), json!({ "strategy": "None" }));
    spec.insert("preserveUnknownFields".into(), Json::Bool(false));
    doc.set_type_identity(&TypeIdentity::new(CRD_V1, CRD_KIND));

    // v1 requires a schema on every version.
    let missing_schema = doc
        .get(&FieldPath::parse("spec.versions"))
        .and_then(Json::as_array)
        .map(|vs| vs.iter().any(|v| v.get("schema").is_none()))
        .unwrap_or(false);
    if preserve_unknown || missing_schema {
        if missing_schema {
            warn!(name = %name, "converted definition had no schema; allowing arbitrary fields");
        }
        relax_pruning(&mut doc)?;
    }
    Ok(doc)
}

/// `group/version` strings the definition makes the backend serve.
pub fn served_api_versions(doc: &Document) -> Vec<String> {
    let Some(group) = doc.get(&FieldPath::parse("spec.group")).and_then(Json::as_str).filter(|g| !g.is_empty()) else {
        return Vec::new();
    };
    let mut versions: Vec<&str> = doc
        .get(&FieldPath::parse("spec.versions"))
        .and_then(Json::as_array)
        .map(|vs| vs.iter().filter_map(|v| v.get("name")?.as_str()).collect())
        .unwrap_or_default();
    if let Some(legacy) = doc.get(&FieldPath::parse("spec.version")).and_then(Json::as_str) {
        if !versions.contains(&legacy) {
            versions.push(legacy);
        }
    }
    versions.into_iter().map(|v| format!("{}/{}", group, v)).collect()
}
