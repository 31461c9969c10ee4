//! hindsight rewrite engine.
//!
//! A rewriter prepares an object loaded from a bundle so the backend accepts
//! it (`before_import`) and undoes that preparation on the way back out of
//! the proxy (`before_serving`). Values removed on import are parked in
//! reserved `hindsight/<field.path>` annotations, JSON-encoded so that the
//! original type survives the trip.

#![forbid(unsafe_code)]

use std::sync::Arc;

use hindsight_core::{annotation_key, Document, FieldPath, PathError};
use serde_json::Value as Json;

mod compose;
mod namespace;

pub use compose::{match_type, Condition, Sequence, When};
pub use namespace::TerminatingNamespace;

#[derive(Debug, thiserror::Error)]
pub enum RewriteError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("annotation {key} holds malformed value: {source}")]
    MalformedAnnotation {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding {field}: {source}")]
    Encode {
        field: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Two-sided transformation applied to every imported and served object.
pub trait ResourceRewriter: Send + Sync {
    /// Invoked before the object is created in the backend.
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError>;

    /// Invoked on every object that passes the proxy (get, list, watch).
    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError>;
}

impl<R: ResourceRewriter + ?Sized> ResourceRewriter for Box<R> {
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError> {
        (**self).before_import(doc)
    }
    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError> {
        (**self).before_serving(doc)
    }
}

impl<R: ResourceRewriter + ?Sized> ResourceRewriter for Arc<R> {
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError> {
        (**self).before_import(doc)
    }
    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError> {
        (**self).before_serving(doc)
    }
}

/// Removes a field on import and restores it on serving.
#[derive(Debug, Clone)]
pub struct RemoveField {
    path: FieldPath,
    annotation: String,
}

impl RemoveField {
    pub fn new(dotted: &str) -> Self {
        let path = FieldPath::parse(dotted);
        let annotation = annotation_key(&path.dotted());
        Self { path, annotation }
    }

    pub fn annotation(&self) -> &str {
        &self.annotation
    }
}

impl ResourceRewriter for RemoveField {
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError> {
        let Some(value) = doc.remove(&self.path)? else { return Ok(()) };
        let encoded = serde_json::to_string(&value)
            .map_err(|source| RewriteError::Encode { field: self.path.dotted(), source })?;
        doc.set_annotation(&self.annotation, encoded)?;
        Ok(())
    }

    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError> {
        let Some(raw) = doc.annotation(&self.annotation)? else { return Ok(()) };
        let value: Json = serde_json::from_str(raw)
            .map_err(|source| RewriteError::MalformedAnnotation { key: self.annotation.clone(), source })?;
        doc.set(&self.path, value)?;
        doc.remove_annotation(&self.annotation);
        Ok(())
    }
}

fn boxed<R: ResourceRewriter + 'static>(r: R) -> Box<dyn ResourceRewriter> {
    Box::new(r)
}

/// Metadata the API server generates on write.
/// See <https://kubernetes.io/docs/reference/using-api/api-concepts/#generated-values>.
pub fn generated_values() -> Sequence {
    Sequence::new(
        [
            "metadata.generateName",
            "metadata.creationTimestamp",
            "metadata.deletionTimestamp",
            "metadata.deletionGracePeriodSeconds",
            "metadata.uid",
            "metadata.resourceVersion",
        ]
        .into_iter()
        .map(|f| boxed(RemoveField::new(f)))
        .collect(),
    )
}

/// Pod fields that reference cluster state the backend does not have.
pub fn pod_scheduling_fields() -> When {
    When::new(
        match_type("v1", "Pod"),
        Sequence::new(vec![
            boxed(RemoveField::new("spec.priority")),
            boxed(RemoveField::new("spec.priorityClassName")),
            boxed(RemoveField::new("spec.runtimeClassName")),
        ]),
    )
}

pub fn ingress_class() -> When {
    When::new(match_type("networking.k8s.io/v1", "Ingress"), RemoveField::new("spec.ingressClassName"))
}

/// Rewriter covering the changes needed to import and serve a typical bundle.
pub fn default_rewriter() -> Sequence {
    Sequence::new(vec![
        boxed(generated_values()),
        boxed(When::new(match_type("v1", "Namespace"), TerminatingNamespace)),
        boxed(pod_scheduling_fields()),
        boxed(ingress_class()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(meta: Json) -> Document {
        Document::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": meta,
            "spec": { "containers": [] }
        }))
        .unwrap()
    }

    #[test]
    fn remove_field_round_trips_every_json_type() {
        let values = [
            json!("1000"),
            json!(30),
            json!(1.5),
            json!(true),
            json!(null),
            json!({ "nested": ["a", 1] }),
        ];
        let rule = RemoveField::new("metadata.resourceVersion");
        for v in values {
            let original = pod(json!({ "name": "p", "resourceVersion": v.clone() }));
            let mut d = original.clone();
            rule.before_import(&mut d).unwrap();
            assert_eq!(d.get(&FieldPath::parse("metadata.resourceVersion")), None);
            let stored = d.annotation(rule.annotation()).unwrap().unwrap();
            assert_eq!(serde_json::from_str::<Json>(stored).unwrap(), v);

            rule.before_serving(&mut d).unwrap();
            assert_eq!(d, original, "round trip of {}", v);
        }
    }

    #[test]
    fn remove_field_absent_is_noop() {
        let original = pod(json!({ "name": "p" }));
        let mut d = original.clone();
        let rule = RemoveField::new("metadata.uid");
        rule.before_import(&mut d).unwrap();
        assert_eq!(d, original);
        rule.before_serving(&mut d).unwrap();
        assert_eq!(d, original);
    }

    #[test]
    fn serving_without_annotation_keeps_live_value() {
        let mut d = pod(json!({ "name": "p", "resourceVersion": "1000" }));
        RemoveField::new("metadata.resourceVersion").before_serving(&mut d).unwrap();
        assert_eq!(d.get(&FieldPath::parse("metadata.resourceVersion")), Some(&json!("1000")));
    }

    #[test]
    fn malformed_annotation_is_reported() {
        let mut d = pod(json!({
            "name": "p",
            "annotations": { "hindsight/metadata.uid": "{not json" }
        }));
        let err = RemoveField::new("metadata.uid").before_serving(&mut d).unwrap_err();
        assert!(matches!(err, RewriteError::MalformedAnnotation { .. }), "err={}", err);
    }

    #[test]
    fn generated_values_keep_user_annotations() {
        let mut d = pod(json!({
            "name": "p",
            "generateName": "p-",
            "creationTimestamp": "2023-01-01T00:00:00Z",
            "deletionGracePeriodSeconds": 30,
            "uid": "1000",
            "resourceVersion": "2000",
            "annotations": { "team": "storage" }
        }));
        let original = d.clone();
        let r = generated_values();
        r.before_import(&mut d).unwrap();
        let meta = d.as_map()["metadata"].as_object().unwrap();
        for f in ["generateName", "creationTimestamp", "deletionGracePeriodSeconds", "uid", "resourceVersion"] {
            assert!(!meta.contains_key(f), "{} still present", f);
        }
        assert_eq!(d.annotation("hindsight/metadata.deletionGracePeriodSeconds").unwrap(), Some("30"));
        assert_eq!(d.annotation("team").unwrap(), Some("storage"));

        r.before_serving(&mut d).unwrap();
        assert_eq!(d, original);
    }

    #[test]
    fn default_rewriter_strips_pod_scheduling_fields_only_for_pods() {
        let r = default_rewriter();
        let mut p = pod(json!({ "name": "p" }));
        p.set(&FieldPath::parse("spec.priorityClassName"), json!("high")).unwrap();
        p.set(&FieldPath::parse("spec.priority"), json!(1000)).unwrap();
        r.before_import(&mut p).unwrap();
        assert_eq!(p.get(&FieldPath::parse("spec.priorityClassName")), None);
        assert_eq!(p.get(&FieldPath::parse("spec.priority")), None);

        let mut rs = Document::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "metadata": { "name": "rs" },
            "spec": { "template": {}, "priorityClassName": "high" }
        }))
        .unwrap();
        r.before_import(&mut rs).unwrap();
        assert_eq!(rs.get(&FieldPath::parse("spec.priorityClassName")), Some(&json!("high")));
    }

    #[test]
    fn default_rewriter_strips_ingress_class() {
        let original = Document::from_value(json!({
            "apiVersion": "networking.k8s.io/v1",
            "kind": "Ingress",
            "metadata": { "name": "web", "namespace": "shop", "uid": "u-1" },
            "spec": { "ingressClassName": "nginx", "rules": [] }
        }))
        .unwrap();
        let mut d = original.clone();
        let r = default_rewriter();
        r.before_import(&mut d).unwrap();
        assert_eq!(d.get(&FieldPath::parse("spec.ingressClassName")), None);
        r.before_serving(&mut d).unwrap();
        assert_eq!(d, original);
    }
}
