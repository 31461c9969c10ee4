use hindsight_core::{annotation_key, Document, FieldPath};
use serde_json::Value as Json;

use crate::{ResourceRewriter, RewriteError};

const TERMINATING: &str = "Terminating";
const ACTIVE: &str = "Active";

/// Imports namespaces that were being deleted as `Active`, since the API
/// server refuses to create a namespace already in `Terminating` phase, and
/// reports the original phase again when serving.
///
/// Expected to be gated to `v1/Namespace` by the caller.
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminatingNamespace;

impl TerminatingNamespace {
    fn phase_path() -> FieldPath {
        FieldPath::parse("status.phase")
    }

    fn annotation() -> String {
        annotation_key("status.phase")
    }
}

impl ResourceRewriter for TerminatingNamespace {
    fn before_import(&self, doc: &mut Document) -> Result<(), RewriteError> {
        let path = Self::phase_path();
        if doc.get(&path).and_then(Json::as_str) != Some(TERMINATING) {
            return Ok(());
        }
        doc.set(&path, Json::String(ACTIVE.into()))?;
        doc.set_annotation(&Self::annotation(), TERMINATING)?;
        Ok(())
    }

    fn before_serving(&self, doc: &mut Document) -> Result<(), RewriteError> {
        let key = Self::annotation();
        let Some(phase) = doc.annotation(&key)?.map(str::to_string) else { return Ok(()) };
        doc.set(&Self::phase_path(), Json::String(phase))?;
        doc.remove_annotation(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{default_rewriter, match_type, When};

    fn namespace(phase: &str) -> Document {
        Document::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": "test", "deletionTimestamp": "2023-01-01T00:00:00Z" },
            "status": { "phase": phase }
        }))
        .unwrap()
    }

    #[test]
    fn terminating_namespace_is_imported_active_and_served_terminating() {
        let r = When::new(match_type("v1", "Namespace"), TerminatingNamespace);
        let mut ns = namespace("Terminating");
        r.before_import(&mut ns).unwrap();
        assert_eq!(ns.get(&FieldPath::parse("status.phase")), Some(&json!("Active")));
        assert_eq!(ns.annotation("hindsight/status.phase").unwrap(), Some("Terminating"));

        r.before_serving(&mut ns).unwrap();
        assert_eq!(ns.get(&FieldPath::parse("status.phase")), Some(&json!("Terminating")));
        assert_eq!(ns.annotation("hindsight/status.phase").unwrap(), None);
        assert_eq!(ns, namespace("Terminating"));
    }

    #[test]
    fn active_namespace_is_untouched() {
        let r = TerminatingNamespace;
        let mut ns = namespace("Active");
        r.before_import(&mut ns).unwrap();
        assert_eq!(ns, namespace("Active"));
        r.before_serving(&mut ns).unwrap();
        assert_eq!(ns, namespace("Active"));
    }

    #[test]
    fn default_rewriter_round_trips_terminating_namespace() {
        let r = default_rewriter();
        let original = namespace("Terminating");
        let mut ns = original.clone();
        r.before_import(&mut ns).unwrap();
        assert_eq!(ns.get(&FieldPath::parse("status.phase")), Some(&json!("Active")));
        assert_eq!(ns.get(&FieldPath::parse("metadata.deletionTimestamp")), None);
        r.before_serving(&mut ns).unwrap();
        assert_eq!(ns, original);
    }
}
