//! Type inference for bundle files whose items carry no type metadata.

use std::path::{Component, Path};

use glob::{MatchOptions, Pattern, PatternError};
use hindsight_core::TypeIdentity;

/// `*` stays within one path segment.
const MATCH: MatchOptions =
    MatchOptions { case_sensitive: true, require_literal_separator: true, require_literal_leading_dot: false };

/// Maps a glob, relative to the cluster resources directory, to a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRule {
    pub pattern: Pattern,
    pub type_identity: TypeIdentity,
}

impl InferenceRule {
    pub fn new(pattern: &str, api_version: &str, kind: &str) -> Result<Self, PatternError> {
        Ok(Self { pattern: Pattern::new(pattern)?, type_identity: TypeIdentity::new(api_version, kind) })
    }

    /// Whether `relative`, a `/`-separated path, matches this rule.
    pub fn matches(&self, relative: &str) -> bool {
        self.pattern.matches_with(relative, MATCH)
    }
}

pub fn default_inference_rules() -> Vec<InferenceRule> {
    [
        ("cronjobs/*.json", "batch/v1", "CronJob"),
        ("deployments/*.json", "apps/v1", "Deployment"),
        ("events/*.json", "v1", "Event"),
        ("ingress/*.json", "networking.k8s.io/v1", "Ingress"),
        ("jobs/*.json", "batch/v1", "Job"),
        ("limitranges/*.json", "v1", "LimitRange"),
        ("nodes.json", "v1", "Node"),
        ("pods/*.json", "v1", "Pod"),
        ("pvcs/*.json", "v1", "PersistentVolumeClaim"),
        ("pvs.json", "v1", "PersistentVolume"),
        ("replicasets/*.json", "apps/v1", "ReplicaSet"),
        ("services/*.json", "v1", "Service"),
        ("statefulsets/*.json", "apps/v1", "StatefulSet"),
        ("storage-classes.json", "storage.k8s.io/v1", "StorageClass"),
    ]
    .into_iter()
    .map(|(p, av, k)| InferenceRule::new(p, av, k).expect("static inference pattern is valid"))
    .collect()
}

/// First rule matching `relative`, a path below the cluster resources directory.
pub fn infer_type(rules: &[InferenceRule], relative: &Path) -> Option<TypeIdentity> {
    let parts: Vec<&str> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .collect();
    let joined = parts.join("/");
    rules.iter().find(|r| r.matches(&joined)).map(|r| r.type_identity.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str) -> InferenceRule {
        InferenceRule::new(pattern, "v1", "Pod").unwrap()
    }

    #[test]
    fn star_stays_within_segment() {
        assert!(rule("pods/*.json").matches("pods/default.json"));
        assert!(!rule("pods/*.json").matches("pods/logs/default.json"));
        assert!(!rule("pods/*.json").matches("pods/default.yaml"));
        assert!(rule("nodes.json").matches("nodes.json"));
        assert!(!rule("nodes.json").matches("x/nodes.json"));
        assert!(rule("a*b*c").matches("aXXbYc"));
        assert!(!rule("Pods/*.json").matches("pods/default.json"));
    }

    #[test]
    fn character_classes_and_recursion() {
        assert!(rule("pods/[a-c]*.json").matches("pods/billing.json"));
        assert!(!rule("pods/[a-c]*.json").matches("pods/shop.json"));
        assert!(rule("custom-resources/**/*.json").matches("custom-resources/widgets.example.com/shop.json"));
        assert!(InferenceRule::new("pods/[.json", "v1", "Pod").is_err());
    }

    #[test]
    fn default_table() {
        let rules = default_inference_rules();
        let cases = [
            ("cronjobs/default.json", Some(("batch/v1", "CronJob"))),
            ("deployments/shop.json", Some(("apps/v1", "Deployment"))),
            ("events/kube-system.json", Some(("v1", "Event"))),
            ("ingress/shop.json", Some(("networking.k8s.io/v1", "Ingress"))),
            ("jobs/shop.json", Some(("batch/v1", "Job"))),
            ("limitranges/shop.json", Some(("v1", "LimitRange"))),
            ("nodes.json", Some(("v1", "Node"))),
            ("pods/shop.json", Some(("v1", "Pod"))),
            ("pvcs/shop.json", Some(("v1", "PersistentVolumeClaim"))),
            ("pvs.json", Some(("v1", "PersistentVolume"))),
            ("replicasets/shop.json", Some(("apps/v1", "ReplicaSet"))),
            ("services/shop.json", Some(("v1", "Service"))),
            ("statefulsets/shop.json", Some(("apps/v1", "StatefulSet"))),
            ("storage-classes.json", Some(("storage.k8s.io/v1", "StorageClass"))),
            ("custom-resources/widgets.example.com/shop.json", None),
            ("pods/logs/shop/web-0/app.log", None),
        ];
        for (path, want) in cases {
            let got = infer_type(&rules, Path::new(path));
            assert_eq!(got, want.map(|(av, k)| TypeIdentity::new(av, k)), "{}", path);
        }
    }
}
