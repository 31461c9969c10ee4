//! hindsight import: replays the contents of a support bundle into a backend.
//!
//! Stages run in a fixed order so that definitions and namespaces exist
//! before the objects that depend on them:
//! custom resource definitions, namespaces, the remaining cluster
//! resources, config maps, secrets.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hindsight_bundle::{
    data_file_for, is_errors_file, load_config_map, load_resources, load_secret, warn_on_errors_file, Bundle,
    DecodeError,
};
use hindsight_core::{annotation_key, truncate_message, Document, FieldPath, PathError, TypeIdentity};
use hindsight_kubehub::{
    default_inference_rules, infer_type, Backend, BackendError, InferenceRule, ResolveError, Resolved, Resolver,
};
use hindsight_rewrite::{ResourceRewriter, RewriteError};
use metrics::counter;
use serde::Serialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod crds;

/// Backoff for writes that lose a race with the backend's own controllers,
/// and for discovery of groups that definitions created moments ago.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, initial: Duration::from_millis(100), max: Duration::from_secs(2) }
    }
}

/// Static tables driving an import.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Types for files whose items carry no type metadata.
    pub inference: Vec<InferenceRule>,
    /// File names under the cluster resources directory never imported by the walk.
    pub skip_files: Vec<String>,
    /// Directories, relative to the cluster resources directory, not replayed.
    pub skip_dirs: Vec<PathBuf>,
    pub status_retry: RetryPolicy,
    /// Waits for the backend to start serving groups of imported definitions.
    pub discovery_retry: RetryPolicy,
}

pub const CRDS_FILE: &str = "custom-resource-definitions.json";
pub const NAMESPACES_FILE: &str = "namespaces.json";

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            inference: default_inference_rules(),
            skip_files: [CRDS_FILE, NAMESPACES_FILE, "resources.json", "groups.json", "pod-disruption-budgets-info.json"]
                .into_iter()
                .map(String::from)
                .collect(),
            skip_dirs: ["auth-cani-list", "pod-disruption-budgets", "pods/logs"].into_iter().map(PathBuf::from).collect(),
            status_retry: RetryPolicy::default(),
            discovery_retry: RetryPolicy { attempts: 6, initial: Duration::from_millis(250), max: Duration::from_secs(4) },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportFailure {
    pub path: String,
    /// `namespace/name` when the failure concerns a single object.
    pub object: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportSummary {
    pub created: usize,
    pub existing: usize,
    pub status_updated: usize,
    pub skipped_files: usize,
    pub failures: Vec<ImportFailure>,
}

impl fmt::Display for ImportSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} existing={} status_updated={} skipped_files={} failures={}",
            self.created,
            self.existing,
            self.status_updated,
            self.skipped_files,
            self.failures.len()
        )
    }
}

/// Errors that stop the whole import.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("{stage}: {source}")]
    Decode {
        stage: &'static str,
        #[source]
        source: DecodeError,
    },
    #[error("{stage}: {source}")]
    Resolve {
        stage: &'static str,
        #[source]
        source: ResolveError,
    },
    #[error("import cancelled")]
    Cancelled,
}

/// Errors confined to one object.
#[derive(Debug, thiserror::Error)]
enum ObjectError {
    #[error(transparent)]
    Rewrite(#[from] RewriteError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Crd(#[from] crds::CrdError),
    #[error("object has no name")]
    Unnamed,
    #[error("{op}: {source}")]
    Backend {
        op: &'static str,
        #[source]
        source: BackendError,
    },
}

fn backend_err(op: &'static str) -> impl FnOnce(BackendError) -> ObjectError {
    move |source| ObjectError::Backend { op, source }
}

enum Outcome {
    /// A failed status write does not undo the create.
    Created { status: Result<bool, ObjectError> },
    Existing,
}

/// Jobs carry the selector generated by their original API server; the
/// backend rejects an explicit selector unless it is marked manual.
pub fn mark_manual_selector(doc: &mut Document) -> Result<(), PathError> {
    if doc.kind() != "Job" {
        return Ok(());
    }
    let path = FieldPath::parse("spec.manualSelector");
    if doc.get(&path) == Some(&Json::Bool(true)) {
        return Ok(());
    }
    doc.set(&path, Json::Bool(true))?;
    doc.set_annotation(&annotation_key("added-spec.manualSelector"), "true")
}

/// Replays `bundle` into `backend`. Per-object and per-file problems are
/// collected in the summary; only foundational stages abort.
pub async fn import_bundle(
    bundle: &dyn Bundle,
    backend: &dyn Backend,
    rewriter: &dyn ResourceRewriter,
    config: &ImportConfig,
    cancel: CancellationToken,
) -> Result<ImportSummary, ImportError> {
    Importer {
        bundle,
        backend,
        rewriter,
        config,
        cancel,
        resolver: Resolver::new(),
        defined: HashSet::new(),
        summary: ImportSummary::default(),
    }
    .run()
    .await
}

struct Importer<'a> {
    bundle: &'a dyn Bundle,
    backend: &'a dyn Backend,
    rewriter: &'a dyn ResourceRewriter,
    config: &'a ImportConfig,
    cancel: CancellationToken,
    resolver: Resolver,
    /// API versions served by definitions imported in this run; discovery may
    /// lag behind their creation.
    defined: HashSet<String>,
    summary: ImportSummary,
}

impl<'a> Importer<'a> {
    async fn run(mut self) -> Result<ImportSummary, ImportError> {
        self.import_crds().await?;
        self.import_namespaces().await?;
        self.import_cluster_resources().await?;
        self.import_config_maps().await?;
        self.import_secrets().await?;
        info!(summary = %self.summary, "import finished");
        Ok(self.summary)
    }

    fn check_cancelled(&self) -> Result<(), ImportError> {
        if self.cancel.is_cancelled() {
            return Err(ImportError::Cancelled);
        }
        Ok(())
    }

    fn fail(&mut self, path: &Path, object: Option<String>, error: impl fmt::Display) {
        let error = truncate_message(error.to_string());
        warn!(path = %path.display(), object = object.as_deref().unwrap_or("-"), error = %error, "import failed");
        counter!("import_failures_total").increment(1);
        self.summary.failures.push(ImportFailure { path: path.display().to_string(), object, error });
    }

    fn skip_file(&mut self, path: &Path, error: impl fmt::Display) {
        self.summary.skipped_files += 1;
        self.fail(path, None, error);
    }

    fn cluster_file(&self, name: &str) -> PathBuf {
        self.bundle.layout().cluster_resources.join(name)
    }

    async fn import_crds(&mut self) -> Result<(), ImportError> {
        let path = self.cluster_file(CRDS_FILE);
        if !self.bundle.exists(&path) {
            warn_on_errors_file(self.bundle, &path);
            info!(path = %path.display(), "no custom resource definitions in bundle");
            return Ok(());
        }
        let docs = load_resources(self.bundle, &path).map_err(|source| {
            warn_on_errors_file(self.bundle, &path);
            ImportError::Decode { stage: "custom resource definitions", source }
        })?;
        info!(path = %path.display(), count = docs.len(), "importing custom resource definitions");
        for mut doc in docs {
            self.check_cancelled()?;
            let key = doc.object_key();
            if let Err(e) = crds::prepare(&mut doc) {
                self.fail(&path, Some(key), e);
                continue;
            }
            let served = crds::served_api_versions(&doc);
            let result = match self.resolver.resolve(self.backend, &doc.type_identity()).await {
                Ok(target) => self.import_crd(&target, doc).await,
                Err(e) if crds::is_legacy(&doc) => {
                    debug!(name = %key, error = %e, "legacy definition not served; converting to v1");
                    match crds::convert_to_v1(doc) {
                        Ok(converted) => self.import_crd(&crd_v1_target(), converted).await,
                        Err(e) => Err(e.into()),
                    }
                }
                Err(e) => {
                    self.fail(&path, Some(key), e);
                    continue;
                }
            };
            if result.is_ok() {
                for api_version in served {
                    self.resolver.invalidate(&api_version);
                    self.defined.insert(api_version);
                }
            }
            self.record(&path, key, result);
        }
        Ok(())
    }

    /// Resolves `ti`, waiting for discovery to catch up when its group was
    /// defined earlier in this run.
    async fn resolve(&mut self, ti: &TypeIdentity) -> Result<Resolved, ResolveError> {
        let policy = self.config.discovery_retry;
        let mut attempt = 0;
        loop {
            match self.resolver.resolve(self.backend, ti).await {
                Ok(target) => return Ok(target),
                Err(e) if self.defined.contains(&ti.api_version) && attempt + 1 < policy.attempts => {
                    let delay = policy.delay(attempt);
                    debug!(type_identity = %ti, attempt, delay_ms = delay.as_millis() as u64, error = %e, "definition not served yet; retrying discovery");
                    self.resolver.invalidate(&ti.api_version);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if self.defined.remove(&ti.api_version) {
                        warn!(api_version = %ti.api_version, "backend never served imported definition");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn import_crd(&mut self, target: &Resolved, mut doc: Document) -> Result<Outcome, ObjectError> {
        if crds::has_non_structural_schema(&doc) {
            warn!(name = %doc.name(), "definition was reported with a non-structural schema; unknown fields are preserved");
            crds::relax_pruning(&mut doc)?;
        }
        self.import_object(target, doc).await
    }

    async fn import_namespaces(&mut self) -> Result<(), ImportError> {
        const STAGE: &str = "namespaces";
        let path = self.cluster_file(NAMESPACES_FILE);
        let mut docs = load_resources(self.bundle, &path).map_err(|source| {
            warn_on_errors_file(self.bundle, &path);
            ImportError::Decode { stage: STAGE, source }
        })?;
        let Some(first) = docs.first_mut() else { return Ok(()) };
        if first.type_identity().is_empty() {
            for d in docs.iter_mut().filter(|d| d.type_identity().is_empty()) {
                d.set_type_identity(&TypeIdentity::new("v1", "Namespace"));
            }
        }
        let ti = docs[0].type_identity();
        let target = self
            .resolver
            .resolve(self.backend, &ti)
            .await
            .map_err(|source| ImportError::Resolve { stage: STAGE, source })?;
        info!(path = %path.display(), count = docs.len(), "importing namespaces");
        self.import_all(&path, &target, docs).await
    }

    fn skipped_by_config(&self, relative: &Path) -> bool {
        if self.config.skip_dirs.iter().any(|d| relative.starts_with(d)) {
            return true;
        }
        let name = relative.file_name().and_then(|n| n.to_str()).unwrap_or("");
        self.config.skip_files.iter().any(|s| s == name)
    }

    async fn import_cluster_resources(&mut self) -> Result<(), ImportError> {
        let root = self.bundle.layout().cluster_resources.clone();
        let files = match self.bundle.walk(&root) {
            Ok(files) => files,
            Err(e) => {
                self.skip_file(&root, e);
                return Ok(());
            }
        };
        for path in files {
            self.check_cancelled()?;
            let relative = path.strip_prefix(&root).unwrap_or(&path).to_path_buf();
            if self.skipped_by_config(&relative) {
                continue;
            }
            if is_errors_file(&path) {
                if data_file_for(&path).is_some_and(|data| !self.bundle.exists(&data)) {
                    warn!(errors_file = %path.display(), "collector failed to gather this resource; nothing to import");
                }
                continue;
            }
            warn_on_errors_file(self.bundle, &path);
            self.import_file(&path, &relative).await?;
        }
        Ok(())
    }

    async fn import_file(&mut self, path: &Path, relative: &Path) -> Result<(), ImportError> {
        let mut docs = match load_resources(self.bundle, path) {
            Ok(docs) => docs,
            Err(e) => {
                self.skip_file(path, e);
                return Ok(());
            }
        };
        if docs.is_empty() {
            return Ok(());
        }
        if docs[0].type_identity().is_empty() {
            let Some(ti) = infer_type(&self.config.inference, relative) else {
                self.skip_file(path, "items carry no type and none can be inferred from the file name");
                return Ok(());
            };
            for d in docs.iter_mut().filter(|d| d.type_identity().is_empty()) {
                d.set_type_identity(&ti);
            }
        }
        let target = match self.resolve(&docs[0].type_identity()).await {
            Ok(t) => t,
            Err(e) => {
                self.skip_file(path, e);
                return Ok(());
            }
        };
        info!(path = %path.display(), count = docs.len(), "importing objects");
        self.import_all(path, &target, docs).await
    }

    async fn import_config_maps(&mut self) -> Result<(), ImportError> {
        let dir = self.bundle.layout().config_maps.clone();
        self.import_fixed_schema(&dir, TypeIdentity::new("v1", "ConfigMap"), load_config_map).await
    }

    async fn import_secrets(&mut self) -> Result<(), ImportError> {
        let dir = self.bundle.layout().secrets.clone();
        self.import_fixed_schema(&dir, TypeIdentity::new("v1", "Secret"), load_secret).await
    }

    async fn import_fixed_schema(
        &mut self,
        dir: &Path,
        ti: TypeIdentity,
        load: fn(&dyn Bundle, &Path) -> Result<Document, DecodeError>,
    ) -> Result<(), ImportError> {
        let files = match self.bundle.walk(dir) {
            Ok(files) => files,
            Err(e) => {
                self.skip_file(dir, e);
                return Ok(());
            }
        };
        let files: Vec<PathBuf> =
            files.into_iter().filter(|p| p.extension().and_then(|e| e.to_str()) == Some("json")).collect();
        if files.is_empty() {
            return Ok(());
        }
        let target = match self.resolve(&ti).await {
            Ok(t) => t,
            Err(e) => {
                self.skip_file(dir, e);
                return Ok(());
            }
        };
        info!(dir = %dir.display(), kind = %ti.kind, count = files.len(), "importing");
        for path in files {
            self.check_cancelled()?;
            match load(self.bundle, &path) {
                Ok(doc) => self.import_all(&path, &target, vec![doc]).await?,
                Err(e) => self.skip_file(&path, e),
            }
        }
        Ok(())
    }

    async fn import_all(&mut self, path: &Path, target: &Resolved, docs: Vec<Document>) -> Result<(), ImportError> {
        for doc in docs {
            self.check_cancelled()?;
            let key = doc.object_key();
            let result = self.import_object(target, doc).await;
            self.record(path, key, result);
        }
        Ok(())
    }

    fn record(&mut self, path: &Path, key: String, result: Result<Outcome, ObjectError>) {
        match result {
            Ok(Outcome::Created { status }) => {
                self.summary.created += 1;
                counter!("import_objects_created_total").increment(1);
                match status {
                    Ok(true) => self.summary.status_updated += 1,
                    Ok(false) => {}
                    Err(e) => self.fail(path, Some(key), e),
                }
            }
            Ok(Outcome::Existing) => {
                self.summary.existing += 1;
                counter!("import_objects_existing_total").increment(1);
            }
            Err(e) => self.fail(path, Some(key), e),
        }
    }

    async fn import_object(&mut self, target: &Resolved, mut doc: Document) -> Result<Outcome, ObjectError> {
        self.rewriter.before_import(&mut doc)?;
        mark_manual_selector(&mut doc)?;
        if doc.name().is_empty() {
            return Err(ObjectError::Unnamed);
        }
        let existing = self.backend.get(target, doc.namespace(), doc.name()).await.map_err(backend_err("get"))?;
        if existing.is_some() {
            return Ok(Outcome::Existing);
        }
        match self.backend.create(target, &doc).await {
            Ok(_) => {}
            Err(BackendError::AlreadyExists) => return Ok(Outcome::Existing),
            Err(e) => return Err(backend_err("create")(e)),
        }
        let status = match doc.status() {
            Some(status) if target.has_status => {
                update_status(self.backend, target, &doc, status, self.config.status_retry).await.map(|()| true)
            }
            _ => Ok(false),
        };
        Ok(Outcome::Created { status })
    }
}

/// Fetches the freshly created object and writes the recorded status onto
/// it, retrying when the backend reports a write conflict.
async fn update_status(
    backend: &dyn Backend,
    target: &Resolved,
    doc: &Document,
    status: &Json,
    policy: RetryPolicy,
) -> Result<(), ObjectError> {
    let mut attempt = 0;
    loop {
        let mut current = backend
            .get(target, doc.namespace(), doc.name())
            .await
            .map_err(backend_err("get created object"))?
            .ok_or(ObjectError::Backend { op: "get created object", source: BackendError::NotFound })?;
        current.as_map_mut().insert("status".into(), status.clone());
        match backend.replace_status(target, &current).await {
            Ok(_) => return Ok(()),
            Err(e) if e.is_conflict() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                debug!(key = %doc.object_key(), attempt, delay_ms = delay.as_millis() as u64, "status conflict; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(backend_err("update status")(e)),
        }
    }
}

/// Target for definitions converted from `v1beta1`.
fn crd_v1_target() -> Resolved {
    Resolved {
        type_identity: TypeIdentity::new(crds::CRD_V1, crds::CRD_KIND),
        plural: "customresourcedefinitions".into(),
        namespaced: false,
        has_status: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(3), Duration::from_millis(800));
        assert_eq!(p.delay(5), Duration::from_secs(2));
        assert_eq!(p.delay(40), Duration::from_secs(2));
    }

    #[test]
    fn job_gets_manual_selector_once() {
        let mut job = Document::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "migrate" },
            "spec": { "selector": { "matchLabels": { "controller-uid": "x" } } }
        }))
        .unwrap();
        mark_manual_selector(&mut job).unwrap();
        assert_eq!(job.get(&FieldPath::parse("spec.manualSelector")), Some(&json!(true)));
        assert_eq!(job.annotation("hindsight/added-spec.manualSelector").unwrap(), Some("true"));

        let mut manual = Document::from_value(json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": { "name": "manual" },
            "spec": { "manualSelector": true }
        }))
        .unwrap();
        let before = manual.clone();
        mark_manual_selector(&mut manual).unwrap();
        assert_eq!(manual, before);
    }

    #[test]
    fn default_config_skips() {
        let cfg = ImportConfig::default();
        assert!(cfg.skip_files.iter().any(|f| f == "groups.json"));
        assert!(cfg.skip_dirs.iter().any(|d| d == Path::new("pods/logs")));
        assert_eq!(cfg.inference.len(), 14);
    }
}
