//! hindsight bundle access: a read-only view over an extracted support
//! bundle plus the decoders for the file shapes collectors produce.

#![forbid(unsafe_code)]

use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hindsight_core::{Document, FieldPath};
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::warn;

mod decode;

pub use decode::{decode_documents, load_config_map, load_resources, load_secret, DecodeError};

/// Paths under which collectors store particular data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub cluster_info: PathBuf,
    pub cluster_resources: PathBuf,
    pub pod_logs: PathBuf,
    pub config_maps: PathBuf,
    pub secrets: PathBuf,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            cluster_info: "cluster-info".into(),
            cluster_resources: "cluster-resources".into(),
            pod_logs: "pod-logs".into(),
            config_maps: "configmaps".into(),
            secrets: "secrets".into(),
        }
    }
}

/// Read-only hierarchical file store addressed by bundle-relative paths.
pub trait Bundle: Send + Sync {
    fn layout(&self) -> &Layout;

    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    fn exists(&self, path: &Path) -> bool;

    /// All files below `dir`, relative to the bundle root, in file-name order.
    /// A missing `dir` yields an empty list; entries that cannot be read are
    /// left out.
    fn walk(&self, dir: &Path) -> io::Result<Vec<PathBuf>>;
}

/// Bundle backed by an extracted directory on disk.
#[derive(Debug, Clone)]
pub struct DirBundle {
    root: PathBuf,
    layout: Layout,
}

impl DirBundle {
    /// Opens an extracted bundle directory. Archives must be extracted by the caller.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let root = path.canonicalize().with_context(|| format!("resolving bundle path {}", path.display()))?;
        if !root.is_dir() {
            return Err(anyhow!("unknown bundle format: {} is not an extracted bundle directory", root.display()));
        }
        Ok(Self { root, layout: Layout::default() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Bundle for DirBundle {
    fn layout(&self) -> &Layout {
        &self.layout
    }

    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(self.root.join(path))
    }

    fn exists(&self, path: &Path) -> bool {
        self.root.join(path).exists()
    }

    fn walk(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let base = self.root.join(dir);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in walkdir::WalkDir::new(&base).follow_links(true).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(path = ?e.path(), error = %e, "unreadable bundle entry skipped");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                out.push(rel.to_path_buf());
            }
        }
        Ok(out)
    }
}

/// File stem without extension.
fn stem(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("")
}

/// Collectors record a failure to collect `x.json` in a sibling `x-errors.json`.
pub fn errors_file_for(path: &Path) -> PathBuf {
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}-errors.{}", stem(path), ext),
        None => format!("{}-errors", stem(path)),
    };
    path.with_file_name(name)
}

pub fn is_errors_file(path: &Path) -> bool {
    stem(path).ends_with("-errors")
}

/// Data file an errors file reports on (`pods-errors.json` → `pods.json`).
pub fn data_file_for(errors_file: &Path) -> Option<PathBuf> {
    let base = stem(errors_file).strip_suffix("-errors")?;
    let name = match errors_file.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", base, ext),
        None => base.to_string(),
    };
    Some(errors_file.with_file_name(name))
}

/// Warns when collecting `path` was reported as incomplete. Returns whether it was.
pub fn warn_on_errors_file(bundle: &dyn Bundle, path: &Path) -> bool {
    let errors = errors_file_for(path);
    if !bundle.exists(&errors) {
        return false;
    }
    warn!(
        errors_file = %errors.display(),
        path = %path.display(),
        "collector reported errors while gathering this resource; the import may not be complete"
    );
    true
}

/// Server version the bundle was collected from; the hint a control-plane
/// provisioner needs to pick a matching backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterVersion {
    pub major: u32,
    pub minor: u32,
    pub git_version: String,
}

impl std::fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Default, Deserialize)]
struct VersionInfo {
    #[serde(default)]
    major: String,
    #[serde(default)]
    minor: String,
    #[serde(default, rename = "gitVersion")]
    git_version: String,
}

#[derive(Debug, Deserialize)]
struct ClusterVersionFile {
    #[serde(default)]
    info: VersionInfo,
    #[serde(default, rename = "string")]
    version_string: String,
}

/// Parses `major.minor` out of strings like `v1.25.5-eks-123`.
fn parse_semver_prefix(s: &str) -> Option<(u32, u32)> {
    let s = s.trim().trim_start_matches('v');
    let mut parts = s.split(|c: char| !c.is_ascii_digit());
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

fn leading_number(s: &str) -> Option<u32> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// `major.minor` out of the split fields of a server version; minor may
/// carry a provider suffix such as `27+`.
pub fn parse_major_minor(major: &str, minor: &str) -> Option<(u32, u32)> {
    Some((leading_number(major)?, leading_number(minor)?))
}

pub fn detect_cluster_version(bundle: &dyn Bundle) -> Result<ClusterVersion> {
    let path = bundle.layout().cluster_info.join("cluster_version.json");
    let data = bundle.read(&path).with_context(|| format!("reading {}", path.display()))?;
    let file: ClusterVersionFile = serde_json::from_slice(&data).with_context(|| format!("parsing {}", path.display()))?;
    let git_version = if file.version_string.is_empty() { file.info.git_version.clone() } else { file.version_string.clone() };
    let parsed = parse_semver_prefix(&file.version_string)
        .or_else(|| parse_semver_prefix(&file.info.git_version))
        .or_else(|| parse_major_minor(&file.info.major, &file.info.minor));
    match parsed {
        Some((major, minor)) => Ok(ClusterVersion { major, minor, git_version }),
        None => Err(anyhow!("no usable version in {}", path.display())),
    }
}

const SERVICE_CIDR_FLAG: &str = "--service-cluster-ip-range=";

fn is_apiserver_pod(doc: &Document) -> bool {
    doc.name().starts_with("kube-apiserver-")
        && doc.get(&FieldPath::parse("metadata.labels.component")).and_then(Json::as_str) == Some("kube-apiserver")
}

fn service_cidr_flag(pod: &Pod) -> Option<String> {
    let spec = pod.spec.as_ref()?;
    spec.containers
        .iter()
        .filter(|c| c.name == "kube-apiserver")
        .flat_map(|c| c.command.iter().flatten().chain(c.args.iter().flatten()))
        .find_map(|arg| arg.strip_prefix(SERVICE_CIDR_FLAG))
        .map(str::to_string)
}

/// Service IP range the recorded cluster's API server was started with,
/// taken from the flags of its `kube-apiserver` pod. A backend started with
/// the same range accepts the recorded `spec.clusterIP` values. `None` when
/// no such pod or flag was recorded.
pub fn detect_service_cidr(bundle: &dyn Bundle) -> Result<Option<String>> {
    let path = bundle.layout().cluster_resources.join("pods").join("kube-system.json");
    let docs = load_resources(bundle, &path).with_context(|| format!("loading pods from {}", path.display()))?;
    let Some(doc) = docs.into_iter().find(is_apiserver_pod) else { return Ok(None) };
    let pod: Pod = serde_json::from_value(doc.into_value())
        .with_context(|| format!("parsing kube-apiserver pod in {}", path.display()))?;
    Ok(service_cidr_flag(&pod))
}
