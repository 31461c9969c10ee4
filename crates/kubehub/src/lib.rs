//! hindsight kubehub: the seam between the importer and the API server.
//!
//! `Backend` is the narrow set of calls the importer needs; `KubeBackend`
//! implements it with a `kube::Client`, tests implement it in memory.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use hindsight_core::{Document, TypeIdentity};
use tracing::debug;

mod infer;
mod kube_backend;

pub use infer::{default_inference_rules, infer_type, InferenceRule};
pub use kube_backend::KubeBackend;

/// One entry of a discovery listing for a group/version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResourceEntry {
    /// Collection name, or `collection/subresource`.
    pub name: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ApiResourceEntry {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, namespaced: bool) -> Self {
        Self { name: name.into(), kind: kind.into(), namespaced }
    }
}

/// A type identity resolved against the backend's discovery data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub type_identity: TypeIdentity,
    /// Collection (plural) name, e.g. `pods`.
    pub plural: String,
    pub namespaced: bool,
    pub has_status: bool,
}

impl Resolved {
    pub fn group(&self) -> &str {
        self.type_identity.group()
    }

    pub fn version(&self) -> &str {
        self.type_identity.version()
    }

    pub fn api_version(&self) -> &str {
        &self.type_identity.api_version
    }

    pub fn kind(&self) -> &str {
        &self.type_identity.kind
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("{0} has no name")]
    Unnamed(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("encoding object: {0}")]
    Encode(#[from] serde_json::Error),
}

impl BackendError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, BackendError::Conflict(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("resource type {0} is not served by the backend")]
    NotFound(TypeIdentity),
    #[error("type identity is incomplete: {0:?}")]
    Incomplete(TypeIdentity),
    #[error("discovery for {api_version} failed: {source}")]
    Discovery {
        api_version: String,
        #[source]
        source: BackendError,
    },
}

/// Narrow API-server surface used for replaying a bundle.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Discovery listing for one group/version (`v1`, `apps/v1`, ...).
    async fn api_resources(&self, api_version: &str) -> Result<Vec<ApiResourceEntry>, BackendError>;

    /// Namespace is ignored for cluster-scoped types.
    async fn get(&self, target: &Resolved, namespace: Option<&str>, name: &str) -> Result<Option<Document>, BackendError>;

    async fn create(&self, target: &Resolved, doc: &Document) -> Result<Document, BackendError>;

    /// Writes `doc.status` through the status subresource. `doc` must carry
    /// the current `metadata.resourceVersion`.
    async fn replace_status(&self, target: &Resolved, doc: &Document) -> Result<Document, BackendError>;
}

/// Picks the collection serving `kind` out of a discovery listing.
pub fn resolve_from_listing(entries: &[ApiResourceEntry], ti: &TypeIdentity) -> Result<Resolved, ResolveError> {
    let primary = entries
        .iter()
        .find(|e| e.kind == ti.kind && !e.name.contains('/'))
        .ok_or_else(|| ResolveError::NotFound(ti.clone()))?;
    let status_name = format!("{}/status", primary.name);
    let has_status = entries.iter().any(|e| e.kind == ti.kind && e.name == status_name);
    Ok(Resolved {
        type_identity: ti.clone(),
        plural: primary.name.clone(),
        namespaced: primary.namespaced,
        has_status,
    })
}

/// Resolves type identities, remembering each group/version listing for the
/// lifetime of the resolver.
#[derive(Debug, Default)]
pub struct Resolver {
    listings: HashMap<String, Vec<ApiResourceEntry>>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&mut self, backend: &dyn Backend, ti: &TypeIdentity) -> Result<Resolved, ResolveError> {
        if ti.is_empty() {
            return Err(ResolveError::Incomplete(ti.clone()));
        }
        if !self.listings.contains_key(&ti.api_version) {
            let entries = backend
                .api_resources(&ti.api_version)
                .await
                .map_err(|source| ResolveError::Discovery { api_version: ti.api_version.clone(), source })?;
            debug!(api_version = %ti.api_version, count = entries.len(), "discovered resources");
            self.listings.insert(ti.api_version.clone(), entries);
        }
        let entries = self.listings.get(&ti.api_version).map(Vec::as_slice).unwrap_or(&[]);
        resolve_from_listing(entries, ti)
    }

    /// Drops remembered listings, e.g. after new definitions were created.
    pub fn invalidate(&mut self, api_version: &str) {
        self.listings.remove(api_version);
    }
}
