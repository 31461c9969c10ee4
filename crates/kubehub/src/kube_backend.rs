use async_trait::async_trait;
use hindsight_core::Document;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::debug;

use crate::{ApiResourceEntry, Backend, BackendError, Resolved};

/// `Backend` over a live API server.
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, target: &Resolved, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = ApiResource {
            group: target.group().to_string(),
            version: target.version().to_string(),
            api_version: target.api_version().to_string(),
            kind: target.kind().to_string(),
            plural: target.plural.clone(),
        };
        match (target.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn map_err(e: kube::Error) -> BackendError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => BackendError::NotFound,
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => BackendError::AlreadyExists,
        kube::Error::Api(ae) if ae.code == 409 => BackendError::Conflict(ae.message),
        kube::Error::Api(ae) => BackendError::Api { code: ae.code, message: ae.message },
        other => BackendError::Kube(other),
    }
}

fn to_document(obj: &DynamicObject) -> Result<Document, BackendError> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(Document::from_value(v).unwrap_or_default())
}

fn to_dynamic(doc: &Document) -> Result<DynamicObject, BackendError> {
    Ok(serde_json::from_value(doc.clone().into_value())?)
}

#[async_trait]
impl Backend for KubeBackend {
    async fn api_resources(&self, api_version: &str) -> Result<Vec<ApiResourceEntry>, BackendError> {
        let list = if api_version.contains('/') {
            self.client.list_api_group_resources(api_version).await
        } else {
            self.client.list_core_api_resources(api_version).await
        }
        .map_err(map_err)?;
        Ok(list.resources.into_iter().map(|r| ApiResourceEntry::new(r.name, r.kind, r.namespaced)).collect())
    }

    async fn get(&self, target: &Resolved, namespace: Option<&str>, name: &str) -> Result<Option<Document>, BackendError> {
        let found = self.api(target, namespace).get_opt(name).await.map_err(map_err)?;
        found.as_ref().map(to_document).transpose()
    }

    async fn create(&self, target: &Resolved, doc: &Document) -> Result<Document, BackendError> {
        let obj = to_dynamic(doc)?;
        let created = self.api(target, doc.namespace()).create(&PostParams::default(), &obj).await.map_err(map_err)?;
        debug!(kind = %target.kind(), key = %doc.object_key(), "created");
        to_document(&created)
    }

    async fn replace_status(&self, target: &Resolved, doc: &Document) -> Result<Document, BackendError> {
        if doc.name().is_empty() {
            return Err(BackendError::Unnamed(target.type_identity.to_string()));
        }
        let body = serde_json::to_vec(doc)?;
        let updated = self
            .api(target, doc.namespace())
            .replace_status(doc.name(), &PostParams::default(), body)
            .await
            .map_err(map_err)?;
        to_document(&updated)
    }
}
