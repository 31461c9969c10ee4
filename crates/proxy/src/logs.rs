//! Serves the `log` subresource of pods from the bundle instead of the backend,
//! which never ran any containers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use hindsight_bundle::{load_resources, Bundle};
use hindsight_core::FieldPath;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use serde::Deserialize;
use serde_json::Value as Json;
use tracing::{debug, warn};

use crate::ProxyState;

/// RFC 3339 timestamp followed by the separator the API server emits.
static TIMESTAMP_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z ").expect("timestamp regex is valid"));

const ZERO_TIMESTAMP: &[u8] = b"1970-01-01T00:00:00Z ";

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub container: Option<String>,
    pub timestamps: Option<String>,
}

/// Locates the log file for a container. Without a container the pod must
/// have exactly one container in its recorded spec, or, when the pod was not
/// recorded, exactly one collected log.
pub fn find_pod_log(bundle: &dyn Bundle, namespace: &str, pod: &str, container: Option<&str>) -> Option<PathBuf> {
    let layout = bundle.layout();
    let collected = layout.cluster_resources.join("pods").join("logs").join(namespace).join(pod);
    if let Some(c) = container.filter(|c| !c.is_empty()) {
        return [layout.pod_logs.join(namespace).join(format!("{}-{}.log", pod, c)), collected.join(format!("{}.log", c))]
            .into_iter()
            .find(|p| bundle.exists(p));
    }

    let recorded = RecordedPods::load(bundle, namespace);
    if let Some(containers) = recorded.containers(pod).filter(|c| !c.is_empty()) {
        return match containers.as_slice() {
            [single] => find_pod_log(bundle, namespace, pod, Some(single.as_str())),
            _ => None,
        };
    }
    let prefix = format!("{}-", pod);
    // Logs of `web-0-x` also start with `web-0-`.
    let longer: Vec<String> = recorded.names().filter(|n| n.starts_with(&prefix)).map(|n| format!("{}-", n)).collect();
    let by_pod = only(bundle, &layout.pod_logs.join(namespace), |name| {
        name.starts_with(&prefix) && name.ends_with(".log") && !longer.iter().any(|l| name.starts_with(l.as_str()))
    });
    by_pod.or_else(|| only(bundle, &collected, |name| name.ends_with(".log")))
}

/// Pods recorded for one namespace, with their container names.
#[derive(Debug, Default)]
struct RecordedPods(Vec<(String, Vec<String>)>);

impl RecordedPods {
    fn load(bundle: &dyn Bundle, namespace: &str) -> Self {
        let path = bundle.layout().cluster_resources.join("pods").join(format!("{}.json", namespace));
        if !bundle.exists(&path) {
            return Self::default();
        }
        let docs = match load_resources(bundle, &path) {
            Ok(docs) => docs,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "recorded pods unavailable for log lookup");
                return Self::default();
            }
        };
        let containers = FieldPath::parse("spec.containers");
        Self(
            docs.iter()
                .map(|doc| {
                    let names: Vec<String> = doc
                        .get(&containers)
                        .and_then(Json::as_array)
                        .map(|cs| cs.iter().filter_map(|c| c.get("name")?.as_str()).map(str::to_string).collect())
                        .unwrap_or_default();
                    (doc.name().to_string(), names)
                })
                .collect(),
        )
    }

    fn containers(&self, pod: &str) -> Option<&Vec<String>> {
        self.0.iter().find(|(name, _)| name == pod).map(|(_, c)| c)
    }

    fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }
}

/// The single file directly below `dir` whose name satisfies `pred`.
fn only(bundle: &dyn Bundle, dir: &Path, pred: impl Fn(&str) -> bool) -> Option<PathBuf> {
    let files = bundle.walk(dir).ok()?;
    let mut matches = files.into_iter().filter(|p| {
        p.parent() == Some(dir) && p.file_name().and_then(|n| n.to_str()).is_some_and(&pred)
    });
    let first = matches.next()?;
    matches.next().is_none().then_some(first)
}

/// Prefixes every line with the zero timestamp unless the log already carries
/// timestamps. Clients that request timestamps cut everything up to the first
/// space.
pub fn backfill_timestamps(data: Vec<u8>) -> Vec<u8> {
    if data.is_empty() {
        return data;
    }
    let first = data.split(|b| *b == b'\n').next().unwrap_or_default();
    if TIMESTAMP_PREFIX.is_match(first) {
        return data;
    }
    let trailing = data.ends_with(b"\n");
    let body = if trailing { &data[..data.len() - 1] } else { &data[..] };
    let lines = body.split(|b| *b == b'\n').count();
    let mut out = Vec::with_capacity(data.len() + lines * ZERO_TIMESTAMP.len());
    for (i, line) in body.split(|b| *b == b'\n').enumerate() {
        if i > 0 {
            out.push(b'\n');
        }
        out.extend_from_slice(ZERO_TIMESTAMP);
        out.extend_from_slice(line);
    }
    if trailing {
        out.push(b'\n');
    }
    out
}

fn read_log(bundle: &dyn Bundle, namespace: &str, pod: &str, query: &LogQuery) -> Result<Vec<u8>, Response> {
    let Some(path) = find_pod_log(bundle, namespace, pod, query.container.as_deref()) else {
        let msg = format!(
            "logs for pod {}/{} container {} not found in the bundle",
            namespace,
            pod,
            query.container.as_deref().unwrap_or("<unspecified>")
        );
        return Err((StatusCode::NOT_FOUND, msg).into_response());
    };
    debug!(path = %path.display(), "serving pod log from bundle");
    let data = bundle.read(&path).map_err(|e| {
        warn!(path = %path.display(), error = %e, "reading pod log failed");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    })?;
    if query.timestamps.as_deref() == Some("true") {
        return Ok(backfill_timestamps(data));
    }
    Ok(data)
}

pub async fn pod_logs(
    State(state): State<ProxyState>,
    UrlPath((namespace, pod)): UrlPath<(String, String)>,
    Query(query): Query<LogQuery>,
) -> Response {
    let bundle: Arc<dyn Bundle> = state.bundle.clone();
    let read = tokio::task::spawn_blocking(move || read_log(bundle.as_ref(), &namespace, &pod, &query)).await;
    match read {
        Ok(Ok(data)) => ([(header::CONTENT_TYPE, "text/plain")], data).into_response(),
        Ok(Err(resp)) => resp,
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
