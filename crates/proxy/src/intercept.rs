//! Rewrites buffered API responses on their way to the client.

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use hindsight_core::{Document, TypeIdentity};
use hindsight_rewrite::ResourceRewriter;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use serde_json::Value as Json;
use tracing::{debug, warn};

/// Only successful JSON responses carry objects worth rewriting.
pub fn should_intercept(status: StatusCode, headers: &HeaderMap) -> bool {
    if !status.is_success() {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|media| media.trim().eq_ignore_ascii_case("application/json"))
}

pub fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("gzip"))
}

pub(crate) fn gunzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 4);
    GzDecoder::new(data).read_to_end(&mut out)?;
    Ok(out)
}

pub(crate) fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut enc = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    enc.write_all(data)?;
    enc.finish()
}

/// Type of the items of a list envelope such as `NamespaceList`. The API
/// server omits `apiVersion` and `kind` on list items.
fn list_item_type(root: &Json) -> Option<TypeIdentity> {
    let api_version = root.get("apiVersion").and_then(Json::as_str)?;
    let kind = root.get("kind").and_then(Json::as_str)?.strip_suffix("List")?;
    Some(TypeIdentity::new(api_version, kind)).filter(|ti| !ti.is_empty())
}

fn serve_item(rewriter: &dyn ResourceRewriter, item: &mut Json, list_type: Option<&TypeIdentity>) -> bool {
    let Json::Object(map) = item else { return false };
    let mut doc = Document::from(std::mem::take(map));
    let original = doc.clone();
    let borrowed = match list_type {
        Some(ti) if doc.api_version().is_empty() && doc.kind().is_empty() => {
            doc.set_type_identity(ti);
            true
        }
        _ => false,
    };
    if let Err(e) = rewriter.before_serving(&mut doc) {
        warn!(kind = %doc.kind(), key = %original.object_key(), error = %e, "rewrite on serving failed; item served as stored");
        *item = original.into_value();
        return false;
    }
    if borrowed {
        let map = doc.as_map_mut();
        map.remove("apiVersion");
        map.remove("kind");
    }
    let changed = doc != original;
    *item = doc.into_value();
    changed
}

/// Applies `before_serving` to a list or a single object. `None` means the
/// original bytes should be served.
pub fn rewrite_json(rewriter: &dyn ResourceRewriter, data: &[u8]) -> Option<Vec<u8>> {
    let mut root: Json = serde_json::from_slice(data).ok()?;
    let list_type = list_item_type(&root);
    if let Some(Json::Array(items)) = root.get_mut("items").filter(|v| v.as_array().is_some_and(|a| !a.is_empty())) {
        let mut changed = false;
        for item in items.iter_mut() {
            changed |= serve_item(rewriter, item, list_type.as_ref());
        }
        return if changed { serde_json::to_vec(&root).ok() } else { None };
    }

    if root.get("kind").and_then(Json::as_str).unwrap_or("").is_empty() {
        return None;
    }
    let mut doc = Document::from_value(root)?;
    let original = doc.clone();
    if let Err(e) = rewriter.before_serving(&mut doc) {
        warn!(kind = %original.kind(), key = %original.object_key(), error = %e, "rewrite on serving failed; response served as received");
        return None;
    }
    if doc == original {
        return None;
    }
    serde_json::to_vec(&doc).ok()
}

/// Rewrites a complete response body, fixing up the framing headers so they
/// describe the bytes actually sent.
pub fn rewrite_body(rewriter: &dyn ResourceRewriter, headers: &mut HeaderMap, body: Bytes) -> Bytes {
    let out = rewrite_encoded(rewriter, headers, &body).map(Bytes::from).unwrap_or(body);
    headers.remove(header::TRANSFER_ENCODING);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(out.len()));
    out
}

fn rewrite_encoded(rewriter: &dyn ResourceRewriter, headers: &HeaderMap, body: &[u8]) -> Option<Vec<u8>> {
    if !is_gzip(headers) {
        return rewrite_json(rewriter, body);
    }
    let plain = match gunzip(body) {
        Ok(plain) => plain,
        Err(e) => {
            warn!(error = %e, "response declared gzip but did not decompress; passing through");
            return None;
        }
    };
    let rewritten = rewrite_json(rewriter, &plain)?;
    match gzip(&rewritten) {
        Ok(compressed) => Some(compressed),
        Err(e) => {
            debug!(error = %e, "recompressing rewritten response failed; passing through");
            None
        }
    }
}
