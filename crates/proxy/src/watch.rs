//! Watch responses are newline-delimited event streams and must not be
//! buffered; each complete event line is rewritten as it arrives.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use hindsight_core::Document;
use hindsight_rewrite::ResourceRewriter;
use http::Uri;
use serde_json::Value as Json;
use std::sync::Arc;
use tracing::warn;

/// `?watch=true`, `?watch=1` or a legacy `/watch/` path.
pub fn is_watch(uri: &Uri) -> bool {
    if uri.path().contains("/watch/") {
        return true;
    }
    uri.query()
        .unwrap_or("")
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .any(|(k, v)| k == "watch" && (v == "true" || v == "1"))
}

/// Rewrites the `object` of one `{"type": ..., "object": ...}` event line.
/// Lines that fail to parse or rewrite are returned unchanged.
pub fn rewrite_event(rewriter: &dyn ResourceRewriter, line: &[u8]) -> Bytes {
    let unchanged = || Bytes::copy_from_slice(line);
    let body = line.strip_suffix(b"\n").unwrap_or(line);
    let Ok(mut event) = serde_json::from_slice::<Json>(body) else { return unchanged() };
    let Some(Json::Object(obj)) = event.get_mut("object") else { return unchanged() };
    let mut doc = Document::from(std::mem::take(obj));
    let original = doc.clone();
    if let Err(e) = rewriter.before_serving(&mut doc) {
        warn!(kind = %original.kind(), key = %original.object_key(), error = %e, "rewrite of watch event failed; event served as received");
        return unchanged();
    }
    if doc == original {
        return unchanged();
    }
    event["object"] = doc.into_value();
    match serde_json::to_vec(&event) {
        Ok(mut out) => {
            if line.ends_with(b"\n") {
                out.push(b'\n');
            }
            Bytes::from(out)
        }
        Err(_) => unchanged(),
    }
}

struct LineState<S> {
    inner: S,
    buf: BytesMut,
    done: bool,
}

/// Splits `inner` into lines and rewrites each event. A trailing partial
/// line is flushed when the upstream ends.
pub fn rewrite_watch_stream<S, E>(
    rewriter: Arc<dyn ResourceRewriter>,
    inner: S,
) -> impl Stream<Item = Result<Bytes, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    let state = LineState { inner, buf: BytesMut::new(), done: false };
    futures::stream::unfold(state, move |mut st| {
        let rewriter = rewriter.clone();
        async move {
            loop {
                if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                    let line = st.buf.split_to(pos + 1);
                    return Some((Ok(rewrite_event(rewriter.as_ref(), &line)), st));
                }
                if st.done {
                    if st.buf.is_empty() {
                        return None;
                    }
                    let rest = st.buf.split();
                    return Some((Ok(rewrite_event(rewriter.as_ref(), &rest)), st));
                }
                match st.inner.next().await {
                    Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        st.done = true;
                        st.buf.clear();
                        return Some((Err(e), st));
                    }
                    None => st.done = true,
                }
            }
        }
    })
}
