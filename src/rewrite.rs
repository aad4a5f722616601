use http::header::{
    HeaderMap, HeaderValue, ACCEPT_ENCODING, ACCESS_CONTROL_ALLOW_CREDENTIALS,
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    CONTENT_ENCODING, CONTENT_LENGTH, ETAG, HOST, IF_NONE_MATCH, ORIGIN, REFERER,
};
use http::Uri;
use url::Url;

use crate::config::UpstreamOrigin;

// Standard hop-by-hop headers per RFC 7230
const HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
];

/// Map an inbound request path to the pinned origin, preserving the raw
/// path and query byte-for-byte.
pub fn build_target_uri(
    origin: &UpstreamOrigin,
    uri: &Uri,
) -> Result<Uri, http::uri::InvalidUri> {
    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", origin.as_str(), path_and_query).parse()
}

/// Rewrite inbound request headers for forwarding to the upstream.
///
/// For injectable paths, `Accept-Encoding` is removed so the upstream
/// responds with a body we can rewrite as text, and `If-None-Match` is
/// removed so a stale conditional request cannot 304 past injection.
pub fn rewrite_request_headers(
    headers: &HeaderMap,
    origin: &UpstreamOrigin,
    injectable: bool,
) -> HeaderMap {
    let mut out = copy_without_hop_headers(headers);
    rewrite_origin_headers(&mut out, origin);

    let referer = out
        .get(REFERER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    if let Some(referer) = referer {
        match rewrite_referer(&referer, origin).and_then(|r| HeaderValue::from_str(&r).ok()) {
            Some(value) => {
                out.insert(REFERER, value);
            }
            // A malformed Referer is dropped, not forwarded.
            None => {
                out.remove(REFERER);
            }
        }
    }

    if injectable {
        out.remove(ACCEPT_ENCODING);
        out.remove(IF_NONE_MATCH);
    }

    out
}

/// Rewrite headers for an upgrade (WebSocket) request. Keeps the
/// `Connection`/`Upgrade` pair the upstream needs; hyper owns framing, so
/// only the headers it must control are dropped.
pub fn upgrade_request_headers(headers: &HeaderMap, origin: &UpstreamOrigin) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        out.insert(name, value.clone());
    }
    for name in ["proxy-connection", "keep-alive", "te", "trailers", "transfer-encoding"] {
        out.remove(name);
    }
    rewrite_origin_headers(&mut out, origin);
    out
}

/// Compute the headers returned to the client from the upstream's headers.
///
/// `injected_len` is `Some` when the body was rewritten: `Content-Length`
/// is recomputed and the validators that no longer describe the body
/// (`ETag`, `Content-Encoding`) are dropped.
pub fn response_headers(
    upstream: &HeaderMap,
    allow_origin: &str,
    injected_len: Option<usize>,
) -> HeaderMap {
    let mut out = copy_without_hop_headers(upstream);
    if let Some(len) = injected_len {
        out.remove(CONTENT_ENCODING);
        out.remove(ETAG);
        out.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
    apply_cors_headers(&mut out, allow_origin);
    out
}

/// The fixed permissive CORS set, sized to let the preview host embed the
/// proxied content in an iframe.
pub fn apply_cors_headers(headers: &mut HeaderMap, allow_origin: &str) {
    if let Ok(value) = HeaderValue::from_str(allow_origin) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-Requested-With"),
    );
}

fn rewrite_origin_headers(headers: &mut HeaderMap, origin: &UpstreamOrigin) {
    if let Ok(host) = HeaderValue::from_str(origin.authority()) {
        headers.insert(HOST, host);
    }
    if headers.contains_key(ORIGIN) {
        if let Ok(value) = HeaderValue::from_str(origin.as_str()) {
            headers.insert(ORIGIN, value);
        }
    }
}

/// Re-home a Referer onto the pinned origin, keeping its path and query.
/// Returns None when the inbound value does not parse as an absolute URL.
fn rewrite_referer(referer: &str, origin: &UpstreamOrigin) -> Option<String> {
    let url = Url::parse(referer).ok()?;
    let mut out = String::from(origin.as_str());
    out.push_str(url.path());
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    Some(out)
}

fn copy_without_hop_headers(headers: &HeaderMap) -> HeaderMap {
    // Connection may name additional per-hop headers beyond the RFC set.
    let connection_tokens: Vec<String> = headers
        .get("connection")
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.iter() {
        out.insert(name, value.clone());
    }
    for name in HOP_HEADERS {
        out.remove(*name);
    }
    for name in connection_tokens {
        out.remove(name.as_str());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> UpstreamOrigin {
        UpstreamOrigin::resolve("http://127.0.0.1:5173").unwrap()
    }

    #[test]
    fn target_uri_preserves_path_and_query() {
        let uri: Uri = "/foo/bar?x=1&y=%20z".parse().unwrap();
        let target = build_target_uri(&origin(), &uri).unwrap();
        assert_eq!(target.to_string(), "http://127.0.0.1:5173/foo/bar?x=1&y=%20z");
    }

    #[test]
    fn host_and_origin_are_rewritten() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("preview.example"));
        headers.insert(ORIGIN, HeaderValue::from_static("https://preview.example"));
        let out = rewrite_request_headers(&headers, &origin(), false);
        assert_eq!(out.get(HOST).unwrap(), "127.0.0.1:5173");
        assert_eq!(out.get(ORIGIN).unwrap(), "http://127.0.0.1:5173");
    }

    #[test]
    fn origin_left_absent_when_not_sent() {
        let headers = HeaderMap::new();
        let out = rewrite_request_headers(&headers, &origin(), false);
        assert!(out.get(ORIGIN).is_none());
    }

    #[test]
    fn referer_keeps_path_and_query() {
        let mut headers = HeaderMap::new();
        headers.insert(
            REFERER,
            HeaderValue::from_static("https://original.example/foo?x=1"),
        );
        let out = rewrite_request_headers(&headers, &origin(), false);
        assert_eq!(out.get(REFERER).unwrap(), "http://127.0.0.1:5173/foo?x=1");
    }

    #[test]
    fn malformed_referer_is_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(REFERER, HeaderValue::from_static("::not a url::"));
        let out = rewrite_request_headers(&headers, &origin(), false);
        assert!(out.get(REFERER).is_none());
    }

    #[test]
    fn injectable_paths_force_identity_and_unconditional() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip, br"));
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        let out = rewrite_request_headers(&headers, &origin(), true);
        assert!(out.get(ACCEPT_ENCODING).is_none());
        assert!(out.get(IF_NONE_MATCH).is_none());
    }

    #[test]
    fn non_injectable_paths_keep_conditional_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"abc\""));
        let out = rewrite_request_headers(&headers, &origin(), false);
        assert_eq!(out.get(ACCEPT_ENCODING).unwrap(), "gzip");
        assert_eq!(out.get(IF_NONE_MATCH).unwrap(), "\"abc\"");
    }

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-custom"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-custom", HeaderValue::from_static("per-hop"));
        headers.insert("accept", HeaderValue::from_static("*/*"));
        let out = rewrite_request_headers(&headers, &origin(), false);
        assert!(out.get("connection").is_none());
        assert!(out.get("keep-alive").is_none());
        assert!(out.get("x-custom").is_none());
        assert_eq!(out.get("accept").unwrap(), "*/*");
    }

    #[test]
    fn upgrade_headers_keep_the_upgrade_pair() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("Upgrade"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("sec-websocket-key", HeaderValue::from_static("dGhlIHNhbXBsZQ=="));
        let out = upgrade_request_headers(&headers, &origin());
        assert_eq!(out.get("connection").unwrap(), "Upgrade");
        assert_eq!(out.get("upgrade").unwrap(), "websocket");
        assert_eq!(out.get(HOST).unwrap(), "127.0.0.1:5173");
    }

    #[test]
    fn passthrough_response_keeps_validators() {
        let mut upstream = HeaderMap::new();
        upstream.insert(ETAG, HeaderValue::from_static("\"abc\""));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("14"));
        let out = response_headers(&upstream, "http://localhost:3000", None);
        assert_eq!(out.get(ETAG).unwrap(), "\"abc\"");
        assert_eq!(out.get(CONTENT_LENGTH).unwrap(), "14");
        assert_eq!(
            out.get(ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "http://localhost:3000"
        );
        assert_eq!(out.get(ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
    }

    #[test]
    fn injected_response_recomputes_length_and_drops_validators() {
        let mut upstream = HeaderMap::new();
        upstream.insert(ETAG, HeaderValue::from_static("\"abc\""));
        upstream.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        upstream.insert(CONTENT_LENGTH, HeaderValue::from_static("14"));
        let out = response_headers(&upstream, "http://localhost:3000", Some(1024));
        assert!(out.get(ETAG).is_none());
        assert!(out.get(CONTENT_ENCODING).is_none());
        assert_eq!(out.get(CONTENT_LENGTH).unwrap(), "1024");
    }
}
