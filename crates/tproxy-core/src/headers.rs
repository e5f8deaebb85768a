use http::HeaderMap;
use http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, HeaderName,
    HeaderValue,
};

pub const REQUEST_ID_HEADER: &str = "x-tproxy-request-id";

pub fn is_hop_by_hop_or_framing_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("transfer-encoding")
        || name.eq_ignore_ascii_case("connection")
        || name.eq_ignore_ascii_case("keep-alive")
        || name.eq_ignore_ascii_case("proxy-connection")
        || name.eq_ignore_ascii_case("proxy-authenticate")
        || name.eq_ignore_ascii_case("proxy-authorization")
        || name.eq_ignore_ascii_case("te")
        || name.eq_ignore_ascii_case("trailer")
        || name.eq_ignore_ascii_case("upgrade")
}

/// Extra headers a `Connection` header declares hop-by-hop.
fn connection_listed(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect()
}

fn copy_end_to_end(headers: &HeaderMap, skip: impl Fn(&HeaderName) -> bool) -> HeaderMap {
    let listed = connection_listed(headers);
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop_or_framing_header(name.as_str())
            || listed.iter().any(|item| item == name.as_str())
            || skip(name)
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Client headers as sent upstream. `host` and framing are recomputed by the
/// client; `accept-encoding` is dropped so the upstream answers uncompressed
/// and SSE stays inspectable.
pub fn upstream_request_headers(headers: &HeaderMap) -> HeaderMap {
    copy_end_to_end(headers, |name| *name == HOST || *name == ACCEPT_ENCODING)
}

/// Upstream response headers as mirrored to the client. `content-length` is
/// kept only when the body is forwarded byte for byte.
pub fn downstream_response_headers(headers: &HeaderMap, body_rewritten: bool) -> HeaderMap {
    let mut out = copy_end_to_end(headers, |_| false);
    if !body_rewritten {
        if let Some(length) = headers.get(CONTENT_LENGTH) {
            out.insert(CONTENT_LENGTH, length.clone());
        }
    }
    out
}

pub fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .trim_start()
                .to_ascii_lowercase()
                .starts_with("text/event-stream")
        })
}

pub fn mark_event_stream(headers: &mut HeaderMap) {
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
}

pub fn insert_request_id(headers: &mut HeaderMap, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        headers.insert(REQUEST_ID_HEADER, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn request_headers_drop_hop_by_hop_and_encoding() {
        let headers = map(&[
            ("host", "localhost:8788"),
            ("connection", "keep-alive, x-trace"),
            ("x-trace", "1"),
            ("content-length", "42"),
            ("accept-encoding", "gzip"),
            ("authorization", "Bearer t"),
            ("content-type", "application/json"),
        ]);
        let out = upstream_request_headers(&headers);
        assert_eq!(out.len(), 2);
        assert!(out.contains_key("authorization"));
        assert!(out.contains_key("content-type"));
    }

    #[test]
    fn response_headers_keep_length_only_when_untouched() {
        let headers = map(&[
            ("content-length", "10"),
            ("transfer-encoding", "chunked"),
            ("content-type", "application/json"),
        ]);
        let kept = downstream_response_headers(&headers, false);
        assert_eq!(kept.get(CONTENT_LENGTH).unwrap(), "10");
        assert!(!kept.contains_key("transfer-encoding"));
        let rewritten = downstream_response_headers(&headers, true);
        assert!(!rewritten.contains_key(CONTENT_LENGTH));
    }

    #[test]
    fn detects_event_stream() {
        assert!(is_event_stream(&map(&[(
            "content-type",
            "Text/Event-Stream; charset=utf-8"
        )])));
        assert!(!is_event_stream(&map(&[("content-type", "application/json")])));
    }
}
