use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::StatusCode;
use http::header::{CONTENT_TYPE, HeaderValue};
use serde_json::{Value, json};

/// Response synthesized by the proxy itself rather than mirrored from the
/// upstream. Bodies are JSON `{"error": code, "detail": message}`.
#[derive(Debug)]
pub struct ProxyError {
    pub status: StatusCode,
    pub body: Bytes,
}

impl ProxyError {
    pub fn json_error_with(status: StatusCode, code: &str, detail: impl Into<Value>) -> Self {
        Self::from_value(
            status,
            json!({
                "error": code,
                "detail": detail.into(),
            }),
        )
    }

    fn from_value(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            body: Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
        }
    }

    pub fn bad_request(detail: impl Into<Value>) -> Self {
        Self::json_error_with(StatusCode::BAD_REQUEST, "bad_request", detail)
    }

    pub fn payload_too_large(limit: usize) -> Self {
        Self::json_error_with(
            StatusCode::PAYLOAD_TOO_LARGE,
            "payload_too_large",
            format!("request body exceeds {limit} bytes"),
        )
    }

    pub fn bad_gateway(code: &str, detail: impl Into<Value>) -> Self {
        Self::json_error_with(StatusCode::BAD_GATEWAY, code, detail)
    }

    pub fn gateway_timeout(detail: impl Into<Value>) -> Self {
        Self::json_error_with(StatusCode::GATEWAY_TIMEOUT, "upstream_timeout", detail)
    }

    pub fn service_unavailable(code: &str, detail: impl Into<Value>) -> Self {
        Self::json_error_with(StatusCode::SERVICE_UNAVAILABLE, code, detail)
    }

    /// Rate-limit retries exhausted. Deliberately not a 429 so clients do not
    /// start a retry storm of their own.
    pub fn upstream_unavailable(detail: impl Into<Value>) -> Self {
        Self::from_value(
            StatusCode::SERVICE_UNAVAILABLE,
            json!({
                "error": "upstream_unavailable",
                "detail": detail.into(),
                "retryable": true,
            }),
        )
    }

    pub fn into_response(self) -> Response {
        let mut resp = Response::new(Body::from(self.body));
        *resp.status_mut() = self.status;
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp
    }
}
