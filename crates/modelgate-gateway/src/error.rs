use axum::body::Body;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, StatusCode};
use serde_json::json;

use crate::ratelimit::RateDecision;

/// Caller-visible gateway error: an HTTP status plus a preserialized JSON body, and
/// any headers the error must carry.
#[derive(Debug)]
pub struct GatewayError {
    pub status: StatusCode,
    pub body: Bytes,
    pub headers: HeaderMap,
}

impl GatewayError {
    pub fn admission(status: StatusCode, message: &str) -> Self {
        let body = json!({
            "error": {
                "message": message,
                "type": "error",
            }
        });
        Self {
            status,
            body: Bytes::from(body.to_string()),
            headers: HeaderMap::new(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self::admission(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: &str) -> Self {
        Self::admission(StatusCode::UNAUTHORIZED, message)
    }

    pub fn payment_required(message: &str) -> Self {
        Self::admission(StatusCode::PAYMENT_REQUIRED, message)
    }

    pub fn forbidden(message: &str) -> Self {
        Self::admission(StatusCode::FORBIDDEN, message)
    }

    pub fn not_found(message: &str) -> Self {
        Self::admission(StatusCode::NOT_FOUND, message)
    }

    pub fn internal() -> Self {
        Self::admission(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Service temporarily unavailable",
        )
    }

    pub fn rate_limited(decision: &RateDecision, now: i64) -> Self {
        let body = json!({
            "error": {
                "message": "Rate limit exceeded. Please try again later.",
                "type": "rate_limit_error",
                "code": "rate_limit_exceeded",
            }
        });
        let mut headers = HeaderMap::new();
        insert_numeric(&mut headers, "x-ratelimit-limit", decision.limit);
        insert_numeric(&mut headers, "x-ratelimit-remaining", 0);
        insert_numeric(&mut headers, "x-ratelimit-reset", decision.reset_at);
        insert_numeric(&mut headers, "retry-after", (decision.reset_at - now).max(1));
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: Bytes::from(body.to_string()),
            headers,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        response.headers_mut().extend(self.headers);
        response
    }
}

fn insert_numeric(headers: &mut HeaderMap, name: &'static str, value: i64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_error_shape() {
        let err = GatewayError::not_found("Model 'x' is not available");
        let value: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(value["error"]["message"], "Model 'x' is not available");
        assert_eq!(value["error"]["type"], "error");
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn rate_limited_error_carries_headers() {
        let decision = RateDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: 1_700_000_060,
        };
        let err = GatewayError::rate_limited(&decision, 1_700_000_013);
        assert_eq!(err.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.headers["x-ratelimit-limit"], "10");
        assert_eq!(err.headers["x-ratelimit-remaining"], "0");
        assert_eq!(err.headers["retry-after"], "47");
        let value: serde_json::Value = serde_json::from_slice(&err.body).unwrap();
        assert_eq!(value["error"]["type"], "rate_limit_error");
        assert_eq!(value["error"]["code"], "rate_limit_exceeded");
    }

    #[test]
    fn retry_after_is_at_least_one() {
        let decision = RateDecision {
            allowed: false,
            limit: 10,
            remaining: 0,
            reset_at: 1_700_000_000,
        };
        let err = GatewayError::rate_limited(&decision, 1_700_000_059);
        assert_eq!(err.headers["retry-after"], "1");
    }
}
