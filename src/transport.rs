//! Shared HTTP plumbing for bucket and inbox clients.
//!
//! Thin helpers over `reqwest`: bearer auth, protocol status mapping, and
//! `Retry-After` handling. Wire bodies are opaque CBOR; everything typed
//! lives in [`crate::protocol`].

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};

use crate::error::GraffitiError;

/// Media type for all binary wire bodies.
pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

/// Build the shared HTTP client.
pub fn client() -> Result<reqwest::Client, GraffitiError> {
    reqwest::Client::builder()
        .build()
        .map_err(GraffitiError::from)
}

/// Attach a bearer token when one is supplied.
pub fn bearer(request: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
        None => request,
    }
}

/// Map an error status to the protocol taxonomy.
pub fn status_error(status: StatusCode, context: &str) -> GraffitiError {
    match status {
        StatusCode::UNAUTHORIZED => GraffitiError::Unauthorized(context.to_string()),
        StatusCode::FORBIDDEN => GraffitiError::Forbidden(context.to_string()),
        StatusCode::NOT_FOUND => GraffitiError::NotFound(context.to_string()),
        StatusCode::GONE => GraffitiError::CursorExpired(context.to_string()),
        StatusCode::PAYLOAD_TOO_LARGE => GraffitiError::TooLarge(context.to_string()),
        other => GraffitiError::Transport(format!("{context}: http status {other}")),
    }
}

/// Fail unless the response is a success, mapping the status.
pub fn require_success(response: Response, context: &str) -> Result<Response, GraffitiError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(status_error(response.status(), context))
    }
}

/// Parse an honored `Retry-After` header as a delay. Only the
/// seconds form is recognized; HTTP-date values are ignored.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Join an endpoint base and a path, tolerating trailing slashes.
pub fn join(endpoint: &str, path: &str) -> String {
    format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// Fetch the authorization endpoint a service advertises at `GET /auth`.
pub async fn fetch_auth_endpoint(
    http: &reqwest::Client,
    endpoint: &str,
) -> Result<String, GraffitiError> {
    let response = http.get(join(endpoint, "auth")).send().await?;
    let response = require_success(response, &format!("auth discovery for {endpoint}"))?;
    Ok(response.text().await?.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn maps_protocol_statuses() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, "x"),
            GraffitiError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::GONE, "x"),
            GraffitiError::CursorExpired(_)
        ));
        assert!(matches!(
            status_error(StatusCode::PAYLOAD_TOO_LARGE, "x"),
            GraffitiError::TooLarge(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "x"),
            GraffitiError::Transport(_)
        ));
    }

    #[test]
    fn parses_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(2)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn joins_endpoints_and_paths() {
        assert_eq!(join("https://a.test/", "/send"), "https://a.test/send");
        assert_eq!(join("https://a.test", "send"), "https://a.test/send");
    }
}
