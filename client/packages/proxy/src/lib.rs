//! Reverse proxy that lets a browser-hosted client reach workspace servers it
//! cannot call directly. Every `/api/v2/*` request is forwarded to the origin
//! named in the `X-Proxy-Target` header.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::Url;
use workbench_error::{ProblemDetails, SyncError};
use workbench_sync::config::{PROXY_PREFIX, PROXY_TARGET_HEADER};

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub connect_timeout: Duration,
    /// Request bodies are buffered before forwarding; larger ones are refused.
    pub max_request_body: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_request_body: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("missing X-Proxy-Target header")]
    MissingTarget,
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),
    #[error("unreadable request: {0}")]
    InvalidRequest(String),
    #[error("upstream {target} unreachable: {message}")]
    Upstream { target: String, message: String },
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl ProxyError {
    pub fn to_problem_details(&self) -> ProblemDetails {
        let err = match self {
            ProxyError::MissingTarget => SyncError::ProxyTargetMissing,
            ProxyError::InvalidTarget(target) => SyncError::InvalidProxyTarget {
                target: target.clone(),
            },
            ProxyError::InvalidRequest(message) => SyncError::invalid_request(message.clone()),
            ProxyError::Upstream { message, .. } => SyncError::Unreachable {
                message: message.clone(),
            },
            ProxyError::Client(err) => SyncError::Unreachable {
                message: err.to_string(),
            },
        };
        err.to_problem_details()
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let problem = self.to_problem_details();
        let status = StatusCode::from_u16(problem.status).unwrap_or(StatusCode::BAD_GATEWAY);
        (status, Json(problem)).into_response()
    }
}

struct ProxyState {
    client: reqwest::Client,
    max_request_body: usize,
}

pub fn build_router(config: &ProxyConfig) -> Result<Router, ProxyError> {
    let client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .no_proxy()
        .build()?;
    let state = Arc::new(ProxyState {
        client,
        max_request_body: config.max_request_body,
    });

    Ok(Router::new()
        .route(&format!("{PROXY_PREFIX}/*path"), any(forward))
        .with_state(state)
        .layer(TraceLayer::new_for_http()))
}

async fn forward(
    State(state): State<Arc<ProxyState>>,
    request: Request,
) -> Result<Response, ProxyError> {
    let (parts, body) = request.into_parts();
    let target = target_origin(&parts.headers)?;

    let path = parts
        .uri
        .path()
        .strip_prefix(PROXY_PREFIX)
        .unwrap_or(parts.uri.path());
    let mut url = format!("{target}{path}");
    if let Some(query) = parts.uri.query() {
        url.push('?');
        url.push_str(query);
    }

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|_| ProxyError::InvalidRequest(format!("method {}", parts.method)))?;
    let body = to_bytes(body, state.max_request_body)
        .await
        .map_err(|err| ProxyError::InvalidRequest(err.to_string()))?;

    let mut upstream = state.client.request(method, &url);
    for (name, value) in parts.headers.iter() {
        if is_stripped_request_header(name.as_str()) {
            continue;
        }
        upstream = upstream.header(name.as_str(), value.as_bytes());
    }
    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    let response = upstream.send().await.map_err(|err| {
        warn!(proxy_target = %target, path, error = %err, "proxy request failed");
        ProxyError::Upstream {
            target: target.clone(),
            message: err.to_string(),
        }
    })?;
    debug!(
        proxy_target = %target,
        path,
        status = response.status().as_u16(),
        "proxied"
    );
    Ok(relay(response))
}

/// The target origin, without a trailing slash. Only http(s) is accepted.
fn target_origin(headers: &HeaderMap) -> Result<String, ProxyError> {
    let raw = headers
        .get(PROXY_TARGET_HEADER)
        .ok_or(ProxyError::MissingTarget)?
        .to_str()
        .map_err(|_| ProxyError::InvalidTarget("<non-ascii>".to_string()))?
        .trim();
    if raw.is_empty() {
        return Err(ProxyError::MissingTarget);
    }
    let url = Url::parse(raw).map_err(|_| ProxyError::InvalidTarget(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ProxyError::InvalidTarget(raw.to_string()));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn is_stripped_request_header(name: &str) -> bool {
    matches!(name, "host" | "origin" | "referer" | "content-length")
        || name == PROXY_TARGET_HEADER
        || HOP_BY_HOP.contains(&name)
}

fn is_stripped_response_header(name: &str) -> bool {
    name.starts_with("access-control-") || HOP_BY_HOP.contains(&name)
}

/// Copies status and headers and streams the body, so event streams pass
/// through unbuffered.
fn relay(upstream: reqwest::Response) -> Response {
    let status = StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers() {
        if is_stripped_response_header(name.as_str()) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_must_be_an_http_origin() {
        let mut headers = HeaderMap::new();
        assert!(matches!(target_origin(&headers), Err(ProxyError::MissingTarget)));

        headers.insert(PROXY_TARGET_HEADER, HeaderValue::from_static("http://box:4096/"));
        assert_eq!(target_origin(&headers).expect("origin"), "http://box:4096");

        headers.insert(PROXY_TARGET_HEADER, HeaderValue::from_static("ftp://box"));
        assert!(matches!(
            target_origin(&headers),
            Err(ProxyError::InvalidTarget(_))
        ));

        headers.insert(PROXY_TARGET_HEADER, HeaderValue::from_static("not a url"));
        assert!(matches!(
            target_origin(&headers),
            Err(ProxyError::InvalidTarget(_))
        ));
    }

    #[test]
    fn strips_browser_and_hop_by_hop_headers() {
        for name in ["host", "origin", "referer", "x-proxy-target", "connection", "upgrade"] {
            assert!(is_stripped_request_header(name), "{name}");
        }
        assert!(!is_stripped_request_header("authorization"));
        assert!(!is_stripped_request_header("accept"));

        assert!(is_stripped_response_header("access-control-allow-origin"));
        assert!(is_stripped_response_header("transfer-encoding"));
        assert!(!is_stripped_response_header("content-type"));
    }

    #[test]
    fn missing_target_maps_to_service_unavailable() {
        let problem = ProxyError::MissingTarget.to_problem_details();
        assert_eq!(problem.status, 503);
        assert_eq!(problem.type_, "urn:workbench:error:proxy_target_missing");
    }
}
