use std::net::SocketAddr;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use workbench_proxy::{build_router, ProxyConfig};

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: String) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    (
        [
            ("access-control-allow-origin", "*"),
            ("x-upstream", "echo"),
        ],
        Json(json!({
            "method": method.as_str(),
            "path": uri.path(),
            "query": uri.query(),
            "host": header("host"),
            "origin": header("origin"),
            "referer": header("referer"),
            "target": header("x-proxy-target"),
            "authorization": header("authorization"),
            "body": body,
        })),
    )
}

async fn spawn_upstream() -> SocketAddr {
    let app = Router::new()
        .route("/session", any(echo))
        .route("/session/:id/message", any(echo))
        .route(
            "/global/event",
            get(|| async {
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    "data: {\"type\":\"server.connected\"}\n\n",
                )
            }),
        );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    addr
}

async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    headers: &[(&str, &str)],
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request_body = match body {
        Some(body) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };
    let request = builder.body(request_body).expect("build request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("collect body")
        .to_bytes();
    (status, headers, bytes.to_vec())
}

fn router() -> Router {
    build_router(&ProxyConfig::default()).expect("build proxy")
}

#[tokio::test]
async fn missing_target_header_is_service_unavailable() {
    let (status, _, body) = send(&router(), Method::GET, "/api/v2/session", &[], None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert_eq!(problem["type"], "urn:workbench:error:proxy_target_missing");
    assert_eq!(problem["status"], 503);
}

#[tokio::test]
async fn non_http_target_is_rejected() {
    let (status, _, body) = send(
        &router(),
        Method::GET,
        "/api/v2/session",
        &[("x-proxy-target", "file:///etc")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert_eq!(problem["type"], "urn:workbench:error:invalid_proxy_target");
}

#[tokio::test]
async fn forwards_path_query_and_body_and_strips_browser_headers() {
    let addr = spawn_upstream().await;
    let target = format!("http://{addr}");

    let (status, headers, body) = send(
        &router(),
        Method::POST,
        "/api/v2/session/ses_1/message?directory=%2Fproj",
        &[
            ("x-proxy-target", target.as_str()),
            ("origin", "http://app.local"),
            ("referer", "http://app.local/chat"),
            ("authorization", "Bearer secret"),
        ],
        Some(json!({"parts": [{"type": "text", "text": "hello"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers.get("x-upstream").and_then(|value| value.to_str().ok()),
        Some("echo")
    );
    assert!(headers.get("access-control-allow-origin").is_none());

    let echoed: Value = serde_json::from_slice(&body).expect("echo json");
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/session/ses_1/message");
    assert_eq!(echoed["query"], "directory=%2Fproj");
    assert_eq!(echoed["host"], addr.to_string());
    assert_eq!(echoed["origin"], Value::Null);
    assert_eq!(echoed["referer"], Value::Null);
    assert_eq!(echoed["target"], Value::Null);
    assert_eq!(echoed["authorization"], "Bearer secret");
    let forwarded: Value =
        serde_json::from_str(echoed["body"].as_str().expect("body string")).expect("body json");
    assert_eq!(forwarded["parts"][0]["text"], "hello");
}

#[tokio::test]
async fn upstream_status_and_content_type_pass_through() {
    let addr = spawn_upstream().await;
    let target = format!("http://{addr}");
    let app = router();

    let (status, _, _) = send(
        &app,
        Method::GET,
        "/api/v2/nothing-here",
        &[("x-proxy-target", target.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, headers, body) = send(
        &app,
        Method::GET,
        "/api/v2/global/event",
        &[("x-proxy-target", target.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/event-stream")
    );
    assert_eq!(
        String::from_utf8(body).expect("utf8"),
        "data: {\"type\":\"server.connected\"}\n\n"
    );
}

#[tokio::test]
async fn unreachable_upstream_is_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let target = format!("http://{addr}");
    let (status, _, body) = send(
        &router(),
        Method::GET,
        "/api/v2/session",
        &[("x-proxy-target", target.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    let problem: Value = serde_json::from_slice(&body).expect("problem json");
    assert_eq!(problem["type"], "urn:workbench:error:unreachable");
}
