use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use url::Url;
use workbench_error::SyncError;

use crate::config::{SyncConfig, TransportMode, PROXY_PREFIX, PROXY_TARGET_HEADER};
use crate::types::Workspace;

const EVENT_PATH: &str = "/global/event";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

/// One SDK call, independent of how it reaches the workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, path).with_body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn with_directory(self, directory: Option<&str>) -> Self {
        match directory {
            Some(directory) => self.with_query("directory", directory),
            None => self,
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value, SyncError>> + Send>>;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// The wire underneath one workspace connection.
pub trait Transport: Send + Sync {
    /// Performs a request and returns the decoded JSON body (`Null` when the
    /// body was empty).
    fn request(&self, request: ApiRequest) -> TransportFuture<'_, Value>;

    /// Opens the workspace's push-event stream. Items are raw event payloads.
    fn open_event_stream(&self) -> TransportFuture<'_, EventStream>;
}

pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        workspace: &Workspace,
        config: &SyncConfig,
    ) -> Result<Arc<dyn Transport>, SyncError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HttpTransportFactory;

impl TransportFactory for HttpTransportFactory {
    fn create(
        &self,
        workspace: &Workspace,
        config: &SyncConfig,
    ) -> Result<Arc<dyn Transport>, SyncError> {
        Ok(Arc::new(HttpTransport::new(workspace, config)?))
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: String,
    proxy_target: Option<String>,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(workspace: &Workspace, config: &SyncConfig) -> Result<Self, SyncError> {
        let origin = normalize_base_url(&workspace.base_url)?;
        let (base_url, proxy_target) = match &config.mode {
            TransportMode::Direct => (origin, None),
            TransportMode::Proxied { proxy_base_url } => {
                let proxy = normalize_base_url(proxy_base_url)?;
                (format!("{proxy}{PROXY_PREFIX}"), Some(origin))
            }
        };

        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|err| SyncError::invalid_request(err.to_string()))?;

        Ok(Self {
            client,
            base_url,
            proxy_target,
            auth_token: config.auth_token.clone(),
            request_timeout: config.request_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn builder(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = match method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Patch => self.client.patch(url),
            Method::Delete => self.client.delete(url),
        };
        if let Some(target) = &self.proxy_target {
            builder = builder.header(PROXY_TARGET_HEADER, target.as_str());
        }
        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        builder
    }

    async fn send(&self, request: ApiRequest) -> Result<Value, SyncError> {
        let mut builder = self
            .builder(request.method, &request.path)
            .timeout(self.request_timeout);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).trim().to_string();
            return Err(status_error(status, (!body.is_empty()).then_some(body)));
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| SyncError::MalformedResponse {
            message: format!("{} {}: {err}", request.method.as_str(), request.path),
        })
    }

    async fn connect_events(&self) -> Result<EventStream, SyncError> {
        let response = self
            .builder(Method::Get, EVENT_PATH)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.ok().filter(|body| !body.is_empty());
            return Err(status_error(status, body));
        }

        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|item| async move {
                match item {
                    Ok(event) => {
                        let data = event.data.trim();
                        if data.is_empty() {
                            return None;
                        }
                        Some(serde_json::from_str::<Value>(data).map_err(|err| {
                            SyncError::MalformedResponse {
                                message: format!("event payload: {err}"),
                            }
                        }))
                    }
                    Err(err) => Some(Err(SyncError::StreamClosed {
                        message: err.to_string(),
                    })),
                }
            });
        Ok(Box::pin(stream) as EventStream)
    }
}

impl Transport for HttpTransport {
    fn request(&self, request: ApiRequest) -> TransportFuture<'_, Value> {
        Box::pin(self.send(request))
    }

    fn open_event_stream(&self) -> TransportFuture<'_, EventStream> {
        Box::pin(self.connect_events())
    }
}

fn normalize_base_url(raw: &str) -> Result<String, SyncError> {
    let url = Url::parse(raw.trim()).map_err(|err| {
        SyncError::invalid_request(format!("invalid workspace url {raw:?}: {err}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SyncError::invalid_request(format!(
            "unsupported scheme in {raw:?}"
        )));
    }
    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn status_error(status: StatusCode, body: Option<String>) -> SyncError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthRejected { message: body },
        _ => SyncError::UpstreamStatus {
            status: status.as_u16(),
            body,
        },
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::Timeout {
            message: Some(err.to_string()),
        }
    } else if err.is_decode() {
        SyncError::MalformedResponse {
            message: err.to_string(),
        }
    } else {
        SyncError::Unreachable {
            message: err.to_string(),
        }
    }
}
