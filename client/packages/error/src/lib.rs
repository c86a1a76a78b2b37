use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    Unreachable,
    Timeout,
    AuthRejected,
    UpstreamStatus,
    MalformedResponse,
    MissingData,
    StreamClosed,
    NotConnected,
    ProxyTargetMissing,
    InvalidProxyTarget,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:workbench:error:invalid_request",
            Self::Unreachable => "urn:workbench:error:unreachable",
            Self::Timeout => "urn:workbench:error:timeout",
            Self::AuthRejected => "urn:workbench:error:auth_rejected",
            Self::UpstreamStatus => "urn:workbench:error:upstream_status",
            Self::MalformedResponse => "urn:workbench:error:malformed_response",
            Self::MissingData => "urn:workbench:error:missing_data",
            Self::StreamClosed => "urn:workbench:error:stream_closed",
            Self::NotConnected => "urn:workbench:error:not_connected",
            Self::ProxyTargetMissing => "urn:workbench:error:proxy_target_missing",
            Self::InvalidProxyTarget => "urn:workbench:error:invalid_proxy_target",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::Unreachable => "Workspace Unreachable",
            Self::Timeout => "Timeout",
            Self::AuthRejected => "Authentication Rejected",
            Self::UpstreamStatus => "Upstream Error",
            Self::MalformedResponse => "Malformed Response",
            Self::MissingData => "Missing Data",
            Self::StreamClosed => "Event Stream Closed",
            Self::NotConnected => "Not Connected",
            Self::ProxyTargetMissing => "Proxy Target Missing",
            Self::InvalidProxyTarget => "Invalid Proxy Target",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::Unreachable => 502,
            Self::Timeout => 504,
            Self::AuthRejected => 401,
            Self::UpstreamStatus => 502,
            Self::MalformedResponse => 502,
            Self::MissingData => 502,
            Self::StreamClosed => 502,
            Self::NotConnected => 503,
            Self::ProxyTargetMissing => 503,
            Self::InvalidProxyTarget => 400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Every failure the synchronization core can surface to a consumer.
///
/// Values are cheap to clone so a query snapshot can carry its last error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("workspace unreachable: {message}")]
    Unreachable { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("authentication rejected")]
    AuthRejected { message: Option<String> },
    #[error("upstream returned status {status}")]
    UpstreamStatus { status: u16, body: Option<String> },
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },
    #[error("response for {operation} carried no data")]
    MissingData { operation: String },
    #[error("event stream closed: {message}")]
    StreamClosed { message: String },
    #[error("workspace not connected: {workspace_id}")]
    NotConnected { workspace_id: String },
    #[error("missing proxy target header")]
    ProxyTargetMissing,
    #[error("invalid proxy target: {target}")]
    InvalidProxyTarget { target: String },
}

impl SyncError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::Unreachable { .. } => ErrorType::Unreachable,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::AuthRejected { .. } => ErrorType::AuthRejected,
            Self::UpstreamStatus { .. } => ErrorType::UpstreamStatus,
            Self::MalformedResponse { .. } => ErrorType::MalformedResponse,
            Self::MissingData { .. } => ErrorType::MissingData,
            Self::StreamClosed { .. } => ErrorType::StreamClosed,
            Self::NotConnected { .. } => ErrorType::NotConnected,
            Self::ProxyTargetMissing => ErrorType::ProxyTargetMissing,
            Self::InvalidProxyTarget { .. } => ErrorType::InvalidProxyTarget,
        }
    }

    /// True when the failure says the transport itself is gone, as opposed to
    /// a single request being rejected or malformed.
    pub fn is_transport_loss(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::StreamClosed { .. })
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::Timeout { message } | Self::AuthRejected { message } => {
                if let Some(message) = message {
                    extensions.insert("message".to_string(), Value::String(message.clone()));
                }
            }
            Self::UpstreamStatus { status, body } => {
                extensions.insert(
                    "upstreamStatus".to_string(),
                    Value::Number(serde_json::Number::from(*status)),
                );
                if let Some(body) = body {
                    extensions.insert("body".to_string(), Value::String(body.clone()));
                }
            }
            Self::NotConnected { workspace_id } => {
                extensions.insert(
                    "workspaceId".to_string(),
                    Value::String(workspace_id.clone()),
                );
            }
            Self::InvalidProxyTarget { target } => {
                extensions.insert("target".to_string(), Value::String(target.clone()));
            }
            _ => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<SyncError> for ProblemDetails {
    fn from(value: SyncError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SyncError> for ProblemDetails {
    fn from(value: &SyncError) -> Self {
        value.to_problem_details()
    }
}
