use std::time::Duration;

use crate::polling::PollingConfig;

pub const PROXY_PREFIX: &str = "/api/v2";
pub const PROXY_TARGET_HEADER: &str = "x-proxy-target";

/// How SDK requests reach a workspace. Chosen once per process.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransportMode {
    /// Requests go straight to the workspace's base URL.
    #[default]
    Direct,
    /// Requests go to `{proxy_base_url}/api/v2/...` with the workspace origin
    /// carried in `X-Proxy-Target`.
    Proxied { proxy_base_url: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mode: TransportMode,
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub idle_grace: Duration,
    /// Longest silence tolerated on an open event stream. The server sends
    /// heartbeats well inside this window.
    pub event_idle_timeout: Duration,
    pub unreachable_threshold: u32,
    pub polling: PollingConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Direct,
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(30),
            idle_grace: Duration::from_secs(5),
            event_idle_timeout: Duration::from_secs(60),
            unreachable_threshold: 3,
            polling: PollingConfig::default(),
        }
    }
}
