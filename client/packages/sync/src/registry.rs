use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::runtime::Handle;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use workbench_error::SyncError;

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::dispatcher::{EventDispatcher, EventListener, ListenerFilter, Subscription};
use crate::sdk::OpencodeClient;
use crate::transport::{EventStream, Transport, TransportFactory};
use crate::types::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_error: Option<SyncError>,
    /// Consecutive failed attempts since the last successful connect.
    pub attempt: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            last_error: None,
            attempt: 0,
        }
    }
}

#[derive(Default)]
struct Lifecycle {
    refs: usize,
    supervisor: Option<JoinHandle<()>>,
    teardown: Option<JoinHandle<()>>,
    closed: bool,
}

/// One workspace's live link: transport, event fan-out and status. Owned by
/// the registry; consumers hold it through a `ConnectionLease`.
pub struct Connection {
    workspace: Workspace,
    client: OpencodeClient,
    dispatcher: EventDispatcher,
    state_tx: watch::Sender<ConnectionState>,
    retry: Notify,
    reconnect: Notify,
    unreachable_failures: AtomicU32,
    unreachable_threshold: u32,
    event_idle_timeout: Duration,
    lifecycle: Mutex<Lifecycle>,
    installed: Mutex<Vec<Subscription>>,
}

impl Connection {
    fn new(workspace: Workspace, transport: Arc<dyn Transport>, config: &SyncConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::default());
        Self {
            dispatcher: EventDispatcher::new(&workspace.id),
            workspace,
            client: OpencodeClient::new(transport),
            state_tx,
            retry: Notify::new(),
            reconnect: Notify::new(),
            unreachable_failures: AtomicU32::new(0),
            unreachable_threshold: config.unreachable_threshold.max(1),
            event_idle_timeout: config.event_idle_timeout,
            lifecycle: Mutex::new(Lifecycle::default()),
            installed: Mutex::new(Vec::new()),
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace.id
    }

    pub fn client(&self) -> &OpencodeClient {
        &self.client
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().status
    }

    pub fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// True once the registry has torn this connection down.
    pub fn is_closed(&self) -> bool {
        self.lifecycle
            .lock()
            .map(|lifecycle| lifecycle.closed)
            .unwrap_or(true)
    }

    pub fn subscribe(&self, filter: ListenerFilter, listener: Arc<dyn EventListener>) -> Subscription {
        self.dispatcher.subscribe(filter, listener)
    }

    /// Skips the remaining backoff delay. Only meaningful while in `error`.
    pub fn retry(&self) -> bool {
        if self.status() != ConnectionStatus::Error {
            return false;
        }
        info!(workspace_id = %self.workspace.id, "manual retry requested");
        self.retry.notify_waiters();
        true
    }

    /// Feeds a request outcome into the unreachable counter. Enough
    /// consecutive unreachable or timed out requests while the stream still
    /// looks healthy force the stream to reconnect.
    pub fn report_request_result<T>(&self, result: &Result<T, SyncError>) {
        match result {
            Ok(_) => self.unreachable_failures.store(0, Ordering::Relaxed),
            Err(SyncError::Unreachable { .. } | SyncError::Timeout { .. }) => {
                let failures = self.unreachable_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.unreachable_threshold
                    && self.status() == ConnectionStatus::Connected
                {
                    self.unreachable_failures.store(0, Ordering::Relaxed);
                    warn!(
                        workspace_id = %self.workspace.id,
                        failures,
                        "requests keep failing, forcing reconnect"
                    );
                    self.reconnect.notify_one();
                }
            }
            Err(_) => {}
        }
    }

    fn set_state(&self, status: ConnectionStatus, last_error: Option<SyncError>, attempt: u32) {
        let previous = self.state_tx.send_replace(ConnectionState {
            status,
            last_error,
            attempt,
        });
        if previous.status != status {
            info!(
                workspace_id = %self.workspace.id,
                from = previous.status.as_str(),
                to = status.as_str(),
                "connection status changed"
            );
        }
    }

    fn install(&self, filter: ListenerFilter, listener: Arc<dyn EventListener>) {
        let subscription = self.dispatcher.subscribe(filter, listener);
        if let Ok(mut installed) = self.installed.lock() {
            installed.push(subscription);
        }
    }

    fn start(self: &Arc<Self>, handle: &Handle, config: &SyncConfig) {
        let supervisor = handle.spawn(supervise(
            self.clone(),
            config.connect_timeout,
            Backoff::new(config.backoff_base, config.backoff_max),
        ));
        if let Ok(mut lifecycle) = self.lifecycle.lock() {
            lifecycle.supervisor = Some(supervisor);
        }
    }

    fn shutdown(&self) {
        let supervisor = {
            let Ok(mut lifecycle) = self.lifecycle.lock() else {
                return;
            };
            if lifecycle.closed {
                return;
            }
            lifecycle.closed = true;
            if let Some(teardown) = lifecycle.teardown.take() {
                teardown.abort();
            }
            lifecycle.supervisor.take()
        };
        if let Some(supervisor) = supervisor {
            supervisor.abort();
        }
        self.set_state(ConnectionStatus::Disconnected, None, 0);
        self.dispatcher.closed();
        info!(workspace_id = %self.workspace.id, "connection closed");
    }

    /// Runs until the stream fails. Any item, heartbeats included, resets the
    /// idle timer; a stream that stays silent past it is treated as dropped.
    async fn pump(&self, stream: &mut EventStream) -> SyncError {
        loop {
            tokio::select! {
                item = timeout(self.event_idle_timeout, stream.next()) => match item {
                    Err(_) => {
                        return SyncError::StreamClosed {
                            message: format!(
                                "no events for {}ms",
                                self.event_idle_timeout.as_millis()
                            ),
                        }
                    }
                    Ok(Some(Ok(value))) => self.dispatcher.dispatch_raw(value),
                    Ok(Some(Err(err))) if err.is_transport_loss() => return err,
                    Ok(Some(Err(err))) => {
                        warn!(workspace_id = %self.workspace.id, error = %err, "dropping unreadable event");
                    }
                    Ok(None) => {
                        return SyncError::StreamClosed {
                            message: "event stream ended".to_string(),
                        }
                    }
                },
                _ = self.reconnect.notified() => {
                    return SyncError::Unreachable {
                        message: "requests failing while stream open".to_string(),
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("workspace_id", &self.workspace.id)
            .field("status", &self.status())
            .finish()
    }
}

/// Owns the status transitions of one connection. Runs until aborted.
async fn supervise(connection: Arc<Connection>, connect_timeout: Duration, mut backoff: Backoff) {
    let workspace_id = connection.workspace.id.clone();
    let mut connected_before = false;

    loop {
        let last_error = connection.state().last_error;
        connection.set_state(ConnectionStatus::Connecting, last_error, backoff.attempt());

        let handshake = connection.client.transport().open_event_stream();
        let failure = match timeout(connect_timeout, handshake).await {
            Err(_) => SyncError::Timeout {
                message: Some(format!(
                    "event stream handshake exceeded {}ms",
                    connect_timeout.as_millis()
                )),
            },
            Ok(Err(err)) => err,
            Ok(Ok(mut stream)) => {
                backoff.reset();
                connection.unreachable_failures.store(0, Ordering::Relaxed);
                connection.set_state(ConnectionStatus::Connected, None, 0);
                connection.dispatcher.connected(connected_before);
                connected_before = true;
                connection.pump(&mut stream).await
            }
        };

        let delay = backoff.next_delay();
        warn!(
            workspace_id = %workspace_id,
            error = %failure,
            attempt = backoff.attempt(),
            retry_in_ms = delay.as_millis() as u64,
            "workspace connection failed"
        );
        // Registered before the status flips so a retry issued as soon as
        // `error` is observable is not missed.
        let retry = connection.retry.notified();
        tokio::pin!(retry);
        retry.as_mut().enable();
        connection.set_state(ConnectionStatus::Error, Some(failure), backoff.attempt());

        tokio::select! {
            _ = sleep(delay) => {}
            _ = &mut retry => {
                backoff.reset();
            }
        }
    }
}

/// Keeps a connection alive. Dropping the last lease starts the idle grace
/// period; the connection is torn down if nobody re-acquires it in time.
pub struct ConnectionLease {
    registry: Weak<RegistryInner>,
    connection: Arc<Connection>,
}

impl ConnectionLease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }
}

impl Deref for ConnectionLease {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.connection
    }
}

impl Clone for ConnectionLease {
    fn clone(&self) -> Self {
        RegistryInner::retain(&self.connection);
        Self {
            registry: self.registry.clone(),
            connection: self.connection.clone(),
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            RegistryInner::release(&registry, &self.connection);
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ConnectionLease").field(&self.connection).finish()
    }
}

struct RegistryInner {
    config: SyncConfig,
    factory: Arc<dyn TransportFactory>,
    listeners: Vec<(ListenerFilter, Arc<dyn EventListener>)>,
    connections: Mutex<HashMap<String, Arc<Connection>>>,
    disposed: AtomicBool,
}

impl RegistryInner {
    fn retain(connection: &Arc<Connection>) {
        if let Ok(mut lifecycle) = connection.lifecycle.lock() {
            lifecycle.refs += 1;
            if let Some(teardown) = lifecycle.teardown.take() {
                debug!(workspace_id = %connection.workspace.id, "re-acquired during grace period");
                teardown.abort();
            }
        }
    }

    fn release(this: &Arc<Self>, connection: &Arc<Connection>) {
        let Ok(mut lifecycle) = connection.lifecycle.lock() else {
            return;
        };
        lifecycle.refs = lifecycle.refs.saturating_sub(1);
        if lifecycle.refs > 0 || lifecycle.closed {
            return;
        }

        let grace = this.config.idle_grace;
        let handle = Handle::try_current().ok().filter(|_| !grace.is_zero());
        match handle {
            Some(handle) => {
                let registry = Arc::downgrade(this);
                let workspace_id = connection.workspace.id.clone();
                lifecycle.teardown = Some(handle.spawn(async move {
                    sleep(grace).await;
                    if let Some(registry) = registry.upgrade() {
                        registry.teardown_if_idle(&workspace_id);
                    }
                }));
            }
            None => {
                drop(lifecycle);
                this.teardown_if_idle(&connection.workspace.id);
            }
        }
    }

    fn teardown_if_idle(&self, workspace_id: &str) {
        let removed = {
            let Ok(mut connections) = self.connections.lock() else {
                return;
            };
            let idle = connections.get(workspace_id).is_some_and(|connection| {
                connection
                    .lifecycle
                    .lock()
                    .map(|lifecycle| lifecycle.refs == 0)
                    .unwrap_or(false)
            });
            if !idle {
                return;
            }
            connections.remove(workspace_id)
        };
        if let Some(connection) = removed {
            debug!(workspace_id = %workspace_id, "idle grace period elapsed");
            connection.shutdown();
        }
    }

    fn drain(&self) -> Vec<Arc<Connection>> {
        self.connections
            .lock()
            .map(|mut connections| connections.drain().map(|(_, connection)| connection).collect())
            .unwrap_or_default()
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for connection in self.drain() {
            connection.shutdown();
        }
    }
}

/// At most one live connection per workspace id. Cheap to clone; clones share
/// the same connections.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(config: SyncConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::with_listeners(config, factory, Vec::new())
    }

    /// `listeners` are installed on every connection before it starts, so
    /// they observe its first `on_connected`.
    pub fn with_listeners(
        config: SyncConfig,
        factory: Arc<dyn TransportFactory>,
        listeners: Vec<(ListenerFilter, Arc<dyn EventListener>)>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                config,
                factory,
                listeners,
                connections: Mutex::new(HashMap::new()),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Returns the workspace's connection, creating and starting it on first
    /// use. Must be called from within a tokio runtime.
    pub fn acquire(&self, workspace: &Workspace) -> Result<ConnectionLease, SyncError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(SyncError::NotConnected {
                workspace_id: workspace.id.clone(),
            });
        }

        let mut connections = self
            .inner
            .connections
            .lock()
            .map_err(|_| SyncError::NotConnected {
                workspace_id: workspace.id.clone(),
            })?;

        let connection = match connections.get(&workspace.id) {
            Some(existing) => existing.clone(),
            None => {
                let handle = Handle::try_current().map_err(|_| {
                    SyncError::invalid_request("acquire requires a tokio runtime")
                })?;
                let transport = self.inner.factory.create(workspace, &self.inner.config)?;
                let connection = Arc::new(Connection::new(
                    workspace.clone(),
                    transport,
                    &self.inner.config,
                ));
                for (filter, listener) in &self.inner.listeners {
                    connection.install(*filter, listener.clone());
                }
                connections.insert(workspace.id.clone(), connection.clone());
                info!(workspace_id = %workspace.id, base_url = %workspace.base_url, "opening workspace connection");
                connection.start(&handle, &self.inner.config);
                connection
            }
        };
        RegistryInner::retain(&connection);
        drop(connections);

        Ok(ConnectionLease {
            registry: Arc::downgrade(&self.inner),
            connection,
        })
    }

    pub fn connection(&self, workspace_id: &str) -> Option<Arc<Connection>> {
        self.inner
            .connections
            .lock()
            .ok()
            .and_then(|connections| connections.get(workspace_id).cloned())
    }

    pub fn status_of(&self, workspace_id: &str) -> ConnectionStatus {
        self.connection(workspace_id)
            .map(|connection| connection.status())
            .unwrap_or(ConnectionStatus::Disconnected)
    }

    pub fn watch_status(&self, workspace_id: &str) -> Option<watch::Receiver<ConnectionState>> {
        self.connection(workspace_id)
            .map(|connection| connection.watch_state())
    }

    pub fn retry(&self, workspace_id: &str) -> bool {
        self.connection(workspace_id)
            .map(|connection| connection.retry())
            .unwrap_or(false)
    }

    pub fn subscribe(
        &self,
        workspace_id: &str,
        filter: ListenerFilter,
        listener: Arc<dyn EventListener>,
    ) -> Result<Subscription, SyncError> {
        let connection = self
            .connection(workspace_id)
            .ok_or_else(|| SyncError::NotConnected {
                workspace_id: workspace_id.to_string(),
            })?;
        Ok(connection.subscribe(filter, listener))
    }

    pub fn workspace_ids(&self) -> Vec<String> {
        self.inner
            .connections
            .lock()
            .map(|connections| connections.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Closes every connection. Later acquires fail.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        for connection in self.inner.drain() {
            connection.shutdown();
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("workspaces", &self.workspace_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransportFactory;

    fn registry(factory: Arc<MockTransportFactory>) -> ConnectionRegistry {
        ConnectionRegistry::new(SyncConfig::default(), factory)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_reuses_the_live_connection() {
        let factory = Arc::new(MockTransportFactory::new());
        let registry = registry(factory.clone());
        let workspace = Workspace::new("w1", "http://w1.test");

        let first = registry.acquire(&workspace).expect("acquire");
        let second = registry.acquire(&workspace).expect("acquire");
        assert!(Arc::ptr_eq(first.connection(), second.connection()));
        assert_eq!(factory.created("w1"), 1);

        settle().await;
        assert_eq!(registry.status_of("w1"), ConnectionStatus::Connected);
        assert_eq!(factory.transport("w1").open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_workspace_reports_disconnected() {
        let registry = registry(Arc::new(MockTransportFactory::new()));
        assert_eq!(registry.status_of("nope"), ConnectionStatus::Disconnected);
        assert!(!registry.retry("nope"));
        assert!(matches!(
            registry.subscribe("nope", ListenerFilter::All, Arc::new(Noop)),
            Err(SyncError::NotConnected { .. })
        ));
    }

    struct Noop;

    impl EventListener for Noop {
        fn on_event(
            &self,
            _workspace_id: &str,
            _envelope: &crate::event::EventEnvelope,
        ) -> Result<(), crate::dispatcher::ListenerError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disposed_registry_refuses_new_leases() {
        let factory = Arc::new(MockTransportFactory::new());
        let registry = registry(factory.clone());
        let workspace = Workspace::new("w1", "http://w1.test");
        let lease = registry.acquire(&workspace).expect("acquire");
        settle().await;

        registry.dispose();
        assert_eq!(lease.status(), ConnectionStatus::Disconnected);
        assert_eq!(registry.status_of("w1"), ConnectionStatus::Disconnected);
        assert!(registry.acquire(&workspace).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_requests_force_a_reconnect() {
        let factory = Arc::new(MockTransportFactory::new());
        let registry = registry(factory.clone());
        let workspace = Workspace::new("w1", "http://w1.test");
        let lease = registry.acquire(&workspace).expect("acquire");
        settle().await;
        assert_eq!(lease.status(), ConnectionStatus::Connected);

        let unreachable: Result<(), SyncError> = Err(SyncError::Unreachable {
            message: "refused".to_string(),
        });
        lease.report_request_result(&unreachable);
        lease.report_request_result(&unreachable);
        settle().await;
        assert_eq!(factory.transport("w1").open_count(), 1);

        lease.report_request_result(&unreachable);
        settle().await;
        assert_eq!(lease.status(), ConnectionStatus::Error);

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(factory.transport("w1").open_count(), 2);
        assert_eq!(lease.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_requests_count_toward_the_threshold() {
        let factory = Arc::new(MockTransportFactory::new());
        let registry = registry(factory.clone());
        let workspace = Workspace::new("w1", "http://w1.test");
        let lease = registry.acquire(&workspace).expect("acquire");
        settle().await;

        let timed_out: Result<(), SyncError> = Err(SyncError::Timeout { message: None });
        let rejected: Result<(), SyncError> = Err(SyncError::UpstreamStatus {
            status: 500,
            body: None,
        });
        lease.report_request_result(&timed_out);
        lease.report_request_result(&rejected);
        lease.report_request_result(&timed_out);
        settle().await;
        assert_eq!(lease.status(), ConnectionStatus::Connected);

        lease.report_request_result(&timed_out);
        settle().await;
        assert_eq!(lease.status(), ConnectionStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_stream_is_treated_as_dropped() {
        let factory = Arc::new(MockTransportFactory::new());
        let registry = registry(factory.clone());
        let workspace = Workspace::new("w1", "http://w1.test");
        let lease = registry.acquire(&workspace).expect("acquire");
        settle().await;
        let transport = factory.transport("w1");

        tokio::time::sleep(Duration::from_secs(50)).await;
        assert!(transport.push_event(serde_json::json!({"type": "server.heartbeat"})));
        settle().await;
        tokio::time::sleep(Duration::from_secs(50)).await;
        settle().await;
        assert_eq!(lease.status(), ConnectionStatus::Connected);
        assert_eq!(transport.open_count(), 1);

        tokio::time::sleep(Duration::from_millis(10_200)).await;
        settle().await;
        assert_eq!(lease.status(), ConnectionStatus::Error);
        assert!(matches!(
            lease.state().last_error,
            Some(SyncError::StreamClosed { .. })
        ));

        tokio::time::sleep(Duration::from_millis(600)).await;
        settle().await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(lease.status(), ConnectionStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_retry_does_not_skip_a_later_backoff() {
        let factory = Arc::new(MockTransportFactory::new());
        factory.transport("w1").refuse_next_connects(5);
        let registry = registry(factory.clone());
        let workspace = Workspace::new("w1", "http://w1.test");
        let lease = registry.acquire(&workspace).expect("acquire");
        settle().await;
        let transport = factory.transport("w1");
        assert_eq!(transport.open_count(), 1);
        assert_eq!(lease.status(), ConnectionStatus::Error);

        assert!(lease.retry());
        assert!(lease.retry());
        settle().await;
        assert_eq!(transport.open_count(), 2);
        assert_eq!(lease.status(), ConnectionStatus::Error);

        tokio::time::sleep(Duration::from_millis(400)).await;
        settle().await;
        assert_eq!(transport.open_count(), 2);

        tokio::time::sleep(Duration::from_millis(101)).await;
        settle().await;
        assert_eq!(transport.open_count(), 3);
    }
}
