//! In-memory transport for exercising the sync layer without a server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use workbench_error::SyncError;

use crate::config::SyncConfig;
use crate::transport::{
    ApiRequest, EventStream, Method, Transport, TransportFactory, TransportFuture,
};
use crate::types::Workspace;

type Responder = Arc<dyn Fn(&ApiRequest) -> Result<Value, SyncError> + Send + Sync>;

enum ConnectPlan {
    Refuse,
    Hang,
}

#[derive(Default)]
struct MockState {
    routes: HashMap<(Method, String), Responder>,
    delays: HashMap<(Method, String), VecDeque<Duration>>,
    calls: Vec<ApiRequest>,
    connect_plan: VecDeque<ConnectPlan>,
    event_tx: Option<mpsc::UnboundedSender<Result<Value, SyncError>>>,
    open_count: usize,
}

/// Scripted responses per `(method, path)` plus a controllable event stream.
/// Responses are computed when the request arrives; any configured delay is
/// applied afterwards.
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on(
        &self,
        method: Method,
        path: &str,
        responder: impl Fn(&ApiRequest) -> Result<Value, SyncError> + Send + Sync + 'static,
    ) {
        self.state()
            .routes
            .insert((method, path.to_string()), Arc::new(responder));
    }

    pub fn respond(&self, method: Method, path: &str, value: Value) {
        self.on(method, path, move |_| Ok(value.clone()));
    }

    pub fn fail(&self, method: Method, path: &str, error: SyncError) {
        self.on(method, path, move |_| Err(error.clone()));
    }

    /// Delays the next matching response by `delay`.
    pub fn delay_next(&self, method: Method, path: &str, delay: Duration) {
        self.state()
            .delays
            .entry((method, path.to_string()))
            .or_default()
            .push_back(delay);
    }

    pub fn calls(&self) -> Vec<ApiRequest> {
        self.state().calls.clone()
    }

    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Sends a raw event on the open stream. Returns false when no stream is
    /// open.
    pub fn push_event(&self, value: Value) -> bool {
        match &self.state().event_tx {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    pub fn push_error(&self, error: SyncError) -> bool {
        match &self.state().event_tx {
            Some(tx) => tx.send(Err(error)).is_ok(),
            None => false,
        }
    }

    /// Ends the open event stream as if the server went away.
    pub fn drop_stream(&self) {
        self.state().event_tx = None;
    }

    pub fn refuse_next_connects(&self, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            state.connect_plan.push_back(ConnectPlan::Refuse);
        }
    }

    /// The next handshake never completes.
    pub fn hang_next_connect(&self) {
        self.state().connect_plan.push_back(ConnectPlan::Hang);
    }

    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub fn is_stream_open(&self) -> bool {
        self.state()
            .event_tx
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Transport for MockTransport {
    fn request(&self, request: ApiRequest) -> TransportFuture<'_, Value> {
        Box::pin(async move {
            let (result, delay) = {
                let mut state = self.state();
                state.calls.push(request.clone());
                let route = (request.method, request.path.clone());
                let delay = state
                    .delays
                    .get_mut(&route)
                    .and_then(VecDeque::pop_front);
                let result = match state.routes.get(&route) {
                    Some(responder) => responder(&request),
                    None => Err(SyncError::UpstreamStatus {
                        status: 404,
                        body: Some(format!(
                            "no mock for {} {}",
                            request.method.as_str(),
                            request.path
                        )),
                    }),
                };
                (result, delay)
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            result
        })
    }

    fn open_event_stream(&self) -> TransportFuture<'_, EventStream> {
        Box::pin(async move {
            let plan = {
                let mut state = self.state();
                state.open_count += 1;
                state.connect_plan.pop_front()
            };
            match plan {
                Some(ConnectPlan::Refuse) => {
                    return Err(SyncError::Unreachable {
                        message: "connection refused".to_string(),
                    })
                }
                Some(ConnectPlan::Hang) => {
                    futures::future::pending::<()>().await;
                }
                None => {}
            }

            let (tx, rx) = mpsc::unbounded_channel();
            self.state().event_tx = Some(tx);
            Ok(Box::pin(UnboundedReceiverStream::new(rx)) as EventStream)
        })
    }
}

/// Hands out one `MockTransport` per workspace id and counts how often each
/// was created.
#[derive(Default)]
pub struct MockTransportFactory {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    created: Mutex<HashMap<String, usize>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport a workspace will use; created on first access so tests
    /// can script it before connecting.
    pub fn transport(&self, workspace_id: &str) -> Arc<MockTransport> {
        self.transports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workspace_id.to_string())
            .or_default()
            .clone()
    }

    pub fn created(&self, workspace_id: &str) -> usize {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(workspace_id)
            .copied()
            .unwrap_or(0)
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(
        &self,
        workspace: &Workspace,
        _config: &SyncConfig,
    ) -> Result<Arc<dyn Transport>, SyncError> {
        *self
            .created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(workspace.id.clone())
            .or_default() += 1;
        Ok(self.transport(&workspace.id))
    }
}
