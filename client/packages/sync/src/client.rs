use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing::info;
use workbench_error::SyncError;

use crate::cache::{Fetcher, PollPolicy, Query, QueryCache};
use crate::config::SyncConfig;
use crate::dispatcher::ListenerFilter;
use crate::invalidation::{CacheBridge, QueryKey};
use crate::polling;
use crate::registry::{ConnectionLease, ConnectionRegistry, ConnectionStatus};
use crate::sdk::OpencodeClient;
use crate::transport::{HttpTransportFactory, TransportFactory};
use crate::types::{
    CreateSessionRequest, CreateTerminalRequest, GitStatus, McpStatusMap, Message, Permission,
    PermissionReply, ProviderList, Pty, SendMessageRequest, Session, SessionStatusMap, Todo,
    Workspace, Worktree,
};

fn fetcher<T, F, Fut>(fetch: F) -> Fetcher<T>
where
    F: Fn(OpencodeClient) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
{
    Arc::new(move |client: OpencodeClient| fetch(client).boxed())
}

/// Reads and writes against any number of workspaces. Reads are live
/// `Query` handles kept fresh by push events and polling; writes await the
/// server and invalidate what they touched before returning.
#[derive(Clone)]
pub struct SyncClient {
    registry: ConnectionRegistry,
    cache: Arc<QueryCache>,
    config: SyncConfig,
}

impl SyncClient {
    pub fn new(config: SyncConfig) -> Self {
        Self::with_factory(config, Arc::new(HttpTransportFactory))
    }

    pub fn with_factory(config: SyncConfig, factory: Arc<dyn TransportFactory>) -> Self {
        let cache = Arc::new(QueryCache::new());
        let bridge = Arc::new(CacheBridge::new(cache.clone()));
        let registry = ConnectionRegistry::with_listeners(
            config.clone(),
            factory,
            vec![(ListenerFilter::All, bridge)],
        );
        Self {
            registry,
            cache,
            config,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn connection(&self, workspace: &Workspace) -> Result<ConnectionLease, SyncError> {
        self.registry.acquire(workspace)
    }

    pub fn workspace_connection_status(&self, workspace_id: &str) -> ConnectionStatus {
        self.registry.status_of(workspace_id)
    }

    pub fn retry(&self, workspace_id: &str) -> bool {
        self.registry.retry(workspace_id)
    }

    pub fn dispose(&self) {
        self.registry.dispose();
    }

    fn query<T>(
        &self,
        workspace: &Workspace,
        key: QueryKey,
        fetch: Fetcher<T>,
        policy: Option<PollPolicy<T>>,
    ) -> Result<Query<T>, SyncError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let lease = self.registry.acquire(workspace)?;
        let cell = self.cache.cell(key, lease.connection(), fetch, policy);
        Ok(Query::new(cell, lease))
    }

    pub fn sessions(
        &self,
        workspace: &Workspace,
        directory: Option<&str>,
    ) -> Result<Query<Vec<Session>>, SyncError> {
        let scope = directory.map(str::to_string);
        self.query(
            workspace,
            QueryKey::sessions(&workspace.id, directory),
            fetcher(move |client| {
                let scope = scope.clone();
                async move { client.list_sessions(scope.as_deref()).await }
            }),
            None,
        )
    }

    pub fn session_status(&self, workspace: &Workspace) -> Result<Query<SessionStatusMap>, SyncError> {
        let config = self.config.polling;
        self.query(
            workspace,
            QueryKey::session_status(&workspace.id),
            fetcher(|client| async move { client.session_status().await }),
            Some(Arc::new(move |statuses: Option<&SessionStatusMap>| {
                polling::session_status_interval(&config, statuses)
            })),
        )
    }

    /// Sub-sessions whose parent is `session_id`.
    pub fn session_children(
        &self,
        workspace: &Workspace,
        session_id: &str,
    ) -> Result<Query<Vec<Session>>, SyncError> {
        let id = session_id.to_string();
        self.query(
            workspace,
            QueryKey::session_children(&workspace.id, Some(session_id)),
            fetcher(move |client| {
                let id = id.clone();
                async move { client.session_children(&id).await }
            }),
            None,
        )
    }

    pub fn session_messages(
        &self,
        workspace: &Workspace,
        session_id: &str,
    ) -> Result<Query<Vec<Message>>, SyncError> {
        let config = self.config.polling;
        let id = session_id.to_string();
        self.query(
            workspace,
            QueryKey::messages(&workspace.id, session_id),
            fetcher(move |client| {
                let id = id.clone();
                async move { client.session_messages(&id).await }
            }),
            Some(Arc::new(move |messages: Option<&Vec<Message>>| {
                polling::message_interval(&config, messages)
            })),
        )
    }

    pub fn session_todos(
        &self,
        workspace: &Workspace,
        session_id: &str,
    ) -> Result<Query<Vec<Todo>>, SyncError> {
        let config = self.config.polling;
        let id = session_id.to_string();
        self.query(
            workspace,
            QueryKey::session_todo(&workspace.id, session_id),
            fetcher(move |client| {
                let id = id.clone();
                async move { client.session_todo(&id).await }
            }),
            Some(Arc::new(move |todos: Option<&Vec<Todo>>| {
                polling::todo_interval(&config, todos)
            })),
        )
    }

    /// Permissions the server is holding for one session.
    pub fn permissions(
        &self,
        workspace: &Workspace,
        session_id: &str,
    ) -> Result<Query<Vec<Permission>>, SyncError> {
        let id = session_id.to_string();
        self.query(
            workspace,
            QueryKey::permissions(&workspace.id, session_id),
            fetcher(move |client| {
                let id = id.clone();
                async move {
                    let permissions = client.list_permissions().await?;
                    Ok::<_, SyncError>(
                        permissions
                            .into_iter()
                            .filter(|permission| permission.session_id == id)
                            .collect::<Vec<_>>(),
                    )
                }
            }),
            None,
        )
    }

    pub fn terminals(
        &self,
        workspace: &Workspace,
        directory: Option<&str>,
    ) -> Result<Query<Vec<Pty>>, SyncError> {
        let scope = directory.map(str::to_string);
        self.query(
            workspace,
            QueryKey::terminals(&workspace.id, directory),
            fetcher(move |client| {
                let scope = scope.clone();
                async move { client.list_pty(scope.as_deref()).await }
            }),
            None,
        )
    }

    /// Current branch plus changed files.
    pub fn git_status(
        &self,
        workspace: &Workspace,
        directory: Option<&str>,
    ) -> Result<Query<GitStatus>, SyncError> {
        let scope = directory.map(str::to_string);
        self.query(
            workspace,
            QueryKey::git_status(&workspace.id, directory),
            fetcher(move |client| {
                let scope = scope.clone();
                async move {
                    let (vcs, files) = tokio::try_join!(
                        client.vcs(scope.as_deref()),
                        client.file_status(scope.as_deref())
                    )?;
                    Ok::<_, SyncError>(GitStatus {
                        branch: vcs.branch,
                        files,
                    })
                }
            }),
            None,
        )
    }

    pub fn providers(&self, workspace: &Workspace) -> Result<Query<ProviderList>, SyncError> {
        self.query(
            workspace,
            QueryKey::providers(&workspace.id),
            fetcher(|client| async move { client.providers().await }),
            None,
        )
    }

    pub fn mcp_status(&self, workspace: &Workspace) -> Result<Query<McpStatusMap>, SyncError> {
        self.query(
            workspace,
            QueryKey::mcp_status(&workspace.id),
            fetcher(|client| async move { client.mcp_status().await }),
            None,
        )
    }

    fn invalidate(&self, keys: &[QueryKey]) {
        for key in keys {
            self.cache.invalidate(key);
        }
    }

    /// Sends one text prompt. Empty or whitespace-only text is rejected
    /// without touching the network.
    pub async fn send_message(
        &self,
        workspace: &Workspace,
        session_id: &str,
        request: SendMessageRequest,
    ) -> Result<Message, SyncError> {
        let text = request.text.trim().to_string();
        if text.is_empty() {
            return Err(SyncError::invalid_request("message text is empty"));
        }
        if session_id.trim().is_empty() {
            return Err(SyncError::invalid_request("session id is required"));
        }
        let request = SendMessageRequest { text, ..request };

        let lease = self.registry.acquire(workspace)?;
        let message = lease.client().prompt(session_id, &request).await?;
        info!(
            workspace_id = %workspace.id,
            session_id,
            message_id = %message.info.id,
            "message sent"
        );
        self.invalidate(&[
            QueryKey::messages(&workspace.id, session_id),
            QueryKey::session_status(&workspace.id),
        ]);
        Ok(message)
    }

    pub async fn create_session(
        &self,
        workspace: &Workspace,
        request: CreateSessionRequest,
    ) -> Result<Session, SyncError> {
        let lease = self.registry.acquire(workspace)?;
        let session = lease.client().create_session(&request).await?;
        info!(workspace_id = %workspace.id, session_id = %session.id, "session created");
        let mut keys = vec![
            QueryKey::sessions(&workspace.id, request.directory.as_deref()),
            QueryKey::session_status(&workspace.id),
        ];
        if let Some(parent_id) = &request.parent_id {
            keys.push(QueryKey::session_children(&workspace.id, Some(parent_id.as_str())));
        }
        self.invalidate(&keys);
        Ok(session)
    }

    pub async fn abort_session(&self, workspace: &Workspace, session_id: &str) -> Result<(), SyncError> {
        let lease = self.registry.acquire(workspace)?;
        lease.client().abort_session(session_id).await?;
        self.invalidate(&[
            QueryKey::session_status(&workspace.id),
            QueryKey::messages(&workspace.id, session_id),
        ]);
        Ok(())
    }

    pub async fn delete_session(&self, workspace: &Workspace, session_id: &str) -> Result<(), SyncError> {
        let lease = self.registry.acquire(workspace)?;
        lease.client().delete_session(session_id).await?;
        info!(workspace_id = %workspace.id, session_id, "session deleted");
        self.invalidate(&[
            QueryKey::sessions(&workspace.id, None),
            QueryKey::session_status(&workspace.id),
            QueryKey::session_children(&workspace.id, None),
        ]);
        Ok(())
    }

    pub async fn reply_permission(
        &self,
        workspace: &Workspace,
        session_id: &str,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), SyncError> {
        let lease = self.registry.acquire(workspace)?;
        lease.client().reply_permission(permission_id, reply).await?;
        self.invalidate(&[QueryKey::permissions(&workspace.id, session_id)]);
        Ok(())
    }

    pub async fn create_terminal(
        &self,
        workspace: &Workspace,
        request: CreateTerminalRequest,
    ) -> Result<Pty, SyncError> {
        if request.directory.trim().is_empty() {
            return Err(SyncError::invalid_request("terminal directory is required"));
        }
        let lease = self.registry.acquire(workspace)?;
        let pty = lease.client().create_pty(&request).await?;
        self.invalidate(&[QueryKey::terminals(&workspace.id, Some(&request.directory))]);
        Ok(pty)
    }

    pub async fn remove_terminal(
        &self,
        workspace: &Workspace,
        directory: &str,
        pty_id: &str,
    ) -> Result<(), SyncError> {
        let lease = self.registry.acquire(workspace)?;
        lease.client().remove_pty(pty_id, Some(directory)).await?;
        self.invalidate(&[QueryKey::terminals(&workspace.id, Some(directory))]);
        Ok(())
    }

    pub async fn create_worktree(
        &self,
        workspace: &Workspace,
        directory: &str,
        name: Option<&str>,
    ) -> Result<Worktree, SyncError> {
        let lease = self.registry.acquire(workspace)?;
        let worktree = lease.client().create_worktree(directory, name).await?;
        info!(
            workspace_id = %workspace.id,
            worktree = %worktree.directory,
            "worktree created"
        );
        self.invalidate(&[
            QueryKey::git_status(&workspace.id, None),
            QueryKey::sessions(&workspace.id, None),
        ]);
        Ok(worktree)
    }

    pub async fn reset_worktree(&self, workspace: &Workspace, directory: &str) -> Result<(), SyncError> {
        let lease = self.registry.acquire(workspace)?;
        lease.client().reset_worktree(directory).await?;
        self.invalidate(&[QueryKey::git_status(&workspace.id, Some(directory))]);
        Ok(())
    }

    /// Waits for the first settled session list of a directory.
    pub async fn fetch_sessions(
        &self,
        workspace: &Workspace,
        directory: Option<&str>,
        wait: Duration,
    ) -> Result<Vec<Session>, SyncError> {
        let mut query = self.sessions(workspace, directory)?;
        let state = tokio::time::timeout(
            wait,
            query.wait_for(|state| state.data.is_some() || state.error.is_some()),
        )
        .await
        .map_err(|_| SyncError::Timeout {
            message: Some(format!("no session list within {}ms", wait.as_millis())),
        })??;
        match (state.data, state.error) {
            (Some(sessions), _) => Ok(sessions),
            (None, Some(err)) => Err(err),
            (None, None) => Err(SyncError::MissingData {
                operation: "session.list".to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("registry", &self.registry)
            .finish()
    }
}
