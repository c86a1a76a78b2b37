use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use url::Url;
use workbench_error::SyncError;

use crate::transport::{ApiRequest, Transport};
use crate::types::{
    CreateSessionRequest, CreateTerminalRequest, FileStatus, McpStatusMap, Message, Permission,
    PermissionReply, ProviderList, Pty, SendMessageRequest, Session, SessionStatusMap, Todo,
    VcsInfo, Worktree,
};

/// Joins path segments, percent-encoding each one so an id can never change
/// which route is called.
fn api_path(segments: &[&str]) -> Result<String, SyncError> {
    let mut url = Url::parse("http://localhost/")
        .map_err(|err| SyncError::invalid_request(err.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| SyncError::invalid_request("cannot build request path"))?
        .clear()
        .extend(segments);
    Ok(url.path().to_string())
}

/// Typed calls against an OpenCode-compatible server. Every call resolves to
/// either data or an error; a success that carries no body where one is
/// required is reported as `MissingData`.
#[derive(Clone)]
pub struct OpencodeClient {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for OpencodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpencodeClient").finish_non_exhaustive()
    }
}

impl OpencodeClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        request: ApiRequest,
    ) -> Result<T, SyncError> {
        let value = self.transport.request(request).await?;
        if value.is_null() {
            return Err(SyncError::MissingData {
                operation: operation.to_string(),
            });
        }
        serde_json::from_value(value).map_err(|err| SyncError::MalformedResponse {
            message: format!("{operation}: {err}"),
        })
    }

    async fn call_ack(&self, request: ApiRequest) -> Result<(), SyncError> {
        self.transport.request(request).await.map(|_| ())
    }

    pub async fn list_sessions(&self, directory: Option<&str>) -> Result<Vec<Session>, SyncError> {
        self.call(
            "session.list",
            ApiRequest::get("/session").with_directory(directory),
        )
        .await
    }

    pub async fn session_status(&self) -> Result<SessionStatusMap, SyncError> {
        self.call("session.status", ApiRequest::get("/session/status"))
            .await
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<Session, SyncError> {
        let mut body = Map::new();
        if let Some(title) = &request.title {
            body.insert("title".to_string(), Value::String(title.clone()));
        }
        if let Some(parent_id) = &request.parent_id {
            body.insert("parentID".to_string(), Value::String(parent_id.clone()));
        }
        self.call(
            "session.create",
            ApiRequest::post("/session", Value::Object(body))
                .with_directory(request.directory.as_deref()),
        )
        .await
    }

    pub async fn prompt(
        &self,
        session_id: &str,
        request: &SendMessageRequest,
    ) -> Result<Message, SyncError> {
        let mut body = json!({
            "parts": [{"type": "text", "text": request.text}],
        });
        if let Some(model) = &request.model {
            body["model"] = json!({
                "providerID": model.provider_id,
                "modelID": model.model_id,
            });
        }
        if let Some(agent) = &request.agent {
            body["agent"] = Value::String(agent.clone());
        }
        self.call(
            "session.prompt",
            ApiRequest::post(api_path(&["session", session_id, "message"])?, body),
        )
        .await
    }

    pub async fn session_messages(&self, session_id: &str) -> Result<Vec<Message>, SyncError> {
        self.call(
            "session.messages",
            ApiRequest::get(api_path(&["session", session_id, "message"])?),
        )
        .await
    }

    pub async fn session_todo(&self, session_id: &str) -> Result<Vec<Todo>, SyncError> {
        self.call(
            "session.todo",
            ApiRequest::get(api_path(&["session", session_id, "todo"])?),
        )
        .await
    }

    pub async fn session_children(&self, session_id: &str) -> Result<Vec<Session>, SyncError> {
        self.call(
            "session.children",
            ApiRequest::get(api_path(&["session", session_id, "children"])?),
        )
        .await
    }

    pub async fn abort_session(&self, session_id: &str) -> Result<(), SyncError> {
        self.call_ack(ApiRequest::post(
            api_path(&["session", session_id, "abort"])?,
            json!({}),
        ))
        .await
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), SyncError> {
        self.call_ack(ApiRequest::delete(api_path(&["session", session_id])?))
            .await
    }

    pub async fn list_permissions(&self) -> Result<Vec<Permission>, SyncError> {
        self.call("permission.list", ApiRequest::get("/permission"))
            .await
    }

    pub async fn reply_permission(
        &self,
        permission_id: &str,
        reply: PermissionReply,
    ) -> Result<(), SyncError> {
        self.call_ack(ApiRequest::post(
            api_path(&["permission", permission_id, "reply"])?,
            json!({"reply": reply.as_str()}),
        ))
        .await
    }

    pub async fn list_pty(&self, directory: Option<&str>) -> Result<Vec<Pty>, SyncError> {
        self.call("pty.list", ApiRequest::get("/pty").with_directory(directory))
            .await
    }

    pub async fn create_pty(&self, request: &CreateTerminalRequest) -> Result<Pty, SyncError> {
        let mut body = Map::new();
        if let Some(command) = &request.command {
            body.insert("command".to_string(), Value::String(command.clone()));
        }
        if !request.args.is_empty() {
            body.insert("args".to_string(), json!(request.args));
        }
        if let Some(cwd) = &request.cwd {
            body.insert("cwd".to_string(), Value::String(cwd.clone()));
        }
        if let Some(title) = &request.title {
            body.insert("title".to_string(), Value::String(title.clone()));
        }
        self.call(
            "pty.create",
            ApiRequest::post("/pty", Value::Object(body)).with_directory(Some(&request.directory)),
        )
        .await
    }

    pub async fn remove_pty(&self, pty_id: &str, directory: Option<&str>) -> Result<(), SyncError> {
        self.call_ack(ApiRequest::delete(api_path(&["pty", pty_id])?).with_directory(directory))
            .await
    }

    pub async fn vcs(&self, directory: Option<&str>) -> Result<VcsInfo, SyncError> {
        self.call("vcs.get", ApiRequest::get("/vcs").with_directory(directory))
            .await
    }

    pub async fn file_status(&self, directory: Option<&str>) -> Result<Vec<FileStatus>, SyncError> {
        self.call(
            "file.status",
            ApiRequest::get("/file/status").with_directory(directory),
        )
        .await
    }

    pub async fn create_worktree(
        &self,
        directory: &str,
        name: Option<&str>,
    ) -> Result<Worktree, SyncError> {
        let body = match name {
            Some(name) => json!({"name": name}),
            None => json!({}),
        };
        self.call(
            "worktree.create",
            ApiRequest::post("/experimental/worktree", body).with_directory(Some(directory)),
        )
        .await
    }

    pub async fn reset_worktree(&self, directory: &str) -> Result<(), SyncError> {
        self.call_ack(
            ApiRequest::post(
                "/experimental/worktree/reset",
                json!({"directory": directory}),
            )
            .with_directory(Some(directory)),
        )
        .await
    }

    pub async fn providers(&self) -> Result<ProviderList, SyncError> {
        self.call("provider.list", ApiRequest::get("/provider"))
            .await
    }

    pub async fn mcp_status(&self) -> Result<McpStatusMap, SyncError> {
        self.call("mcp.status", ApiRequest::get("/mcp")).await
    }
}
