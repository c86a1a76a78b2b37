use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote development environment running an agent server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(alias = "base_url")]
    pub base_url: String,
}

impl Workspace {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Busy,
    Input,
    Aborting,
    Done,
    Error,
    Retry,
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Busy => "busy",
            SessionStatus::Input => "input",
            SessionStatus::Aborting => "aborting",
            SessionStatus::Done => "done",
            SessionStatus::Error => "error",
            SessionStatus::Retry => "retry",
            SessionStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub updated: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(rename = "parentID", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default)]
    pub time: SessionTime,
}

impl Session {
    pub fn is_child(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// Sessions whose parent back-reference points at `parent_id`.
pub fn child_sessions<'a>(sessions: &'a [Session], parent_id: &str) -> Vec<&'a Session> {
    sessions
        .iter()
        .filter(|session| session.parent_id.as_deref() == Some(parent_id))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusInfo {
    #[serde(rename = "type")]
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub type SessionStatusMap = HashMap<String, SessionStatusInfo>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTime {
    #[serde(default)]
    pub created: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    pub role: MessageRole,
    #[serde(default)]
    pub time: MessageTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Message {
    /// An assistant message without a completion timestamp is still being
    /// produced by the agent.
    pub fn is_streaming(&self) -> bool {
        self.info.role == MessageRole::Assistant && self.info.time.completed.is_none()
    }

    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match &part.kind {
                PartKind::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub id: String,
    #[serde(rename = "sessionID", default)]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(flatten)]
    pub kind: PartKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PartKind {
    Text {
        #[serde(default)]
        text: String,
    },
    Tool {
        #[serde(rename = "callID", default)]
        call_id: String,
        tool: String,
        state: ToolState,
    },
    Reasoning {
        #[serde(default)]
        text: String,
    },
    File {
        #[serde(default)]
        mime: String,
        #[serde(default)]
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Patch {
        #[serde(default)]
        hash: String,
        #[serde(default)]
        files: Vec<String>,
    },
    Snapshot {
        #[serde(default)]
        snapshot: String,
    },
    StepStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
    },
    StepFinish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ToolState {
    Pending {
        #[serde(default)]
        input: Value,
    },
    Running {
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Completed {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
    },
    Error {
        #[serde(default)]
        input: Value,
        #[serde(default)]
        error: String,
    },
}

impl ToolState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolState::Completed { .. } | ToolState::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    #[serde(default)]
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl Todo {
    pub fn is_active(&self) -> bool {
        matches!(self.status, TodoStatus::Pending | TodoStatus::InProgress)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    #[default]
    Pending,
    Approved,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub id: String,
    #[serde(rename = "sessionID")]
    pub session_id: String,
    #[serde(rename = "messageID", default)]
    pub message_id: String,
    #[serde(rename = "type", alias = "permission", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: PermissionStatus,
    #[serde(default)]
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionReply {
    Once,
    Always,
    Reject,
}

impl PermissionReply {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionReply::Once => "once",
            PermissionReply::Always => "always",
            PermissionReply::Reject => "reject",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PtyStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pty {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: String,
    pub status: PtyStatus,
    #[serde(default)]
    pub pid: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsInfo {
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStatus {
    pub path: String,
    #[serde(default)]
    pub added: i64,
    #[serde(default)]
    pub removed: i64,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitStatus {
    pub branch: Option<String>,
    pub files: Vec<FileStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub models: HashMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderList {
    #[serde(default)]
    pub all: Vec<Provider>,
    #[serde(default)]
    pub connected: Vec<String>,
    #[serde(default)]
    pub default: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpServerStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub type McpStatusMap = HashMap<String, McpServerStatus>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub name: String,
    #[serde(default)]
    pub branch: Option<String>,
    pub directory: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionRequest {
    pub directory: Option<String>,
    pub title: Option<String>,
    pub parent_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelRef {
    pub provider_id: String,
    pub model_id: String,
}

impl ModelRef {
    /// Parses `provider/model`.
    pub fn parse(value: &str) -> Option<Self> {
        let (provider_id, model_id) = value.split_once('/')?;
        if provider_id.is_empty() || model_id.is_empty() {
            return None;
        }
        Some(Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendMessageRequest {
    pub text: String,
    pub model: Option<ModelRef>,
    pub agent: Option<String>,
}

impl SendMessageRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateTerminalRequest {
    pub directory: String,
    pub command: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub title: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parts_decode_by_type_and_tolerate_unknown_kinds() {
        let parts: Vec<Part> = serde_json::from_value(json!([
            {"id": "p1", "sessionID": "s", "messageID": "m", "type": "text", "text": "hi"},
            {"id": "p2", "sessionID": "s", "messageID": "m", "type": "tool", "callID": "c1",
             "tool": "bash", "state": {"status": "running", "input": {"cmd": "ls"}}},
            {"id": "p3", "sessionID": "s", "messageID": "m", "type": "step-start"},
            {"id": "p4", "sessionID": "s", "messageID": "m", "type": "agent", "name": "x"}
        ]))
        .expect("decode parts");

        assert_eq!(
            parts[0].kind,
            PartKind::Text {
                text: "hi".to_string()
            }
        );
        match &parts[1].kind {
            PartKind::Tool { tool, state, .. } => {
                assert_eq!(tool, "bash");
                assert!(!state.is_terminal());
            }
            other => panic!("unexpected part {other:?}"),
        }
        assert_eq!(parts[2].kind, PartKind::StepStart { snapshot: None });
        assert_eq!(parts[3].kind, PartKind::Unknown);
    }

    #[test]
    fn assistant_message_without_completion_is_streaming() {
        let message: Message = serde_json::from_value(json!({
            "info": {"id": "m1", "sessionID": "s1", "role": "assistant", "time": {"created": 1}},
            "parts": []
        }))
        .expect("decode message");
        assert!(message.is_streaming());

        let user: Message = serde_json::from_value(json!({
            "info": {"id": "m0", "sessionID": "s1", "role": "user", "time": {"created": 1}}
        }))
        .expect("decode message");
        assert!(!user.is_streaming());
    }

    #[test]
    fn child_sessions_follow_parent_back_references() {
        let sessions: Vec<Session> = serde_json::from_value(json!([
            {"id": "root", "title": "root"},
            {"id": "a", "title": "a", "parentID": "root"},
            {"id": "b", "title": "b", "parentID": "a"}
        ]))
        .expect("decode sessions");
        let children = child_sessions(&sessions, "root");
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].id, "a");
        assert!(!sessions[0].is_child());
    }

    #[test]
    fn model_ref_requires_provider_and_model() {
        assert_eq!(
            ModelRef::parse("anthropic/claude"),
            Some(ModelRef {
                provider_id: "anthropic".to_string(),
                model_id: "claude".to_string()
            })
        );
        assert_eq!(ModelRef::parse("claude"), None);
        assert_eq!(ModelRef::parse("/claude"), None);
    }
}
