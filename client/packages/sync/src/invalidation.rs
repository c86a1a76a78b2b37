use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::cache::QueryCache;
use crate::dispatcher::{EventListener, ListenerError};
use crate::event::{EventEnvelope, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Sessions,
    SessionStatus,
    SessionChildren,
    Messages,
    SessionTodo,
    Permissions,
    Terminals,
    GitStatus,
    Providers,
    McpStatus,
}

impl QueryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryKind::Sessions => "sessions",
            QueryKind::SessionStatus => "session-status",
            QueryKind::SessionChildren => "session-children",
            QueryKind::Messages => "messages",
            QueryKind::SessionTodo => "session-todo",
            QueryKind::Permissions => "permissions",
            QueryKind::Terminals => "terminals",
            QueryKind::GitStatus => "git-status",
            QueryKind::Providers => "providers",
            QueryKind::McpStatus => "mcp-status",
        }
    }
}

/// Identifies one cached read. `scope` is the session id or directory the
/// read is narrowed to; a key without a scope used as an invalidation target
/// matches every key of that kind in the workspace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    pub kind: QueryKind,
    pub workspace_id: String,
    pub scope: Option<String>,
}

impl QueryKey {
    fn new(kind: QueryKind, workspace_id: &str, scope: Option<&str>) -> Self {
        Self {
            kind,
            workspace_id: workspace_id.to_string(),
            scope: scope.map(str::to_string),
        }
    }

    pub fn sessions(workspace_id: &str, directory: Option<&str>) -> Self {
        Self::new(QueryKind::Sessions, workspace_id, directory)
    }

    pub fn session_status(workspace_id: &str) -> Self {
        Self::new(QueryKind::SessionStatus, workspace_id, None)
    }

    pub fn session_children(workspace_id: &str, parent_id: Option<&str>) -> Self {
        Self::new(QueryKind::SessionChildren, workspace_id, parent_id)
    }

    pub fn messages(workspace_id: &str, session_id: &str) -> Self {
        Self::new(QueryKind::Messages, workspace_id, Some(session_id))
    }

    pub fn session_todo(workspace_id: &str, session_id: &str) -> Self {
        Self::new(QueryKind::SessionTodo, workspace_id, Some(session_id))
    }

    pub fn permissions(workspace_id: &str, session_id: &str) -> Self {
        Self::new(QueryKind::Permissions, workspace_id, Some(session_id))
    }

    pub fn terminals(workspace_id: &str, directory: Option<&str>) -> Self {
        Self::new(QueryKind::Terminals, workspace_id, directory)
    }

    pub fn git_status(workspace_id: &str, directory: Option<&str>) -> Self {
        Self::new(QueryKind::GitStatus, workspace_id, directory)
    }

    pub fn providers(workspace_id: &str) -> Self {
        Self::new(QueryKind::Providers, workspace_id, None)
    }

    pub fn mcp_status(workspace_id: &str) -> Self {
        Self::new(QueryKind::McpStatus, workspace_id, None)
    }

    /// True when invalidating `self` must also invalidate `other`.
    pub fn covers(&self, other: &QueryKey) -> bool {
        self.kind == other.kind
            && self.workspace_id == other.workspace_id
            && (self.scope.is_none() || self.scope == other.scope)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Some(scope) => write!(f, "{}:{}:{}", self.kind.as_str(), self.workspace_id, scope),
            None => write!(f, "{}:{}", self.kind.as_str(), self.workspace_id),
        }
    }
}

/// The cache keys an event makes stale. Routing reads only the event type,
/// session and directory, so partial payloads route like complete ones.
/// Events the table does not route (server lifecycle, file edits, unknown
/// kinds) yield nothing.
pub fn map_event_to_keys(workspace_id: &str, envelope: &EventEnvelope) -> Vec<QueryKey> {
    let directory = envelope.directory.as_deref();
    let session_id = envelope.event.session_id();
    match envelope.event.event_type() {
        "message.updated" | "message.part.updated" | "message.removed" | "message.part.removed" => {
            vec![QueryKey::new(QueryKind::Messages, workspace_id, session_id)]
        }
        "session.created" | "session.updated" | "session.deleted" => vec![
            QueryKey::sessions(workspace_id, None),
            QueryKey::session_status(workspace_id),
            QueryKey::session_children(workspace_id, None),
        ],
        "session.status" | "session.idle" => vec![
            QueryKey::sessions(workspace_id, None),
            QueryKey::session_status(workspace_id),
        ],
        "todo.updated" => vec![QueryKey::new(QueryKind::SessionTodo, workspace_id, session_id)],
        "permission.updated" | "permission.asked" | "permission.replied" => {
            vec![QueryKey::new(QueryKind::Permissions, workspace_id, session_id)]
        }
        "pty.created" | "pty.updated" => {
            let cwd = match &envelope.event {
                ServerEvent::PtyCreated { info } | ServerEvent::PtyUpdated { info } => {
                    Some(info.cwd.as_str()).filter(|cwd| !cwd.is_empty())
                }
                _ => None,
            };
            vec![QueryKey::terminals(workspace_id, directory.or(cwd))]
        }
        "pty.exited" | "pty.deleted" => vec![QueryKey::terminals(workspace_id, directory)],
        "vcs.branch.updated" => vec![QueryKey::git_status(workspace_id, directory)],
        _ => Vec::new(),
    }
}

/// Connects every workspace's event stream to the query cache: routed
/// events invalidate, connects trigger loads, closes evict.
pub struct CacheBridge {
    cache: Arc<QueryCache>,
}

impl CacheBridge {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self { cache }
    }
}

impl EventListener for CacheBridge {
    fn on_event(&self, workspace_id: &str, envelope: &EventEnvelope) -> Result<(), ListenerError> {
        for key in map_event_to_keys(workspace_id, envelope) {
            let matched = self.cache.invalidate(&key);
            debug!(
                key = %key,
                matched,
                event_type = envelope.event.event_type(),
                "invalidated from event"
            );
        }
        Ok(())
    }

    fn on_connected(&self, workspace_id: &str, resumed: bool) {
        self.cache.connected(workspace_id, resumed);
    }

    fn on_closed(&self, workspace_id: &str) {
        self.cache.evict_closed(workspace_id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::event::parse_event;

    fn keys_for(value: serde_json::Value) -> Vec<QueryKey> {
        let envelope = parse_event(value).expect("parse event");
        map_event_to_keys("w1", &envelope)
    }

    #[test]
    fn message_events_invalidate_that_sessions_messages() {
        let keys = keys_for(json!({
            "type": "message.updated",
            "properties": {"info": {"id": "m1", "sessionID": "s1", "role": "assistant", "time": {"created": 1}}}
        }));
        assert_eq!(keys, vec![QueryKey::messages("w1", "s1")]);

        let keys = keys_for(json!({
            "type": "message.part.updated",
            "properties": {"part": {"id": "p1", "sessionID": "s2", "messageID": "m1", "type": "text", "text": "x"}}
        }));
        assert_eq!(keys, vec![QueryKey::messages("w1", "s2")]);
    }

    #[test]
    fn incomplete_payloads_still_route_by_session() {
        let keys = keys_for(json!({
            "type": "message.updated",
            "properties": {"info": {"id": "m1", "sessionID": "s1"}}
        }));
        assert_eq!(keys, vec![QueryKey::messages("w1", "s1")]);

        let keys = keys_for(json!({
            "type": "message.part.updated",
            "properties": {"part": {"id": "p1", "sessionID": "s1", "messageID": "m1", "type": "tool", "state": {"status": "running"}}}
        }));
        assert_eq!(keys, vec![QueryKey::messages("w1", "s1")]);

        let keys = keys_for(json!({
            "directory": "/proj",
            "payload": {"type": "pty.updated", "properties": {"info": {"id": "pty_1"}}}
        }));
        assert_eq!(keys, vec![QueryKey::terminals("w1", Some("/proj"))]);

        let keys = keys_for(json!({"type": "todo.updated", "properties": {"todos": "nope"}}));
        assert_eq!(keys, vec![QueryKey::new(QueryKind::SessionTodo, "w1", None)]);
    }

    #[test]
    fn session_events_invalidate_sessions_and_status() {
        let tree_change = vec![
            QueryKey::sessions("w1", None),
            QueryKey::session_status("w1"),
            QueryKey::session_children("w1", None),
        ];
        assert_eq!(
            keys_for(json!({"type": "session.created", "properties": {"info": {"id": "s1", "title": "t"}}})),
            tree_change
        );
        assert_eq!(
            keys_for(json!({"type": "session.updated", "properties": {"info": {"id": "s1", "title": "t"}}})),
            tree_change
        );
        assert_eq!(
            keys_for(json!({"type": "session.status", "properties": {"sessionID": "s1", "status": {"type": "idle"}}})),
            vec![QueryKey::sessions("w1", None), QueryKey::session_status("w1")]
        );
    }

    #[test]
    fn todo_and_permission_events_are_session_scoped() {
        assert_eq!(
            keys_for(json!({"type": "todo.updated", "properties": {"sessionID": "s1", "todos": []}})),
            vec![QueryKey::session_todo("w1", "s1")]
        );
        assert_eq!(
            keys_for(json!({
                "type": "permission.updated",
                "properties": {"id": "per_1", "sessionID": "s1", "messageID": "m1", "type": "bash", "title": "run"}
            })),
            vec![QueryKey::permissions("w1", "s1")]
        );
        assert_eq!(
            keys_for(json!({
                "type": "permission.replied",
                "properties": {"sessionID": "s1", "permissionID": "per_1", "response": "once"}
            })),
            vec![QueryKey::permissions("w1", "s1")]
        );
    }

    #[test]
    fn pty_events_use_envelope_directory_then_pty_cwd() {
        let keys = keys_for(json!({
            "directory": "/proj",
            "payload": {"type": "pty.exited", "properties": {"id": "pty_1", "exitCode": 0}}
        }));
        assert_eq!(keys, vec![QueryKey::terminals("w1", Some("/proj"))]);

        let keys = keys_for(json!({
            "type": "pty.created",
            "properties": {"info": {"id": "pty_1", "command": "bash", "cwd": "/other", "status": "running"}}
        }));
        assert_eq!(keys, vec![QueryKey::terminals("w1", Some("/other"))]);

        let keys = keys_for(json!({"type": "pty.deleted", "properties": {"id": "pty_1"}}));
        assert_eq!(keys, vec![QueryKey::terminals("w1", None)]);
    }

    #[test]
    fn branch_updates_invalidate_git_status() {
        let keys = keys_for(json!({
            "directory": "/proj",
            "payload": {"type": "vcs.branch.updated", "properties": {"branch": "main"}}
        }));
        assert_eq!(keys, vec![QueryKey::git_status("w1", Some("/proj"))]);
    }

    #[test]
    fn unrouted_events_map_to_nothing() {
        assert!(keys_for(json!({"type": "server.heartbeat"})).is_empty());
        assert!(keys_for(json!({"type": "file.edited", "properties": {"file": "a.rs"}})).is_empty());
        assert!(keys_for(json!({"type": "installation.updated", "properties": {}})).is_empty());
    }

    #[test]
    fn unscoped_keys_cover_scoped_keys_of_the_same_workspace() {
        let pattern = QueryKey::sessions("w1", None);
        assert!(pattern.covers(&QueryKey::sessions("w1", Some("/proj"))));
        assert!(pattern.covers(&QueryKey::sessions("w1", None)));
        assert!(!pattern.covers(&QueryKey::sessions("w2", Some("/proj"))));
        assert!(!pattern.covers(&QueryKey::session_status("w1")));

        let scoped = QueryKey::sessions("w1", Some("/proj"));
        assert!(scoped.covers(&QueryKey::sessions("w1", Some("/proj"))));
        assert!(!scoped.covers(&QueryKey::sessions("w1", Some("/other"))));
        assert!(!scoped.covers(&QueryKey::sessions("w1", None)));
    }
}
