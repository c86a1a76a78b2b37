use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::types::{MessageInfo, Part, Permission, Pty, Session, SessionStatusInfo, Todo};

/// Coarse grouping listeners filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventCategory {
    Chat,
    Permission,
    Pty,
    Todo,
    File,
    Git,
    Server,
}

/// Every push event kind this client routes. Kinds the server adds later land
/// in `Unknown` and are never treated as errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    ServerConnected,
    ServerHeartbeat,
    SessionCreated {
        info: Session,
    },
    SessionUpdated {
        info: Session,
    },
    SessionDeleted {
        info: Session,
    },
    SessionStatus {
        session_id: String,
        status: SessionStatusInfo,
    },
    SessionIdle {
        session_id: String,
    },
    MessageUpdated {
        info: MessageInfo,
    },
    MessageRemoved {
        session_id: String,
        message_id: String,
    },
    MessagePartUpdated {
        part: Part,
        delta: Option<String>,
    },
    MessagePartRemoved {
        session_id: String,
        message_id: String,
        part_id: String,
    },
    TodoUpdated {
        session_id: String,
        todos: Vec<Todo>,
    },
    PermissionUpdated {
        permission: Permission,
    },
    PermissionReplied {
        session_id: String,
        permission_id: String,
        response: String,
    },
    PtyCreated {
        info: Pty,
    },
    PtyUpdated {
        info: Pty,
    },
    PtyExited {
        id: String,
        exit_code: i64,
    },
    PtyDeleted {
        id: String,
    },
    FileEdited {
        file: String,
    },
    VcsBranchUpdated {
        branch: Option<String>,
    },
    /// A known kind whose payload did not decode in full, such as a delta
    /// missing fields the typed form requires. Carries only what routing needs.
    Partial {
        event_type: String,
        session_id: Option<String>,
    },
    Unknown {
        event_type: String,
    },
}

impl ServerEvent {
    pub fn event_type(&self) -> &str {
        match self {
            ServerEvent::ServerConnected => "server.connected",
            ServerEvent::ServerHeartbeat => "server.heartbeat",
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::SessionDeleted { .. } => "session.deleted",
            ServerEvent::SessionStatus { .. } => "session.status",
            ServerEvent::SessionIdle { .. } => "session.idle",
            ServerEvent::MessageUpdated { .. } => "message.updated",
            ServerEvent::MessageRemoved { .. } => "message.removed",
            ServerEvent::MessagePartUpdated { .. } => "message.part.updated",
            ServerEvent::MessagePartRemoved { .. } => "message.part.removed",
            ServerEvent::TodoUpdated { .. } => "todo.updated",
            ServerEvent::PermissionUpdated { .. } => "permission.updated",
            ServerEvent::PermissionReplied { .. } => "permission.replied",
            ServerEvent::PtyCreated { .. } => "pty.created",
            ServerEvent::PtyUpdated { .. } => "pty.updated",
            ServerEvent::PtyExited { .. } => "pty.exited",
            ServerEvent::PtyDeleted { .. } => "pty.deleted",
            ServerEvent::FileEdited { .. } => "file.edited",
            ServerEvent::VcsBranchUpdated { .. } => "vcs.branch.updated",
            ServerEvent::Partial { event_type, .. } | ServerEvent::Unknown { event_type } => {
                event_type
            }
        }
    }

    /// `None` for unknown kinds.
    pub fn category(&self) -> Option<EventCategory> {
        category_of(self.event_type())
    }

    /// Session the event is about, when it names one.
    pub fn session_id(&self) -> Option<&str> {
        let id = match self {
            ServerEvent::SessionCreated { info }
            | ServerEvent::SessionUpdated { info }
            | ServerEvent::SessionDeleted { info } => info.id.as_str(),
            ServerEvent::SessionStatus { session_id, .. }
            | ServerEvent::SessionIdle { session_id }
            | ServerEvent::MessageRemoved { session_id, .. }
            | ServerEvent::MessagePartRemoved { session_id, .. }
            | ServerEvent::TodoUpdated { session_id, .. }
            | ServerEvent::PermissionReplied { session_id, .. } => session_id.as_str(),
            ServerEvent::MessageUpdated { info } => info.session_id.as_str(),
            ServerEvent::MessagePartUpdated { part, .. } => part.session_id.as_str(),
            ServerEvent::PermissionUpdated { permission } => permission.session_id.as_str(),
            ServerEvent::Partial {
                session_id: Some(session_id),
                ..
            } => session_id.as_str(),
            _ => return None,
        };
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

/// Category of a known event type.
pub fn category_of(event_type: &str) -> Option<EventCategory> {
    let category = match event_type {
        "server.connected" | "server.heartbeat" => EventCategory::Server,
        "session.created" | "session.updated" | "session.deleted" | "session.status"
        | "session.idle" | "message.updated" | "message.removed" | "message.part.updated"
        | "message.part.removed" => EventCategory::Chat,
        "todo.updated" => EventCategory::Todo,
        "permission.updated" | "permission.asked" | "permission.replied" => {
            EventCategory::Permission
        }
        "pty.created" | "pty.updated" | "pty.exited" | "pty.deleted" => EventCategory::Pty,
        "file.edited" => EventCategory::File,
        "vcs.branch.updated" => EventCategory::Git,
        _ => return None,
    };
    Some(category)
}

/// A decoded event plus the directory the global stream attributed it to.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope {
    pub directory: Option<String>,
    pub event: ServerEvent,
}

impl EventEnvelope {
    pub fn new(event: ServerEvent) -> Self {
        Self {
            directory: None,
            event,
        }
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventParseError {
    #[error("event is not valid json: {0}")]
    InvalidJson(String),
    #[error("event has no type")]
    MissingType,
    #[error("invalid {event_type} payload: {message}")]
    InvalidPayload { event_type: String, message: String },
}

#[derive(Deserialize)]
struct InfoProps<T> {
    info: T,
}

#[derive(Deserialize)]
struct SessionStatusProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    status: SessionStatusInfo,
}

#[derive(Deserialize)]
struct SessionRefProps {
    #[serde(rename = "sessionID")]
    session_id: String,
}

#[derive(Deserialize)]
struct MessageRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
}

#[derive(Deserialize)]
struct PartUpdatedProps {
    part: Part,
    #[serde(default)]
    delta: Option<String>,
}

#[derive(Deserialize)]
struct PartRemovedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "messageID")]
    message_id: String,
    #[serde(rename = "partID")]
    part_id: String,
}

#[derive(Deserialize)]
struct TodoProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(default)]
    todos: Vec<Todo>,
}

#[derive(Deserialize)]
struct PermissionRepliedProps {
    #[serde(rename = "sessionID")]
    session_id: String,
    #[serde(rename = "permissionID")]
    permission_id: String,
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct PtyExitedProps {
    id: String,
    #[serde(rename = "exitCode", default)]
    exit_code: i64,
}

#[derive(Deserialize)]
struct PtyRefProps {
    id: String,
}

#[derive(Deserialize)]
struct FileProps {
    file: String,
}

#[derive(Deserialize)]
struct BranchProps {
    #[serde(default)]
    branch: Option<String>,
}

pub fn parse_event_str(raw: &str) -> Result<EventEnvelope, EventParseError> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| EventParseError::InvalidJson(err.to_string()))?;
    parse_event(value)
}

/// Accepts both `{type, properties}` and the global stream's
/// `{directory, payload: {type, properties}}`.
pub fn parse_event(value: Value) -> Result<EventEnvelope, EventParseError> {
    let (directory, mut body) = match value {
        Value::Object(mut map) if map.get("payload").is_some_and(Value::is_object) => {
            let directory = map
                .get("directory")
                .and_then(Value::as_str)
                .map(str::to_string);
            let body = map.remove("payload").unwrap_or(Value::Null);
            (directory, body)
        }
        other => (None, other),
    };

    let event_type = body
        .get("type")
        .and_then(Value::as_str)
        .ok_or(EventParseError::MissingType)?
        .to_string();
    let properties = body
        .get_mut("properties")
        .map(Value::take)
        .unwrap_or(Value::Null);

    let session_id = routing_session_id(&event_type, &properties);
    let event = match decode_event(&event_type, properties) {
        Ok(event) => event,
        Err(err) => {
            debug!(event_type = %event_type, error = %err, "routing event from raw fields");
            ServerEvent::Partial {
                event_type,
                session_id,
            }
        }
    };
    Ok(EventEnvelope { directory, event })
}

const SESSION_ID_PATHS: [&[&str]; 3] = [&["sessionID"], &["info", "sessionID"], &["part", "sessionID"]];

/// The session an event names, read from the raw properties so that
/// incomplete payloads still route.
fn routing_session_id(event_type: &str, properties: &Value) -> Option<String> {
    SESSION_ID_PATHS
        .iter()
        .find_map(|path| extract_nested_string(properties, path))
        .or_else(|| {
            if event_type.starts_with("session.") {
                extract_nested_string(properties, &["info", "id"])
            } else {
                None
            }
        })
        .filter(|id| !id.is_empty())
}

fn extract_nested_string(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(*key)?;
    }
    current.as_str().map(str::to_string)
}

fn decode_event(event_type: &str, properties: Value) -> Result<ServerEvent, EventParseError> {
    let event = match event_type {
        "server.connected" => ServerEvent::ServerConnected,
        "server.heartbeat" => ServerEvent::ServerHeartbeat,
        "session.created" => ServerEvent::SessionCreated {
            info: props::<InfoProps<Session>>(event_type, properties)?.info,
        },
        "session.updated" => ServerEvent::SessionUpdated {
            info: props::<InfoProps<Session>>(event_type, properties)?.info,
        },
        "session.deleted" => ServerEvent::SessionDeleted {
            info: props::<InfoProps<Session>>(event_type, properties)?.info,
        },
        "session.status" => {
            let props: SessionStatusProps = props(event_type, properties)?;
            ServerEvent::SessionStatus {
                session_id: props.session_id,
                status: props.status,
            }
        }
        "session.idle" => ServerEvent::SessionIdle {
            session_id: props::<SessionRefProps>(event_type, properties)?.session_id,
        },
        "message.updated" => ServerEvent::MessageUpdated {
            info: props::<InfoProps<MessageInfo>>(event_type, properties)?.info,
        },
        "message.removed" => {
            let props: MessageRemovedProps = props(event_type, properties)?;
            ServerEvent::MessageRemoved {
                session_id: props.session_id,
                message_id: props.message_id,
            }
        }
        "message.part.updated" => {
            let props: PartUpdatedProps = props(event_type, properties)?;
            ServerEvent::MessagePartUpdated {
                part: props.part,
                delta: props.delta,
            }
        }
        "message.part.removed" => {
            let props: PartRemovedProps = props(event_type, properties)?;
            ServerEvent::MessagePartRemoved {
                session_id: props.session_id,
                message_id: props.message_id,
                part_id: props.part_id,
            }
        }
        "todo.updated" => {
            let props: TodoProps = props(event_type, properties)?;
            ServerEvent::TodoUpdated {
                session_id: props.session_id,
                todos: props.todos,
            }
        }
        "permission.updated" | "permission.asked" => ServerEvent::PermissionUpdated {
            permission: props(event_type, properties)?,
        },
        "permission.replied" => {
            let props: PermissionRepliedProps = props(event_type, properties)?;
            ServerEvent::PermissionReplied {
                session_id: props.session_id,
                permission_id: props.permission_id,
                response: props.response,
            }
        }
        "pty.created" => ServerEvent::PtyCreated {
            info: props::<InfoProps<Pty>>(event_type, properties)?.info,
        },
        "pty.updated" => ServerEvent::PtyUpdated {
            info: props::<InfoProps<Pty>>(event_type, properties)?.info,
        },
        "pty.exited" => {
            let props: PtyExitedProps = props(event_type, properties)?;
            ServerEvent::PtyExited {
                id: props.id,
                exit_code: props.exit_code,
            }
        }
        "pty.deleted" => ServerEvent::PtyDeleted {
            id: props::<PtyRefProps>(event_type, properties)?.id,
        },
        "file.edited" => ServerEvent::FileEdited {
            file: props::<FileProps>(event_type, properties)?.file,
        },
        "vcs.branch.updated" => ServerEvent::VcsBranchUpdated {
            branch: props::<BranchProps>(event_type, properties)?.branch,
        },
        other => ServerEvent::Unknown {
            event_type: other.to_string(),
        },
    };
    Ok(event)
}

fn props<T: DeserializeOwned>(event_type: &str, properties: Value) -> Result<T, EventParseError> {
    serde_json::from_value(properties).map_err(|err| EventParseError::InvalidPayload {
        event_type: event_type.to_string(),
        message: err.to_string(),
    })
}
