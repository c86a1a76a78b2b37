use std::time::Duration;

use crate::types::{Message, SessionStatusMap, Todo};

/// Refresh cadence for the reads that poll. A policy returning `None` stops
/// the timer until the next snapshot change re-evaluates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingConfig {
    pub todo_interval: Duration,
    pub session_status_interval: Duration,
    pub message_interval: Duration,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            todo_interval: Duration::from_millis(3000),
            session_status_interval: Duration::from_millis(5000),
            message_interval: Duration::from_millis(2000),
        }
    }
}

pub fn todo_interval(config: &PollingConfig, todos: Option<&Vec<Todo>>) -> Option<Duration> {
    let todos = todos?;
    todos
        .iter()
        .any(Todo::is_active)
        .then_some(config.todo_interval)
}

pub fn session_status_interval(
    config: &PollingConfig,
    _statuses: Option<&SessionStatusMap>,
) -> Option<Duration> {
    Some(config.session_status_interval)
}

pub fn message_interval(config: &PollingConfig, messages: Option<&Vec<Message>>) -> Option<Duration> {
    let messages = messages?;
    messages
        .iter()
        .any(Message::is_streaming)
        .then_some(config.message_interval)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn todos(statuses: &[&str]) -> Vec<Todo> {
        let values: Vec<_> = statuses
            .iter()
            .enumerate()
            .map(|(idx, status)| json!({"id": format!("t{idx}"), "content": "x", "status": status}))
            .collect();
        serde_json::from_value(serde_json::Value::Array(values)).expect("decode todos")
    }

    #[test]
    fn todos_poll_while_work_is_outstanding() {
        let config = PollingConfig::default();
        assert_eq!(
            todo_interval(&config, Some(&todos(&["completed", "pending"]))),
            Some(Duration::from_millis(3000))
        );
        assert_eq!(
            todo_interval(&config, Some(&todos(&["in_progress"]))),
            Some(Duration::from_millis(3000))
        );
        assert_eq!(
            todo_interval(&config, Some(&todos(&["completed", "cancelled"]))),
            None
        );
        assert_eq!(todo_interval(&config, Some(&Vec::new())), None);
        assert_eq!(todo_interval(&config, None), None);
    }

    #[test]
    fn session_status_polls_at_a_fixed_rate() {
        let config = PollingConfig::default();
        assert_eq!(
            session_status_interval(&config, None),
            Some(Duration::from_millis(5000))
        );
        assert_eq!(
            session_status_interval(&config, Some(&SessionStatusMap::new())),
            Some(Duration::from_millis(5000))
        );
    }

    #[test]
    fn messages_poll_only_while_an_assistant_reply_streams() {
        let config = PollingConfig::default();
        let streaming: Vec<Message> = serde_json::from_value(json!([
            {"info": {"id": "m1", "sessionID": "s", "role": "user", "time": {"created": 1}}},
            {"info": {"id": "m2", "sessionID": "s", "role": "assistant", "time": {"created": 2}}}
        ]))
        .expect("decode");
        assert_eq!(
            message_interval(&config, Some(&streaming)),
            Some(Duration::from_millis(2000))
        );

        let finished: Vec<Message> = serde_json::from_value(json!([
            {"info": {"id": "m2", "sessionID": "s", "role": "assistant", "time": {"created": 2, "completed": 3}}}
        ]))
        .expect("decode");
        assert_eq!(message_interval(&config, Some(&finished)), None);
    }

    #[test]
    fn intervals_follow_configuration() {
        let config = PollingConfig {
            todo_interval: Duration::from_millis(100),
            ..PollingConfig::default()
        };
        assert_eq!(
            todo_interval(&config, Some(&todos(&["pending"]))),
            Some(Duration::from_millis(100))
        );
    }
}
